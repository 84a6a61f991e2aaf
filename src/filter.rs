//! Decimation filters.
//!
//! A filter passes `X` packets out of every `N`, with `O` shifting which
//! members of the cycle pass. The count is taken either from the packet
//! sequence counter or from the whole seconds of its time stamp. Filters are
//! stateless, every packet is judged on its own header.

use crate::error::TableError;
use crate::message::BusMessage;
use serde::{Deserialize, Serialize};

pub const FILTER_TYPE_ALWAYS: u16 = 1;
pub const FILTER_TYPE_BY_SEQ_CNT: u16 = 2;
pub const FILTER_TYPE_BY_TIME: u16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterKind {
    Always,
    SeqCount,
    Time,
}

impl FilterKind {
    /// Maps a commanded filter type code. Unknown codes are rejected.
    pub fn from_code(code: u16) -> Result<Self, TableError> {
        match code {
            FILTER_TYPE_ALWAYS => Ok(FilterKind::Always),
            FILTER_TYPE_BY_SEQ_CNT => Ok(FilterKind::SeqCount),
            FILTER_TYPE_BY_TIME => Ok(FilterKind::Time),
            other => Err(TableError::InvalidFilterType(other)),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            FilterKind::Always => FILTER_TYPE_ALWAYS,
            FilterKind::SeqCount => FILTER_TYPE_BY_SEQ_CNT,
            FilterKind::Time => FILTER_TYPE_BY_TIME,
        }
    }
}

/// Decimation parameters: pass `x` of every `n`, offset by `o`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterParams {
    pub n: u16,
    pub x: u16,
    pub o: u16,
}

impl FilterParams {
    pub const fn new(n: u16, x: u16, o: u16) -> Self {
        Self { n, x, o }
    }

    pub fn is_consistent(&self) -> bool {
        self.n > 0 && self.x <= self.n
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketFilter {
    pub kind: FilterKind,
    pub params: FilterParams,
}

impl PacketFilter {
    pub const fn always() -> Self {
        Self {
            kind: FilterKind::Always,
            params: FilterParams { n: 1, x: 1, o: 0 },
        }
    }

    pub const fn by_seq_count(n: u16, x: u16, o: u16) -> Self {
        Self {
            kind: FilterKind::SeqCount,
            params: FilterParams { n, x, o },
        }
    }

    pub const fn by_time(n: u16, x: u16, o: u16) -> Self {
        Self {
            kind: FilterKind::Time,
            params: FilterParams { n, x, o },
        }
    }
}

impl Default for PacketFilter {
    fn default() -> Self {
        Self::always()
    }
}

/// Filter as it appears in commands and table files, with the type still a raw code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub filter_type: u16,
    #[serde(default)]
    pub params: FilterParams,
}

impl TryFrom<FilterSpec> for PacketFilter {
    type Error = TableError;

    fn try_from(spec: FilterSpec) -> Result<Self, Self::Error> {
        Ok(PacketFilter {
            kind: FilterKind::from_code(spec.filter_type)?,
            params: spec.params,
        })
    }
}

impl From<PacketFilter> for FilterSpec {
    fn from(filter: PacketFilter) -> Self {
        FilterSpec {
            filter_type: filter.kind.code(),
            params: filter.params,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterDecision {
    Pass,
    Drop,
}

impl FilterDecision {
    pub fn passed(self) -> bool {
        matches!(self, FilterDecision::Pass)
    }
}

/// Decide whether a packet passes its route's filter.
pub fn evaluate(packet: &BusMessage, filter: &PacketFilter) -> FilterDecision {
    match filter.kind {
        FilterKind::Always => FilterDecision::Pass,
        FilterKind::SeqCount => decimate(u32::from(packet.sequence_count()), &filter.params),
        FilterKind::Time => match packet.time() {
            Some(time) => decimate(time.seconds, &filter.params),
            None => FilterDecision::Drop,
        },
    }
}

/// `(count + O) mod N < X`. A zero cycle length passes nothing.
pub fn decimate(count: u32, params: &FilterParams) -> FilterDecision {
    if params.n == 0 {
        return FilterDecision::Drop;
    }
    let k = (u64::from(count) + u64::from(params.o)) % u64::from(params.n);
    if k < u64::from(params.x) {
        FilterDecision::Pass
    } else {
        FilterDecision::Drop
    }
}
