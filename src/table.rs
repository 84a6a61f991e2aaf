//! Packet table: the fixed set of slots describing which bus messages are
//! routed to the ground, with their bus QoS and decimation filter.
//!
//! A message identifier maps onto a slot through the application id mask.
//! A slot is either unused or holds exactly one [`Route`].

use crate::bus::SoftwareBus;
use crate::error::TableError;
use crate::filter::{FilterSpec, PacketFilter};
use crate::message::MessageId;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default slot geometry: 11 bit CCSDS application id.
pub const DEFAULT_APP_ID_MASK: u16 = 0x07FF;
pub const DEFAULT_SLOT_COUNT: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Qos {
    pub priority: u8,
    pub reliability: u8,
}

/// One configured packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: MessageId,
    pub qos: Qos,
    pub buffer_limit: u16,
    pub filter: PacketFilter,
}

impl Route {
    pub fn new(id: MessageId, qos: Qos, buffer_limit: u16, filter: PacketFilter) -> Self {
        Self {
            id,
            qos,
            buffer_limit,
            filter,
        }
    }
}

/// How identifiers map onto slots. Both values belong to the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableGeometry {
    pub slot_count: usize,
    pub app_id_mask: u16,
}

impl TableGeometry {
    pub fn new(slot_count: usize, app_id_mask: u16) -> Self {
        Self {
            slot_count,
            app_id_mask,
        }
    }

    /// Masked slot index, or `None` when it falls outside the table.
    pub fn slot_of(&self, id: MessageId) -> Option<usize> {
        let slot = usize::from(id.value() & self.app_id_mask);
        (slot < self.slot_count).then_some(slot)
    }
}

impl Default for TableGeometry {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_COUNT, DEFAULT_APP_ID_MASK)
    }
}

#[derive(Debug, Clone)]
pub struct PacketTable {
    geometry: TableGeometry,
    slots: alloc::vec::Vec<Option<Route>>,
}

impl PacketTable {
    /// Empty table, every slot unused.
    pub fn new(geometry: TableGeometry) -> Self {
        Self {
            geometry,
            slots: vec![None; geometry.slot_count],
        }
    }

    pub fn geometry(&self) -> TableGeometry {
        self.geometry
    }

    /// Validates `id` against the bus identifier space and the slot range.
    pub fn slot_for<B: SoftwareBus + ?Sized>(&self, bus: &B, id: MessageId) -> Result<usize, TableError> {
        if !bus.is_valid_msg_id(id) {
            return Err(TableError::InvalidMessageId(id));
        }
        self.geometry.slot_of(id).ok_or(TableError::InvalidMessageId(id))
    }

    pub fn slot(&self, slot: usize) -> Option<&Route> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// The route stored for exactly this identifier.
    pub fn get(&self, id: MessageId) -> Option<&Route> {
        self.geometry
            .slot_of(id)
            .and_then(|slot| self.slot(slot))
            .filter(|route| route.id == id)
    }

    pub fn is_occupied(&self, slot: usize) -> bool {
        self.slot(slot).is_some()
    }

    pub(crate) fn set(&mut self, slot: usize, route: Route) {
        self.slots[slot] = Some(route);
    }

    pub(crate) fn clear(&mut self, slot: usize) -> Option<Route> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub(crate) fn set_filter(&mut self, slot: usize, filter: PacketFilter) -> Option<PacketFilter> {
        self.slots
            .get_mut(slot)
            .and_then(Option::as_mut)
            .map(|route| core::mem::replace(&mut route.filter, filter))
    }

    pub fn routes(&self) -> impl Iterator<Item = (usize, &Route)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, route)| route.as_ref().map(|r| (slot, r)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

/// One entry of a packet table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDef {
    pub stream_id: MessageId,
    #[serde(default)]
    pub qos: Qos,
    pub buf_lim: u16,
    pub filter: FilterSpec,
}

impl RouteDef {
    pub fn from_route(route: &Route) -> Self {
        Self {
            stream_id: route.id,
            qos: route.qos,
            buf_lim: route.buffer_limit,
            filter: route.filter.into(),
        }
    }
}

/// Packet table document as loaded from storage or carried by a load command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketTableDef {
    #[serde(default)]
    pub packets: alloc::vec::Vec<RouteDef>,
}

impl PacketTableDef {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, crate::error::ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&content)?)
    }

    pub fn from_table(table: &PacketTable) -> Self {
        Self {
            packets: table.routes().map(|(_, route)| RouteDef::from_route(route)).collect(),
        }
    }

    /// Checks every entry and builds the slot-ordered table. Nothing is
    /// subscribed here; the result is handed to the packet manager.
    pub fn validate<B: SoftwareBus + ?Sized>(
        &self,
        geometry: TableGeometry,
        bus: &B,
    ) -> Result<PacketTable, TableError> {
        let mut table = PacketTable::new(geometry);

        for def in &self.packets {
            let slot = table.slot_for(bus, def.stream_id)?;
            let filter = PacketFilter::try_from(def.filter)?;

            if let Some(existing) = table.slot(slot) {
                return Err(TableError::SlotConflict {
                    slot,
                    first: existing.id,
                    second: def.stream_id,
                });
            }

            table.set(slot, Route::new(def.stream_id, def.qos, def.buf_lim, filter));
        }

        Ok(table)
    }
}
