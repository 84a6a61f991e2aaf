//! Keeps packet table entries and bus subscriptions in step.
//!
//! Every table mutation that creates a slot subscribes before the slot is
//! committed, every mutation that destroys one unsubscribes after the slot is
//! cleared. The manager itself holds no table state, only the bus handle for
//! the output pipe and failure counters.

use crate::bus::SoftwareBus;
use crate::error::BusError;
use crate::message::{BusMessage, MessageId};
use crate::table::Route;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub subscribes: u32,
    pub unsubscribes: u32,
    pub subscribe_failures: u32,
    pub unsubscribe_failures: u32,
    pub flushed_messages: u32,
}

#[derive(Debug)]
pub struct SubscriptionManager<B: SoftwareBus> {
    bus: B,
    stats: SubscriptionStats,
}

impl<B: SoftwareBus> SubscriptionManager<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            stats: SubscriptionStats::default(),
        }
    }

    pub fn subscribe(&mut self, route: &Route) -> Result<(), BusError> {
        match self.bus.subscribe(route.id, route.qos, route.buffer_limit) {
            Ok(()) => {
                self.stats.subscribes = self.stats.subscribes.wrapping_add(1);
                debug!(stream_id = %route.id, buf_lim = route.buffer_limit, "subscribed");
                Ok(())
            }
            Err(e) => {
                self.stats.subscribe_failures = self.stats.subscribe_failures.wrapping_add(1);
                error!(
                    stream_id = %route.id,
                    buf_lim = route.buffer_limit,
                    "Error subscribing to stream: {}", e
                );
                Err(e)
            }
        }
    }

    pub fn unsubscribe(&mut self, id: MessageId) -> Result<(), BusError> {
        match self.bus.unsubscribe(id) {
            Ok(()) => {
                self.stats.unsubscribes = self.stats.unsubscribes.wrapping_add(1);
                debug!(stream_id = %id, "unsubscribed");
                Ok(())
            }
            Err(e) => {
                self.stats.unsubscribe_failures = self.stats.unsubscribe_failures.wrapping_add(1);
                Err(e)
            }
        }
    }

    /// Discard everything queued on the pipe. Returns the number discarded.
    pub fn flush_pipe(&mut self) -> usize {
        let mut flushed = 0;
        while self.bus.receive_poll().is_some() {
            flushed += 1;
        }
        self.stats.flushed_messages = self.stats.flushed_messages.wrapping_add(flushed as u32);
        debug!(flushed, "output pipe flushed");
        flushed
    }

    pub fn receive_poll(&mut self) -> Option<BusMessage> {
        self.bus.receive_poll()
    }

    pub fn transmit(&mut self, msg: BusMessage) -> Result<(), BusError> {
        self.bus.transmit(msg)
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn stats(&self) -> &SubscriptionStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = SubscriptionStats::default();
    }
}
