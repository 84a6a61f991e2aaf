//! Packet manager: owns the packet table, the output pipe subscriptions, the
//! ground destination and the throughput statistics, and moves telemetry from
//! the bus to the ground once per output cycle.
//!
//! Bulk operations (table load, remove all) carry on past individual bus
//! failures and report them as partial failures. Nothing here is rolled back.

use crate::bus::SoftwareBus;
use crate::config::GatewayConfig;
use crate::error::{BusError, OutputError, TableError};
use crate::filter::{self, FilterSpec, PacketFilter};
use crate::message::{BusMessage, MessageId};
use crate::protocol::PacketTableTlm;
use crate::stats::StatisticsEngine;
use crate::subscription::SubscriptionManager;
use crate::table::{PacketTable, Qos, Route};
use crate::transport::{self, Destination, SocketFactory};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What one output cycle did with the messages it drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub drained: u32,
    pub packets_sent: u32,
    pub bytes_sent: u64,
    pub filtered: u32,
    pub unrouted: u32,
    /// Drained while the downlink was disabled or suppressed.
    pub not_sent: u32,
    pub send_errors: u32,
}

/// Running totals since the last status reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTotals {
    pub cycles: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub filtered: u64,
    pub unrouted: u64,
    pub not_sent: u64,
    pub send_errors: u64,
}

impl OutputTotals {
    fn add(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.packets_sent += u64::from(report.packets_sent);
        self.bytes_sent += report.bytes_sent;
        self.filtered += u64::from(report.filtered);
        self.unrouted += u64::from(report.unrouted);
        self.not_sent += u64::from(report.not_sent);
        self.send_errors += u64::from(report.send_errors);
    }
}

pub struct PacketManager<B: SoftwareBus, F: SocketFactory> {
    table: PacketTable,
    subscriptions: SubscriptionManager<B>,
    factory: F,
    destination: Destination<F::Socket>,
    stats: StatisticsEngine,
    startup_delay_ms: u32,
    reconfig_delay_ms: u32,
    totals: OutputTotals,
    shut_down: bool,
}

impl<B: SoftwareBus, F: SocketFactory> PacketManager<B, F> {
    /// Empty table, downlink disabled, statistics warming up over the
    /// start-up delay.
    pub fn new(bus: B, factory: F, config: &GatewayConfig) -> Self {
        Self {
            table: PacketTable::new(config.geometry()),
            subscriptions: SubscriptionManager::new(bus),
            factory,
            destination: Destination::new(config.tlm_port),
            stats: StatisticsEngine::new(
                config.run_loop_delay_ms,
                config.stats_startup_delay_ms,
                config.stats_interval_ms,
            ),
            startup_delay_ms: config.stats_startup_delay_ms,
            reconfig_delay_ms: config.stats_reconfig_delay_ms,
            totals: OutputTotals::default(),
            shut_down: false,
        }
    }

    /// Replace the whole table. Existing entries are removed first, then every
    /// route is copied in and subscribed. Subscribe failures are counted and
    /// the remaining routes are still loaded.
    pub fn load_table(&mut self, table: PacketTable) -> Result<usize, TableError> {
        if let Err(e) = self.remove_all_packets() {
            warn!("Packet table load continuing after removal failures: {}", e);
        }

        let mut packets = 0;
        let mut failed = 0;
        for (_, route) in table.routes() {
            packets += 1;
            if self.load_table_entry(*route).is_err() {
                failed += 1;
            }
        }

        if failed > 0 {
            error!(packets, failed, "Packet table loaded with subscription failures");
            return Err(TableError::PartialLoad { packets, failed });
        }

        self.stats.reinit(None, self.startup_delay_ms);
        info!(packets, "Packet table loaded");
        Ok(packets)
    }

    /// Copy one route into its slot and subscribe to it. The route stays in
    /// the table even if the subscription fails. A route with another id in
    /// the same slot is displaced and unsubscribed.
    pub fn load_table_entry(&mut self, route: Route) -> Result<usize, TableError> {
        let slot = self.table.slot_for(self.subscriptions.bus(), route.id)?;

        let mut displaced = Ok(());
        if let Some(old) = self.table.slot(slot).map(|r| r.id).filter(|&id| id != route.id) {
            warn!(stream_id = %route.id, displaced_id = %old, slot, "Packet table entry replaces another packet");
            self.table.clear(slot);
            displaced = self
                .subscriptions
                .unsubscribe(old)
                .map_err(|source| TableError::UnsubscribeFailed { id: old, source });
        }

        self.table.set(slot, route);
        self.subscriptions
            .subscribe(&route)
            .map_err(|source| TableError::SubscribeFailed { id: route.id, source })?;
        displaced?;
        Ok(slot)
    }

    pub fn add_packet(
        &mut self,
        id: MessageId,
        qos: Qos,
        buffer_limit: u16,
        filter: FilterSpec,
    ) -> Result<usize, TableError> {
        let slot = self.table.slot_for(self.subscriptions.bus(), id)?;
        let filter = PacketFilter::try_from(filter)?;

        if self.table.is_occupied(slot) {
            warn!(stream_id = %id, slot, "Error adding packet, it already exists in the packet table");
            return Err(TableError::AlreadyExists(id));
        }

        let route = Route::new(id, qos, buffer_limit, filter);
        self.subscriptions
            .subscribe(&route)
            .map_err(|source| TableError::SubscribeFailed { id, source })?;
        self.table.set(slot, route);

        info!(stream_id = %id, slot, buf_lim = buffer_limit, "Added packet");
        Ok(slot)
    }

    /// Remove one packet. An unsubscribe failure is reported, but the route
    /// is gone from the table either way.
    pub fn remove_packet(&mut self, id: MessageId) -> Result<Route, TableError> {
        let slot = self.table.slot_for(self.subscriptions.bus(), id)?;
        if self.table.get(id).is_none() {
            warn!(stream_id = %id, "Error removing packet, it is not defined in the packet table");
            return Err(TableError::NotInTable(id));
        }

        let route = self.table.clear(slot).ok_or(TableError::NotInTable(id))?;
        self.subscriptions.unsubscribe(id).map_err(|source| {
            error!(stream_id = %id, "Removed packet from table, unsubscribe failed: {}", source);
            TableError::UnsubscribeFailed { id, source }
        })?;

        info!(stream_id = %id, slot, "Removed packet");
        Ok(route)
    }

    /// Remove every packet and flush anything left on the pipe.
    pub fn remove_all_packets(&mut self) -> Result<usize, TableError> {
        let occupied: alloc::vec::Vec<(usize, MessageId)> =
            self.table.routes().map(|(slot, route)| (slot, route.id)).collect();

        let mut failed = 0;
        for &(slot, id) in &occupied {
            self.table.clear(slot);
            if let Err(e) = self.subscriptions.unsubscribe(id) {
                failed += 1;
                error!(stream_id = %id, "Error removing packet: {}", e);
            }
        }

        let flushed = self.subscriptions.flush_pipe();
        let packets = occupied.len();

        if failed > 0 {
            return Err(TableError::PartialRemove { packets, failed });
        }
        info!(packets, flushed, "Removed all packets");
        Ok(packets)
    }

    /// Replace the filter of an existing packet. Returns the previous filter.
    pub fn update_filter(&mut self, id: MessageId, filter: FilterSpec) -> Result<PacketFilter, TableError> {
        let slot = self.table.slot_for(self.subscriptions.bus(), id)?;
        if self.table.get(id).is_none() {
            warn!(stream_id = %id, "Error updating filter, packet is not defined in the packet table");
            return Err(TableError::NotInTable(id));
        }

        let new_filter = PacketFilter::try_from(filter).map_err(|e| {
            warn!(stream_id = %id, "Error updating filter: {}", e);
            e
        })?;

        let old = self.table.set_filter(slot, new_filter).ok_or(TableError::NotInTable(id))?;
        info!(
            stream_id = %id,
            old_type = old.kind.code(),
            new_type = new_filter.kind.code(),
            n = new_filter.params.n,
            x = new_filter.params.x,
            o = new_filter.params.o,
            "Updated packet filter"
        );
        Ok(old)
    }

    /// Direct output at `dest_ip`. Opens the socket on first use; later calls
    /// only retarget it and clear a latched send failure.
    pub fn enable_output(&mut self, dest_ip: &str) -> Result<bool, OutputError> {
        let opened = self.destination.enable(&mut self.factory, dest_ip).map_err(|e| {
            error!("Telemetry output enable failed: {}", e);
            e
        })?;

        self.stats.reinit(None, self.startup_delay_ms);
        info!(
            dest_ip = self.destination.ip(),
            port = self.destination.port(),
            socket_id = self.destination.socket_id(),
            "Telemetry output enabled"
        );
        Ok(opened)
    }

    pub fn reset_status(&mut self) {
        self.totals = OutputTotals::default();
        self.subscriptions.reset_stats();
        self.stats.reinit(None, self.reconfig_delay_ms);
    }

    /// New output cycle period. Statistics restart their warm-up.
    pub fn set_cycle_period(&mut self, cycle_period_ms: u32) {
        self.stats.reinit(Some(cycle_period_ms), self.reconfig_delay_ms);
    }

    /// Drain the output pipe and downlink whatever passes its route's filter.
    /// The pipe is always emptied, even while nothing can be sent.
    pub fn output_telemetry(&mut self, now: Instant) -> CycleReport {
        let mut report = CycleReport::default();

        while let Some(msg) = self.subscriptions.receive_poll() {
            report.drained += 1;

            if !self.destination.can_send() {
                report.not_sent += 1;
                continue;
            }

            let Some(route) = self.table.get(msg.msg_id()) else {
                report.unrouted += 1;
                debug!(stream_id = %msg.msg_id(), "dropping message with no packet table entry");
                continue;
            };

            if !filter::evaluate(&msg, &route.filter).passed() {
                report.filtered += 1;
                continue;
            }

            match self.destination.send(msg.as_bytes()) {
                Ok(_) => {
                    report.packets_sent += 1;
                    report.bytes_sent += msg.len() as u64;
                }
                Err(e) if transport::is_transient(&e) => {
                    report.send_errors += 1;
                    warn!(stream_id = %msg.msg_id(), "Send telemetry dropped one packet: {}", e);
                }
                Err(e) => {
                    report.send_errors += 1;
                    error!(
                        stream_id = %msg.msg_id(),
                        dest_ip = self.destination.ip(),
                        "Send telemetry error, output suppressed until re-enabled: {}", e
                    );
                    self.destination.suppress();
                }
            }
        }

        self.stats.update(report.packets_sent, report.bytes_sent, now);
        self.totals.add(&report);

        if report.drained > 0 {
            debug!(
                drained = report.drained,
                sent = report.packets_sent,
                bytes = report.bytes_sent,
                filtered = report.filtered,
                "output cycle"
            );
        }
        report
    }

    /// Snapshot of the slot `id` maps to.
    pub fn packet_table_tlm(&self, id: MessageId) -> Result<PacketTableTlm, TableError> {
        let slot = self.table.slot_for(self.subscriptions.bus(), id)?;
        Ok(self
            .table
            .slot(slot)
            .map_or_else(|| PacketTableTlm::unused(id), PacketTableTlm::from_route))
    }

    /// Publish a message of our own on the bus.
    pub fn transmit(&mut self, msg: BusMessage) -> Result<(), BusError> {
        self.subscriptions.transmit(msg)
    }

    pub fn table(&self) -> &PacketTable {
        &self.table
    }

    pub fn destination(&self) -> &Destination<F::Socket> {
        &self.destination
    }

    pub fn stats(&self) -> &StatisticsEngine {
        &self.stats
    }

    pub fn subscriptions(&self) -> &SubscriptionManager<B> {
        &self.subscriptions
    }

    pub fn bus(&self) -> &B {
        self.subscriptions.bus()
    }

    pub fn totals(&self) -> &OutputTotals {
        &self.totals
    }

    /// Close the output socket and drop every subscription. Only the first
    /// call does anything.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        self.destination.close();
        let ids: alloc::vec::Vec<MessageId> = self.table.routes().map(|(_, route)| route.id).collect();
        for id in ids {
            if let Err(e) = self.subscriptions.unsubscribe(id) {
                warn!(stream_id = %id, "unsubscribe at shutdown failed: {}", e);
            }
        }
        info!("Packet manager shut down");
    }
}

impl<B: SoftwareBus, F: SocketFactory> Drop for PacketManager<B, F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
