use crate::bus::SoftwareBus;
use crate::config::GatewayConfig;
use crate::error::{AppError, OutputError, TableError};
use crate::filter::{self, FilterParams, PacketFilter};
use crate::manager::{CycleReport, PacketManager};
use crate::message::{BusMessage, MessageId, MsgTime};
use crate::protocol::{
    Command, CommandResponse, CommandType, FilterTrace, HousekeepingTlm, PacketTableTlm, ProtocolHandler,
    ResponseStatus,
};
use crate::table::PacketTableDef;
use crate::transport::SocketFactory;
use heapless::{spsc::Queue, Vec};
use std::time::Instant;
use tracing::{error, info, warn};

const MAX_COMMAND_QUEUE_SIZE: usize = 32;
const MAX_RESPONSES: usize = 16;
/// Steps run by each half of the filter self-test.
pub const FILTER_TEST_STEPS: usize = 20;

type CommandQueue = Queue<Command, MAX_COMMAND_QUEUE_SIZE>;
pub type FilterTestTrace = Vec<FilterTrace, FILTER_TEST_STEPS>;

/// The telemetry output application: command handling, the output cycle and
/// housekeeping around a [`PacketManager`].
pub struct TelemetryOutputApp<B: SoftwareBus, F: SocketFactory> {
    config: GatewayConfig,
    manager: PacketManager<B, F>,
    protocol_handler: ProtocolHandler,

    command_queue: CommandQueue,
    response_buffer: Vec<CommandResponse, MAX_RESPONSES>,

    valid_cmd_cnt: u16,
    invalid_cmd_cnt: u16,
    run_loop_delay_ms: u32,
    last_table_load_ok: bool,
    start_time: Instant,
}

impl<B: SoftwareBus, F: SocketFactory> TelemetryOutputApp<B, F> {
    /// Build the application and apply the start-up parts of the
    /// configuration: the initial packet table and the default destination.
    pub fn new(bus: B, factory: F, config: GatewayConfig) -> Result<Self, AppError> {
        config.validate()?;

        let mut app = Self {
            manager: PacketManager::new(bus, factory, &config),
            protocol_handler: ProtocolHandler::new(),
            command_queue: Queue::new(),
            response_buffer: Vec::new(),
            valid_cmd_cnt: 0,
            invalid_cmd_cnt: 0,
            run_loop_delay_ms: config.run_loop_delay_ms,
            last_table_load_ok: false,
            start_time: Instant::now(),
            config,
        };

        if let Some(path) = app.config.packet_table.clone() {
            let def = PacketTableDef::from_file(&path)?;
            match app.load_table(&def) {
                Ok(packets) => info!(path = %path.display(), packets, "Initial packet table loaded"),
                Err(AppError::Table(e @ TableError::PartialLoad { .. })) => {
                    error!(path = %path.display(), "Initial packet table load incomplete: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(ip) = app.config.default_dest_ip.clone() {
            app.manager.enable_output(&ip)?;
        }

        info!(
            run_loop_delay_ms = app.run_loop_delay_ms,
            tlm_port = app.config.tlm_port,
            "Telemetry output app initialized"
        );
        Ok(app)
    }

    /// One pass of the run loop: downlink first, then commands that arrived
    /// since the previous pass, then one housekeeping packet.
    pub fn run_cycle(&mut self, now: Instant) -> CycleReport {
        let report = self.manager.output_telemetry(now);
        self.process_commands();
        if let Err(e) = self.send_housekeeping() {
            warn!("Housekeeping not sent: {}", e);
        }
        report
    }

    pub fn queue_command(&mut self, command: Command) -> Result<(), AppError> {
        self.command_queue.enqueue(command).map_err(|_| AppError::CommandQueueFull)
    }

    pub fn process_commands(&mut self) {
        while let Some(command) = self.command_queue.dequeue() {
            let response = self.execute_command(command);
            if self.response_buffer.is_full() {
                self.response_buffer.remove(0);
            }
            let _ = self.response_buffer.push(response);
        }
    }

    pub fn take_responses(&mut self) -> Vec<CommandResponse, MAX_RESPONSES> {
        core::mem::take(&mut self.response_buffer)
    }

    /// Parse and execute one JSON command line. Unparseable input counts as
    /// an invalid command.
    pub fn handle_json(&mut self, json: &str) -> CommandResponse {
        match self.protocol_handler.parse_command(json) {
            Ok(command) => self.execute_command(command),
            Err(e) => {
                self.invalid_cmd_cnt = self.invalid_cmd_cnt.wrapping_add(1);
                warn!("Rejected command: {}", e);
                self.protocol_handler.create_response(
                    0,
                    self.uptime_ms(),
                    ResponseStatus::InvalidCommand,
                    Some(e.to_string()),
                )
            }
        }
    }

    pub fn execute_command(&mut self, command: Command) -> CommandResponse {
        let name = command.command_type.name();

        let (status, message) = match self.dispatch(command.command_type) {
            Ok(message) => (ResponseStatus::Success, message),
            Err(e) => {
                warn!(command = name, "Command failed: {}", e);
                (response_status(&e), Some(e.to_string()))
            }
        };

        match status {
            ResponseStatus::Success => self.valid_cmd_cnt = self.valid_cmd_cnt.wrapping_add(1),
            _ => self.invalid_cmd_cnt = self.invalid_cmd_cnt.wrapping_add(1),
        }

        self.protocol_handler.create_response(command.id, self.uptime_ms(), status, message)
    }

    fn dispatch(&mut self, command_type: CommandType) -> Result<Option<String>, AppError> {
        match command_type {
            CommandType::Noop => {
                info!("No operation command received");
                Ok(None)
            }
            CommandType::ResetStatus => {
                self.reset_status();
                Ok(None)
            }
            CommandType::LoadTable { table } => {
                let packets = self.load_table(&table)?;
                Ok(Some(format!("loaded {} packets", packets)))
            }
            CommandType::AddPacket { stream_id, qos, buf_lim, filter } => {
                let slot = self.manager.add_packet(stream_id, qos, buf_lim, filter)?;
                Ok(Some(format!("added {} in slot {}", stream_id, slot)))
            }
            CommandType::RemovePacket { stream_id } => {
                self.manager.remove_packet(stream_id)?;
                Ok(None)
            }
            CommandType::RemoveAllPackets => {
                let packets = self.manager.remove_all_packets()?;
                Ok(Some(format!("removed {} packets", packets)))
            }
            CommandType::UpdateFilter { stream_id, filter } => {
                self.manager.update_filter(stream_id, filter)?;
                Ok(None)
            }
            CommandType::EnableOutput { dest_ip } => {
                self.manager.enable_output(&dest_ip)?;
                Ok(Some(format!(
                    "downlink to {}:{}",
                    self.manager.destination().ip(),
                    self.manager.destination().port()
                )))
            }
            CommandType::SendPacketTableTlm { stream_id } => {
                let tlm = self.send_packet_table_tlm(stream_id)?;
                Ok(serde_json::to_string(&tlm).ok())
            }
            CommandType::SetRunLoopDelay { delay_ms } => {
                self.set_run_loop_delay(delay_ms)?;
                Ok(None)
            }
            CommandType::TestFilter { params } => {
                let trace = self.test_filter(params);
                let seq_passed = trace.iter().filter(|t| t.seq_cnt_passed).count();
                let time_passed = trace.iter().filter(|t| t.time_passed).count();
                Ok(Some(format!(
                    "sequence filter passed {}/{}, time filter passed {}/{}",
                    seq_passed,
                    trace.len(),
                    time_passed,
                    trace.len()
                )))
            }
            CommandType::SendHousekeeping => {
                let hk = self.send_housekeeping()?;
                Ok(serde_json::to_string(&hk).ok())
            }
        }
    }

    /// Validate a table document and replace the packet table with it.
    pub fn load_table(&mut self, def: &PacketTableDef) -> Result<usize, AppError> {
        self.last_table_load_ok = false;
        let table = def.validate(self.config.geometry(), self.manager.bus())?;
        let packets = self.manager.load_table(table)?;
        self.last_table_load_ok = true;
        Ok(packets)
    }

    /// Zero the command counters and restart the statistics.
    pub fn reset_status(&mut self) {
        self.valid_cmd_cnt = 0;
        self.invalid_cmd_cnt = 0;
        self.manager.reset_status();
        info!("Status counters reset");
    }

    pub fn set_run_loop_delay(&mut self, delay_ms: u32) -> Result<(), AppError> {
        if !self.config.run_loop_delay_in_range(delay_ms) {
            return Err(AppError::InvalidRunLoopDelay {
                requested: delay_ms,
                min: self.config.min_run_loop_delay_ms,
                max: self.config.max_run_loop_delay_ms,
            });
        }

        info!(old = self.run_loop_delay_ms, new = delay_ms, "Run loop delay changed");
        self.run_loop_delay_ms = delay_ms;
        self.manager.set_cycle_period(delay_ms);
        Ok(())
    }

    /// Run `params` through both decimation filters over twenty consecutive
    /// sequence counts and seconds, logging each decision.
    pub fn test_filter(&self, params: FilterParams) -> FilterTestTrace {
        if !params.is_consistent() {
            warn!(n = params.n, x = params.x, o = params.o, "Filter test with X greater than N");
        }

        let seq_filter = PacketFilter::by_seq_count(params.n, params.x, params.o);
        let time_filter = PacketFilter::by_time(params.n, params.x, params.o);
        let mut trace = FilterTestTrace::new();

        for step in 0..FILTER_TEST_STEPS as u16 {
            let time = MsgTime::new(u32::from(step), 0);
            let Ok(packet) = BusMessage::telemetry(MessageId(0), step, time, &[]) else {
                continue;
            };
            let entry = FilterTrace {
                sequence_count: step,
                time,
                seq_cnt_passed: filter::evaluate(&packet, &seq_filter).passed(),
                time_passed: filter::evaluate(&packet, &time_filter).passed(),
            };
            info!(
                seq = step,
                seconds = time.seconds,
                seq_cnt = entry.seq_cnt_passed,
                time = entry.time_passed,
                "filter test step"
            );
            let _ = trace.push(entry);
        }

        trace
    }

    pub fn housekeeping(&self) -> HousekeepingTlm {
        let stats = self.manager.stats();
        let destination = self.manager.destination();

        HousekeepingTlm {
            valid_cmd_cnt: self.valid_cmd_cnt,
            invalid_cmd_cnt: self.invalid_cmd_cnt,
            run_loop_delay_ms: self.run_loop_delay_ms,
            last_table_load_ok: self.last_table_load_ok,
            packets_in_table: self.manager.table().len() as u16,
            stats_state: stats.state(),
            stats_valid: stats.is_valid(),
            pkts_per_sec: stats.avg_packets_per_sec().round() as u16,
            bytes_per_sec: stats.avg_bytes_per_sec().round() as u32,
            downlink_enabled: destination.downlink_enabled(),
            suppress_send: destination.suppress_send(),
            tlm_sock_id: destination.socket_id(),
            tlm_dest_ip: destination.ip().to_string(),
        }
    }

    /// Publish housekeeping on the bus. Returns what was published.
    pub fn send_housekeeping(&mut self) -> Result<HousekeepingTlm, AppError> {
        let hk = self.housekeeping();
        let msg = self
            .protocol_handler
            .encode_housekeeping(self.config.hk_tlm_mid, &hk, MsgTime::now())?;
        self.manager.transmit(msg)?;
        Ok(hk)
    }

    pub fn send_packet_table_tlm(&mut self, stream_id: MessageId) -> Result<PacketTableTlm, AppError> {
        let tlm = self.manager.packet_table_tlm(stream_id)?;
        let msg = self
            .protocol_handler
            .encode_packet_table(self.config.pkt_tbl_tlm_mid, &tlm, MsgTime::now())?;
        self.manager.transmit(msg)?;
        info!(stream_id = %stream_id, in_use = tlm.in_use, "Sent packet table telemetry");
        Ok(tlm)
    }

    pub fn shutdown(&mut self) {
        self.manager.shutdown();
    }

    pub fn manager(&self) -> &PacketManager<B, F> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut PacketManager<B, F> {
        &mut self.manager
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn run_loop_delay_ms(&self) -> u32 {
        self.run_loop_delay_ms
    }

    pub fn valid_cmd_cnt(&self) -> u16 {
        self.valid_cmd_cnt
    }

    pub fn invalid_cmd_cnt(&self) -> u16 {
        self.invalid_cmd_cnt
    }

    pub fn last_table_load_ok(&self) -> bool {
        self.last_table_load_ok
    }

    fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

/// Rejections that changed nothing are invalid commands; failures after the
/// command started changing state are partial or execution failures.
fn response_status(error: &AppError) -> ResponseStatus {
    match error {
        AppError::Table(
            TableError::PartialLoad { .. } | TableError::PartialRemove { .. } | TableError::UnsubscribeFailed { .. },
        ) => ResponseStatus::PartialFailure,
        AppError::Table(TableError::SubscribeFailed { .. }) => ResponseStatus::ExecutionFailed,
        AppError::Output(OutputError::SocketOpen(_)) => ResponseStatus::ExecutionFailed,
        AppError::Bus(_) | AppError::Protocol(_) | AppError::CommandQueueFull => ResponseStatus::ExecutionFailed,
        AppError::Table(_) | AppError::Output(_) | AppError::Config(_) | AppError::InvalidRunLoopDelay { .. } => {
            ResponseStatus::InvalidCommand
        }
    }
}
