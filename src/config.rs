//! Gateway configuration.
//!
//! Everything here is a property of the deployment rather than of the
//! routing core: cycle period bounds, warm-up delays, table geometry, the
//! bus identifier space and the message ids the gateway publishes under.

use crate::bus::{DEFAULT_HIGHEST_VALID_MSG_ID, MAX_PIPE_DEPTH};
use crate::error::ConfigError;
use crate::message::MessageId;
use crate::stats::DEFAULT_STATS_INTERVAL_MS;
use crate::table::{TableGeometry, DEFAULT_APP_ID_MASK, DEFAULT_SLOT_COUNT};
use crate::transport::DEFAULT_TLM_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_RUN_LOOP_DELAY_MS: u32 = 500;
pub const MIN_RUN_LOOP_DELAY_MS: u32 = 20;
pub const MAX_RUN_LOOP_DELAY_MS: u32 = 20000;
pub const STATS_STARTUP_DELAY_MS: u32 = 20000;
pub const STATS_RECONFIG_DELAY_MS: u32 = 5000;
pub const DEFAULT_PIPE_DEPTH: usize = 256;
pub const DEFAULT_COMMAND_PORT: u16 = 8090;
pub const HK_TLM_MID: u16 = 0x0880;
pub const PKT_TBL_TLM_MID: u16 = 0x0881;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Output cycle period at start-up.
    pub run_loop_delay_ms: u32,
    pub min_run_loop_delay_ms: u32,
    pub max_run_loop_delay_ms: u32,

    /// Warm-up after start-up, table loads and output enables.
    pub stats_startup_delay_ms: u32,
    /// Warm-up after status resets and cycle period changes.
    pub stats_reconfig_delay_ms: u32,
    pub stats_interval_ms: u32,

    pub tlm_port: u16,
    pub pipe_depth: usize,
    pub slot_count: usize,
    pub app_id_mask: u16,
    pub highest_valid_msg_id: u16,

    pub hk_tlm_mid: MessageId,
    pub pkt_tbl_tlm_mid: MessageId,

    pub default_dest_ip: Option<String>,
    pub command_port: u16,
    pub packet_table: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            run_loop_delay_ms: DEFAULT_RUN_LOOP_DELAY_MS,
            min_run_loop_delay_ms: MIN_RUN_LOOP_DELAY_MS,
            max_run_loop_delay_ms: MAX_RUN_LOOP_DELAY_MS,
            stats_startup_delay_ms: STATS_STARTUP_DELAY_MS,
            stats_reconfig_delay_ms: STATS_RECONFIG_DELAY_MS,
            stats_interval_ms: DEFAULT_STATS_INTERVAL_MS,
            tlm_port: DEFAULT_TLM_PORT,
            pipe_depth: DEFAULT_PIPE_DEPTH,
            slot_count: DEFAULT_SLOT_COUNT,
            app_id_mask: DEFAULT_APP_ID_MASK,
            highest_valid_msg_id: DEFAULT_HIGHEST_VALID_MSG_ID,
            hk_tlm_mid: MessageId(HK_TLM_MID),
            pkt_tbl_tlm_mid: MessageId(PKT_TBL_TLM_MID),
            default_dest_ip: None,
            command_port: DEFAULT_COMMAND_PORT,
            packet_table: None,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn geometry(&self) -> TableGeometry {
        TableGeometry::new(self.slot_count, self.app_id_mask)
    }

    pub fn run_loop_delay_in_range(&self, delay_ms: u32) -> bool {
        (self.min_run_loop_delay_ms..=self.max_run_loop_delay_ms).contains(&delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_run_loop_delay_ms == 0 || self.min_run_loop_delay_ms > self.max_run_loop_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "run loop delay range [{},{}] is empty or starts at zero",
                self.min_run_loop_delay_ms, self.max_run_loop_delay_ms
            )));
        }
        if !self.run_loop_delay_in_range(self.run_loop_delay_ms) {
            return Err(ConfigError::Invalid(format!(
                "run loop delay {} ms outside [{},{}]",
                self.run_loop_delay_ms, self.min_run_loop_delay_ms, self.max_run_loop_delay_ms
            )));
        }
        if self.stats_interval_ms == 0 {
            return Err(ConfigError::Invalid("stats interval must be non-zero".to_string()));
        }
        if self.pipe_depth == 0 || self.pipe_depth > MAX_PIPE_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "pipe depth {} outside [1,{}]",
                self.pipe_depth, MAX_PIPE_DEPTH
            )));
        }
        if self.slot_count == 0 {
            return Err(ConfigError::Invalid("slot count must be non-zero".to_string()));
        }
        if usize::from(self.app_id_mask) >= self.slot_count {
            return Err(ConfigError::Invalid(format!(
                "app id mask 0x{:04X} addresses slots beyond the {} slot table",
                self.app_id_mask, self.slot_count
            )));
        }
        if self.tlm_port == 0 {
            return Err(ConfigError::Invalid("telemetry port must be non-zero".to_string()));
        }
        Ok(())
    }
}
