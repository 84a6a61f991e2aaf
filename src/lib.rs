//! # Telemetry Downlink Gateway
//!
//! Routes telemetry from an onboard software bus to a ground station over UDP.
//! A packet table names the messages that go to the ground, each with its bus
//! QoS, a per-message buffer limit and a decimation filter. Once per output
//! cycle the gateway drains its bus pipe, filters what it drained and sends
//! the survivors unacknowledged to the configured destination.
//!
//! ## Features
//!
//! - **Packet table**: slot-per-application-id routing table with add, remove,
//!   bulk load and in-place filter updates
//! - **Decimation filters**: pass X of every N packets by sequence count or by
//!   time stamp seconds, with an offset
//! - **Subscription tracking**: bus subscriptions kept in step with the table
//! - **Throughput statistics**: warm-up aware, interval smoothed packet and
//!   byte rates
//! - **Command interface**: JSON commands with housekeeping telemetry
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Instant;
//! use tlmgate::{GatewayConfig, LocalBus, TelemetryOutputApp, UdpSocketFactory};
//!
//! let bus = LocalBus::default();
//! let mut app = TelemetryOutputApp::new(bus.clone(), UdpSocketFactory, GatewayConfig::default())
//!     .expect("default configuration is valid");
//!
//! // One output cycle, then whatever commands were queued
//! let report = app.run_cycle(Instant::now());
//! assert_eq!(report.packets_sent, 0);
//! ```
//!
//! ## Architecture
//!
//! - [`app`] - Command handling, run loop and housekeeping
//! - [`manager`] - Packet table ownership and the output cycle
//! - [`table`] - Slots, routes and packet table documents
//! - [`filter`] - Decimation filters
//! - [`subscription`] - Bus subscriptions for the output pipe
//! - [`stats`] - Throughput statistics
//! - [`transport`] - UDP destination
//! - [`bus`] - Software bus interface and the in-process bus

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

extern crate alloc;

pub mod app;
pub mod bus;
pub mod config;
pub mod error;
pub mod filter;
pub mod manager;
pub mod message;
pub mod protocol;
pub mod stats;
pub mod subscription;
pub mod table;
pub mod transport;

// Re-export main public types for convenience
pub use app::TelemetryOutputApp;
pub use bus::{LocalBus, SoftwareBus};
pub use config::GatewayConfig;
pub use error::{AppError, TableError};
pub use filter::{FilterParams, FilterSpec, PacketFilter};
pub use manager::{CycleReport, PacketManager};
pub use message::{BusMessage, MessageId, MsgTime};
pub use protocol::{Command, CommandResponse, CommandType, ResponseStatus};
pub use table::{PacketTableDef, Qos, Route};
pub use transport::{SocketFactory, UdpSocketFactory};
