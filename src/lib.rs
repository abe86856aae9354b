//! # tinybms-rs - A Rust Gateway from TinyBMS Serial to the Victron CAN Bus
//!
//! The tinybms-rs crate bridges an Energus TinyBMS battery-management module
//! onto a Victron-Energy compatible CAN bus, so commercial inverters and
//! chargers recognise the pack and respect its limits.
//!
//! ## Features
//!
//! - Poll a TinyBMS module over its MODBUS-like serial protocol, with
//!   CRC-16 framing, timeout/retry handling, and a typed register catalogue
//! - Maintain a coherent live-data model with bounded history and
//!   synchronous listener fan-out
//! - Compute charge voltage and current limits through a six-state CVL
//!   machine with cell protection and imbalance hold
//! - Publish the 19-frame Victron BMS-CAN register set on per-channel
//!   periods, with keep-alive and handshake liveness
//! - Accumulate charged/discharged energy with crash-safe persistence
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tinybms_rs::{Gateway, GatewayConfig};
//! use tinybms_rs::victron::can_mock::MockCanBus;
//! use tinybms_rs::tinybms::serial_mock::MockSerialPort;
//!
//! # async fn demo() -> Result<(), tinybms_rs::Error> {
//! let config = GatewayConfig::default();
//! let gateway = Gateway::start(config, MockSerialPort::new(), Arc::new(MockCanBus::new())).await?;
//! // ... run until shutdown ...
//! gateway.deinit().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod energy;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod model;
pub mod tinybms;
pub mod util;
pub mod victron;

pub use crate::config::GatewayConfig;
pub use crate::error::{DecodeError, Error};
pub use crate::gateway::Gateway;
pub use crate::logging::{init_logger, log_info};

// Core TinyBMS types
pub use tinybms::client::{PollConfig, TinyBmsClient};
pub use tinybms::frame::{encode_read, encode_write, parse_reply, ReplyFrame, ReplyType};
pub use tinybms::registers::{RegisterDescriptor, RegisterGroup, RegisterKind, RegisterValue};
pub use tinybms::serial::{SerialConfig, TinyBmsTransport};

// Live-data model
pub use model::live_data::{LiveData, OnlineStatus};
pub use model::simulator::{BmsSimulator, SimulatorConfig};
pub use model::store::{CondensedSample, ConnectionStatus, LiveDataStore};

// Energy accounting
pub use energy::integrator::{EnergyConfig, EnergyIntegrator, EnergyState};
pub use energy::persistence::{JsonFileStore, KeyValueStore};

// Victron CAN side
pub use victron::can::{CanBus, CanBusState, CanConfig, CanDriver, CanFrame, CanStats};
pub use victron::cvl::{CvlConfig, CvlEngine, CvlRuntime, CvlState};
pub use victron::encoders::{BatteryIdentity, PublisherChannel, CHANNELS};
pub use victron::events::{EventBus, GatewayEvent};
pub use victron::publisher::{Publisher, PublisherConfig};
