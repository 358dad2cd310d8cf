// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Sunlink device server core.
//!
//! Accepts persistent TCP connections from field data-loggers, identifies the
//! connected device by probing it with candidate protocols, then runs a
//! scheduled polling loop that extracts telemetry and ships it to storage
//! backends (TimescaleDB hypertable + control-plane HTTP API).
//!
//! Subsystems:
//! - [`protocol`]: declarative protocol definitions, registry, register maps
//! - [`server`] / [`session`]: TCP acceptor and per-connection sessions
//! - [`connection`]: session lifecycle (identify -> register -> poll)
//! - [`identify`]: Modbus and command-line probing engine
//! - [`adapter`]: per-device pollers created from register maps
//! - [`device`]: identified-device bookkeeping and lifecycle events
//! - [`polling`]: per-device schedulers and the telemetry pipeline
//! - [`storage`]: time-series writer and control-plane client
//! - [`discovery`]: active network scanning reusing the prober
//! - [`command`]: control-plane command queue consumer

pub mod adapter;
pub mod command;
pub mod config;
pub mod connection;
pub mod device;
pub mod discovery;
pub mod identify;
pub mod modbus;
pub mod polling;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

pub use config::Settings;
pub use connection::ConnectionManager;
pub use device::{DeviceEvent, DeviceManager, DeviceStatus};
pub use identify::{IdentifiedDevice, Prober};
pub use protocol::{ProtocolDefinition, ProtocolRegistry};
pub use server::TcpAcceptor;
pub use session::{Session, SessionState};
