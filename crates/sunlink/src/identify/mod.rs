// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Device identification: probe a live session with candidate protocols until
//! one matches.
//!
//! Modbus protocols are tried first (inverters and meters dominate the
//! fleet), then command protocols, each group in priority order. Every probe
//! is bounded by the protocol's identification timeout plus one second of
//! slack so a silent candidate cannot eat the next candidate's slice.

pub mod command;
pub mod modbus;

use crate::protocol::{ProtocolDefinition, ProtocolRegistry, Transport};
use crate::session::{Session, SessionError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a successful probe.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifiedDevice {
    pub protocol_id: String,
    pub serial_number: String,
    pub device_type: String,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub firmware_version: Option<String>,
    /// True when serial extraction failed and the serial was synthesized from
    /// the peer address. Degraded identification; the device still registers.
    pub fallback_serial: bool,
    pub extra: BTreeMap<String, serde_json::Value>,
    pub identified_at: DateTime<Utc>,
}

impl IdentifiedDevice {
    fn new(protocol: &ProtocolDefinition, serial_number: String, fallback_serial: bool) -> Self {
        Self {
            protocol_id: protocol.protocol_id.clone(),
            serial_number,
            device_type: protocol.device_type.as_str().to_string(),
            model: Some(protocol.name.clone()),
            manufacturer: protocol.manufacturer.clone(),
            firmware_version: None,
            fallback_serial,
            extra: BTreeMap::new(),
            identified_at: Utc::now(),
        }
    }
}

/// Why a probe did not identify the peer.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The device answered and definitively does not speak this protocol
    /// (wrong identification value, Modbus exception, wrong magic header,
    /// empty text response).
    #[error("no match")]
    Miss,
    /// Transport-level failure; the next candidate may still succeed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Synthesize the deterministic fallback serial for a protocol/peer pair.
pub fn fallback_serial(protocol_id: &str, session: &Session) -> String {
    format!(
        "{}_{}_{}",
        protocol_id,
        session.remote_ip(),
        session.remote_port()
    )
}

/// Probing orchestrator: owns the per-transport probers and walks the
/// registry's priority order.
pub struct Prober {
    registry: Arc<ProtocolRegistry>,
}

impl Prober {
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    /// Identify the device behind a session. First success wins; `None`
    /// after every candidate missed.
    pub async fn identify(&self, session: &Session) -> Option<IdentifiedDevice> {
        info!(
            "Starting device identification for {}",
            session.remote_addr()
        );

        for protocol in self.registry.iter_modbus_by_priority() {
            match self.try_protocol(session, protocol).await {
                Ok(identified) => return Some(identified),
                Err(ProbeError::Session(SessionError::Closed)) => {
                    debug!("Session closed during identification");
                    return None;
                }
                Err(_) => continue,
            }
        }

        for protocol in self.registry.iter_command_by_priority() {
            match self.try_protocol(session, protocol).await {
                Ok(identified) => return Some(identified),
                Err(ProbeError::Session(SessionError::Closed)) => {
                    debug!("Session closed during identification");
                    return None;
                }
                Err(_) => continue,
            }
        }

        warn!(
            "Failed to identify device on {} after trying {} protocols",
            session.remote_addr(),
            self.registry.len()
        );
        None
    }

    /// Identify using one specific protocol (known or suspected peer).
    pub async fn identify_with_protocol(
        &self,
        session: &Session,
        protocol_id: &str,
    ) -> Option<IdentifiedDevice> {
        let protocol = match self.registry.get(protocol_id) {
            Some(protocol) => protocol,
            None => {
                warn!("Unknown protocol: {}", protocol_id);
                return None;
            }
        };
        self.try_protocol(session, protocol).await.ok()
    }

    /// Diagnostic sweep: run every candidate to completion and return all
    /// matches instead of stopping at the first.
    pub async fn probe_all(&self, session: &Session) -> Vec<IdentifiedDevice> {
        let mut matches = Vec::new();
        for protocol in self.registry.iter_by_priority() {
            if let Ok(identified) = self.try_protocol(session, protocol).await {
                matches.push(identified);
            }
        }
        matches
    }

    async fn try_protocol(
        &self,
        session: &Session,
        protocol: &ProtocolDefinition,
    ) -> Result<IdentifiedDevice, ProbeError> {
        debug!("Trying protocol: {}", protocol.protocol_id);

        // One second of slack on top of the per-protocol deadline keeps a
        // wedged probe from consuming the next candidate's slice.
        let budget = protocol.identification_timeout() + Duration::from_secs(1);

        let probe = async {
            match protocol.transport {
                Transport::ModbusTcp | Transport::ModbusRtu => {
                    modbus::probe(session, protocol).await
                }
                Transport::Command => command::probe(session, protocol).await,
                Transport::Ble => {
                    // BLE devices are not reachable over a logger TCP session.
                    debug!("Skipping BLE protocol: {}", protocol.protocol_id);
                    Err(ProbeError::Miss)
                }
            }
        };

        match tokio::time::timeout(budget, probe).await {
            Ok(Ok(identified)) => {
                info!(
                    "Identified {} (serial: {}{})",
                    identified.protocol_id,
                    identified.serial_number,
                    if identified.fallback_serial {
                        ", synthesized"
                    } else {
                        ""
                    }
                );
                Ok(identified)
            }
            Ok(Err(e)) => {
                debug!("Probe {} failed: {}", protocol.protocol_id, e);
                Err(e)
            }
            Err(_) => {
                debug!("Timeout probing {}", protocol.protocol_id);
                Err(ProbeError::Session(SessionError::Timeout))
            }
        }
    }
}
