// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Device adapters: the per-session pollers the scheduler drives.
//!
//! An adapter's whole public contract is `poll()`, producing one map of
//! decoded metric values. The factory binds a session to its protocol's
//! register map (Modbus) or command script (command transports).

use crate::identify::command::send_text_command;
use crate::modbus::{ModbusClient, ModbusError};
use crate::protocol::{
    CommandSettings, ProtocolDefinition, RegisterDescriptor, RegisterMapCache, Transport,
};
use crate::session::{Session, SessionError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Decoded metrics from one poll.
pub type Metrics = serde_json::Map<String, serde_json::Value>;

/// Why a poll failed. The three kinds drive different failure counters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PollError {
    #[error("poll timed out")]
    Timeout,
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("device refused: {0}")]
    Exception(String),
}

impl From<SessionError> for PollError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Timeout => Self::Timeout,
            other => Self::Io(other.to_string()),
        }
    }
}

/// Poller for one identified device. The adapter set is closed at build time;
/// `adapter_class` in a protocol definition is advisory metadata only.
pub enum DeviceAdapter {
    Modbus(ModbusAdapter),
    Command(CommandAdapter),
}

impl DeviceAdapter {
    /// Poll all readable registers (or run the command script) and return the
    /// decoded metrics.
    pub async fn poll(&self) -> Result<Metrics, PollError> {
        match self {
            Self::Modbus(adapter) => adapter.poll().await,
            Self::Command(adapter) => adapter.poll().await,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        match self {
            Self::Modbus(adapter) => &adapter.session,
            Self::Command(adapter) => &adapter.session,
        }
    }
}

/// Modbus register poller.
pub struct ModbusAdapter {
    session: Arc<Session>,
    client: ModbusClient,
    registers: Arc<Vec<RegisterDescriptor>>,
    protocol_id: String,
}

impl ModbusAdapter {
    pub fn new(
        session: Arc<Session>,
        protocol: &ProtocolDefinition,
        registers: Arc<Vec<RegisterDescriptor>>,
    ) -> Self {
        let timeout = protocol
            .modbus
            .as_ref()
            .map(|m| m.timeout_duration())
            .unwrap_or_else(|| std::time::Duration::from_secs(5));
        Self {
            session,
            client: ModbusClient::new(protocol.unit_id(), timeout),
            registers,
            protocol_id: protocol.protocol_id.clone(),
        }
    }

    /// One read per readable register, sequential. A failed register is
    /// omitted from the result and does not fail the poll; a closed session
    /// does.
    pub async fn poll(&self) -> Result<Metrics, PollError> {
        let mut values = Metrics::new();

        for descriptor in self.registers.iter() {
            if !descriptor.is_readable() {
                continue;
            }

            let words = match self
                .client
                .read_holding_registers(&self.session, descriptor.addr, descriptor.size.max(1))
                .await
            {
                Ok(words) => words,
                Err(ModbusError::Session(SessionError::Closed)) => {
                    return Err(PollError::Io("session closed".to_string()));
                }
                Err(e) => {
                    debug!(
                        "{}: failed to read register {}: {}",
                        self.protocol_id, descriptor.id, e
                    );
                    continue;
                }
            };

            values.insert(descriptor.id.clone(), descriptor.decode(&words).into());
        }

        Ok(values)
    }

    /// Write access for the command worker (setpoint changes and similar).
    pub async fn write_register(&self, addr: u16, value: u16) -> Result<(), PollError> {
        self.client
            .write_single_register(&self.session, addr, value)
            .await
            .map_err(|e| match e {
                ModbusError::Exception { .. } => PollError::Exception(e.to_string()),
                ModbusError::Session(SessionError::Timeout) => PollError::Timeout,
                other => PollError::Io(other.to_string()),
            })
    }
}

/// Command-script poller for text-protocol devices.
pub struct CommandAdapter {
    session: Arc<Session>,
    settings: CommandSettings,
    protocol_id: String,
}

impl CommandAdapter {
    pub fn new(session: Arc<Session>, protocol: &ProtocolDefinition) -> Self {
        Self {
            session,
            settings: protocol.command.clone().unwrap_or_default(),
            protocol_id: protocol.protocol_id.clone(),
        }
    }

    /// Run the protocol's poll script. Raw responses land under conventional
    /// keys; numeric extraction is the telemetry pipeline's concern.
    pub async fn poll(&self) -> Result<Metrics, PollError> {
        let mut values = Metrics::new();

        if self.protocol_id.to_ascii_lowercase().contains("pytes") {
            if let Some(response) = self.send("pwr").await? {
                values.insert("power_response".to_string(), response.into());
            }
            tokio::time::sleep(self.settings.command_delay_duration()).await;
            if let Some(response) = self.send("bat").await? {
                values.insert("battery_response".to_string(), response.into());
            }
        }

        Ok(values)
    }

    async fn send(&self, command: &str) -> Result<Option<String>, PollError> {
        match send_text_command(
            &self.session,
            command,
            &self.settings.line_ending,
            self.settings.response_timeout_duration(),
        )
        .await
        {
            Ok(response) => Ok(response),
            Err(SessionError::Closed) => Err(PollError::Io("session closed".to_string())),
            Err(SessionError::Timeout) => Err(PollError::Timeout),
            Err(e) => Err(PollError::Io(e.to_string())),
        }
    }
}

/// Creates adapters bound to a session and its protocol's register map.
pub struct AdapterFactory {
    register_maps: Arc<RegisterMapCache>,
}

impl AdapterFactory {
    pub fn new(register_maps: Arc<RegisterMapCache>) -> Self {
        Self { register_maps }
    }

    pub fn create(&self, session: Arc<Session>, protocol: &ProtocolDefinition) -> DeviceAdapter {
        match protocol.transport {
            Transport::ModbusTcp | Transport::ModbusRtu => {
                let registers = match &protocol.register_map_file {
                    Some(file) => self.register_maps.load(file),
                    None => Arc::new(Vec::new()),
                };
                DeviceAdapter::Modbus(ModbusAdapter::new(session, protocol, registers))
            }
            Transport::Command => {
                DeviceAdapter::Command(CommandAdapter::new(session, protocol))
            }
            Transport::Ble => {
                // No BLE transport over logger sessions; an empty Modbus map
                // yields empty telemetry rather than failing the device.
                warn!(
                    "Unsupported transport for {}: falling back to empty poller",
                    protocol.protocol_id
                );
                DeviceAdapter::Modbus(ModbusAdapter::new(session, protocol, Arc::new(Vec::new())))
            }
        }
    }
}
