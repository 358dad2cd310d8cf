// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Protocol definitions: the immutable, declarative description of one device
//! family, covering identification, serial-number extraction, polling cadence
//! and transport-specific tuning.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Device families the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Inverter,
    Meter,
    Battery,
    Logger,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inverter => "inverter",
            Self::Meter => "meter",
            Self::Battery => "battery",
            Self::Logger => "logger",
            Self::Unknown => "unknown",
        }
    }

    /// Lenient parse used by the loader; unrecognized strings map to
    /// `Unknown` rather than failing the whole definition.
    pub fn parse_lenient(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "inverter" => Self::Inverter,
            "meter" => Self::Meter,
            "battery" => Self::Battery,
            "logger" => Self::Logger,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire transport a protocol speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    ModbusTcp,
    ModbusRtu,
    Command,
    Ble,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModbusTcp => "modbus_tcp",
            Self::ModbusRtu => "modbus_rtu",
            Self::Command => "command",
            Self::Ble => "ble",
        }
    }

    pub fn is_modbus(&self) -> bool {
        matches!(self, Self::ModbusTcp | Self::ModbusRtu)
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a device of this family is recognized on a live session.
///
/// Exactly one of the two strategies applies to a protocol; modeling this as a
/// sum type removes the "neither field present" configurations the loader
/// would otherwise have to reject at probe time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IdentificationSpec {
    /// Read `size` holding registers at `register`; the first word must be a
    /// member of `expected_values`.
    RegisterProbe {
        register: u16,
        size: u16,
        expected_values: Vec<u16>,
    },
    /// Send `command` (text, or hex/`\x`-escaped binary) and match the
    /// response against `expected_response`.
    CommandProbe {
        command: String,
        expected_response: Option<String>,
    },
}

/// How the globally unique serial number is extracted after a successful
/// probe. `None` means the prober synthesizes a fallback serial from the
/// protocol id and the peer address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SerialNumberSpec {
    /// Read `size` consecutive holding registers at `register` and decode.
    RegisterExtract {
        register: u16,
        size: u16,
        encoding: SerialEncoding,
    },
    /// Send `command`; the regex's single capture group is the serial.
    CommandExtract { command: String, parse_regex: String },
    None,
}

/// Register-to-string decodings for serial extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialEncoding {
    Ascii,
    Hex,
    Raw,
}

/// Polling cadence and failure policy for one protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Base interval between polls, seconds.
    pub default_interval: u64,
    pub min_interval: u64,
    pub max_interval: u64,
    /// Deadline for one poll, seconds.
    pub timeout: f64,
    pub max_consecutive_failures: u32,
    pub retry_delay: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_interval: 10,
            min_interval: 5,
            max_interval: 300,
            timeout: 5.0,
            max_consecutive_failures: 5,
            retry_delay: 1.0,
        }
    }
}

impl PollingConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

/// Modbus tuning. The RTU serial-line fields ride along for loggers that
/// bridge RTU devices; they are opaque to the TCP path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusSettings {
    pub unit_id: u8,
    pub timeout: f64,
    pub retries: u32,
    pub retry_delay: f64,
    pub baudrate: u32,
    pub parity: String,
    pub stopbits: u8,
    pub bytesize: u8,
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            unit_id: 1,
            timeout: 5.0,
            retries: 3,
            retry_delay: 0.5,
            baudrate: 9600,
            parity: "N".to_string(),
            stopbits: 1,
            bytesize: 8,
        }
    }
}

impl ModbusSettings {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

/// Command-transport tuning (text-command batteries and similar).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSettings {
    pub line_ending: String,
    pub response_timeout: f64,
    /// Delay between consecutive commands of a poll script, seconds.
    pub command_delay: f64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            line_ending: "\r\n".to_string(),
            response_timeout: 5.0,
            command_delay: 0.1,
        }
    }
}

impl CommandSettings {
    pub fn response_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.response_timeout)
    }

    pub fn command_delay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.command_delay)
    }
}

/// Complete protocol definition for one device family. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolDefinition {
    pub protocol_id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub transport: Transport,

    /// Lower values are probed first.
    pub priority: i32,

    /// Register-map sidecar, relative to the register-maps directory.
    pub register_map_file: Option<String>,

    pub identification: IdentificationSpec,

    /// Per-protocol identification deadline, seconds.
    pub identification_timeout: f64,

    pub serial_number: SerialNumberSpec,

    pub polling: PollingConfig,

    pub modbus: Option<ModbusSettings>,
    pub command: Option<CommandSettings>,

    /// Opaque adapter handle; resolved against the closed, build-time adapter
    /// set, never dereferenced here.
    pub adapter_class: Option<String>,

    pub manufacturer: Option<String>,
    pub model_pattern: Option<String>,
    pub description: Option<String>,
}

impl ProtocolDefinition {
    /// Modbus unit id, defaulting when the sub-config is absent.
    pub fn unit_id(&self) -> u8 {
        self.modbus.as_ref().map(|m| m.unit_id).unwrap_or(1)
    }

    /// Line ending for command transports, defaulting when absent.
    pub fn line_ending(&self) -> &str {
        self.command
            .as_ref()
            .map(|c| c.line_ending.as_str())
            .unwrap_or("\r\n")
    }

    pub fn identification_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.identification_timeout)
    }

    /// Whether a probed identification word is one of the expected values.
    pub fn matches_identification(&self, value: u16) -> bool {
        match &self.identification {
            IdentificationSpec::RegisterProbe { expected_values, .. } => {
                expected_values.contains(&value)
            }
            IdentificationSpec::CommandProbe { .. } => false,
        }
    }
}
