// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Protocol configuration loader.
//!
//! Parses YAML documents with a top-level `protocols:` list into
//! [`ProtocolDefinition`]s. Unknown keys are ignored so that configs written
//! for newer server versions still load. A malformed entry is logged and
//! skipped; a malformed file is an error.

use super::definitions::{
    CommandSettings, DeviceType, IdentificationSpec, ModbusSettings, PollingConfig,
    ProtocolDefinition, SerialEncoding, SerialNumberSpec, Transport,
};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Raw YAML shape of one protocol entry. Everything optional except `id`;
/// defaults and inference happen in [`ProtocolLoader::build`].
#[derive(Debug, Default, Deserialize)]
struct RawProtocol {
    id: Option<String>,
    name: Option<String>,
    device_type: Option<String>,
    protocol_type: Option<String>,
    #[serde(default)]
    command_based: bool,
    #[serde(default)]
    ble: bool,
    priority: Option<i32>,
    register_map: Option<String>,
    #[serde(default)]
    identification: RawIdentification,
    #[serde(default)]
    serial_number: RawSerialNumber,
    #[serde(default)]
    polling: RawPolling,
    #[serde(default)]
    modbus: RawModbus,
    #[serde(default)]
    command: RawCommand,
    adapter_class: Option<String>,
    manufacturer: Option<String>,
    model_pattern: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawIdentification {
    register: Option<u16>,
    size: Option<u16>,
    #[serde(default)]
    expected_values: Vec<u16>,
    command: Option<String>,
    expected_response: Option<String>,
    timeout: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSerialNumber {
    register: Option<u16>,
    size: Option<u16>,
    encoding: Option<String>,
    command: Option<String>,
    parse_regex: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPolling {
    default_interval: Option<u64>,
    min_interval: Option<u64>,
    max_interval: Option<u64>,
    timeout: Option<f64>,
    max_consecutive_failures: Option<u32>,
    retry_delay: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawModbus {
    unit_id: Option<u8>,
    timeout: Option<f64>,
    retries: Option<u32>,
    retry_delay: Option<f64>,
    baudrate: Option<u32>,
    parity: Option<String>,
    stopbits: Option<u8>,
    bytesize: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCommand {
    line_ending: Option<String>,
    response_timeout: Option<f64>,
    command_delay: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    protocols: Vec<RawProtocol>,
}

/// Loads protocol definitions from YAML files.
pub struct ProtocolLoader;

impl ProtocolLoader {
    /// Load protocols from one YAML file.
    pub fn load_from_file(path: &Path) -> Result<Vec<ProtocolDefinition>, LoaderError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LoaderError::Io(path.display().to_string(), e.to_string()))?;
        let protocols = Self::load_from_str(&content)?;
        info!("Loaded {} protocols from {}", protocols.len(), path.display());
        Ok(protocols)
    }

    /// Load protocols from YAML text.
    pub fn load_from_str(content: &str) -> Result<Vec<ProtocolDefinition>, LoaderError> {
        if content.trim().is_empty() {
            warn!("Empty protocol config");
            return Ok(Vec::new());
        }

        let doc: RawDocument =
            serde_yaml::from_str(content).map_err(|e| LoaderError::Yaml(e.to_string()))?;

        let mut protocols = Vec::with_capacity(doc.protocols.len());
        for raw in doc.protocols {
            let id = raw.id.clone().unwrap_or_else(|| "<missing id>".to_string());
            match Self::build(raw) {
                Ok(protocol) => {
                    debug!(
                        "Loaded protocol: {} ({})",
                        protocol.protocol_id, protocol.device_type
                    );
                    protocols.push(protocol);
                }
                Err(e) => {
                    warn!("Skipping protocol entry '{}': {}", id, e);
                }
            }
        }
        Ok(protocols)
    }

    /// Load `protocols.yaml` plus any `protocols_*.yaml` siblings.
    pub fn load_all(config_dir: &Path) -> Result<Vec<ProtocolDefinition>, LoaderError> {
        let mut all = Vec::new();

        let main = config_dir.join("protocols.yaml");
        if main.exists() {
            all.extend(Self::load_from_file(&main)?);
        } else {
            warn!("Protocol config not found: {}", main.display());
        }

        let mut extras: Vec<_> = std::fs::read_dir(config_dir)
            .map_err(|e| LoaderError::Io(config_dir.display().to_string(), e.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("protocols_") && n.ends_with(".yaml"))
                    .unwrap_or(false)
            })
            .collect();
        extras.sort();

        for path in extras {
            all.extend(Self::load_from_file(&path)?);
        }

        info!("Loaded {} protocols total", all.len());
        Ok(all)
    }

    fn build(raw: RawProtocol) -> Result<ProtocolDefinition, LoaderError> {
        let protocol_id = raw
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| LoaderError::MissingField("id".to_string()))?;
        let name = raw.name.clone().unwrap_or_else(|| protocol_id.clone());

        let device_type = raw
            .device_type
            .as_deref()
            .map(DeviceType::parse_lenient)
            .unwrap_or(DeviceType::Unknown);

        let transport = Self::infer_transport(&raw);

        let identification = Self::build_identification(&raw.identification, transport)?;
        let identification_timeout = raw.identification.timeout.unwrap_or(5.0);
        let serial_number = Self::build_serial_number(&raw.serial_number);

        let defaults = PollingConfig::default();
        let polling = PollingConfig {
            default_interval: raw.polling.default_interval.unwrap_or(defaults.default_interval),
            min_interval: raw.polling.min_interval.unwrap_or(defaults.min_interval),
            max_interval: raw.polling.max_interval.unwrap_or(defaults.max_interval),
            timeout: raw.polling.timeout.unwrap_or(defaults.timeout),
            max_consecutive_failures: raw
                .polling
                .max_consecutive_failures
                .unwrap_or(defaults.max_consecutive_failures),
            retry_delay: raw.polling.retry_delay.unwrap_or(defaults.retry_delay),
        };

        // A transport always carries its own sub-config, defaulted when the
        // YAML omits the block.
        let modbus = transport.is_modbus().then(|| {
            let d = ModbusSettings::default();
            ModbusSettings {
                unit_id: raw.modbus.unit_id.unwrap_or(d.unit_id),
                timeout: raw.modbus.timeout.unwrap_or(d.timeout),
                retries: raw.modbus.retries.unwrap_or(d.retries),
                retry_delay: raw.modbus.retry_delay.unwrap_or(d.retry_delay),
                baudrate: raw.modbus.baudrate.unwrap_or(d.baudrate),
                parity: raw.modbus.parity.clone().unwrap_or(d.parity),
                stopbits: raw.modbus.stopbits.unwrap_or(d.stopbits),
                bytesize: raw.modbus.bytesize.unwrap_or(d.bytesize),
            }
        });
        let command = (transport == Transport::Command).then(|| {
            let d = CommandSettings::default();
            CommandSettings {
                line_ending: raw.command.line_ending.clone().unwrap_or(d.line_ending),
                response_timeout: raw.command.response_timeout.unwrap_or(d.response_timeout),
                command_delay: raw.command.command_delay.unwrap_or(d.command_delay),
            }
        });

        Ok(ProtocolDefinition {
            protocol_id,
            name,
            device_type,
            transport,
            priority: raw.priority.unwrap_or(100),
            register_map_file: raw.register_map,
            identification,
            identification_timeout,
            serial_number,
            polling,
            modbus,
            command,
            adapter_class: raw.adapter_class,
            manufacturer: raw.manufacturer,
            model_pattern: raw.model_pattern,
            description: raw.description,
        })
    }

    /// Transport inference for legacy configs that omit `protocol_type`:
    /// an identification command or a `command_based` flag means command
    /// transport, `ble: true` means BLE, anything else is Modbus TCP.
    fn infer_transport(raw: &RawProtocol) -> Transport {
        if let Some(explicit) = raw.protocol_type.as_deref() {
            match explicit.to_ascii_lowercase().as_str() {
                "modbus_tcp" => return Transport::ModbusTcp,
                "modbus_rtu" => return Transport::ModbusRtu,
                "command" => return Transport::Command,
                "ble" => return Transport::Ble,
                other => {
                    warn!("Unknown protocol_type '{}', inferring from fields", other);
                }
            }
        }
        if raw.command_based || raw.identification.command.is_some() {
            return Transport::Command;
        }
        if raw.ble {
            return Transport::Ble;
        }
        Transport::ModbusTcp
    }

    fn build_identification(
        raw: &RawIdentification,
        transport: Transport,
    ) -> Result<IdentificationSpec, LoaderError> {
        if let Some(register) = raw.register {
            return Ok(IdentificationSpec::RegisterProbe {
                register,
                size: raw.size.unwrap_or(1).max(1),
                expected_values: raw.expected_values.clone(),
            });
        }
        if let Some(command) = raw.command.clone() {
            return Ok(IdentificationSpec::CommandProbe {
                command,
                expected_response: raw.expected_response.clone(),
            });
        }
        Err(LoaderError::MissingField(format!(
            "identification.register or identification.command (transport {})",
            transport
        )))
    }

    fn build_serial_number(raw: &RawSerialNumber) -> SerialNumberSpec {
        if let Some(register) = raw.register {
            let encoding = match raw.encoding.as_deref() {
                Some("hex") => SerialEncoding::Hex,
                Some("raw") => SerialEncoding::Raw,
                _ => SerialEncoding::Ascii,
            };
            return SerialNumberSpec::RegisterExtract {
                register,
                size: raw.size.unwrap_or(8).max(1),
                encoding,
            };
        }
        if let (Some(command), Some(parse_regex)) = (raw.command.clone(), raw.parse_regex.clone())
        {
            return SerialNumberSpec::CommandExtract { command, parse_regex };
        }
        SerialNumberSpec::None
    }
}

/// Loader error types.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("I/O error reading {0}: {1}")]
    Io(String, String),
    #[error("YAML error: {0}")]
    Yaml(String),
    #[error("missing required field: {0}")]
    MissingField(String),
}
