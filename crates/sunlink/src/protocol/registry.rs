// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Central registry of protocol definitions.
//!
//! Indexes protocols by id, device type and transport, and maintains one
//! global priority order used by the prober. Duplicate registration of a
//! protocol id is a configuration error and fatal at startup.

use super::definitions::{DeviceType, ProtocolDefinition, Transport};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Registry of all supported device protocols.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    protocols: HashMap<String, ProtocolDefinition>,
    by_device_type: HashMap<DeviceType, Vec<String>>,
    by_transport: HashMap<Transport, Vec<String>>,
    /// Protocol ids sorted by (priority asc, insertion order).
    priority_order: Vec<String>,
    insertion_counter: u64,
    insertion_rank: HashMap<String, u64>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the config directory.
    pub fn from_config(config_dir: &Path) -> Result<Self, RegistryError> {
        let protocols = super::loader::ProtocolLoader::load_all(config_dir)
            .map_err(|e| RegistryError::Load(e.to_string()))?;

        let mut registry = Self::new();
        for protocol in protocols {
            registry.register(protocol)?;
        }
        info!("Initialized protocol registry with {} protocols", registry.len());
        Ok(registry)
    }

    /// Register a protocol definition.
    pub fn register(&mut self, protocol: ProtocolDefinition) -> Result<(), RegistryError> {
        if self.protocols.contains_key(&protocol.protocol_id) {
            return Err(RegistryError::Duplicate(protocol.protocol_id));
        }

        let id = protocol.protocol_id.clone();
        debug!(
            "Registered protocol: {} (type={}, priority={})",
            id, protocol.device_type, protocol.priority
        );

        self.by_device_type
            .entry(protocol.device_type)
            .or_default()
            .push(id.clone());
        self.by_transport
            .entry(protocol.transport)
            .or_default()
            .push(id.clone());

        self.insertion_rank.insert(id.clone(), self.insertion_counter);
        self.insertion_counter += 1;

        self.protocols.insert(id.clone(), protocol);

        self.priority_order.push(id);
        let protocols = &self.protocols;
        let ranks = &self.insertion_rank;
        self.priority_order
            .sort_by_key(|pid| (protocols[pid].priority, ranks[pid]));

        Ok(())
    }

    /// Remove a protocol. Returns the removed definition if present.
    pub fn unregister(&mut self, protocol_id: &str) -> Option<ProtocolDefinition> {
        let protocol = self.protocols.remove(protocol_id)?;

        if let Some(ids) = self.by_device_type.get_mut(&protocol.device_type) {
            ids.retain(|id| id != protocol_id);
        }
        if let Some(ids) = self.by_transport.get_mut(&protocol.transport) {
            ids.retain(|id| id != protocol_id);
        }
        self.priority_order.retain(|id| id != protocol_id);
        self.insertion_rank.remove(protocol_id);

        debug!("Unregistered protocol: {}", protocol_id);
        Some(protocol)
    }

    pub fn get(&self, protocol_id: &str) -> Option<&ProtocolDefinition> {
        self.protocols.get(protocol_id)
    }

    pub fn contains(&self, protocol_id: &str) -> bool {
        self.protocols.contains_key(protocol_id)
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// Protocols of one device type, priority order.
    pub fn get_by_device_type(&self, device_type: DeviceType) -> Vec<&ProtocolDefinition> {
        self.iter_by_priority()
            .filter(|p| p.device_type == device_type)
            .collect()
    }

    /// Protocols using one transport, priority order.
    pub fn get_by_transport(&self, transport: Transport) -> Vec<&ProtocolDefinition> {
        self.iter_by_priority()
            .filter(|p| p.transport == transport)
            .collect()
    }

    /// All protocols in global priority order (lower priority value first,
    /// ties broken by registration order).
    pub fn iter_by_priority(&self) -> impl Iterator<Item = &ProtocolDefinition> {
        self.priority_order.iter().map(|id| &self.protocols[id])
    }

    /// Modbus protocols (TCP and RTU) in priority order.
    pub fn iter_modbus_by_priority(&self) -> impl Iterator<Item = &ProtocolDefinition> {
        self.iter_by_priority().filter(|p| p.transport.is_modbus())
    }

    /// Command protocols in priority order.
    pub fn iter_command_by_priority(&self) -> impl Iterator<Item = &ProtocolDefinition> {
        self.iter_by_priority()
            .filter(|p| p.transport == Transport::Command)
    }

    /// Human-readable summary for startup logging.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Protocol registry: {} protocols", self.len())];
        for device_type in [
            DeviceType::Inverter,
            DeviceType::Meter,
            DeviceType::Battery,
            DeviceType::Logger,
            DeviceType::Unknown,
        ] {
            let count = self
                .by_device_type
                .get(&device_type)
                .map(|ids| ids.len())
                .unwrap_or(0);
            if count > 0 {
                lines.push(format!("  {}: {}", device_type, count));
            }
        }
        lines.join("\n")
    }
}

/// Registry error types.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("protocol '{0}' is already registered")]
    Duplicate(String),
    #[error("failed to load protocols: {0}")]
    Load(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::definitions::{
        IdentificationSpec, PollingConfig, SerialNumberSpec,
    };

    fn protocol(id: &str, transport: Transport, priority: i32) -> ProtocolDefinition {
        ProtocolDefinition {
            protocol_id: id.to_string(),
            name: id.to_string(),
            device_type: DeviceType::Inverter,
            transport,
            priority,
            register_map_file: None,
            identification: match transport {
                Transport::Command => IdentificationSpec::CommandProbe {
                    command: "info".to_string(),
                    expected_response: None,
                },
                _ => IdentificationSpec::RegisterProbe {
                    register: 0,
                    size: 1,
                    expected_values: vec![1],
                },
            },
            identification_timeout: 5.0,
            serial_number: SerialNumberSpec::None,
            polling: PollingConfig::default(),
            modbus: None,
            command: None,
            adapter_class: None,
            manufacturer: None,
            model_pattern: None,
            description: None,
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ProtocolRegistry::new();
        registry.register(protocol("a", Transport::ModbusTcp, 10)).unwrap();
        let err = registry.register(protocol("a", Transport::ModbusTcp, 20));
        assert!(matches!(err, Err(RegistryError::Duplicate(_))));
    }

    #[test]
    fn test_priority_order_stable() {
        let mut registry = ProtocolRegistry::new();
        registry.register(protocol("slow", Transport::ModbusTcp, 100)).unwrap();
        registry.register(protocol("fast", Transport::ModbusTcp, 10)).unwrap();
        registry.register(protocol("also_fast", Transport::ModbusTcp, 10)).unwrap();

        let order: Vec<_> = registry
            .iter_by_priority()
            .map(|p| p.protocol_id.as_str())
            .collect();
        // Equal priorities keep registration order.
        assert_eq!(order, vec!["fast", "also_fast", "slow"]);
    }

    #[test]
    fn test_transport_iterators() {
        let mut registry = ProtocolRegistry::new();
        registry.register(protocol("m1", Transport::ModbusTcp, 20)).unwrap();
        registry.register(protocol("c1", Transport::Command, 10)).unwrap();
        registry.register(protocol("m2", Transport::ModbusRtu, 5)).unwrap();

        let modbus: Vec<_> = registry
            .iter_modbus_by_priority()
            .map(|p| p.protocol_id.as_str())
            .collect();
        assert_eq!(modbus, vec!["m2", "m1"]);

        let command: Vec<_> = registry
            .iter_command_by_priority()
            .map(|p| p.protocol_id.as_str())
            .collect();
        assert_eq!(command, vec!["c1"]);
    }

    #[test]
    fn test_unregister_removes_indexes() {
        let mut registry = ProtocolRegistry::new();
        registry.register(protocol("a", Transport::ModbusTcp, 10)).unwrap();
        assert!(registry.unregister("a").is_some());
        assert!(registry.get("a").is_none());
        assert_eq!(registry.iter_by_priority().count(), 0);
        assert!(registry.unregister("a").is_none());
    }

    #[test]
    fn test_summary_counts() {
        let mut registry = ProtocolRegistry::new();
        registry.register(protocol("a", Transport::ModbusTcp, 10)).unwrap();
        let summary = registry.summary();
        assert!(summary.contains("1 protocols"));
        assert!(summary.contains("inverter: 1"));
    }
}
