// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Identified-device bookkeeping.
//!
//! The manager owns three indexes (device id, serial number, session id)
//! behind one mutex with short critical sections, and publishes lifecycle
//! events on a channel consumed with no locks held. The device record keeps a
//! weak reference to its session (the session id); the session itself is held
//! alongside and never dereferenced after close.

use crate::adapter::{DeviceAdapter, Metrics};
use crate::identify::IdentifiedDevice;
use crate::protocol::ProtocolDefinition;
use crate::session::Session;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const POLL_HISTORY_CAPACITY: usize = 100;

/// Device online status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Initializing,
    Online,
    Offline,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the bounded poll history ring.
#[derive(Debug, Clone, Serialize)]
pub struct PollRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: f64,
}

/// Canonical record for one identified device. Identity is the serial
/// number; at most one live session maps to a serial at any instant.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub device_id: Uuid,
    pub serial_number: String,
    pub protocol_id: String,
    pub device_type: String,

    pub session_id: Uuid,
    pub remote_addr: String,

    pub status: DeviceStatus,
    pub status_message: Option<String>,

    pub connected_at: DateTime<Utc>,
    pub identified_at: Option<DateTime<Utc>>,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_successful_poll: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,

    /// Base poll interval, seconds. Mutable at runtime through the scheduler.
    pub poll_interval: u64,
    pub consecutive_failures: u32,
    pub total_polls: u64,
    pub successful_polls: u64,
    pub failed_polls: u64,

    pub last_telemetry: Option<Metrics>,
    pub poll_history: VecDeque<PollRecord>,

    pub model: Option<String>,
    pub manufacturer: Option<String>,
    /// True when the serial was synthesized from the peer address.
    pub fallback_serial: bool,
    /// Set when control-plane registration failed and should be retried.
    pub registration_pending: bool,
}

impl DeviceRecord {
    pub fn record_poll(
        &mut self,
        success: bool,
        data: Option<Metrics>,
        error: Option<String>,
        duration_ms: f64,
    ) {
        let now = Utc::now();
        self.total_polls += 1;
        self.last_poll = Some(now);

        if success {
            self.successful_polls += 1;
            self.last_successful_poll = Some(now);
            self.consecutive_failures = 0;
            self.last_telemetry = data;
            self.status = DeviceStatus::Online;
            self.status_message = None;
        } else {
            self.failed_polls += 1;
            self.consecutive_failures += 1;
            self.last_error = Some(now);
            self.status_message = error.clone();
        }

        self.poll_history.push_back(PollRecord {
            timestamp: now,
            success,
            error,
            duration_ms,
        });
        while self.poll_history.len() > POLL_HISTORY_CAPACITY {
            self.poll_history.pop_front();
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }

    /// Poll success rate in percent.
    pub fn success_rate(&self) -> f64 {
        if self.total_polls == 0 {
            0.0
        } else {
            (self.successful_polls as f64 / self.total_polls as f64) * 100.0
        }
    }

    pub fn avg_poll_duration_ms(&self) -> f64 {
        let successful: Vec<&PollRecord> =
            self.poll_history.iter().filter(|r| r.success).collect();
        if successful.is_empty() {
            0.0
        } else {
            successful.iter().map(|r| r.duration_ms).sum::<f64>() / successful.len() as f64
        }
    }
}

/// Lifecycle events published by the manager. Consumed by the composition
/// root to drive scheduling and control-plane updates.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Added {
        device_id: Uuid,
        record: Box<DeviceRecord>,
        /// True when an existing device re-dialed and had its session swapped.
        reconnected: bool,
    },
    Removed {
        device_id: Uuid,
        serial_number: String,
    },
    StatusChanged {
        device_id: Uuid,
        old_status: DeviceStatus,
        new_status: DeviceStatus,
        message: Option<String>,
    },
}

#[derive(Default)]
struct Indexes {
    devices: HashMap<Uuid, DeviceRecord>,
    by_serial: HashMap<String, Uuid>,
    by_session: HashMap<Uuid, Uuid>,
    adapters: HashMap<Uuid, Arc<DeviceAdapter>>,
    sessions: HashMap<Uuid, Arc<Session>>,
}

/// Owns the set of identified devices.
pub struct DeviceManager {
    inner: parking_lot::Mutex<Indexes>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceManager {
    /// Create the manager and the receiving end of its event stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                inner: parking_lot::Mutex::new(Indexes::default()),
                events,
            },
            receiver,
        )
    }

    fn emit(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            debug!("Device event receiver dropped");
        }
    }

    /// Add a newly identified device, or re-bind an existing one when the
    /// serial is already known (logger re-dialed). Re-binding swaps the
    /// session and adapter atomically, closes the previous socket, zeroes the
    /// failure counter and preserves the device id.
    pub async fn add_device(
        &self,
        session: Arc<Session>,
        identified: &IdentifiedDevice,
        protocol: &ProtocolDefinition,
        adapter: Arc<DeviceAdapter>,
        device_id: Option<Uuid>,
        registration_pending: bool,
    ) -> Uuid {
        let mut old_session: Option<Arc<Session>> = None;
        let (device_id, record, reconnected) = {
            let mut inner = self.inner.lock();

            if let Some(&existing_id) = inner.by_serial.get(&identified.serial_number) {
                warn!(
                    "Device {} already registered as {}, updating session",
                    identified.serial_number, existing_id
                );

                old_session = inner.sessions.remove(&existing_id);

                let record = inner
                    .devices
                    .get_mut(&existing_id)
                    .expect("serial index points at missing device");
                let stale_session = record.session_id;
                record.session_id = session.id();
                record.remote_addr = session.remote_addr().to_string();
                record.consecutive_failures = 0;
                record.status = DeviceStatus::Online;
                record.status_message = None;
                let snapshot = record.clone();

                inner.by_session.remove(&stale_session);
                inner.by_session.insert(session.id(), existing_id);
                inner.sessions.insert(existing_id, session);
                inner.adapters.insert(existing_id, adapter);

                (existing_id, snapshot, true)
            } else {
                let device_id = device_id.unwrap_or_else(Uuid::new_v4);
                let record = DeviceRecord {
                    device_id,
                    serial_number: identified.serial_number.clone(),
                    protocol_id: protocol.protocol_id.clone(),
                    device_type: protocol.device_type.as_str().to_string(),
                    session_id: session.id(),
                    remote_addr: session.remote_addr().to_string(),
                    status: DeviceStatus::Online,
                    status_message: None,
                    connected_at: Utc::now(),
                    identified_at: Some(identified.identified_at),
                    last_poll: None,
                    last_successful_poll: None,
                    last_error: None,
                    poll_interval: protocol.polling.default_interval,
                    consecutive_failures: 0,
                    total_polls: 0,
                    successful_polls: 0,
                    failed_polls: 0,
                    last_telemetry: None,
                    poll_history: VecDeque::with_capacity(POLL_HISTORY_CAPACITY),
                    model: identified.model.clone(),
                    manufacturer: identified.manufacturer.clone(),
                    fallback_serial: identified.fallback_serial,
                    registration_pending,
                };
                let snapshot = record.clone();

                inner.devices.insert(device_id, record);
                inner
                    .by_serial
                    .insert(identified.serial_number.clone(), device_id);
                inner.by_session.insert(session.id(), device_id);
                inner.sessions.insert(device_id, session);
                inner.adapters.insert(device_id, adapter);

                (device_id, snapshot, false)
            }
        };

        if let Some(old) = old_session {
            old.close().await;
        }

        info!(
            "{} device {} (serial={}, protocol={})",
            if reconnected { "Re-bound" } else { "Added" },
            device_id,
            identified.serial_number,
            protocol.protocol_id
        );

        self.emit(DeviceEvent::Added {
            device_id,
            record: Box::new(record),
            reconnected,
        });
        device_id
    }

    /// Remove a device and close its session.
    pub async fn remove_device(&self, device_id: Uuid) {
        let (session, serial) = {
            let mut inner = self.inner.lock();
            let record = match inner.devices.remove(&device_id) {
                Some(record) => record,
                None => return,
            };
            inner.by_serial.remove(&record.serial_number);
            inner.by_session.remove(&record.session_id);
            inner.adapters.remove(&device_id);
            (inner.sessions.remove(&device_id), record.serial_number)
        };

        if let Some(session) = session {
            session.close().await;
        }

        info!("Removed device {} (serial={})", device_id, serial);
        self.emit(DeviceEvent::Removed {
            device_id,
            serial_number: serial,
        });
    }

    /// Mark a device offline. Emits a status-changed event on transition.
    pub fn mark_offline(&self, device_id: Uuid, reason: Option<String>) {
        self.set_status(
            device_id,
            DeviceStatus::Offline,
            reason.or_else(|| Some("Device offline".to_string())),
        );
    }

    /// Mark a device as errored.
    pub fn mark_error(&self, device_id: Uuid, error: String) {
        self.set_status(device_id, DeviceStatus::Error, Some(error));
    }

    fn set_status(&self, device_id: Uuid, status: DeviceStatus, message: Option<String>) {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.devices.get_mut(&device_id) {
                Some(record) => {
                    let old = record.status;
                    record.status = status;
                    record.status_message = message.clone();
                    if status == DeviceStatus::Error {
                        record.last_error = Some(Utc::now());
                    }
                    (old != status).then_some(old)
                }
                None => None,
            }
        };

        if let Some(old_status) = transition {
            if status == DeviceStatus::Error {
                error!("Device {} error: {:?}", device_id, message);
            } else {
                warn!("Device {} -> {}: {:?}", device_id, status, message);
            }
            self.emit(DeviceEvent::StatusChanged {
                device_id,
                old_status,
                new_status: status,
                message,
            });
        }
    }

    /// Record a poll result against the device's counters and history ring.
    pub fn record_poll(
        &self,
        device_id: Uuid,
        success: bool,
        data: Option<Metrics>,
        error: Option<String>,
        duration_ms: f64,
    ) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.devices.get_mut(&device_id) {
            record.record_poll(success, data, error, duration_ms);
        }
    }

    pub fn update_poll_interval(&self, device_id: Uuid, interval: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.devices.get_mut(&device_id) {
            Some(record) => {
                record.poll_interval = interval;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, device_id: Uuid) -> Option<DeviceRecord> {
        self.inner.lock().devices.get(&device_id).cloned()
    }

    pub fn get_by_serial(&self, serial: &str) -> Option<DeviceRecord> {
        let inner = self.inner.lock();
        inner
            .by_serial
            .get(serial)
            .and_then(|id| inner.devices.get(id))
            .cloned()
    }

    pub fn get_by_session(&self, session_id: Uuid) -> Option<DeviceRecord> {
        let inner = self.inner.lock();
        inner
            .by_session
            .get(&session_id)
            .and_then(|id| inner.devices.get(id))
            .cloned()
    }

    pub fn adapter(&self, device_id: Uuid) -> Option<Arc<DeviceAdapter>> {
        self.inner.lock().adapters.get(&device_id).cloned()
    }

    pub fn session(&self, device_id: Uuid) -> Option<Arc<Session>> {
        self.inner.lock().sessions.get(&device_id).cloned()
    }

    pub fn list(&self) -> Vec<DeviceRecord> {
        self.inner.lock().devices.values().cloned().collect()
    }

    pub fn list_online(&self) -> Vec<DeviceRecord> {
        self.inner
            .lock()
            .devices
            .values()
            .filter(|d| d.is_online())
            .cloned()
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.inner.lock().devices.len()
    }

    pub fn online_count(&self) -> usize {
        self.inner
            .lock()
            .devices
            .values()
            .filter(|d| d.is_online())
            .count()
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> DeviceManagerStats {
        let inner = self.inner.lock();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut by_protocol: HashMap<String, usize> = HashMap::new();

        for device in inner.devices.values() {
            *by_type.entry(device.device_type.clone()).or_default() += 1;
            *by_status.entry(device.status.as_str().to_string()).or_default() += 1;
            *by_protocol.entry(device.protocol_id.clone()).or_default() += 1;
        }

        DeviceManagerStats {
            total_devices: inner.devices.len(),
            online_devices: inner.devices.values().filter(|d| d.is_online()).count(),
            by_type,
            by_status,
            by_protocol,
        }
    }

    /// Close every session and clear all state.
    pub async fn shutdown(&self) {
        info!("Shutting down device manager");
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock();
            let sessions = inner.sessions.drain().map(|(_, s)| s).collect();
            inner.devices.clear();
            inner.by_serial.clear();
            inner.by_session.clear();
            inner.adapters.clear();
            sessions
        };
        for session in sessions {
            session.close().await;
        }
    }
}

/// Device manager statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceManagerStats {
    pub total_devices: usize,
    pub online_devices: usize,
    pub by_type: HashMap<String, usize>,
    pub by_status: HashMap<String, usize>,
    pub by_protocol: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterFactory;
    use crate::protocol::register_map::RegisterMapCache;
    use crate::protocol::{
        DeviceType, IdentificationSpec, PollingConfig, SerialNumberSpec, Transport,
    };
    use tokio::net::{TcpListener, TcpStream};

    fn test_protocol() -> ProtocolDefinition {
        ProtocolDefinition {
            protocol_id: "powdrive".to_string(),
            name: "Powdrive".to_string(),
            device_type: DeviceType::Inverter,
            transport: Transport::ModbusTcp,
            priority: 10,
            register_map_file: None,
            identification: IdentificationSpec::RegisterProbe {
                register: 0,
                size: 1,
                expected_values: vec![3],
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

    fn identified(serial: &str) -> IdentifiedDevice {
        IdentifiedDevice {
            protocol_id: "powdrive".to_string(),
            serial_number: serial.to_string(),
            device_type: "inverter".to_string(),
            model: Some("Powdrive".to_string()),
            manufacturer: None,
            firmware_version: None,
            fallback_serial: false,
            extra: Default::default(),
            identified_at: Utc::now(),
        }
    }

    async fn test_session() -> Arc<Session> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        Arc::new(Session::new(stream, peer))
    }

    async fn adapter_for(session: &Arc<Session>) -> Arc<DeviceAdapter> {
        let dir = tempfile::tempdir().unwrap();
        let factory = AdapterFactory::new(Arc::new(RegisterMapCache::new(dir.path())));
        Arc::new(factory.create(Arc::clone(session), &test_protocol()))
    }

    #[tokio::test]
    async fn test_add_and_lookup() {
        let (manager, mut events) = DeviceManager::new();
        let session = test_session().await;
        let adapter = adapter_for(&session).await;

        let device_id = manager
            .add_device(
                Arc::clone(&session),
                &identified("SN1"),
                &test_protocol(),
                adapter,
                None,
                false,
            )
            .await;

        assert_eq!(manager.device_count(), 1);
        assert_eq!(manager.get_by_serial("SN1").unwrap().device_id, device_id);
        assert_eq!(
            manager.get_by_session(session.id()).unwrap().device_id,
            device_id
        );
        assert!(matches!(
            events.recv().await,
            Some(DeviceEvent::Added { reconnected: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_reconnect_preserves_device_id_and_closes_old_session() {
        let (manager, mut events) = DeviceManager::new();
        let first_session = test_session().await;
        let first_adapter = adapter_for(&first_session).await;

        let first_id = manager
            .add_device(
                Arc::clone(&first_session),
                &identified("SN1"),
                &test_protocol(),
                first_adapter,
                None,
                false,
            )
            .await;
        let _ = events.recv().await;

        // Fail a couple of polls, then re-dial.
        manager.record_poll(first_id, false, None, Some("timeout".into()), 10.0);
        manager.record_poll(first_id, false, None, Some("timeout".into()), 10.0);

        let second_session = test_session().await;
        let second_adapter = adapter_for(&second_session).await;
        let second_id = manager
            .add_device(
                Arc::clone(&second_session),
                &identified("SN1"),
                &test_protocol(),
                second_adapter,
                None,
                false,
            )
            .await;

        assert_eq!(first_id, second_id);
        assert_eq!(manager.device_count(), 1);
        assert!(!first_session.is_connected());

        let record = manager.get(first_id).unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.session_id, second_session.id());
        assert_eq!(record.status, DeviceStatus::Online);
        assert!(matches!(
            events.recv().await,
            Some(DeviceEvent::Added { reconnected: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_poll_history_ring_is_bounded() {
        let (manager, _events) = DeviceManager::new();
        let session = test_session().await;
        let adapter = adapter_for(&session).await;
        let device_id = manager
            .add_device(session, &identified("SN1"), &test_protocol(), adapter, None, false)
            .await;

        for _ in 0..150 {
            manager.record_poll(device_id, true, Some(Metrics::new()), None, 5.0);
        }
        let record = manager.get(device_id).unwrap();
        assert_eq!(record.poll_history.len(), 100);
        assert_eq!(record.total_polls, 150);
        assert_eq!(record.success_rate(), 100.0);
    }

    #[tokio::test]
    async fn test_status_transitions_emit_events() {
        let (manager, mut events) = DeviceManager::new();
        let session = test_session().await;
        let adapter = adapter_for(&session).await;
        let device_id = manager
            .add_device(session, &identified("SN1"), &test_protocol(), adapter, None, false)
            .await;
        let _ = events.recv().await; // Added

        manager.mark_offline(device_id, Some("too many failures".into()));
        match events.recv().await {
            Some(DeviceEvent::StatusChanged {
                old_status,
                new_status,
                ..
            }) => {
                assert_eq!(old_status, DeviceStatus::Online);
                assert_eq!(new_status, DeviceStatus::Offline);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Marking offline again is not a transition.
        manager.mark_offline(device_id, None);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_clears_indexes() {
        let (manager, mut events) = DeviceManager::new();
        let session = test_session().await;
        let adapter = adapter_for(&session).await;
        let device_id = manager
            .add_device(
                Arc::clone(&session),
                &identified("SN1"),
                &test_protocol(),
                adapter,
                None,
                false,
            )
            .await;
        let _ = events.recv().await;

        manager.remove_device(device_id).await;
        assert_eq!(manager.device_count(), 0);
        assert!(manager.get_by_serial("SN1").is_none());
        assert!(manager.get_by_session(session.id()).is_none());
        assert!(manager.adapter(device_id).is_none());
        assert!(!session.is_connected());
        assert!(matches!(
            events.recv().await,
            Some(DeviceEvent::Removed { .. })
        ));
    }
}
