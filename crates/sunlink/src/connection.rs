// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Connection lifecycle: drives each accepted session from `Connected`
//! through identification and registration into polling, and cleans up on
//! loss.
//!
//! State machine per session:
//!
//! ```text
//!         accept                 probe-ok               register+adapter
//! Connected ------> Identifying ---------> Identified -----------------> Polling
//!     |                | probe-fail            | dup-serial (kick peer)      |
//!     |                v                       |                             |
//!     |           Disconnected <---------------+-----------------------------+
//!     |                ^                             close/IO-error/stop
//!     +----------------+
//! ```

use crate::adapter::AdapterFactory;
use crate::config::Settings;
use crate::device::DeviceManager;
use crate::identify::{IdentifiedDevice, Prober};
use crate::session::{Session, SessionState};
use crate::storage::control_plane::ControlPlaneClient;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Orchestrates the lifecycle of every data-logger session.
pub struct ConnectionManager {
    settings: Settings,
    prober: Arc<Prober>,
    device_manager: Arc<DeviceManager>,
    adapter_factory: AdapterFactory,
    control_plane: Option<Arc<ControlPlaneClient>>,

    connections: parking_lot::Mutex<HashMap<Uuid, Arc<Session>>>,
    by_serial: parking_lot::Mutex<HashMap<String, Uuid>>,

    total_identified: AtomicU64,
    total_failed: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        settings: Settings,
        prober: Arc<Prober>,
        device_manager: Arc<DeviceManager>,
        adapter_factory: AdapterFactory,
        control_plane: Option<Arc<ControlPlaneClient>>,
    ) -> Self {
        Self {
            settings,
            prober,
            device_manager,
            adapter_factory,
            control_plane,
            connections: parking_lot::Mutex::new(HashMap::new()),
            by_serial: parking_lot::Mutex::new(HashMap::new()),
            total_identified: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        }
    }

    /// Entry point called by the acceptor for each new session. Returns the
    /// task driving the session lifecycle.
    pub fn handle_session(self: &Arc<Self>, session: Arc<Session>) -> JoinHandle<()> {
        self.connections.lock().insert(session.id(), Arc::clone(&session));

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.session_lifecycle(Arc::clone(&session)).await;
            manager.cleanup_session(session).await;
        })
    }

    async fn session_lifecycle(&self, session: Arc<Session>) {
        // Stabilization: some loggers send junk right after connecting.
        tokio::time::sleep(self.settings.stabilization_delay()).await;

        session.set_state(SessionState::Identifying);
        let identified = match self.identify_with_retries(&session).await {
            Some(identified) => identified,
            None => {
                warn!(
                    "Failed to identify device on {}, closing connection",
                    session.remote_addr()
                );
                self.total_failed.fetch_add(1, Ordering::Relaxed);
                session.close().await;
                return;
            }
        };

        session.set_protocol_id(identified.protocol_id.as_str());
        session.set_serial_number(identified.serial_number.as_str());
        session.set_state(SessionState::Identified);

        info!(
            "Identified device: {} (serial: {}) on {}",
            identified.protocol_id,
            identified.serial_number,
            session.remote_addr()
        );

        // Unique-serial invariant: the newer session wins. A logger that
        // re-dials is assumed to do so because the old path died.
        self.kick_duplicate(&identified.serial_number, session.id()).await;
        self.by_serial
            .lock()
            .insert(identified.serial_number.clone(), session.id());

        let (device_id, registration_pending) =
            self.register_device(&session, &identified).await;
        if let Some(device_id) = device_id {
            session.set_device_id(device_id);
        }

        let protocol = match self.prober.registry().get(&identified.protocol_id) {
            Some(protocol) => protocol.clone(),
            None => {
                // Cannot happen for protocols the prober itself selected.
                warn!("Protocol vanished from registry: {}", identified.protocol_id);
                session.close().await;
                return;
            }
        };

        let adapter = Arc::new(
            self.adapter_factory
                .create(Arc::clone(&session), &protocol),
        );

        session.set_state(SessionState::Polling);
        self.total_identified.fetch_add(1, Ordering::Relaxed);

        self.device_manager
            .add_device(
                Arc::clone(&session),
                &identified,
                &protocol,
                adapter,
                device_id,
                registration_pending,
            )
            .await;

        // Hold the lifecycle open until the session dies; polling runs on the
        // scheduler's own task.
        while session.is_connected() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn identify_with_retries(&self, session: &Arc<Session>) -> Option<IdentifiedDevice> {
        let max_retries = self.settings.identification.max_retries.max(1);
        let retry_delay = Duration::from_secs_f64(self.settings.identification.retry_delay);
        let pass_timeout = Duration::from_secs_f64(self.settings.identification.timeout);

        for attempt in 0..max_retries {
            if attempt > 0 {
                debug!(
                    "Identification attempt {}/{} for {}",
                    attempt + 1,
                    max_retries,
                    session.remote_addr()
                );
                tokio::time::sleep(retry_delay).await;
            }

            if !session.is_connected() {
                return None;
            }

            match tokio::time::timeout(pass_timeout, self.prober.identify(session)).await {
                Ok(Some(identified)) => return Some(identified),
                Ok(None) => {}
                Err(_) => {
                    warn!(
                        "Identification timeout for {} (attempt {}/{})",
                        session.remote_addr(),
                        attempt + 1,
                        max_retries
                    );
                }
            }
        }
        None
    }

    async fn kick_duplicate(&self, serial: &str, new_session_id: Uuid) {
        // A serial that already reached polling is re-bound atomically by the
        // device manager, which closes the old socket itself; here we only
        // kick peers that identified but never became a device.
        if self.device_manager.get_by_serial(serial).is_some() {
            return;
        }
        let old = {
            let by_serial = self.by_serial.lock();
            by_serial
                .get(serial)
                .filter(|&&id| id != new_session_id)
                .and_then(|id| self.connections.lock().get(id).cloned())
        };
        if let Some(old_session) = old {
            if old_session.is_connected() {
                info!("Replacing existing connection for {}", serial);
                old_session.close().await;
            }
        }
    }

    /// Best-effort control-plane registration. On failure a local device id
    /// is generated and the registration is flagged for out-of-band retry;
    /// a control-plane outage never blocks the session.
    async fn register_device(
        &self,
        session: &Session,
        identified: &IdentifiedDevice,
    ) -> (Option<Uuid>, bool) {
        let client = match &self.control_plane {
            Some(client) => client,
            None => return (None, false),
        };

        let site_id = client
            .get_site_for_device(&session.remote_addr().to_string())
            .await
            .unwrap_or(None);

        match client
            .register_device(
                site_id,
                &identified.serial_number,
                &identified.device_type,
                &identified.protocol_id,
                identified.model.as_deref(),
                identified.manufacturer.as_deref(),
            )
            .await
        {
            Ok(device_id) => {
                info!(
                    "Registered device {} with control plane as {}",
                    identified.serial_number, device_id
                );
                (Some(device_id), false)
            }
            Err(e) => {
                warn!(
                    "Control-plane registration failed for {}: {}; using local id",
                    identified.serial_number, e
                );
                (Some(Uuid::new_v4()), true)
            }
        }
    }

    async fn cleanup_session(&self, session: Arc<Session>) {
        debug!("Cleaning up session {}", session.id());

        self.connections.lock().remove(&session.id());
        if let Some(serial) = session.serial_number() {
            let mut by_serial = self.by_serial.lock();
            // Only drop the serial mapping if this session still owns it;
            // a newer session may have taken over.
            if by_serial.get(&serial) == Some(&session.id()) {
                by_serial.remove(&serial);
            }
        }

        // Tear down the device only when it still points at this session.
        if let Some(record) = self.device_manager.get_by_session(session.id()) {
            self.device_manager.remove_device(record.device_id).await;
        }

        if session.is_connected() {
            session.close().await;
        }
    }

    pub fn connection_by_serial(&self, serial: &str) -> Option<Arc<Session>> {
        let id = *self.by_serial.lock().get(serial)?;
        self.connections.lock().get(&id).cloned()
    }

    /// Close all tracked sessions (shutdown path).
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.connections.lock().values().cloned().collect();
        info!("Closing {} connections", sessions.len());
        for session in sessions {
            session.close().await;
        }
        self.connections.lock().clear();
        self.by_serial.lock().clear();
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> ConnectionManagerStats {
        ConnectionManagerStats {
            active_connections: self.connections.lock().len(),
            identified_serials: self.by_serial.lock().len(),
            total_identified: self.total_identified.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
        }
    }
}

/// Connection manager statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionManagerStats {
    pub active_connections: usize,
    pub identified_serials: usize,
    pub total_identified: u64,
    pub total_failed: u64,
}
