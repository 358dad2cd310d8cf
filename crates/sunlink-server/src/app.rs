// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Composition root: builds every subsystem once, wires the event streams
//! between them, and owns startup and ordered shutdown.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use sunlink::adapter::AdapterFactory;
use sunlink::config::Settings;
use sunlink::connection::ConnectionManager;
use sunlink::device::{DeviceEvent, DeviceManager};
use sunlink::discovery::DiscoveryService;
use sunlink::identify::Prober;
use sunlink::polling::{
    AnomalyEvent, PollingEvent, PollingScheduler, TelemetrySample, TelemetrySink, TelemetryWorker,
    TelemetryRow,
};
use sunlink::protocol::{ProtocolRegistry, RegisterMapCache};
use sunlink::server::{SessionHandler, TcpAcceptor};
use sunlink::storage::{ControlPlaneClient, TimescaleWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Telemetry sink selected at startup: the real store, or a shedding no-op
/// when no DSN is configured.
pub enum StorageSink {
    Timescale(Arc<TimescaleWriter>),
    Disabled,
}

impl TelemetrySink for StorageSink {
    async fn write_batch(&self, batch: Vec<TelemetryRow>) -> Result<(), String> {
        match self {
            Self::Timescale(writer) => writer.write_batch(batch).await,
            Self::Disabled => {
                debug!("Telemetry store disabled, discarding {} rows", batch.len());
                Ok(())
            }
        }
    }
}

/// The assembled device server.
pub struct DeviceServer {
    settings: Settings,
    acceptor: Arc<TcpAcceptor>,
    connection_manager: Arc<ConnectionManager>,
    device_manager: Arc<DeviceManager>,
    scheduler: Arc<PollingScheduler>,
    telemetry_worker: Arc<TelemetryWorker<StorageSink>>,
    timescale: Option<Arc<TimescaleWriter>>,
    control_plane: Option<Arc<ControlPlaneClient>>,
    pub discovery: Arc<DiscoveryService>,
    pumps: Vec<JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
}

impl DeviceServer {
    /// Build every component. Fatal on configuration errors; storage and
    /// control-plane outages degrade to warnings.
    pub async fn build(settings: Settings) -> anyhow::Result<Self> {
        settings.validate().context("invalid configuration")?;

        let registry = Arc::new(
            ProtocolRegistry::from_config(&settings.config_dir)
                .context("failed to load protocol definitions")?,
        );
        info!("{}", registry.summary());

        let timescale = match &settings.storage.timescale_dsn {
            Some(dsn) => match TimescaleWriter::connect(dsn).await {
                Ok(writer) => Some(Arc::new(writer)),
                Err(e) => {
                    warn!("Telemetry store unavailable at startup: {}", e);
                    None
                }
            },
            None => {
                warn!("No telemetry store configured (DEVICE_STORAGE_TIMESCALE_DSN unset)");
                None
            }
        };

        let control_plane = ControlPlaneClient::from_settings(&settings.control_plane).map(Arc::new);
        if control_plane.is_none() {
            warn!("Control-plane integration disabled (no API key)");
        }

        let register_maps = Arc::new(RegisterMapCache::new(settings.register_maps_dir.clone()));
        let adapter_factory = AdapterFactory::new(Arc::clone(&register_maps));

        let prober = Arc::new(Prober::new(Arc::clone(&registry)));
        let discovery = Arc::new(DiscoveryService::new(Arc::clone(&prober)));

        let (device_manager, device_events) = DeviceManager::new();
        let device_manager = Arc::new(device_manager);

        let (scheduler, polling_events) =
            PollingScheduler::new(Arc::clone(&device_manager), settings.polling.clone());
        let scheduler = Arc::new(scheduler);

        let sink = match &timescale {
            Some(writer) => StorageSink::Timescale(Arc::clone(writer)),
            None => StorageSink::Disabled,
        };
        let (telemetry_worker, anomaly_events) =
            TelemetryWorker::new(Arc::new(sink), &settings.storage);
        let telemetry_worker = Arc::new(telemetry_worker);

        let connection_manager = Arc::new(ConnectionManager::new(
            settings.clone(),
            prober,
            Arc::clone(&device_manager),
            adapter_factory,
            control_plane.clone(),
        ));

        let handler: SessionHandler = {
            let connection_manager = Arc::clone(&connection_manager);
            Arc::new(move |session| connection_manager.handle_session(session))
        };
        let acceptor = Arc::new(TcpAcceptor::new(settings.server.clone(), handler));

        let mut server = Self {
            settings,
            acceptor,
            connection_manager,
            device_manager,
            scheduler,
            telemetry_worker,
            timescale,
            control_plane,
            discovery,
            pumps: Vec::new(),
            maintenance: None,
        };
        server.spawn_pumps(device_events, polling_events, anomaly_events);
        Ok(server)
    }

    /// Wire the event streams: device lifecycle drives scheduling and
    /// control-plane status; polling output feeds the telemetry worker and
    /// the device snapshot; anomalies become control-plane events.
    fn spawn_pumps(
        &mut self,
        mut device_events: mpsc::UnboundedReceiver<DeviceEvent>,
        mut polling_events: mpsc::UnboundedReceiver<PollingEvent>,
        mut anomaly_events: mpsc::UnboundedReceiver<AnomalyEvent>,
    ) {
        let scheduler = Arc::clone(&self.scheduler);
        let control_plane = self.control_plane.clone();
        self.pumps.push(tokio::spawn(async move {
            while let Some(event) = device_events.recv().await {
                match event {
                    DeviceEvent::Added { device_id, .. } => {
                        scheduler.schedule(device_id);
                    }
                    DeviceEvent::Removed { device_id, .. } => {
                        scheduler.cancel(device_id);
                    }
                    DeviceEvent::StatusChanged {
                        device_id,
                        new_status,
                        message,
                        ..
                    } => {
                        if let Some(client) = &control_plane {
                            if let Err(e) = client
                                .update_device_status(
                                    device_id,
                                    new_status.as_str(),
                                    message.as_deref(),
                                )
                                .await
                            {
                                warn!("Status update for {} failed: {}", device_id, e);
                            }
                        }
                    }
                }
            }
        }));

        let telemetry_worker = Arc::clone(&self.telemetry_worker);
        let control_plane = self.control_plane.clone();
        self.pumps.push(tokio::spawn(async move {
            while let Some(event) = polling_events.recv().await {
                match event {
                    PollingEvent::Telemetry { device_id, metrics } => {
                        let sample = TelemetrySample::from_enriched(device_id, None, &metrics);
                        telemetry_worker.submit(sample);

                        if let Some(client) = &control_plane {
                            if let Err(e) =
                                client.update_device_snapshot(device_id, &metrics).await
                            {
                                debug!("Snapshot update for {} failed: {}", device_id, e);
                            }
                        }
                    }
                    PollingEvent::PollError { device_id, error } => {
                        debug!("Poll error for {}: {}", device_id, error);
                    }
                    PollingEvent::DeviceOffline { device_id, .. } => {
                        // The device manager already emitted the status
                        // transition; nothing more to forward here.
                        debug!("Device {} went offline", device_id);
                    }
                }
            }
        }));

        let control_plane = self.control_plane.clone();
        self.pumps.push(tokio::spawn(async move {
            while let Some(anomaly) = anomaly_events.recv().await {
                let Some(client) = &control_plane else { continue };
                let details = serde_json::to_value(&anomaly).unwrap_or_default();
                if let Err(e) = client
                    .create_event(
                        anomaly.device_id,
                        anomaly.site_id,
                        "telemetry_anomaly",
                        "warning",
                        &anomaly.message,
                        details,
                    )
                    .await
                {
                    debug!("Anomaly event delivery failed: {}", e);
                }
            }
        }));
    }

    /// Run until the acceptor stops. Callers trigger [`DeviceServer::stop`]
    /// from a signal handler.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.telemetry_worker.start().await;

        if let Some(writer) = &self.timescale {
            self.maintenance = Some(writer.spawn_maintenance(Duration::from_secs(3600)));
        }

        if let Some(client) = &self.control_plane {
            if client.heartbeat().await {
                info!("Control plane reachable");
            } else {
                warn!("Control plane unreachable at startup; continuing");
            }
        }

        info!(
            "Device server starting on {}:{}",
            self.settings.server.host, self.settings.server.port
        );
        self.acceptor.run().await.context("acceptor failed")?;
        Ok(())
    }

    /// Graceful shutdown: stop accepting, cancel pollers (which also ends
    /// identification-in-progress via session closes), flush telemetry once,
    /// then close the storage pool and the control-plane client.
    pub async fn stop(&self) {
        info!("Stopping device server");
        debug!("Final stats: {}", self.stats());

        self.acceptor.shutdown();
        self.scheduler.stop().await;
        self.connection_manager.close_all().await;
        self.device_manager.shutdown().await;
        self.telemetry_worker.stop().await;

        if let Some(task) = &self.maintenance {
            task.abort();
        }
        if let Some(writer) = &self.timescale {
            writer.close().await;
        }

        info!("Device server stopped");
    }

    /// Aggregate statistics for diagnostics.
    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "acceptor": self.acceptor.stats(),
            "connections": self.connection_manager.stats(),
            "devices": self.device_manager.stats(),
            "polling": self.scheduler.stats(),
            "telemetry": self.telemetry_worker.stats(),
        })
    }

    pub fn acceptor(&self) -> &Arc<TcpAcceptor> {
        &self.acceptor
    }
}
