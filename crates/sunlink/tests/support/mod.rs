// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! In-process device simulators and a wiring harness for end-to-end tests.

// Each integration test crate compiles its own copy of this module and uses
// a different slice of it.
#![allow(dead_code)]

pub mod simulators;

use self::simulators::RecordingSink;
use std::path::Path;
use std::sync::Arc;
use sunlink::adapter::AdapterFactory;
use sunlink::config::Settings;
use sunlink::connection::ConnectionManager;
use sunlink::device::{DeviceEvent, DeviceManager};
use sunlink::identify::Prober;
use sunlink::polling::{PollingEvent, PollingScheduler, TelemetrySample, TelemetryWorker};
use sunlink::protocol::{ProtocolRegistry, RegisterMapCache};
use sunlink::server::{SessionHandler, TcpAcceptor};
use tokio::task::JoinHandle;

/// Protocol fixtures used across the end-to-end tests: a Modbus inverter, a
/// Modbus meter and a text-command battery.
pub const PROTOCOLS_YAML: &str = r#"
protocols:
  - id: powdrive
    name: Powdrive Inverter
    device_type: inverter
    priority: 10
    register_map: powdrive.json
    manufacturer: Powdrive
    identification:
      register: 0
      size: 1
      expected_values: [3]
      timeout: 1.0
    serial_number:
      register: 3
      size: 5
      encoding: ascii
    polling:
      default_interval: 1
      min_interval: 1
      max_interval: 10
      timeout: 1.0
    modbus:
      unit_id: 1
      timeout: 1.0
  - id: acme_meter
    name: Acme Meter
    device_type: meter
    priority: 20
    identification:
      register: 100
      size: 1
      expected_values: [7]
      timeout: 1.0
    serial_number:
      register: 103
      size: 5
      encoding: ascii
    polling:
      default_interval: 1
      min_interval: 1
      max_interval: 10
      timeout: 1.0
    modbus:
      unit_id: 1
      timeout: 1.0
  - id: pytes_battery
    name: Pytes Battery
    device_type: battery
    priority: 50
    identification:
      command: info
      expected_response: pytes
      timeout: 1.0
    serial_number:
      command: info
      parse_regex: 'Barcode\s*:\s*(\S+)'
    polling:
      default_interval: 1
      min_interval: 1
      max_interval: 10
      timeout: 1.0
    command:
      line_ending: "\r\n"
      response_timeout: 1.0
      command_delay: 0.05
"#;

pub const POWDRIVE_MAP_JSON: &str = r#"[
  {"id": "grid_voltage", "addr": 10, "size": 1, "kind": "holding", "type": "u16", "rw": "RO", "scale": 0.1},
  {"id": "pv_power", "addr": 11, "size": 1, "kind": "holding", "type": "u16", "rw": "RO"},
  {"id": "inverter_status", "addr": 12, "size": 1, "kind": "holding", "type": "u16", "rw": "RO"}
]"#;

/// Write the protocol fixtures into a config/register-map layout.
pub fn write_fixtures(dir: &Path) {
    let config_dir = dir.join("config");
    let maps_dir = dir.join("register_maps");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::create_dir_all(&maps_dir).unwrap();
    std::fs::write(config_dir.join("protocols.yaml"), PROTOCOLS_YAML).unwrap();
    std::fs::write(maps_dir.join("powdrive.json"), POWDRIVE_MAP_JSON).unwrap();
}

/// Settings tuned for fast tests.
pub fn test_settings(dir: &Path, port: u16) -> Settings {
    let mut settings = Settings::default();
    settings.config_dir = dir.join("config");
    settings.register_maps_dir = dir.join("register_maps");
    settings.server.host = "127.0.0.1".to_string();
    settings.server.port = port;
    settings.server.max_connections = 16;
    settings.connection.stabilization_delay = 0.05;
    settings.identification.timeout = 5.0;
    settings.identification.max_retries = 2;
    settings.identification.retry_delay = 0.1;
    settings.polling.default_interval = 1;
    settings.polling.min_interval = 1;
    settings.polling.max_interval = 10;
    settings.polling.max_consecutive_failures = 2;
    settings.polling.timeout = 1.0;
    settings
}

/// A fully wired device server against a recording telemetry sink, without
/// the external storage backends.
pub struct TestServer {
    pub port: u16,
    pub settings: Settings,
    pub registry: Arc<ProtocolRegistry>,
    pub prober: Arc<Prober>,
    pub acceptor: Arc<TcpAcceptor>,
    pub connection_manager: Arc<ConnectionManager>,
    pub device_manager: Arc<DeviceManager>,
    pub scheduler: Arc<PollingScheduler>,
    pub worker: Arc<TelemetryWorker<RecordingSink>>,
    pub sink: Arc<RecordingSink>,
    runner: JoinHandle<()>,
    pumps: Vec<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start(dir: &Path) -> Self {
        write_fixtures(dir);

        let port = free_port().await;
        let settings = test_settings(dir, port);

        let registry =
            Arc::new(ProtocolRegistry::from_config(&settings.config_dir).unwrap());
        let prober = Arc::new(Prober::new(Arc::clone(&registry)));
        let register_maps = Arc::new(RegisterMapCache::new(settings.register_maps_dir.clone()));
        let adapter_factory = AdapterFactory::new(Arc::clone(&register_maps));

        let (device_manager, mut device_events) = DeviceManager::new();
        let device_manager = Arc::new(device_manager);

        let (scheduler, mut polling_events) =
            PollingScheduler::new(Arc::clone(&device_manager), settings.polling.clone());
        let scheduler = Arc::new(scheduler);

        let sink = RecordingSink::new();
        let (worker, _anomalies) = TelemetryWorker::new(Arc::clone(&sink), &settings.storage);
        let worker = Arc::new(worker);
        worker.start().await;

        let connection_manager = Arc::new(ConnectionManager::new(
            settings.clone(),
            Arc::clone(&prober),
            Arc::clone(&device_manager),
            adapter_factory,
            None,
        ));

        let handler: SessionHandler = {
            let connection_manager = Arc::clone(&connection_manager);
            Arc::new(move |session| connection_manager.handle_session(session))
        };
        let acceptor = Arc::new(TcpAcceptor::new(settings.server.clone(), handler));

        let runner = {
            let acceptor = Arc::clone(&acceptor);
            tokio::spawn(async move {
                acceptor.run().await.unwrap();
            })
        };

        let mut pumps = Vec::new();
        pumps.push({
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                while let Some(event) = device_events.recv().await {
                    match event {
                        DeviceEvent::Added { device_id, .. } => scheduler.schedule(device_id),
                        DeviceEvent::Removed { device_id, .. } => scheduler.cancel(device_id),
                        DeviceEvent::StatusChanged { .. } => {}
                    }
                }
            })
        });
        pumps.push({
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                while let Some(event) = polling_events.recv().await {
                    if let PollingEvent::Telemetry { device_id, metrics } = event {
                        worker.submit(TelemetrySample::from_enriched(device_id, None, &metrics));
                    }
                }
            })
        });

        // Give the listener a moment to come up.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        Self {
            port,
            settings,
            registry,
            prober,
            acceptor,
            connection_manager,
            device_manager,
            scheduler,
            worker,
            sink,
            runner,
            pumps,
        }
    }

    pub async fn stop(self) {
        self.acceptor.shutdown();
        self.scheduler.stop().await;
        self.connection_manager.close_all().await;
        self.device_manager.shutdown().await;
        self.worker.stop().await;
        let _ = self.runner.await;
        for pump in self.pumps {
            pump.abort();
        }
    }

    /// Wait until `predicate` holds, or panic after `timeout`.
    pub async fn wait_for<F: Fn() -> bool>(
        &self,
        predicate: F,
        timeout: std::time::Duration,
        what: &str,
    ) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !predicate() {
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }
}

pub async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
