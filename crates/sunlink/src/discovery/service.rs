// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Discovery service: two-phase pipeline over the scanner and the prober.
//!
//! Phase 1 sweeps the network for responsive endpoints; phase 2 opens a fresh
//! session to each and runs the identification engine. Results are tracked
//! per scan id and deduplicated by serial number across runs.

use super::result::{DiscoveredDevice, DiscoveryResult, ScanStatus};
use super::scanner::{NetworkScanner, ScanConfig, ScanEndpoint};
use crate::identify::Prober;
use crate::session::Session;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Per-scan tuning knobs.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub ports: Vec<u16>,
    pub site_id: Option<Uuid>,
    pub max_concurrent: usize,
    pub connect_timeout: Duration,
    pub identify_timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            ports: vec![502, 8502],
            site_id: None,
            max_concurrent: 50,
            connect_timeout: Duration::from_secs(2),
            identify_timeout: Duration::from_secs(10),
        }
    }
}

type SharedResult = Arc<parking_lot::Mutex<DiscoveryResult>>;

/// Progress callback invoked on every update.
pub type ProgressCallback = Arc<dyn Fn(&DiscoveryResult) + Send + Sync>;

/// Orchestrates network scans and device identification.
pub struct DiscoveryService {
    prober: Arc<Prober>,
    scans: parking_lot::Mutex<HashMap<Uuid, SharedResult>>,
    tasks: parking_lot::Mutex<HashMap<Uuid, JoinHandle<()>>>,
    known_serials: parking_lot::Mutex<HashSet<String>>,
}

impl DiscoveryService {
    pub fn new(prober: Arc<Prober>) -> Self {
        Self {
            prober,
            scans: parking_lot::Mutex::new(HashMap::new()),
            tasks: parking_lot::Mutex::new(HashMap::new()),
            known_serials: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// Run a scan to completion and return the final result.
    pub async fn scan_network(
        &self,
        network: &str,
        options: ScanOptions,
        progress_callback: Option<ProgressCallback>,
    ) -> DiscoveryResult {
        let shared = self.track_new_scan(network, &options);
        let scan_id = shared.lock().scan_id;

        self.run_scan(network, options, Arc::clone(&shared), progress_callback)
            .await;

        let result = shared.lock().clone();
        debug!("Scan {} finished with {} devices", scan_id, result.devices.len());
        result
    }

    /// Start a background scan and return its id immediately.
    pub fn scan_network_background(
        self: &Arc<Self>,
        network: &str,
        options: ScanOptions,
        progress_callback: Option<ProgressCallback>,
    ) -> Uuid {
        let shared = self.track_new_scan(network, &options);
        let scan_id = shared.lock().scan_id;

        let service = Arc::clone(self);
        let network = network.to_string();
        let task = tokio::spawn(async move {
            service
                .run_scan(&network, options, shared, progress_callback)
                .await;
        });
        self.tasks.lock().insert(scan_id, task);

        scan_id
    }

    fn track_new_scan(&self, network: &str, options: &ScanOptions) -> SharedResult {
        let result = DiscoveryResult::new(network, options.ports.clone(), options.site_id);
        let shared = Arc::new(parking_lot::Mutex::new(result));
        let scan_id = shared.lock().scan_id;
        self.scans.lock().insert(scan_id, Arc::clone(&shared));
        shared
    }

    async fn run_scan(
        &self,
        network: &str,
        options: ScanOptions,
        shared: SharedResult,
        progress_callback: Option<ProgressCallback>,
    ) {
        let notify = |shared: &SharedResult| {
            if let Some(callback) = &progress_callback {
                let snapshot = shared.lock().clone();
                (callback.as_ref())(&snapshot);
            }
        };

        let scanner = NetworkScanner::new(ScanConfig {
            network: network.to_string(),
            ports: options.ports.clone(),
            max_concurrent: options.max_concurrent,
            connect_timeout: options.connect_timeout,
            ..Default::default()
        });

        let scan_id = {
            let mut result = shared.lock();
            result.progress.current_status = ScanStatus::Scanning;
            result.progress.started_at = Some(Utc::now());
            result.progress.total_hosts = scanner.total_targets();
            result.progress.status_message = "Starting network scan...".to_string();
            result.scan_id
        };
        notify(&shared);

        info!("Starting discovery scan {} on {}", scan_id, network);

        // Phase 1: sweep.
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
        let mut endpoints_rx = scanner.scan(Some(tick_tx));

        let mut responsive: Vec<ScanEndpoint> = Vec::new();
        loop {
            tokio::select! {
                endpoint = endpoints_rx.recv() => {
                    match endpoint {
                        Some(endpoint) => {
                            debug!(
                                "Found responsive host: {}:{} ({:.1}ms)",
                                endpoint.ip, endpoint.port, endpoint.response_time_ms
                            );
                            shared.lock().progress.responsive_hosts += 1;
                            responsive.push(endpoint);
                        }
                        None => break,
                    }
                }
                Some(tick) = tick_rx.recv() => {
                    let mut result = shared.lock();
                    result.progress.scanned_hosts = tick.scanned;
                    result.progress.current_ip = Some(tick.ip);
                    result.progress.current_port = Some(tick.port);
                    result.progress.status_message =
                        format!("Scanning {}:{}", tick.ip, tick.port);
                    drop(result);
                    notify(&shared);
                }
            }
        }
        // Drain any ticks that raced the endpoint channel closing.
        while let Ok(tick) = tick_rx.try_recv() {
            shared.lock().progress.scanned_hosts = tick.scanned;
        }

        info!("Scan found {} responsive hosts", responsive.len());

        // Phase 2: identification.
        {
            let mut result = shared.lock();
            result.progress.current_status = ScanStatus::Identifying;
            result.progress.status_message = "Identifying devices...".to_string();
        }
        notify(&shared);

        let semaphore = Arc::new(Semaphore::new(options.max_concurrent.min(10).max(1)));
        let mut tasks = Vec::with_capacity(responsive.len());
        for endpoint in responsive {
            let semaphore = Arc::clone(&semaphore);
            let prober = Arc::clone(&self.prober);
            let identify_timeout = options.identify_timeout;
            let connect_timeout = options.connect_timeout;
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                Some(identify_endpoint(prober, endpoint, connect_timeout, identify_timeout).await)
            }));
        }

        for task in tasks {
            let device = match task.await {
                Ok(Some(device)) => device,
                Ok(None) => continue,
                Err(e) => {
                    error!("Identification task failed: {}", e);
                    continue;
                }
            };

            // Dedup by serial across runs.
            if let Some(serial) = &device.serial_number {
                let mut known = self.known_serials.lock();
                if known.contains(serial) {
                    debug!("Skipping duplicate device: {}", serial);
                    continue;
                }
                known.insert(serial.clone());
            }

            let mut result = shared.lock();
            result.progress.status_message = format!(
                "Identified: {} at {}:{}",
                device.protocol_id.as_deref().unwrap_or("unknown"),
                device.ip_address,
                device.port
            );
            result.add_device(device);
            drop(result);
            notify(&shared);
        }

        let (identified, unidentified) = {
            let mut result = shared.lock();
            result.progress.current_status = ScanStatus::Completed;
            result.progress.completed_at = Some(Utc::now());
            result.progress.status_message = format!(
                "Completed: Found {} devices",
                result.progress.identified_devices
            );
            (
                result.progress.identified_devices,
                result.progress.failed_identifications,
            )
        };
        notify(&shared);

        info!(
            "Discovery scan {} completed: {} devices identified, {} unidentified hosts",
            scan_id, identified, unidentified
        );
    }

    pub fn get_scan_status(&self, scan_id: Uuid) -> Option<DiscoveryResult> {
        self.scans.lock().get(&scan_id).map(|s| s.lock().clone())
    }

    pub fn active_scans(&self) -> Vec<DiscoveryResult> {
        self.scans.lock().values().map(|s| s.lock().clone()).collect()
    }

    /// Cancel a background scan.
    pub async fn cancel_scan(&self, scan_id: Uuid) -> bool {
        let task = self.tasks.lock().remove(&scan_id);
        match task {
            Some(task) if !task.is_finished() => {
                task.abort();
                let _ = task.await;
                let shared = self.scans.lock().get(&scan_id).cloned();
                if let Some(shared) = shared {
                    let mut result = shared.lock();
                    result.progress.current_status = ScanStatus::Cancelled;
                    result.progress.completed_at = Some(Utc::now());
                    result.progress.status_message = "Scan cancelled".to_string();
                }
                true
            }
            _ => false,
        }
    }

    /// Forget seen serials, allowing re-discovery.
    pub fn clear_known_devices(&self) {
        self.known_serials.lock().clear();
    }
}

async fn identify_endpoint(
    prober: Arc<Prober>,
    endpoint: ScanEndpoint,
    connect_timeout: Duration,
    identify_timeout: Duration,
) -> DiscoveredDevice {
    let mut device =
        DiscoveredDevice::unidentified(endpoint.ip, endpoint.port, endpoint.response_time_ms);

    let stream = match tokio::time::timeout(
        connect_timeout,
        tokio::net::TcpStream::connect((endpoint.ip, endpoint.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        _ => {
            debug!("Re-connect failed for {}:{}", endpoint.ip, endpoint.port);
            return device;
        }
    };
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(_) => return device,
    };

    let session = Session::new(stream, peer);
    let identified =
        tokio::time::timeout(identify_timeout, prober.identify(&session)).await;
    session.close().await;

    if let Ok(Some(identified)) = identified {
        info!(
            "Identified {} at {}:{} (serial: {})",
            identified.protocol_id, endpoint.ip, endpoint.port, identified.serial_number
        );
        device.is_identified = true;
        device.protocol_id = Some(identified.protocol_id);
        device.serial_number = Some(identified.serial_number);
        device.device_type = Some(identified.device_type);
        device.model = identified.model;
        device.manufacturer = identified.manufacturer;
        device.firmware_version = identified.firmware_version;
        device.extra = identified.extra;
    } else {
        debug!("Could not identify device at {}:{}", endpoint.ip, endpoint.port);
    }

    device
}
