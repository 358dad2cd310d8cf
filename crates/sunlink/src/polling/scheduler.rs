// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Polling scheduler: one independent cooperative task per device, no
//! central loop.
//!
//! Each task polls, reports through the event stream, backs off
//! exponentially on consecutive failures and stops once the device crosses
//! the offline threshold. Cancellation (device removed, shutdown) aborts the
//! task; every poll inside it is already deadline-bounded.

use crate::adapter::Metrics;
use crate::config::PollingSettings;
use crate::device::DeviceManager;
use crate::polling::collector::{TelemetryCollector, TelemetryProcessor};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notifications from the polling tasks, consumed by the composition root.
#[derive(Debug, Clone)]
pub enum PollingEvent {
    Telemetry {
        device_id: Uuid,
        metrics: Metrics,
    },
    PollError {
        device_id: Uuid,
        error: String,
    },
    DeviceOffline {
        device_id: Uuid,
        consecutive_failures: u32,
    },
}

/// Next poll interval with exponential backoff.
///
/// With backoff disabled or no failures the base interval is used as-is.
/// Otherwise `min(base * 2^failures, max_interval)` clamped to at least
/// `min_interval`: non-decreasing in the failure count and bounded above.
pub fn compute_interval(base: u64, failures: u32, settings: &PollingSettings) -> u64 {
    if !settings.failure_backoff || failures == 0 {
        return base;
    }
    let backoff = 2u64
        .checked_pow(failures)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(u64::MAX);
    backoff.min(settings.max_interval).max(settings.min_interval)
}

/// Manages the per-device polling tasks.
pub struct PollingScheduler {
    device_manager: Arc<DeviceManager>,
    collector: Arc<TelemetryCollector>,
    processor: TelemetryProcessor,
    settings: PollingSettings,
    tasks: parking_lot::Mutex<HashMap<Uuid, JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    events: mpsc::UnboundedSender<PollingEvent>,
}

impl PollingScheduler {
    /// Create the scheduler and the receiving end of its event stream.
    pub fn new(
        device_manager: Arc<DeviceManager>,
        settings: PollingSettings,
    ) -> (Self, mpsc::UnboundedReceiver<PollingEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let collector = Arc::new(TelemetryCollector::new(
            Arc::clone(&device_manager),
            settings.clone(),
        ));
        (
            Self {
                device_manager,
                collector,
                processor: TelemetryProcessor::new(),
                settings,
                tasks: parking_lot::Mutex::new(HashMap::new()),
                shutdown_tx,
                events,
            },
            receiver,
        )
    }

    /// Start (or restart) polling for a device. Any previous task for the
    /// same device is cancelled first, so at most one exists at any time.
    pub fn schedule(&self, device_id: Uuid) {
        if *self.shutdown_tx.borrow() {
            warn!("Scheduler stopped, not scheduling {}", device_id);
            return;
        }
        let record = match self.device_manager.get(device_id) {
            Some(record) => record,
            None => {
                warn!("Device {} not found, cannot schedule polling", device_id);
                return;
            }
        };

        self.cancel(device_id);

        let task = tokio::spawn(poll_loop(
            device_id,
            Arc::clone(&self.device_manager),
            Arc::clone(&self.collector),
            self.processor.clone(),
            self.settings.clone(),
            self.events.clone(),
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.lock().insert(device_id, task);

        info!(
            "Scheduled polling for {} (interval={}s)",
            device_id, record.poll_interval
        );
    }

    /// Cancel polling for one device.
    pub fn cancel(&self, device_id: Uuid) {
        if let Some(task) = self.tasks.lock().remove(&device_id) {
            task.abort();
            debug!("Cancelled polling for {}", device_id);
        }
    }

    /// Stop all polling tasks.
    pub async fn stop(&self) {
        info!("Stopping polling scheduler");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<(Uuid, JoinHandle<()>)> = self.tasks.lock().drain().collect();
        for (_, task) in tasks {
            task.abort();
            let _ = task.await;
        }
        info!("Polling scheduler stopped");
    }

    /// Change a device's base interval. Clamped to the configured bounds;
    /// takes effect at the next scheduling decision.
    pub fn update_poll_interval(&self, device_id: Uuid, interval: u64) -> bool {
        let clamped = interval
            .max(self.settings.min_interval)
            .min(self.settings.max_interval);
        let updated = self.device_manager.update_poll_interval(device_id, clamped);
        if updated {
            info!("Updated poll interval for {} to {}s", device_id, clamped);
        }
        updated
    }

    pub fn is_polling(&self, device_id: Uuid) -> bool {
        self.tasks
            .lock()
            .get(&device_id)
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn polling_devices(&self) -> Vec<Uuid> {
        self.tasks
            .lock()
            .iter()
            .filter(|(_, task)| !task.is_finished())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> SchedulerStats {
        let tasks = self.tasks.lock();
        SchedulerStats {
            running: !*self.shutdown_tx.borrow(),
            active_tasks: tasks.values().filter(|t| !t.is_finished()).count(),
            total_tasks: tasks.len(),
        }
    }
}

/// Scheduler statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub active_tasks: usize,
    pub total_tasks: usize,
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    device_id: Uuid,
    device_manager: Arc<DeviceManager>,
    collector: Arc<TelemetryCollector>,
    processor: TelemetryProcessor,
    settings: PollingSettings,
    events: mpsc::UnboundedSender<PollingEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Starting poll loop for {}", device_id);

    loop {
        let record = match device_manager.get(device_id) {
            Some(record) => record,
            None => {
                info!("Device {} removed, stopping poll loop", device_id);
                break;
            }
        };

        match collector.collect(device_id).await {
            Ok(metrics) => {
                let processed = processor.process(&metrics);
                let _ = events.send(PollingEvent::Telemetry {
                    device_id,
                    metrics: processed,
                });
            }
            Err(error) => {
                let _ = events.send(PollingEvent::PollError {
                    device_id,
                    error,
                });

                // collect() already bumped the failure counter.
                let failures = device_manager
                    .get(device_id)
                    .map(|r| r.consecutive_failures)
                    .unwrap_or(0);
                if failures >= settings.max_consecutive_failures {
                    warn!(
                        "Device {} marked offline after {} consecutive failures",
                        device_id, failures
                    );
                    device_manager.mark_offline(
                        device_id,
                        Some(format!("Too many poll failures ({})", failures)),
                    );
                    let _ = events.send(PollingEvent::DeviceOffline {
                        device_id,
                        consecutive_failures: failures,
                    });
                    break;
                }
            }
        }

        let failures = device_manager
            .get(device_id)
            .map(|r| r.consecutive_failures)
            .unwrap_or(0);
        let interval = compute_interval(record.poll_interval, failures, &settings);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Poll loop ended for {}", device_id);
}
