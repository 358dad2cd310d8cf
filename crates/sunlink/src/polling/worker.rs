// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Telemetry worker: the bounded hand-off between pollers and storage.
//!
//! Producers enqueue without blocking; when the queue is full the sample is
//! dropped and counted. Polling progress is worth more than full fidelity,
//! so back-pressure sheds the tail instead of stalling a poller. Each sample
//! is validated, screened against per-metric ranges, checked for anomalies
//! over a sliding window, and appended to a batch that flushes on size or on
//! a timer. A failed flush returns the batch to the buffer: eventual
//! duplicates are accepted over data loss at this layer.

use crate::adapter::Metrics;
use crate::config::StorageSettings;
use crate::polling::collector::TelemetryProcessor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ANOMALY_WINDOW_SIZE: usize = 10;

/// One telemetry sample produced by a successful poll.
#[derive(Debug, Clone)]
pub struct TelemetrySample {
    pub device_id: Uuid,
    pub site_id: Option<Uuid>,
    pub serial_number: String,
    pub protocol_id: String,
    pub device_type: String,
    pub timestamp: DateTime<Utc>,
    pub poll_duration_ms: Option<f64>,
    /// Metric values, metadata already stripped.
    pub metrics: Metrics,
}

impl TelemetrySample {
    /// Split an enriched metric map (underscore-prefixed metadata plus metric
    /// values) into a sample.
    pub fn from_enriched(device_id: Uuid, site_id: Option<Uuid>, enriched: &Metrics) -> Self {
        let str_meta = |key: &str| {
            enriched
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string()
        };

        let timestamp = enriched
            .get("_timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let metrics = enriched
            .iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Self {
            device_id,
            site_id,
            serial_number: str_meta("_serial_number"),
            protocol_id: str_meta("_protocol_id"),
            device_type: str_meta("_device_type"),
            timestamp,
            poll_duration_ms: enriched.get("_poll_duration_ms").and_then(|v| v.as_f64()),
            metrics,
        }
    }
}

/// One row bound for the time-series store.
#[derive(Debug, Clone)]
pub struct TelemetryRow {
    pub time: DateTime<Utc>,
    pub device_id: Uuid,
    pub serial_number: String,
    pub protocol_id: String,
    pub device_type: String,
    pub data: Metrics,
    pub poll_duration_ms: Option<f64>,
}

/// Batch consumer seam; implemented by the time-series writer and by test
/// doubles.
pub trait TelemetrySink: Send + Sync + 'static {
    fn write_batch(
        &self,
        batch: Vec<TelemetryRow>,
    ) -> impl Future<Output = Result<(), String>> + Send;
}

/// Per-metric anomaly thresholds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnomalyThresholds {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub rate_of_change: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    BelowMinimum,
    AboveMaximum,
    RapidChange,
}

/// An in-range-table but threshold-crossing reading. Emitted best-effort as a
/// control-plane event; the sample itself is still stored.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyEvent {
    pub device_id: Uuid,
    pub site_id: Option<Uuid>,
    pub metric_name: String,
    pub value: f64,
    pub kind: AnomalyKind,
    pub threshold: f64,
    pub previous_value: Option<f64>,
    pub message: String,
}

/// Bounded-queue telemetry processor.
pub struct TelemetryWorker<S: TelemetrySink> {
    sink: Arc<S>,
    batch_size: usize,
    flush_interval: Duration,
    queue_capacity: usize,

    queue_tx: mpsc::Sender<TelemetrySample>,
    queue_rx: tokio::sync::Mutex<Option<mpsc::Receiver<TelemetrySample>>>,
    queue_depth: Arc<AtomicU64>,

    batch: tokio::sync::Mutex<Vec<TelemetryRow>>,
    processor: TelemetryProcessor,

    thresholds: parking_lot::RwLock<HashMap<String, AnomalyThresholds>>,
    windows: parking_lot::Mutex<HashMap<(Uuid, String), VecDeque<f64>>>,
    anomaly_tx: mpsc::UnboundedSender<AnomalyEvent>,

    received: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    anomalies: AtomicU64,

    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<S: TelemetrySink> TelemetryWorker<S> {
    /// Create the worker and the receiving end of its anomaly event stream.
    pub fn new(
        sink: Arc<S>,
        settings: &StorageSettings,
    ) -> (Self, mpsc::UnboundedReceiver<AnomalyEvent>) {
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_size);
        let (anomaly_tx, anomaly_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        (
            Self {
                sink,
                batch_size: settings.batch_size,
                flush_interval: Duration::from_secs_f64(settings.flush_interval),
                queue_capacity: settings.queue_size,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(Some(queue_rx)),
                queue_depth: Arc::new(AtomicU64::new(0)),
                batch: tokio::sync::Mutex::new(Vec::new()),
                processor: TelemetryProcessor::new(),
                thresholds: parking_lot::RwLock::new(HashMap::new()),
                windows: parking_lot::Mutex::new(HashMap::new()),
                anomaly_tx,
                received: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                anomalies: AtomicU64::new(0),
                shutdown_tx,
                tasks: parking_lot::Mutex::new(Vec::new()),
            },
            anomaly_rx,
        )
    }

    /// Replace the anomaly threshold table.
    pub fn set_anomaly_thresholds(&self, thresholds: HashMap<String, AnomalyThresholds>) {
        *self.thresholds.write() = thresholds;
    }

    /// Non-blocking enqueue. Returns false (and counts the drop) when the
    /// queue is at capacity; nothing already queued is evicted.
    pub fn submit(&self, sample: TelemetrySample) -> bool {
        self.received.fetch_add(1, Ordering::Relaxed);
        match self.queue_tx.try_send(sample) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(sample)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Telemetry queue full, dropping sample for {}",
                    sample.device_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Start the processing and flush tasks.
    pub async fn start(self: &Arc<Self>) {
        let mut rx_slot = self.queue_rx.lock().await;
        let rx = match rx_slot.take() {
            Some(rx) => rx,
            None => {
                warn!("Telemetry worker already running");
                return;
            }
        };
        drop(rx_slot);

        info!("Starting telemetry worker (queue capacity {})", self.queue_capacity);

        let worker = Arc::clone(self);
        let process_task = tokio::spawn(worker.process_loop(rx));

        let worker = Arc::clone(self);
        let flush_task = tokio::spawn(async move {
            let mut shutdown = worker.shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(worker.flush_interval) => {
                        worker.flush().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        self.tasks.lock().extend([process_task, flush_task]);
    }

    /// Stop the worker: drain what is already queued, then flush once.
    pub async fn stop(&self) {
        info!("Stopping telemetry worker");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.flush().await;
        info!(
            "Telemetry worker stopped (received: {}, processed: {}, dropped: {})",
            self.received.load(Ordering::Relaxed),
            self.processed.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed)
        );
    }

    async fn process_loop(self: Arc<Self>, mut rx: mpsc::Receiver<TelemetrySample>) {
        debug!("Telemetry processing loop started");
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                sample = rx.recv() => {
                    match sample {
                        Some(sample) => {
                            self.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            self.process_sample(sample).await;
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Drain whatever is already queued before exiting.
                        while let Ok(sample) = rx.try_recv() {
                            self.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            self.process_sample(sample).await;
                        }
                        break;
                    }
                }
            }
        }
        debug!("Telemetry processing loop ended");
    }

    async fn process_sample(&self, sample: TelemetrySample) {
        // Step 1+2: validate and range-screen the metric values.
        let validated = self.processor.process(&sample.metrics);

        // Step 3: anomaly detection over the numeric subset.
        let numeric: Vec<(String, f64)> = validated
            .iter()
            .filter_map(|(key, value)| value.as_f64().map(|v| (key.clone(), v)))
            .collect();
        let anomalies = self.detect_anomalies(sample.device_id, &numeric);
        for mut anomaly in anomalies {
            anomaly.site_id = sample.site_id;
            self.anomalies.fetch_add(1, Ordering::Relaxed);
            if self.anomaly_tx.send(anomaly).is_err() {
                debug!("Anomaly event receiver dropped");
            }
        }

        // Step 4: append to the storage batch.
        let row = TelemetryRow {
            time: sample.timestamp,
            device_id: sample.device_id,
            serial_number: sample.serial_number,
            protocol_id: sample.protocol_id,
            device_type: sample.device_type,
            data: validated,
            poll_duration_ms: sample.poll_duration_ms,
        };

        let should_flush = {
            let mut batch = self.batch.lock().await;
            batch.push(row);
            batch.len() >= self.batch_size
        };
        if should_flush {
            self.flush().await;
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn detect_anomalies(&self, device_id: Uuid, metrics: &[(String, f64)]) -> Vec<AnomalyEvent> {
        let thresholds = self.thresholds.read();
        let mut windows = self.windows.lock();
        let mut events = Vec::new();

        for (name, value) in metrics {
            let window = windows
                .entry((device_id, name.clone()))
                .or_insert_with(|| VecDeque::with_capacity(ANOMALY_WINDOW_SIZE));

            if let Some(limits) = thresholds.get(name) {
                if let Some(min) = limits.min {
                    if *value < min {
                        events.push(AnomalyEvent {
                            device_id,
                            site_id: None,
                            metric_name: name.clone(),
                            value: *value,
                            kind: AnomalyKind::BelowMinimum,
                            threshold: min,
                            previous_value: None,
                            message: format!(
                                "{} ({}) below minimum threshold ({})",
                                name, value, min
                            ),
                        });
                    }
                }
                if let Some(max) = limits.max {
                    if *value > max {
                        events.push(AnomalyEvent {
                            device_id,
                            site_id: None,
                            metric_name: name.clone(),
                            value: *value,
                            kind: AnomalyKind::AboveMaximum,
                            threshold: max,
                            previous_value: None,
                            message: format!(
                                "{} ({}) above maximum threshold ({})",
                                name, value, max
                            ),
                        });
                    }
                }
                if let Some(rate_limit) = limits.rate_of_change {
                    if let Some(&previous) = window.back() {
                        let delta = (*value - previous).abs();
                        if delta > rate_limit {
                            events.push(AnomalyEvent {
                                device_id,
                                site_id: None,
                                metric_name: name.clone(),
                                value: *value,
                                kind: AnomalyKind::RapidChange,
                                threshold: rate_limit,
                                previous_value: Some(previous),
                                message: format!(
                                    "{} changed rapidly ({} -> {})",
                                    name, previous, value
                                ),
                            });
                        }
                    }
                }
            }

            window.push_back(*value);
            while window.len() > ANOMALY_WINDOW_SIZE {
                window.pop_front();
            }
        }

        events
    }

    /// Flush the current batch. A failed write puts the rows back at the
    /// front of the buffer so retry preserves per-device ordering.
    pub async fn flush(&self) {
        let batch: Vec<TelemetryRow> = {
            let mut guard = self.batch.lock().await;
            if guard.is_empty() {
                return;
            }
            std::mem::take(&mut *guard)
        };

        let count = batch.len();
        match self.sink.write_batch(batch.clone()).await {
            Ok(()) => {
                debug!("Flushed {} telemetry rows", count);
            }
            Err(e) => {
                error!("Error flushing telemetry batch: {}", e);
                let mut guard = self.batch.lock().await;
                guard.splice(0..0, batch);
            }
        }
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> TelemetryWorkerStats {
        TelemetryWorkerStats {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            queue_capacity: self.queue_capacity,
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            anomalies_detected: self.anomalies.load(Ordering::Relaxed),
            devices_tracked: self
                .windows
                .lock()
                .keys()
                .map(|(device_id, _)| *device_id)
                .collect::<std::collections::HashSet<_>>()
                .len(),
        }
    }
}

/// Telemetry worker statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryWorkerStats {
    pub queue_depth: u64,
    pub queue_capacity: usize,
    pub received: u64,
    pub processed: u64,
    pub dropped: u64,
    pub anomalies_detected: u64,
    pub devices_tracked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Sink that can be paused and records every row it accepts.
    struct TestSink {
        rows: tokio::sync::Mutex<Vec<TelemetryRow>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl TestSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rows: tokio::sync::Mutex::new(Vec::new()),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }

        fn set_failing(&self, failing: bool) {
            self.fail.store(failing, Ordering::SeqCst);
        }
    }

    impl TelemetrySink for TestSink {
        async fn write_batch(&self, batch: Vec<TelemetryRow>) -> Result<(), String> {
            if self.fail.load(Ordering::SeqCst) {
                return Err("sink offline".to_string());
            }
            self.rows.lock().await.extend(batch);
            Ok(())
        }
    }

    fn storage_settings(queue_size: usize, batch_size: usize) -> StorageSettings {
        StorageSettings {
            timescale_dsn: None,
            batch_size,
            flush_interval: 0.05,
            queue_size,
        }
    }

    fn sample(device_id: Uuid, seq: i64) -> TelemetrySample {
        let mut metrics = Metrics::new();
        metrics.insert("grid_voltage".to_string(), json!(230.0));
        metrics.insert("seq".to_string(), json!(seq));
        TelemetrySample {
            device_id,
            site_id: None,
            serial_number: "SN1".to_string(),
            protocol_id: "powdrive".to_string(),
            device_type: "inverter".to_string(),
            timestamp: Utc::now(),
            poll_duration_ms: Some(12.0),
            metrics,
        }
    }

    #[tokio::test]
    async fn test_queue_drop_under_pressure() {
        let sink = TestSink::new();
        let (worker, _anomalies) =
            TelemetryWorker::new(Arc::clone(&sink), &storage_settings(100, 50));
        let worker = Arc::new(worker);
        let device_id = Uuid::new_v4();

        // Flusher not started: the queue fills to capacity, the rest drop.
        let mut accepted = 0;
        for seq in 0..150 {
            if worker.submit(sample(device_id, seq)) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 100);
        let stats = worker.stats();
        assert_eq!(stats.dropped, 50);
        assert_eq!(stats.queue_depth, 100);

        // Resume: every accepted sample is delivered exactly once.
        worker.start().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        worker.stop().await;

        let rows = sink.rows.lock().await;
        assert_eq!(rows.len(), 100);
        let mut seqs: Vec<i64> = rows
            .iter()
            .map(|r| r.data["seq"].as_i64().unwrap())
            .collect();
        let sorted = {
            let mut s = seqs.clone();
            s.sort_unstable();
            s
        };
        // Queue order preserved, no duplicates.
        assert_eq!(seqs, sorted);
        seqs.dedup();
        assert_eq!(seqs.len(), 100);
    }

    #[tokio::test]
    async fn test_flush_failure_retries_without_loss() {
        let sink = TestSink::new();
        let (worker, _anomalies) =
            TelemetryWorker::new(Arc::clone(&sink), &storage_settings(100, 1000));
        let worker = Arc::new(worker);
        let device_id = Uuid::new_v4();

        sink.set_failing(true);
        worker.start().await;
        for seq in 0..5 {
            assert!(worker.submit(sample(device_id, seq)));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sink.rows.lock().await.is_empty());

        sink.set_failing(false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        worker.stop().await;

        let rows = sink.rows.lock().await;
        let seqs: Vec<i64> = rows
            .iter()
            .map(|r| r.data["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_out_of_range_metric_never_stored() {
        let sink = TestSink::new();
        let (worker, _anomalies) =
            TelemetryWorker::new(Arc::clone(&sink), &storage_settings(100, 1));
        let worker = Arc::new(worker);
        let device_id = Uuid::new_v4();
        worker.start().await;

        let mut bad = sample(device_id, 0);
        bad.metrics.clear();
        bad.metrics.insert("battery_soc".to_string(), json!(150.0));
        worker.submit(bad);

        let mut good = sample(device_id, 1);
        good.metrics.clear();
        good.metrics.insert("battery_soc".to_string(), json!(55.0));
        worker.submit(good);

        tokio::time::sleep(Duration::from_millis(200)).await;
        worker.stop().await;

        let rows = sink.rows.lock().await;
        for row in rows.iter() {
            if let Some(soc) = row.data.get("battery_soc") {
                assert_eq!(soc, &json!(55.0));
            }
        }
        assert!(rows.iter().any(|r| r.data.get("battery_soc").is_some()));
    }

    #[tokio::test]
    async fn test_anomaly_detection_bounds_and_rate() {
        let sink = TestSink::new();
        let (worker, mut anomalies) =
            TelemetryWorker::new(Arc::clone(&sink), &storage_settings(100, 1000));
        let worker = Arc::new(worker);
        let device_id = Uuid::new_v4();

        let mut thresholds = HashMap::new();
        thresholds.insert(
            "battery_temperature".to_string(),
            AnomalyThresholds {
                min: Some(0.0),
                max: Some(60.0),
                rate_of_change: Some(10.0),
            },
        );
        worker.set_anomaly_thresholds(thresholds);
        worker.start().await;

        let send = |value: f64| {
            let mut s = sample(device_id, 0);
            s.metrics.clear();
            s.metrics
                .insert("battery_temperature".to_string(), json!(value));
            s
        };

        worker.submit(send(25.0));
        worker.submit(send(70.0)); // above max AND jumps by 45
        tokio::time::sleep(Duration::from_millis(200)).await;
        worker.stop().await;

        let mut kinds = Vec::new();
        while let Ok(event) = anomalies.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&AnomalyKind::AboveMaximum));
        assert!(kinds.contains(&AnomalyKind::RapidChange));
        assert!(!kinds.contains(&AnomalyKind::BelowMinimum));
    }

    #[tokio::test]
    async fn test_stop_flushes_pending_batch() {
        let sink = TestSink::new();
        let (worker, _anomalies) =
            TelemetryWorker::new(Arc::clone(&sink), &storage_settings(100, 1000));
        let worker = Arc::new(worker);
        let device_id = Uuid::new_v4();

        worker.start().await;
        worker.submit(sample(device_id, 0));
        worker.submit(sample(device_id, 1));
        // Batch threshold not reached and flush interval may not have fired;
        // stop() must still deliver everything.
        worker.stop().await;

        assert_eq!(sink.rows.lock().await.len(), 2);
    }
}
