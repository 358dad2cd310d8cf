// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Telemetry collection: executes one poll against a device's adapter,
//! bounded by the polling timeout, and enriches the result with metadata.
//!
//! Keys starting with `_` are reserved metadata; downstream consumers strip
//! them before persisting metric payloads.

use crate::adapter::Metrics;
use crate::config::PollingSettings;
use crate::device::DeviceManager;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Collects telemetry from devices through their adapters.
pub struct TelemetryCollector {
    device_manager: Arc<DeviceManager>,
    settings: PollingSettings,
}

impl TelemetryCollector {
    pub fn new(device_manager: Arc<DeviceManager>, settings: PollingSettings) -> Self {
        Self {
            device_manager,
            settings,
        }
    }

    /// Poll one device. Records the outcome against the device's counters and
    /// returns the enriched metrics on success.
    pub async fn collect(&self, device_id: Uuid) -> Result<Metrics, String> {
        let record = self
            .device_manager
            .get(device_id)
            .ok_or_else(|| "Device not found".to_string())?;
        let adapter = self
            .device_manager
            .adapter(device_id)
            .ok_or_else(|| "No adapter for device".to_string())?;
        let session = self
            .device_manager
            .session(device_id)
            .ok_or_else(|| "Device not connected".to_string())?;
        if !session.is_connected() {
            return Err("Device not connected".to_string());
        }

        let timeout = std::time::Duration::from_secs_f64(self.settings.timeout);
        let started = Instant::now();

        let outcome = tokio::time::timeout(timeout, adapter.poll()).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(Ok(metrics)) if !metrics.is_empty() => {
                let enriched = enrich(&record.device_id, &record.serial_number,
                    &record.protocol_id, &record.device_type, metrics, duration_ms);
                self.device_manager.record_poll(
                    device_id,
                    true,
                    Some(enriched.clone()),
                    None,
                    duration_ms,
                );
                debug!(
                    "Collected telemetry from {}: {} values in {:.1}ms",
                    device_id,
                    enriched.len(),
                    duration_ms
                );
                Ok(enriched)
            }
            Ok(Ok(_)) => {
                let error = "Empty response".to_string();
                self.device_manager
                    .record_poll(device_id, false, None, Some(error.clone()), duration_ms);
                Err(error)
            }
            Ok(Err(e)) => {
                let error = e.to_string();
                self.device_manager
                    .record_poll(device_id, false, None, Some(error.clone()), duration_ms);
                warn!("Error polling device {}: {}", device_id, error);
                Err(error)
            }
            Err(_) => {
                let error = "Poll timeout".to_string();
                self.device_manager
                    .record_poll(device_id, false, None, Some(error.clone()), duration_ms);
                warn!("Timeout polling device {}", device_id);
                Err(error)
            }
        }
    }
}

fn enrich(
    device_id: &Uuid,
    serial_number: &str,
    protocol_id: &str,
    device_type: &str,
    metrics: Metrics,
    duration_ms: f64,
) -> Metrics {
    let mut enriched = Metrics::new();
    enriched.insert("_device_id".to_string(), device_id.to_string().into());
    enriched.insert("_serial_number".to_string(), serial_number.into());
    enriched.insert("_protocol_id".to_string(), protocol_id.into());
    enriched.insert("_device_type".to_string(), device_type.into());
    enriched.insert("_timestamp".to_string(), Utc::now().to_rfc3339().into());
    enriched.insert(
        "_poll_duration_ms".to_string(),
        ((duration_ms * 100.0).round() / 100.0).into(),
    );
    enriched.extend(metrics);
    enriched
}

/// Acceptable bounds for well-known metric names, matched by
/// case-insensitive substring. First match wins. A value outside its range is
/// bad data and silently dropped, which is distinct from an in-range anomaly.
const METRIC_RANGES: &[(&str, f64, f64)] = &[
    // Voltage (V)
    ("voltage", 0.0, 1000.0),
    // Current (A)
    ("current", -1000.0, 1000.0),
    // Power (W)
    ("power", -100_000.0, 100_000.0),
    // Temperature (degrees C)
    ("temperature", -40.0, 100.0),
    // State of charge (%)
    ("soc", 0.0, 100.0),
    // Frequency (Hz)
    ("frequency", 40.0, 70.0),
];

/// Validates and normalizes polled values before they enter the pipeline.
#[derive(Debug, Default, Clone)]
pub struct TelemetryProcessor;

impl TelemetryProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Drop invalid values, pass metadata through untouched. Applying this
    /// twice leaves the result unchanged.
    pub fn process(&self, telemetry: &Metrics) -> Metrics {
        let mut processed = Metrics::new();
        for (key, value) in telemetry {
            if key.starts_with('_') {
                processed.insert(key.clone(), value.clone());
                continue;
            }
            if let Some(normalized) = self.normalize(key, value) {
                processed.insert(key.clone(), normalized);
            }
        }
        processed
    }

    fn normalize(&self, key: &str, value: &serde_json::Value) -> Option<serde_json::Value> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Number(n) => {
                let v = n.as_f64()?;
                if !v.is_finite() {
                    return None;
                }
                // Common Modbus "unavailable" markers. All-zero readings are
                // valid data.
                if v == 65535.0 || v == 4_294_967_295.0 {
                    return None;
                }
                if !self.in_range(key, v) {
                    debug!("Value {} for {} out of range", v, key);
                    return None;
                }
                Some(value.clone())
            }
            serde_json::Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(serde_json::Value::String(trimmed.to_string()))
                }
            }
            other => Some(other.clone()),
        }
    }

    /// Range screen for well-known metric names.
    pub fn in_range(&self, key: &str, value: f64) -> bool {
        let key_lower = key.to_ascii_lowercase();
        for (pattern, min, max) in METRIC_RANGES {
            if key_lower.contains(pattern) {
                return *min <= value && value <= *max;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metrics(pairs: &[(&str, serde_json::Value)]) -> Metrics {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_out_of_range_soc_dropped() {
        let processor = TelemetryProcessor::new();
        let input = metrics(&[("battery_soc", json!(150.0))]);
        let output = processor.process(&input);
        assert!(output.is_empty());

        let input = metrics(&[("battery_soc", json!(55.0))]);
        let output = processor.process(&input);
        assert_eq!(output["battery_soc"], json!(55.0));
    }

    #[test]
    fn test_unavailable_markers_dropped() {
        let processor = TelemetryProcessor::new();
        let input = metrics(&[
            ("raw_a", json!(65535.0)),
            ("raw_b", json!(4_294_967_295.0_f64)),
            ("raw_c", json!(0.0)),
        ]);
        let output = processor.process(&input);
        // Zero is a valid reading; only the markers disappear.
        assert_eq!(output.len(), 1);
        assert_eq!(output["raw_c"], json!(0.0));
    }

    #[test]
    fn test_metadata_passes_through() {
        let processor = TelemetryProcessor::new();
        let input = metrics(&[
            ("_serial_number", json!("SN1")),
            ("grid_voltage", json!(230.0)),
        ]);
        let output = processor.process(&input);
        assert_eq!(output["_serial_number"], json!("SN1"));
        assert_eq!(output["grid_voltage"], json!(230.0));
    }

    #[test]
    fn test_strings_trimmed_and_empties_dropped() {
        let processor = TelemetryProcessor::new();
        let input = metrics(&[("model", json!("  X42  ")), ("blank", json!("   "))]);
        let output = processor.process(&input);
        assert_eq!(output["model"], json!("X42"));
        assert!(!output.contains_key("blank"));
    }

    #[test]
    fn test_process_is_idempotent() {
        let processor = TelemetryProcessor::new();
        let input = metrics(&[
            ("grid_voltage", json!(230.0)),
            ("battery_soc", json!(88.0)),
            ("model", json!("X42")),
            ("_timestamp", json!("2026-01-01T00:00:00Z")),
        ]);
        let once = processor.process(&input);
        let twice = processor.process(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_frequency_bounds() {
        let processor = TelemetryProcessor::new();
        assert!(processor.in_range("grid_frequency", 50.0));
        assert!(!processor.in_range("grid_frequency", 10.0));
        assert!(!processor.in_range("grid_frequency", 75.0));
    }

    #[test]
    fn test_unknown_metric_accepted() {
        let processor = TelemetryProcessor::new();
        assert!(processor.in_range("custom_counter", 1e9));
    }
}
