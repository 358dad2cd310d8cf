// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Discovery result types: discovered devices, scan progress, and the
//! overall result tracked per scan id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;

/// Status of a discovery scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Scanning,
    Identifying,
    Completed,
    Cancelled,
    Failed,
}

/// One endpoint found during discovery, identified or not.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    pub ip_address: IpAddr,
    pub port: u16,

    pub protocol_id: Option<String>,
    pub serial_number: Option<String>,
    pub device_type: Option<String>,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub firmware_version: Option<String>,

    pub is_identified: bool,
    pub response_time_ms: f64,
    pub extra: BTreeMap<String, serde_json::Value>,
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveredDevice {
    pub fn unidentified(ip_address: IpAddr, port: u16, response_time_ms: f64) -> Self {
        Self {
            ip_address,
            port,
            protocol_id: None,
            serial_number: None,
            device_type: None,
            model: None,
            manufacturer: None,
            firmware_version: None,
            is_identified: false,
            response_time_ms,
            extra: BTreeMap::new(),
            discovered_at: Utc::now(),
        }
    }
}

/// Progress counters for a scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanProgress {
    pub total_hosts: usize,
    pub scanned_hosts: usize,
    pub responsive_hosts: usize,
    pub identified_devices: usize,
    pub failed_identifications: usize,

    pub current_ip: Option<IpAddr>,
    pub current_port: Option<u16>,
    pub current_status: ScanStatus,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub status_message: String,
    pub last_error: Option<String>,
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self {
            total_hosts: 0,
            scanned_hosts: 0,
            responsive_hosts: 0,
            identified_devices: 0,
            failed_identifications: 0,
            current_ip: None,
            current_port: None,
            current_status: ScanStatus::Pending,
            started_at: None,
            completed_at: None,
            status_message: String::new(),
            last_error: None,
        }
    }
}

impl ScanProgress {
    pub fn progress_percent(&self) -> f64 {
        if self.total_hosts == 0 {
            0.0
        } else {
            (self.scanned_hosts as f64 / self.total_hosts as f64) * 100.0
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.current_status,
            ScanStatus::Scanning | ScanStatus::Identifying
        )
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self.current_status,
            ScanStatus::Completed | ScanStatus::Cancelled | ScanStatus::Failed
        )
    }

    pub fn elapsed_seconds(&self) -> f64 {
        match self.started_at {
            Some(started) => {
                let end = self.completed_at.unwrap_or_else(Utc::now);
                (end - started).num_milliseconds() as f64 / 1000.0
            }
            None => 0.0,
        }
    }
}

/// Complete result of one discovery scan.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryResult {
    pub scan_id: Uuid,
    pub network: String,
    pub ports: Vec<u16>,
    pub site_id: Option<Uuid>,
    pub devices: Vec<DiscoveredDevice>,
    pub progress: ScanProgress,
}

impl DiscoveryResult {
    pub fn new(network: impl Into<String>, ports: Vec<u16>, site_id: Option<Uuid>) -> Self {
        Self {
            scan_id: Uuid::new_v4(),
            network: network.into(),
            ports,
            site_id,
            devices: Vec::new(),
            progress: ScanProgress::default(),
        }
    }

    /// Record a device and bump the matching progress counter.
    pub fn add_device(&mut self, device: DiscoveredDevice) {
        if device.is_identified {
            self.progress.identified_devices += 1;
        } else {
            self.progress.failed_identifications += 1;
        }
        self.devices.push(device);
    }

    pub fn identified_devices(&self) -> impl Iterator<Item = &DiscoveredDevice> {
        self.devices.iter().filter(|d| d.is_identified)
    }

    pub fn unidentified_hosts(&self) -> impl Iterator<Item = &DiscoveredDevice> {
        self.devices.iter().filter(|d| !d.is_identified)
    }

    pub fn get_by_serial(&self, serial: &str) -> Option<&DiscoveredDevice> {
        self.devices
            .iter()
            .find(|d| d.serial_number.as_deref() == Some(serial))
    }
}
