// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Control-plane HTTP client.
//!
//! Bearer-authenticated JSON client for device registration, status and
//! snapshot updates, site auto-assignment and anomaly events. Every call has
//! a total timeout and bounded retries; a failure is logged and surfaced to
//! the caller, never fatal to the session that triggered it.

use crate::adapter::Metrics;
use crate::config::ControlPlaneSettings;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client for the platform control-plane API.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
    retry_delay: Duration,
}

#[derive(Debug, Deserialize)]
struct DeviceIdResponse {
    device_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct SiteResponse {
    site_id: Option<Uuid>,
}

impl ControlPlaneClient {
    /// Build the client. `None` when no API key is configured (integration
    /// disabled).
    pub fn from_settings(settings: &ControlPlaneSettings) -> Option<Self> {
        let api_key = settings.api_key.as_deref()?;

        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth =
            reqwest::header::HeaderValue::from_str(&format!("Bearer {}", api_key)).ok()?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs_f64(settings.timeout))
            .build()
            .ok()?;

        info!("Control-plane client initialized: {}", settings.base_url);
        Some(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            max_retries: settings.max_retries,
            retry_delay: Duration::from_secs_f64(settings.retry_delay),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST with bounded retries on transport errors and 5xx responses.
    async fn post_with_retry(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, ControlPlaneError> {
        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.client.post(self.url(path)).json(payload).send().await {
                Ok(response) if response.status().is_server_error() => {
                    last_error = format!("server error: {}", response.status());
                    debug!("POST {} attempt {}: {}", path, attempt + 1, last_error);
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    last_error = e.to_string();
                    debug!("POST {} attempt {}: {}", path, attempt + 1, last_error);
                }
            }
        }
        Err(ControlPlaneError::Unreachable(last_error))
    }

    /// Register a device. 201 means created, 409 means it already exists;
    /// both responses carry the canonical device id.
    pub async fn register_device(
        &self,
        site_id: Option<Uuid>,
        serial_number: &str,
        device_type: &str,
        protocol_id: &str,
        model: Option<&str>,
        manufacturer: Option<&str>,
    ) -> Result<Uuid, ControlPlaneError> {
        let payload = serde_json::json!({
            "site_id": site_id,
            "serial_number": serial_number,
            "device_type": device_type,
            "protocol": protocol_id,
            "model": model,
            "manufacturer": manufacturer,
            "status": "online",
        });

        let response = self.post_with_retry("/devices/register", &payload).await?;
        let status = response.status();

        if status == reqwest::StatusCode::CREATED || status == reqwest::StatusCode::CONFLICT {
            let body: DeviceIdResponse = response
                .json()
                .await
                .map_err(|e| ControlPlaneError::BadResponse(e.to_string()))?;
            if status == reqwest::StatusCode::CONFLICT {
                info!(
                    "Device {} already registered as {}",
                    serial_number, body.device_id
                );
            }
            Ok(body.device_id)
        } else {
            Err(ControlPlaneError::Status(status.as_u16()))
        }
    }

    /// Update a device's status.
    pub async fn update_device_status(
        &self,
        device_id: Uuid,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), ControlPlaneError> {
        let payload = serde_json::json!({
            "status": status,
            "status_message": message,
            "updated_at": Utc::now().to_rfc3339(),
        });

        let response = self
            .client
            .patch(self.url(&format!("/devices/{}/status", device_id)))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Unreachable(e.to_string()))?;

        if response.status().is_success() {
            debug!("Updated device {} status to {}", device_id, status);
            Ok(())
        } else {
            Err(ControlPlaneError::Status(response.status().as_u16()))
        }
    }

    /// Push the latest telemetry snapshot for a device. Metadata fields
    /// (underscore-prefixed) are stripped before sending.
    pub async fn update_device_snapshot(
        &self,
        device_id: Uuid,
        telemetry: &Metrics,
    ) -> Result<(), ControlPlaneError> {
        let payload = serde_json::json!({
            "snapshot": snapshot_payload(telemetry),
            "timestamp": Utc::now().to_rfc3339(),
        });

        let response = self
            .client
            .patch(self.url(&format!("/devices/{}/snapshot", device_id)))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Unreachable(e.to_string()))?;

        if response.status().is_success() {
            debug!("Updated snapshot for device {}", device_id);
            Ok(())
        } else {
            warn!(
                "Failed to update snapshot for {}: {}",
                device_id,
                response.status()
            );
            Err(ControlPlaneError::Status(response.status().as_u16()))
        }
    }

    /// Resolve the site a device belongs to from its remote address.
    pub async fn get_site_for_device(
        &self,
        remote_addr: &str,
    ) -> Result<Option<Uuid>, ControlPlaneError> {
        let response = self
            .client
            .get(self.url("/sites/by-address"))
            .query(&[("address", remote_addr)])
            .send()
            .await
            .map_err(|e| ControlPlaneError::Unreachable(e.to_string()))?;

        if response.status().is_success() {
            let body: SiteResponse = response
                .json()
                .await
                .map_err(|e| ControlPlaneError::BadResponse(e.to_string()))?;
            Ok(body.site_id)
        } else {
            Ok(None)
        }
    }

    /// Emit a device event (anomalies and similar). Best-effort.
    pub async fn create_event(
        &self,
        device_id: Uuid,
        site_id: Option<Uuid>,
        event_type: &str,
        severity: &str,
        message: &str,
        details: serde_json::Value,
    ) -> Result<(), ControlPlaneError> {
        let payload = serde_json::json!({
            "device_id": device_id,
            "site_id": site_id,
            "event_type": event_type,
            "severity": severity,
            "message": message,
            "details": details,
            "created_at": Utc::now().to_rfc3339(),
        });

        let response = self.post_with_retry("/events", &payload).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ControlPlaneError::Status(response.status().as_u16()))
        }
    }

    /// Liveness check against the control plane.
    pub async fn heartbeat(&self) -> bool {
        match self.client.get(self.url("/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Snapshot body: metric values with reserved metadata removed.
pub fn snapshot_payload(telemetry: &Metrics) -> Metrics {
    telemetry
        .iter()
        .filter(|(key, _)| !key.starts_with('_'))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Control-plane error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("control plane unreachable: {0}")]
    Unreachable(String),
    #[error("unexpected status: {0}")]
    Status(u16),
    #[error("bad response body: {0}")]
    BadResponse(String),
}
