// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Device server configuration.
//!
//! Settings are grouped per subsystem. Each group deserializes from the server
//! config file and can be overridden field-by-field through environment
//! variables (`DEVICE_SERVER_*`, `DEVICE_CONNECTION_*`,
//! `DEVICE_IDENTIFICATION_*`, `DEVICE_POLLING_*`, `SYSTEM_A_*`,
//! `DEVICE_STORAGE_*`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TCP listener configuration (`DEVICE_SERVER_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Bind address for the data-logger listener.
    #[serde(default = "default_host")]
    pub host: String,

    /// Listener port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrent sessions; further sockets are closed on accept.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Listen backlog.
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

/// Per-session I/O configuration (`DEVICE_CONNECTION_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Read deadline for a single socket read, seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: f64,

    /// Write deadline for a single socket write, seconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout: f64,

    /// Delay after accept before the first probe; some loggers emit junk on
    /// open.
    #[serde(default = "default_stabilization_delay")]
    pub stabilization_delay: f64,

    /// Bound on a graceful session close.
    #[serde(default = "default_close_timeout")]
    pub close_timeout: f64,
}

/// Identification configuration (`DEVICE_IDENTIFICATION_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentificationSettings {
    /// Overall deadline for one identification pass, seconds.
    #[serde(default = "default_identification_timeout")]
    pub timeout: f64,

    /// Full identification passes before the session is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between identification passes, seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
}

/// Polling configuration (`DEVICE_POLLING_*`). Per-protocol polling blocks
/// override `default_interval`; the min/max clamps and the backoff policy are
/// server-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    #[serde(default = "default_poll_interval")]
    pub default_interval: u64,

    #[serde(default = "default_min_interval")]
    pub min_interval: u64,

    #[serde(default = "default_max_interval")]
    pub max_interval: u64,

    /// Enable exponential backoff after consecutive failures.
    #[serde(default = "default_true")]
    pub failure_backoff: bool,

    /// Consecutive failures before a device is marked offline.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Deadline for a single poll, seconds.
    #[serde(default = "default_poll_timeout")]
    pub timeout: f64,
}

/// Control-plane API client configuration (`SYSTEM_A_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneSettings {
    #[serde(default = "default_control_plane_url")]
    pub base_url: String,

    /// Bearer token; `None` disables the client.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Total request timeout, seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout: f64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
}

/// Telemetry storage configuration (`DEVICE_STORAGE_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// TimescaleDB DSN; `None` disables the time-series writer.
    #[serde(default)]
    pub timescale_dsn: Option<String>,

    /// Rows per batched insert.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush cadence, seconds.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: f64,

    /// Telemetry queue capacity; samples beyond it are dropped.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

/// Top-level settings for the device server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding `protocols.yaml` (+ `protocols_*.yaml`).
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Directory holding register-map JSON sidecars.
    #[serde(default = "default_register_maps_dir")]
    pub register_maps_dir: PathBuf,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub identification: IdentificationSettings,

    #[serde(default)]
    pub polling: PollingSettings,

    #[serde(default)]
    pub control_plane: ControlPlaneSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8502
}
fn default_max_connections() -> usize {
    1000
}
fn default_backlog() -> u32 {
    100
}
fn default_read_timeout() -> f64 {
    10.0
}
fn default_write_timeout() -> f64 {
    10.0
}
fn default_stabilization_delay() -> f64 {
    0.5
}
fn default_close_timeout() -> f64 {
    5.0
}
fn default_identification_timeout() -> f64 {
    10.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> f64 {
    1.0
}
fn default_poll_interval() -> u64 {
    10
}
fn default_min_interval() -> u64 {
    5
}
fn default_max_interval() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_max_consecutive_failures() -> u32 {
    5
}
fn default_poll_timeout() -> f64 {
    5.0
}
fn default_control_plane_url() -> String {
    "http://localhost:8000/api/v1".to_string()
}
fn default_http_timeout() -> f64 {
    10.0
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_interval() -> f64 {
    1.0
}
fn default_queue_size() -> usize {
    10_000
}
fn default_config_dir() -> PathBuf {
    PathBuf::from("config")
}
fn default_register_maps_dir() -> PathBuf {
    PathBuf::from("register_maps")
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            stabilization_delay: default_stabilization_delay(),
            close_timeout: default_close_timeout(),
        }
    }
}

impl Default for IdentificationSettings {
    fn default() -> Self {
        Self {
            timeout: default_identification_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            default_interval: default_poll_interval(),
            min_interval: default_min_interval(),
            max_interval: default_max_interval(),
            failure_backoff: true,
            max_consecutive_failures: default_max_consecutive_failures(),
            timeout: default_poll_timeout(),
        }
    }
}

impl Default for ControlPlaneSettings {
    fn default() -> Self {
        Self {
            base_url: default_control_plane_url(),
            api_key: None,
            timeout: default_http_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            timescale_dsn: None,
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            queue_size: default_queue_size(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            register_maps_dir: default_register_maps_dir(),
            server: ServerSettings::default(),
            connection: ConnectionSettings::default(),
            identification: IdentificationSettings::default(),
            polling: PollingSettings::default(),
            control_plane: ControlPlaneSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Defaults with environment-variable overrides applied.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env();
        settings
    }

    /// Apply environment-variable overrides on top of the current values.
    /// Unparsable values are ignored; absent variables leave the field as-is.
    pub fn apply_env(&mut self) {
        env_override("DEVICE_SERVER_HOST", &mut self.server.host);
        env_override("DEVICE_SERVER_PORT", &mut self.server.port);
        env_override("DEVICE_SERVER_MAX_CONNECTIONS", &mut self.server.max_connections);
        env_override("DEVICE_SERVER_BACKLOG", &mut self.server.backlog);

        env_override("DEVICE_CONNECTION_READ_TIMEOUT", &mut self.connection.read_timeout);
        env_override("DEVICE_CONNECTION_WRITE_TIMEOUT", &mut self.connection.write_timeout);
        env_override(
            "DEVICE_CONNECTION_STABILIZATION_DELAY",
            &mut self.connection.stabilization_delay,
        );
        env_override("DEVICE_CONNECTION_CLOSE_TIMEOUT", &mut self.connection.close_timeout);

        env_override("DEVICE_IDENTIFICATION_TIMEOUT", &mut self.identification.timeout);
        env_override("DEVICE_IDENTIFICATION_MAX_RETRIES", &mut self.identification.max_retries);
        env_override("DEVICE_IDENTIFICATION_RETRY_DELAY", &mut self.identification.retry_delay);

        env_override("DEVICE_POLLING_DEFAULT_INTERVAL", &mut self.polling.default_interval);
        env_override("DEVICE_POLLING_MIN_INTERVAL", &mut self.polling.min_interval);
        env_override("DEVICE_POLLING_MAX_INTERVAL", &mut self.polling.max_interval);
        env_override("DEVICE_POLLING_FAILURE_BACKOFF", &mut self.polling.failure_backoff);
        env_override(
            "DEVICE_POLLING_MAX_CONSECUTIVE_FAILURES",
            &mut self.polling.max_consecutive_failures,
        );
        env_override("DEVICE_POLLING_TIMEOUT", &mut self.polling.timeout);

        env_override("SYSTEM_A_BASE_URL", &mut self.control_plane.base_url);
        env_override_opt("SYSTEM_A_API_KEY", &mut self.control_plane.api_key);
        env_override("SYSTEM_A_TIMEOUT", &mut self.control_plane.timeout);
        env_override("SYSTEM_A_MAX_RETRIES", &mut self.control_plane.max_retries);
        env_override("SYSTEM_A_RETRY_DELAY", &mut self.control_plane.retry_delay);

        env_override_opt("DEVICE_STORAGE_TIMESCALE_DSN", &mut self.storage.timescale_dsn);
        env_override("DEVICE_STORAGE_BATCH_SIZE", &mut self.storage.batch_size);
        env_override("DEVICE_STORAGE_FLUSH_INTERVAL", &mut self.storage.flush_interval);
        env_override("DEVICE_STORAGE_QUEUE_SIZE", &mut self.storage.queue_size);

        if let Ok(v) = std::env::var("DEVICE_SERVER_CONFIG_DIR") {
            self.config_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DEVICE_SERVER_REGISTER_MAPS_DIR") {
            self.register_maps_dir = PathBuf::from(v);
        }
    }

    /// Path to the main protocol definition file.
    pub fn protocols_file(&self) -> PathBuf {
        self.config_dir.join("protocols.yaml")
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection.write_timeout)
    }

    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_secs_f64(self.connection.stabilization_delay)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.polling.timeout)
    }

    /// Validate cross-field constraints. Fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue("server.port cannot be 0".into()));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "server.max_connections cannot be 0".into(),
            ));
        }
        if self.polling.min_interval > self.polling.max_interval {
            return Err(ConfigError::InvalidValue(
                "polling.min_interval exceeds polling.max_interval".into(),
            ));
        }
        if self.storage.queue_size == 0 {
            return Err(ConfigError::InvalidValue(
                "storage.queue_size cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

fn env_override<T: std::str::FromStr>(name: &str, field: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(value) = raw.parse() {
            *field = value;
        }
    }
}

fn env_override_opt(name: &str, field: &mut Option<String>) {
    if let Ok(raw) = std::env::var(name) {
        if raw.is_empty() {
            *field = None;
        } else {
            *field = Some(raw);
        }
    }
}

/// Configuration error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
