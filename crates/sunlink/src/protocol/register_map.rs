// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Register maps: JSON sidecars describing the named registers of one device
//! family, plus the word-level decoding the pollers execute.
//!
//! A missing map is non-fatal: the device is identifiable but yields empty
//! telemetry until the sidecar ships.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Register space a descriptor addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    Holding,
    Input,
    /// Anything else in the sidecar (coils, internal bookkeeping rows);
    /// skipped during polling.
    #[serde(other)]
    Other,
}

impl Default for RegisterKind {
    fn default() -> Self {
        Self::Holding
    }
}

/// Read/write capability of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterAccess {
    #[serde(rename = "RO")]
    ReadOnly,
    #[serde(rename = "RW")]
    ReadWrite,
    #[serde(rename = "WO")]
    WriteOnly,
}

impl Default for RegisterAccess {
    fn default() -> Self {
        Self::ReadOnly
    }
}

/// One register descriptor from a JSON sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    pub id: String,
    pub addr: u16,
    #[serde(default = "default_size")]
    pub size: u16,
    #[serde(default)]
    pub kind: RegisterKind,
    #[serde(rename = "type", default)]
    pub value_type: String,
    #[serde(rename = "rw", default)]
    pub access: RegisterAccess,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub encoder: Option<String>,
}

fn default_size() -> u16 {
    1
}

impl RegisterDescriptor {
    /// Whether the poller should read this register.
    pub fn is_readable(&self) -> bool {
        self.access != RegisterAccess::WriteOnly
            && matches!(self.kind, RegisterKind::Holding | RegisterKind::Input)
    }

    /// Decode raw register words into a telemetry value.
    ///
    /// - `ascii` encoder: high byte then low byte per word, truncated at the
    ///   first NUL;
    /// - `s16`: sign-extend at 0x8000;
    /// - `s32`: big-endian word pair, sign-extend at bit 31;
    /// - `u16`/`u32`: straight big-endian compose;
    /// - `scale` multiplies numeric results.
    pub fn decode(&self, words: &[u16]) -> RegisterValue {
        if self.encoder.as_deref() == Some("ascii") || self.value_type == "ascii" {
            return RegisterValue::Text(decode_ascii(words, self.size as usize));
        }

        let value = match self.size {
            1 => {
                let raw = words.first().copied().unwrap_or(0);
                if self.value_type.contains("s16") && raw >= 0x8000 {
                    f64::from(raw as i16)
                } else {
                    f64::from(raw)
                }
            }
            2 => {
                if words.len() < 2 {
                    0.0
                } else {
                    let raw = (u32::from(words[0]) << 16) | u32::from(words[1]);
                    if self.value_type.contains("s32") {
                        f64::from(raw as i32)
                    } else {
                        f64::from(raw)
                    }
                }
            }
            _ => 0.0,
        };

        let value = match self.scale {
            Some(scale) => value * scale,
            None => value,
        };
        RegisterValue::Number(value)
    }
}

/// Decoded telemetry value for one register.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    Number(f64),
    Text(String),
}

impl RegisterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

impl From<RegisterValue> for serde_json::Value {
    fn from(value: RegisterValue) -> Self {
        match value {
            RegisterValue::Number(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            RegisterValue::Text(s) => serde_json::Value::String(s),
        }
    }
}

/// High byte then low byte per word, NUL-truncated, whitespace-trimmed.
pub fn decode_ascii(words: &[u16], size: usize) -> String {
    let mut buf = Vec::with_capacity(size * 2);
    for word in words.iter().take(size) {
        buf.push((word >> 8) as u8);
        buf.push((word & 0xFF) as u8);
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).trim().to_string()
}

/// Pack an ASCII string into register words (high byte first). Test and
/// simulator helper; real devices are the usual producer.
pub fn encode_ascii(text: &str, size: usize) -> Vec<u16> {
    let bytes = text.as_bytes();
    let mut words = Vec::with_capacity(size);
    for i in 0..size {
        let hi = bytes.get(i * 2).copied().unwrap_or(0);
        let lo = bytes.get(i * 2 + 1).copied().unwrap_or(0);
        words.push((u16::from(hi) << 8) | u16::from(lo));
    }
    words
}

/// Lazily loads and caches register maps by sidecar file name.
#[derive(Debug)]
pub struct RegisterMapCache {
    base_dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<Vec<RegisterDescriptor>>>>,
}

impl RegisterMapCache {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load a register map, caching on first use. A missing or malformed map
    /// logs a warning and resolves to an empty map.
    pub fn load(&self, file: &str) -> Arc<Vec<RegisterDescriptor>> {
        if let Some(map) = self.cache.lock().get(file) {
            return Arc::clone(map);
        }

        let map = Arc::new(self.read_map(&self.base_dir.join(file), file));
        self.cache.lock().insert(file.to_string(), Arc::clone(&map));
        map
    }

    fn read_map(&self, path: &Path, file: &str) -> Vec<RegisterDescriptor> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                warn!("Register map not found: {}", path.display());
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<RegisterDescriptor>>(&content) {
            Ok(map) => {
                debug!("Loaded register map: {} ({} registers)", file, map.len());
                map
            }
            Err(e) => {
                warn!("Error parsing register map {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}
