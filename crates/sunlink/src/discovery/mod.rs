// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Auto-discovery: sweep a CIDR range for responsive TCP endpoints, then feed
//! each one to the prober. Reuses the identification engine; discovered
//! devices are deduplicated by serial number across runs.

pub mod result;
pub mod scanner;
pub mod service;

pub use result::{DiscoveredDevice, DiscoveryResult, ScanProgress, ScanStatus};
pub use scanner::{NetworkScanner, ScanConfig, ScanEndpoint};
pub use service::{DiscoveryService, ScanOptions};
