// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Polling: one cooperative task per device collecting telemetry on a
//! failure-aware schedule, and the bounded-queue pipeline that validates,
//! screens and batches the samples for storage.

pub mod collector;
pub mod scheduler;
pub mod worker;

pub use collector::{TelemetryCollector, TelemetryProcessor};
pub use scheduler::{compute_interval, PollingEvent, PollingScheduler};
pub use worker::{
    AnomalyEvent, AnomalyKind, AnomalyThresholds, TelemetryRow, TelemetrySample, TelemetrySink,
    TelemetryWorker,
};
