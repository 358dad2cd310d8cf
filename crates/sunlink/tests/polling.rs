// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! End-to-end polling behavior: failure accumulation, the offline
//! transition, and graceful shutdown.

mod support;

use std::time::Duration;
use support::simulators::ModbusSimulator;
use support::TestServer;
use sunlink::device::DeviceStatus;

/// S3: consecutive poll timeouts push the device offline and terminate its
/// polling task.
#[tokio::test]
async fn test_poll_failures_mark_device_offline() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let simulator = ModbusSimulator::spawn().await;
    simulator.configure_powdrive("PD12K00003");
    let _logger = simulator.dial(server.port).await;

    server
        .wait_for(
            || server.device_manager.get_by_serial("PD12K00003").is_some(),
            Duration::from_secs(2),
            "device identification",
        )
        .await;
    let device_id = server
        .device_manager
        .get_by_serial("PD12K00003")
        .unwrap()
        .device_id;

    // Device stops answering; polls now time out.
    simulator.set_silent(true);

    server
        .wait_for(
            || {
                server
                    .device_manager
                    .get(device_id)
                    .map(|r| r.status == DeviceStatus::Offline)
                    .unwrap_or(false)
            },
            Duration::from_secs(15),
            "offline transition",
        )
        .await;

    let record = server.device_manager.get(device_id).unwrap();
    assert!(record.consecutive_failures >= server.settings.polling.max_consecutive_failures);
    assert!(record.failed_polls >= u64::from(record.consecutive_failures));

    // The polling task winds down after the offline transition.
    server
        .wait_for(
            || !server.scheduler.is_polling(device_id),
            Duration::from_secs(2),
            "polling task termination",
        )
        .await;

    server.stop().await;
}

/// Interval updates are clamped to the configured bounds and visible on the
/// device record.
#[tokio::test]
async fn test_update_poll_interval_clamped() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let simulator = ModbusSimulator::spawn().await;
    simulator.configure_powdrive("PD12K00004");
    let _logger = simulator.dial(server.port).await;

    server
        .wait_for(
            || server.device_manager.get_by_serial("PD12K00004").is_some(),
            Duration::from_secs(2),
            "device identification",
        )
        .await;
    let device_id = server
        .device_manager
        .get_by_serial("PD12K00004")
        .unwrap()
        .device_id;

    // Above the maximum: clamped down.
    assert!(server.scheduler.update_poll_interval(device_id, 9999));
    assert_eq!(
        server.device_manager.get(device_id).unwrap().poll_interval,
        server.settings.polling.max_interval
    );

    // Unknown device: rejected.
    assert!(!server.scheduler.update_poll_interval(uuid::Uuid::new_v4(), 10));

    server.stop().await;
}

/// Property 8: after stop() there is no listener, no polling task and no
/// session left.
#[tokio::test]
async fn test_graceful_shutdown_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;
    let port = server.port;

    let simulator = ModbusSimulator::spawn().await;
    simulator.configure_powdrive("PD12K00005");
    let _logger = simulator.dial(server.port).await;

    server
        .wait_for(
            || server.device_manager.get_by_serial("PD12K00005").is_some(),
            Duration::from_secs(2),
            "device identification",
        )
        .await;
    server
        .wait_for(
            || {
                server
                    .device_manager
                    .get_by_serial("PD12K00005")
                    .map(|r| r.successful_polls > 0)
                    .unwrap_or(false)
            },
            Duration::from_secs(4),
            "first successful poll",
        )
        .await;
    // Let the event pump hand the sample to the worker before stopping.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let device_id = server
        .device_manager
        .get_by_serial("PD12K00005")
        .unwrap()
        .device_id;
    let device_manager = std::sync::Arc::clone(&server.device_manager);
    let scheduler = std::sync::Arc::clone(&server.scheduler);
    let sink = std::sync::Arc::clone(&server.sink);

    server.stop().await;

    assert_eq!(device_manager.device_count(), 0);
    assert!(!scheduler.is_polling(device_id));
    // The port is free again.
    let rebind = tokio::net::TcpListener::bind(("127.0.0.1", port)).await;
    assert!(rebind.is_ok());
    // Nothing accepted before shutdown was lost: the sink saw every flushed
    // row and the worker queue was drained by stop().
    assert!(sink.row_count().await > 0);
}
