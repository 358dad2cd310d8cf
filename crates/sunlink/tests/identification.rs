// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! End-to-end identification scenarios against in-process simulators:
//! probe selection, serial extraction, and duplicate-serial resolution.

mod support;

use std::time::Duration;
use support::simulators::{BatterySimulator, ModbusSimulator};
use support::TestServer;
use sunlink::device::DeviceStatus;
use sunlink::session::Session;
use tokio::net::TcpStream;

async fn session_to(port: u16) -> Session {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let peer = stream.peer_addr().unwrap();
    Session::new(stream, peer)
}

/// S1: a simulated Powdrive inverter reaches polling, its serial and type
/// are registered, and a numeric telemetry sample lands in the store.
#[tokio::test]
async fn test_inverter_connects_identifies_and_polls() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let simulator = ModbusSimulator::spawn().await;
    simulator.configure_powdrive("PD12K00001");
    let _logger = simulator.dial(server.port).await;

    server
        .wait_for(
            || {
                server
                    .device_manager
                    .get_by_serial("PD12K00001")
                    .map(|r| r.status == DeviceStatus::Online)
                    .unwrap_or(false)
            },
            Duration::from_secs(2),
            "device identification",
        )
        .await;

    let record = server.device_manager.get_by_serial("PD12K00001").unwrap();
    assert_eq!(record.protocol_id, "powdrive");
    assert_eq!(record.device_type, "inverter");
    assert!(!record.fallback_serial);
    assert!(server.scheduler.is_polling(record.device_id) || record.total_polls > 0);

    // Within one poll interval a sample reaches the sink with at least one
    // numeric metric.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    loop {
        let rows = server.sink.rows.lock().await;
        if let Some(row) = rows.iter().find(|r| r.serial_number == "PD12K00001") {
            assert_eq!(row.protocol_id, "powdrive");
            assert_eq!(row.device_type, "inverter");
            assert_eq!(
                row.data.get("grid_voltage").and_then(|v| v.as_f64()),
                Some(230.5)
            );
            break;
        }
        drop(rows);
        if tokio::time::Instant::now() >= deadline {
            panic!("no telemetry row for the inverter");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    server.stop().await;
}

/// S2: a second connection claiming the same serial replaces the first; the
/// device id is preserved and the old session is closed before the newcomer
/// polls.
#[tokio::test]
async fn test_duplicate_serial_newer_session_wins() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let simulator = ModbusSimulator::spawn().await;
    simulator.configure_powdrive("PD12K00001");

    let _first = simulator.dial(server.port).await;
    server
        .wait_for(
            || server.device_manager.get_by_serial("PD12K00001").is_some(),
            Duration::from_secs(2),
            "first identification",
        )
        .await;
    let first_record = server.device_manager.get_by_serial("PD12K00001").unwrap();
    let first_session_id = first_record.session_id;

    let _second = simulator.dial(server.port).await;
    server
        .wait_for(
            || {
                server
                    .device_manager
                    .get_by_serial("PD12K00001")
                    .map(|r| r.session_id != first_session_id)
                    .unwrap_or(false)
            },
            Duration::from_secs(3),
            "session replacement",
        )
        .await;

    let record = server.device_manager.get_by_serial("PD12K00001").unwrap();
    assert_eq!(record.device_id, first_record.device_id);
    assert_eq!(record.status, DeviceStatus::Online);
    assert_eq!(server.device_manager.device_count(), 1);
    // The old session no longer maps to the device.
    assert!(server.device_manager.get_by_session(first_session_id).is_none());

    server.stop().await;
}

/// A command-protocol battery is identified after the Modbus candidates
/// miss, with its serial parsed from the info response.
#[tokio::test]
async fn test_battery_identified_via_command_probe() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let battery = BatterySimulator::spawn("PYTES-0042").await;
    let _logger = battery.dial(server.port).await;

    server
        .wait_for(
            || server.device_manager.get_by_serial("PYTES-0042").is_some(),
            Duration::from_secs(8),
            "battery identification",
        )
        .await;

    let record = server.device_manager.get_by_serial("PYTES-0042").unwrap();
    assert_eq!(record.protocol_id, "pytes_battery");
    assert_eq!(record.device_type, "battery");
    assert!(!record.fallback_serial);

    server.stop().await;
}

/// Property 2: with a peer that answers exactly one protocol, that protocol
/// is selected regardless of its position in the priority order.
#[tokio::test]
async fn test_identification_determinism() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    // Answers only the Acme meter probe (priority 20, after powdrive).
    let simulator = ModbusSimulator::spawn().await;
    simulator.configure_acme_meter("MTR900001");

    let session = session_to(simulator.port).await;
    let identified = server.prober.identify(&session).await.unwrap();
    assert_eq!(identified.protocol_id, "acme_meter");
    assert_eq!(identified.serial_number, "MTR900001");
    session.close().await;

    server.stop().await;
}

/// Property 3: a peer satisfying two protocols goes to the lower priority
/// value.
#[tokio::test]
async fn test_priority_preference() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    // Satisfies both the powdrive (priority 10) and acme_meter (priority 20)
    // identification rules.
    let simulator = ModbusSimulator::spawn().await;
    simulator.configure_powdrive("PD12K00002");
    simulator.configure_acme_meter("PD12K00002");

    let session = session_to(simulator.port).await;
    let identified = server.prober.identify(&session).await.unwrap();
    assert_eq!(identified.protocol_id, "powdrive");
    session.close().await;

    server.stop().await;
}

/// A Modbus exception is a definitive miss, and with every candidate
/// refusing, identification fails and the session is closed.
#[tokio::test]
async fn test_all_protocols_refused_closes_session() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    let simulator = ModbusSimulator::spawn().await;
    simulator.set_exception(true);

    let session = session_to(simulator.port).await;
    assert!(server.prober.identify(&session).await.is_none());
    session.close().await;

    server.stop().await;
}

/// Serial extraction failure degrades to the synthesized
/// `<protocol>_<ip>_<port>` serial instead of failing identification.
#[tokio::test]
async fn test_fallback_serial_synthesized() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path()).await;

    // Identification register answers, serial registers read all zeros, so
    // ASCII decoding yields an empty string.
    let simulator = ModbusSimulator::spawn().await;
    simulator.set_register(0, 3);

    let session = session_to(simulator.port).await;
    let remote = session.remote_addr();
    let identified = server.prober.identify(&session).await.unwrap();
    assert!(identified.fallback_serial);
    assert_eq!(
        identified.serial_number,
        format!("powdrive_{}_{}", remote.ip(), remote.port())
    );
    session.close().await;

    server.stop().await;
}
