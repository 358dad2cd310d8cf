// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Scriptable device simulators speaking the real wire protocols over
//! loopback sockets: a Modbus-TCP data logger and a Pytes-style text-command
//! battery. Fault injection covers silence (timeouts) and in-band Modbus
//! exceptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sunlink::polling::{TelemetryRow, TelemetrySink};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Telemetry sink that records every delivered row.
pub struct RecordingSink {
    pub rows: tokio::sync::Mutex<Vec<TelemetryRow>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub async fn row_count(&self) -> usize {
        self.rows.lock().await.len()
    }
}

impl TelemetrySink for RecordingSink {
    async fn write_batch(&self, batch: Vec<TelemetryRow>) -> Result<(), String> {
        self.rows.lock().await.extend(batch);
        Ok(())
    }
}

/// A simulated Modbus-TCP device behind a loopback listener. Holds a sparse
/// register bank; every connection is served concurrently.
pub struct ModbusSimulator {
    pub port: u16,
    registers: Arc<parking_lot::RwLock<HashMap<u16, u16>>>,
    silent: Arc<AtomicBool>,
    exception: Arc<AtomicBool>,
}

impl ModbusSimulator {
    /// Listen on a loopback port (discovery-style: the server dials us).
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let registers: Arc<parking_lot::RwLock<HashMap<u16, u16>>> =
            Arc::new(parking_lot::RwLock::new(HashMap::new()));
        let silent = Arc::new(AtomicBool::new(false));
        let exception = Arc::new(AtomicBool::new(false));

        {
            let registers = Arc::clone(&registers);
            let silent = Arc::clone(&silent);
            let exception = Arc::clone(&exception);
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(_) => break,
                    };
                    tokio::spawn(serve_modbus(
                        stream,
                        Arc::clone(&registers),
                        Arc::clone(&silent),
                        Arc::clone(&exception),
                    ));
                }
            });
        }

        Self {
            port,
            registers,
            silent,
            exception,
        }
    }

    /// Dial a device server and serve the Modbus protocol on that stream,
    /// behaving like a field data logger opening its persistent session.
    pub async fn dial(&self, server_port: u16) -> tokio::task::JoinHandle<()> {
        let stream = TcpStream::connect(("127.0.0.1", server_port))
            .await
            .unwrap();
        tokio::spawn(serve_modbus(
            stream,
            Arc::clone(&self.registers),
            Arc::clone(&self.silent),
            Arc::clone(&self.exception),
        ))
    }

    pub fn set_register(&self, addr: u16, value: u16) {
        self.registers.write().insert(addr, value);
    }

    /// Pack an ASCII string into consecutive registers starting at `addr`.
    pub fn set_ascii(&self, addr: u16, text: &str, words: u16) {
        let mut bank = self.registers.write();
        let bytes = text.as_bytes();
        for i in 0..words {
            let hi = bytes.get(i as usize * 2).copied().unwrap_or(0);
            let lo = bytes.get(i as usize * 2 + 1).copied().unwrap_or(0);
            bank.insert(addr + i, (u16::from(hi) << 8) | u16::from(lo));
        }
    }

    /// Stop answering (requests are swallowed, clients time out).
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Answer every read with an illegal-data-address exception.
    pub fn set_exception(&self, exception: bool) {
        self.exception.store(exception, Ordering::SeqCst);
    }

    /// Configure the standard Powdrive identity used by the fixtures:
    /// identification register 0 = 3, ASCII serial at registers 3..8.
    pub fn configure_powdrive(&self, serial: &str) {
        self.set_register(0, 3);
        self.set_ascii(3, serial, 5);
        self.set_register(10, 2305); // grid_voltage, scaled to 230.5 V
        self.set_register(11, 4200); // pv_power
        self.set_register(12, 1); // inverter_status
    }

    /// Configure the Acme meter identity: identification register 100 = 7,
    /// ASCII serial at registers 103..108.
    pub fn configure_acme_meter(&self, serial: &str) {
        self.set_register(100, 7);
        self.set_ascii(103, serial, 5);
    }
}

async fn serve_modbus(
    mut stream: TcpStream,
    registers: Arc<parking_lot::RwLock<HashMap<u16, u16>>>,
    silent: Arc<AtomicBool>,
    exception: Arc<AtomicBool>,
) {
    let mut request = [0u8; 12];
    loop {
        if stream.read_exact(&mut request).await.is_err() {
            return;
        }
        if silent.load(Ordering::SeqCst) {
            // Swallow the request; the client's read deadline fires.
            continue;
        }

        let transaction_id = [request[0], request[1]];
        let unit_id = request[6];
        let function = request[7];
        let addr = u16::from_be_bytes([request[8], request[9]]);
        let count = u16::from_be_bytes([request[10], request[11]]);

        let response = if function != 0x03 || exception.load(Ordering::SeqCst) {
            // Exception: function | 0x80, code 2 (illegal data address).
            let mut frame = Vec::with_capacity(9);
            frame.extend_from_slice(&transaction_id);
            frame.extend_from_slice(&[0, 0]);
            frame.extend_from_slice(&3u16.to_be_bytes());
            frame.push(unit_id);
            frame.push(function | 0x80);
            frame.push(0x02);
            frame
        } else {
            let bank = registers.read();
            let byte_count = (count as usize) * 2;
            let mut frame = Vec::with_capacity(9 + byte_count);
            frame.extend_from_slice(&transaction_id);
            frame.extend_from_slice(&[0, 0]);
            frame.extend_from_slice(&((byte_count + 3) as u16).to_be_bytes());
            frame.push(unit_id);
            frame.push(0x03);
            frame.push(byte_count as u8);
            for i in 0..count {
                let value = bank.get(&(addr + i)).copied().unwrap_or(0);
                frame.extend_from_slice(&value.to_be_bytes());
            }
            frame
        };

        if stream.write_all(&response).await.is_err() {
            return;
        }
    }
}

/// A simulated Pytes-style battery speaking line commands.
pub struct BatterySimulator {
    pub port: u16,
    barcode: String,
}

impl BatterySimulator {
    /// Listen on a loopback port (discovery-style).
    pub async fn spawn(barcode: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let barcode = barcode.to_string();

        {
            let barcode = barcode.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(_) => break,
                    };
                    tokio::spawn(serve_battery(stream, barcode.clone()));
                }
            });
        }

        Self { port, barcode }
    }

    /// Dial a device server like a logger-bridged battery would.
    pub async fn dial(&self, server_port: u16) -> tokio::task::JoinHandle<()> {
        let stream = TcpStream::connect(("127.0.0.1", server_port))
            .await
            .unwrap();
        tokio::spawn(serve_battery(stream, self.barcode.clone()))
    }
}

async fn serve_battery(mut stream: TcpStream, barcode: String) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let read = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(read) => read,
        };
        buffer.extend_from_slice(&chunk[..read]);

        while let Some(pos) = buffer.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = buffer.drain(..pos + 2).collect();
            let command = String::from_utf8_lossy(&line).trim().to_string();

            // Probe traffic from other protocols may precede the first real
            // command on the same connection; match on the line tail the way
            // tolerant firmware does.
            let response = if command.ends_with("info") {
                format!(
                    "Device address : 1\r\nManufacturer : PYTES\r\nDevice name : E-BOX-48100R\r\nBarcode : {}\r\n>\r\n",
                    barcode
                )
            } else if command.ends_with("pwr") {
                "Power 1 Voltage 49.52 Current 3.10 Temp 23.5\r\n>\r\n".to_string()
            } else if command.ends_with("bat") {
                "Battery 1 48520 3100 23500 95%\r\n>\r\n".to_string()
            } else {
                ">\r\n".to_string()
            };
            if stream.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}
