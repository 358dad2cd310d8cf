// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Per-connection session: exclusive owner of one accepted socket.
//!
//! A session lives from accept to close. All reads and writes are
//! deadline-bounded; the prober and the poller are never active on the same
//! session at the same time because the connection lifecycle is strictly
//! sequential, so a single async mutex around the stream serializes I/O
//! without contention in steady state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};
use uuid::Uuid;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connected,
    Identifying,
    Identified,
    Polling,
    Disconnected,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Identifying => "identifying",
            Self::Identified => "identified",
            Self::Polling => "polling",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

/// Socket plus read-ahead buffer. `read_until` may pull more bytes off the
/// wire than one line; the surplus stays here for the next read.
struct Io {
    stream: TcpStream,
    rbuf: Vec<u8>,
}

/// Late-bound identification fields.
#[derive(Debug, Default, Clone)]
struct SessionIdentity {
    device_id: Option<Uuid>,
    protocol_id: Option<String>,
    serial_number: Option<String>,
}

/// One accepted TCP connection.
pub struct Session {
    id: Uuid,
    remote: SocketAddr,
    io: tokio::sync::Mutex<Option<Io>>,
    state: parking_lot::Mutex<SessionState>,
    identity: parking_lot::Mutex<SessionIdentity>,
    connected_at: DateTime<Utc>,
    last_activity: parking_lot::Mutex<DateTime<Utc>>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    error_count: AtomicU64,
    closing: AtomicBool,
}

impl Session {
    pub fn new(stream: TcpStream, remote: SocketAddr) -> Self {
        let now = Utc::now();
        let session = Self {
            id: Uuid::new_v4(),
            remote,
            io: tokio::sync::Mutex::new(Some(Io {
                stream,
                rbuf: Vec::with_capacity(4096),
            })),
            state: parking_lot::Mutex::new(SessionState::Connected),
            identity: parking_lot::Mutex::new(SessionIdentity::default()),
            connected_at: now,
            last_activity: parking_lot::Mutex::new(now),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        };
        info!("Session {} established from {}", session.id, remote);
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn remote_ip(&self) -> String {
        self.remote.ip().to_string()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.port()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(
                "Session {} state: {} -> {}",
                self.id,
                current.as_str(),
                state.as_str()
            );
            *current = state;
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.closing.load(Ordering::SeqCst)
            && !matches!(
                self.state(),
                SessionState::Disconnected | SessionState::Error
            )
    }

    pub fn device_id(&self) -> Option<Uuid> {
        self.identity.lock().device_id
    }

    pub fn set_device_id(&self, device_id: Uuid) {
        self.identity.lock().device_id = Some(device_id);
    }

    pub fn protocol_id(&self) -> Option<String> {
        self.identity.lock().protocol_id.clone()
    }

    pub fn set_protocol_id(&self, protocol_id: impl Into<String>) {
        self.identity.lock().protocol_id = Some(protocol_id.into());
    }

    pub fn serial_number(&self) -> Option<String> {
        self.identity.lock().serial_number.clone()
    }

    pub fn set_serial_number(&self, serial: impl Into<String>) {
        self.identity.lock().serial_number = Some(serial.into());
    }

    fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    /// Read exactly `n` bytes, consuming buffered read-ahead first.
    pub async fn read_exact(&self, n: usize, timeout: Duration) -> Result<Vec<u8>, SessionError> {
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or(SessionError::Closed)?;

        let result = tokio::time::timeout(timeout, async {
            let mut out = Vec::with_capacity(n);
            let take = n.min(io.rbuf.len());
            out.extend(io.rbuf.drain(..take));

            while out.len() < n {
                let mut chunk = [0u8; 1024];
                let want = (n - out.len()).min(chunk.len());
                let read = io.stream.read(&mut chunk[..want]).await?;
                if read == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed while reading",
                    ));
                }
                out.extend_from_slice(&chunk[..read]);
            }
            Ok(out)
        })
        .await;

        match result {
            Ok(Ok(data)) => {
                self.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
                self.touch();
                Ok(data)
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.set_state(SessionState::Disconnected);
                Err(SessionError::Closed)
            }
            Ok(Err(e)) => Err(SessionError::Io(e.to_string())),
            Err(_) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Read until `separator`, returning the bytes including the separator.
    /// Bytes beyond the separator stay buffered for the next read.
    pub async fn read_until(
        &self,
        separator: &[u8],
        timeout: Duration,
        max_bytes: usize,
    ) -> Result<Vec<u8>, SessionError> {
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or(SessionError::Closed)?;

        let result = tokio::time::timeout(timeout, async {
            loop {
                if let Some(pos) = find_subsequence(&io.rbuf, separator) {
                    let end = pos + separator.len();
                    let line: Vec<u8> = io.rbuf.drain(..end).collect();
                    return Ok(line);
                }
                if io.rbuf.len() > max_bytes {
                    return Err(ReadUntilError::TooLarge(io.rbuf.len()));
                }

                let mut chunk = [0u8; 1024];
                let read = io
                    .stream
                    .read(&mut chunk)
                    .await
                    .map_err(ReadUntilError::Io)?;
                if read == 0 {
                    return Err(ReadUntilError::Eof);
                }
                io.rbuf.extend_from_slice(&chunk[..read]);
            }
        })
        .await;

        match result {
            Ok(Ok(line)) => {
                self.bytes_in.fetch_add(line.len() as u64, Ordering::Relaxed);
                self.touch();
                Ok(line)
            }
            Ok(Err(ReadUntilError::Eof)) => {
                self.set_state(SessionState::Disconnected);
                Err(SessionError::Closed)
            }
            Ok(Err(ReadUntilError::TooLarge(n))) => Err(SessionError::TooLarge(n)),
            Ok(Err(ReadUntilError::Io(e))) => Err(SessionError::Io(e.to_string())),
            Err(_) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Read whatever is available within `timeout`, up to `max_bytes`.
    /// Returns an empty buffer when nothing arrives.
    pub async fn read_available(
        &self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, SessionError> {
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or(SessionError::Closed)?;

        if !io.rbuf.is_empty() {
            let take = io.rbuf.len().min(max_bytes);
            let data: Vec<u8> = io.rbuf.drain(..take).collect();
            self.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
            self.touch();
            return Ok(data);
        }

        let mut chunk = vec![0u8; max_bytes];
        match tokio::time::timeout(timeout, io.stream.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                self.set_state(SessionState::Disconnected);
                Err(SessionError::Closed)
            }
            Ok(Ok(read)) => {
                chunk.truncate(read);
                self.bytes_in.fetch_add(read as u64, Ordering::Relaxed);
                self.touch();
                Ok(chunk)
            }
            Ok(Err(e)) => Err(SessionError::Io(e.to_string())),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Write all of `data` and flush.
    pub async fn write(&self, data: &[u8], timeout: Duration) -> Result<(), SessionError> {
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or(SessionError::Closed)?;

        let result = tokio::time::timeout(timeout, async {
            io.stream.write_all(data).await?;
            io.stream.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.bytes_out.fetch_add(data.len() as u64, Ordering::Relaxed);
                self.touch();
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_state(SessionState::Disconnected);
                Err(SessionError::Io(e.to_string()))
            }
            Err(_) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Close the session. Idempotent; later I/O fails with `Closed`.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            "Closing session {} (device={:?}, protocol={:?})",
            self.id,
            self.device_id(),
            self.protocol_id()
        );
        self.set_state(SessionState::Disconnected);

        let io = self.io.lock().await.take();
        if let Some(mut io) = io {
            let _ = tokio::time::timeout(Duration::from_secs(5), io.stream.shutdown()).await;
        }
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> SessionStats {
        let now = Utc::now();
        let last_activity = *self.last_activity.lock();
        let identity = self.identity.lock().clone();
        SessionStats {
            session_id: self.id,
            remote_addr: self.remote.to_string(),
            state: self.state(),
            device_id: identity.device_id,
            protocol_id: identity.protocol_id,
            serial_number: identity.serial_number,
            connected_at: self.connected_at,
            uptime_seconds: (now - self.connected_at).num_milliseconds() as f64 / 1000.0,
            idle_seconds: (now - last_activity).num_milliseconds() as f64 / 1000.0,
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

enum ReadUntilError {
    Eof,
    TooLarge(usize),
    Io(std::io::Error),
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Session statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub remote_addr: String,
    pub state: SessionState,
    pub device_id: Option<Uuid>,
    pub protocol_id: Option<String>,
    pub serial_number: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub idle_seconds: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub error_count: u64,
}

/// Session error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("operation timed out")]
    Timeout,
    #[error("response too large: {0} bytes")]
    TooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Session, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();
        (Session::new(server_side, peer), client)
    }

    #[tokio::test]
    async fn test_read_exact_and_counters() {
        let (session, mut client) = pair().await;
        client.write_all(b"hello world").await.unwrap();

        let data = session.read_exact(5, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&data, b"hello");
        assert_eq!(session.stats().bytes_in, 5);
    }

    #[tokio::test]
    async fn test_read_until_keeps_surplus() {
        let (session, mut client) = pair().await;
        client.write_all(b"line one\r\nline two\r\n").await.unwrap();

        let first = session
            .read_until(b"\r\n", Duration::from_secs(1), 4096)
            .await
            .unwrap();
        assert_eq!(&first, b"line one\r\n");

        // The second line was already buffered; no further socket data needed.
        let second = session
            .read_until(b"\r\n", Duration::from_secs(1), 4096)
            .await
            .unwrap();
        assert_eq!(&second, b"line two\r\n");
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (session, _client) = pair().await;
        let err = session
            .read_exact(1, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
        assert_eq!(session.stats().error_count, 1);
    }

    #[tokio::test]
    async fn test_peer_close_is_closed_error() {
        let (session, client) = pair().await;
        drop(client);
        let err = session
            .read_exact(1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Closed));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _client) = pair().await;
        session.close().await;
        session.close().await;
        assert!(!session.is_connected());
        let err = session.write(b"x", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }

    #[tokio::test]
    async fn test_read_available_empty_on_silence() {
        let (session, _client) = pair().await;
        let data = session
            .read_available(64, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (session, _client) = pair().await;
        assert_eq!(session.state(), SessionState::Connected);
        session.set_state(SessionState::Identifying);
        session.set_state(SessionState::Identified);
        assert!(session.is_connected());
        session.set_state(SessionState::Disconnected);
        assert!(!session.is_connected());
    }
}
