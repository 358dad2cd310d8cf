// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! TCP acceptor for data-logger connections.
//!
//! Binds the listener, enforces the connection cap, wraps each accepted
//! socket in a [`Session`] and hands it to the connection handler. The wire
//! protocol per connection is whatever the identified protocol dictates; the
//! acceptor itself does no framing.

use crate::config::ServerSettings;
use crate::session::{Session, SessionStats};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Callback invoked for each accepted session. Returns the task driving the
/// session lifecycle; the acceptor tracks it for shutdown.
pub type SessionHandler = Arc<dyn Fn(Arc<Session>) -> JoinHandle<()> + Send + Sync>;

/// TCP acceptor for data-logger sessions.
pub struct TcpAcceptor {
    settings: ServerSettings,
    handler: SessionHandler,
    sessions: Arc<parking_lot::Mutex<HashMap<Uuid, Arc<Session>>>>,
    tasks: Arc<parking_lot::Mutex<HashMap<Uuid, JoinHandle<()>>>>,
    shutdown: Arc<tokio::sync::Notify>,
    running: Arc<AtomicBool>,
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
}

impl TcpAcceptor {
    pub fn new(settings: ServerSettings, handler: SessionHandler) -> Self {
        Self {
            settings,
            handler,
            sessions: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            tasks: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            shutdown: Arc::new(tokio::sync::Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
            total_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Bind the listener and accept until [`TcpAcceptor::shutdown`] fires.
    /// A bind failure is fatal.
    pub async fn run(&self) -> Result<(), AcceptorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AcceptorError::AlreadyRunning);
        }

        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AcceptorError::Bind(addr.clone(), e.to_string()))?;

        let local = listener
            .local_addr()
            .map_err(|e| AcceptorError::Bind(addr, e.to_string()))?;
        info!("Device server listening on {}", local);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            self.accept_one(stream, peer_addr).await;
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("Acceptor shutdown signal received");
                    break;
                }
            }
        }

        drop(listener);
        self.close_all(Duration::from_secs(10)).await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn accept_one(&self, mut stream: tokio::net::TcpStream, peer: std::net::SocketAddr) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        let active = self.sessions.lock().len();
        if active >= self.settings.max_connections {
            warn!(
                "Connection limit reached ({}), rejecting {}",
                self.settings.max_connections, peer
            );
            self.rejected_connections.fetch_add(1, Ordering::Relaxed);
            let _ = stream.shutdown().await;
            return;
        }

        let session = Arc::new(Session::new(stream, peer));
        let session_id = session.id();
        self.sessions.lock().insert(session_id, Arc::clone(&session));

        info!("New connection from {} (active: {})", peer, active + 1);

        let handle = (self.handler.as_ref())(Arc::clone(&session));

        // Wrap the lifecycle task so the indexes are dropped when it ends,
        // however it ends.
        let sessions = Arc::clone(&self.sessions);
        let tasks = Arc::clone(&self.tasks);
        let watcher = tokio::spawn(async move {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Session {} task panicked: {}", session_id, e);
                }
            }
            sessions.lock().remove(&session_id);
            tasks.lock().remove(&session_id);
            debug!("Session {} task finished", session_id);
        });
        self.tasks.lock().insert(session_id, watcher);
    }

    /// Stop accepting and close active sessions.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    async fn close_all(&self, timeout: Duration) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
        if !sessions.is_empty() {
            info!("Closing {} active sessions", sessions.len());
            let closes: Vec<JoinHandle<()>> = sessions
                .into_iter()
                .map(|session| tokio::spawn(async move { session.close().await }))
                .collect();
            let all_closed = async {
                for close in closes {
                    let _ = close.await;
                }
            };
            if tokio::time::timeout(timeout, all_closed).await.is_err() {
                warn!("Timeout waiting for sessions to close");
            }
        }

        // Abort any handler still wedged after its session closed.
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock();
            guard.drain().map(|(_, t)| t).collect()
        };
        for task in tasks {
            task.abort();
        }
        self.sessions.lock().clear();
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> AcceptorStats {
        let sessions = self.sessions.lock();
        AcceptorStats {
            running: self.is_running(),
            host: self.settings.host.clone(),
            port: self.settings.port,
            active_connections: sessions.len(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            max_connections: self.settings.max_connections,
            sessions: sessions.values().map(|s| s.stats()).collect(),
        }
    }
}

/// Acceptor statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptorStats {
    pub running: bool,
    pub host: String,
    pub port: u16,
    pub active_connections: usize,
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub max_connections: usize,
    pub sessions: Vec<SessionStats>,
}

/// Acceptor error types.
#[derive(Debug, thiserror::Error)]
pub enum AcceptorError {
    #[error("acceptor already running")]
    AlreadyRunning,
    #[error("failed to bind {0}: {1}")]
    Bind(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn idle_handler() -> SessionHandler {
        Arc::new(|session: Arc<Session>| {
            tokio::spawn(async move {
                // Park until the session is closed under us.
                while session.is_connected() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
        })
    }

    fn test_settings(port: u16, max_connections: usize) -> ServerSettings {
        ServerSettings {
            host: "127.0.0.1".to_string(),
            port,
            max_connections,
            backlog: 16,
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_accept_and_shutdown() {
        let port = free_port().await;
        let acceptor = Arc::new(TcpAcceptor::new(test_settings(port, 4), idle_handler()));

        let runner = {
            let acceptor = Arc::clone(&acceptor);
            tokio::spawn(async move { acceptor.run().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(acceptor.active_connections(), 1);
        assert_eq!(acceptor.stats().total_connections, 1);

        acceptor.shutdown();
        runner.await.unwrap().unwrap();
        assert_eq!(acceptor.active_connections(), 0);
        assert!(!acceptor.is_running());
    }

    #[tokio::test]
    async fn test_connection_cap_rejects() {
        let port = free_port().await;
        let acceptor = Arc::new(TcpAcceptor::new(test_settings(port, 1), idle_handler()));

        let runner = {
            let acceptor = Arc::clone(&acceptor);
            tokio::spawn(async move { acceptor.run().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let _first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Second connection is accepted then immediately closed.
        let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .expect("rejected socket should close promptly")
            .unwrap();
        assert_eq!(read, 0);

        let stats = acceptor.stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.rejected_connections, 1);
        assert_eq!(stats.total_connections, 2);

        acceptor.shutdown();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_error_is_fatal() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();
        let acceptor = TcpAcceptor::new(test_settings(port, 4), idle_handler());
        let err = acceptor.run().await.unwrap_err();
        assert!(matches!(err, AcceptorError::Bind(_, _)));
    }
}
