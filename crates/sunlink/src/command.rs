// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Control-plane command queue consumer.
//!
//! The platform queues commands (setpoint changes, reboots) against devices;
//! this worker fetches pending entries in batches, dispatches them through an
//! executor, and reports the terminal status back to the store. The store and
//! executor are seams so the platform API and the device path stay out of
//! this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of one queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// One command from the control-plane queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub id: Uuid,
    pub device_id: Uuid,
    pub site_id: Option<Uuid>,
    pub command_type: String,
    #[serde(default)]
    pub command_params: serde_json::Value,
    pub status: CommandStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

/// Persistence seam for the command queue.
pub trait CommandStore: Send + Sync + 'static {
    fn fetch_pending(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<DeviceCommand>, String>> + Send;
    fn mark_sent(&self, command_id: Uuid) -> impl Future<Output = Result<(), String>> + Send;
    fn mark_completed(
        &self,
        command_id: Uuid,
        result: serde_json::Value,
    ) -> impl Future<Output = Result<(), String>> + Send;
    fn mark_failed(
        &self,
        command_id: Uuid,
        error: String,
    ) -> impl Future<Output = Result<(), String>> + Send;
    /// Expire commands past their deadline; returns how many were expired.
    fn expire_stale(&self) -> impl Future<Output = Result<u64, String>> + Send;
}

/// Dispatch seam: executes one command against a connected device.
pub trait CommandExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        device_id: Uuid,
        command_type: &str,
        params: &serde_json::Value,
    ) -> impl Future<Output = Result<serde_json::Value, String>> + Send;
}

/// Background worker draining the command queue.
pub struct CommandWorker<S: CommandStore, E: CommandExecutor> {
    store: Arc<S>,
    executor: Arc<E>,
    poll_interval: Duration,
    batch_size: usize,

    processed: AtomicU64,
    failed: AtomicU64,

    shutdown_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<S: CommandStore, E: CommandExecutor> CommandWorker<S, E> {
    pub fn new(store: Arc<S>, executor: Arc<E>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            executor,
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            shutdown_tx,
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Start the worker loop.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock();
        if slot.is_some() {
            warn!("Command worker already running");
            return;
        }
        info!("Starting command worker");
        let worker = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { worker.run_loop().await }));
    }

    /// Stop the worker.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            info!("Stopping command worker");
            let _ = self.shutdown_tx.send(true);
            let _ = task.await;
            info!(
                "Command worker stopped (processed: {}, failed: {})",
                self.processed.load(Ordering::Relaxed),
                self.failed.load(Ordering::Relaxed)
            );
        }
    }

    async fn run_loop(self: Arc<Self>) {
        debug!("Command worker loop started");
        let mut shutdown = self.shutdown_tx.subscribe();

        self.expire_stale().await;
        let mut cycles: u64 = 0;

        loop {
            self.process_pending().await;

            // Sweep expired commands once a minute at the default cadence.
            cycles += 1;
            if cycles % 60 == 0 {
                self.expire_stale().await;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Command worker loop ended");
    }

    async fn process_pending(&self) {
        let commands = match self.store.fetch_pending(self.batch_size).await {
            Ok(commands) => commands,
            Err(e) => {
                error!("Error fetching pending commands: {}", e);
                return;
            }
        };

        for command in commands {
            self.execute_one(command).await;
        }
    }

    async fn execute_one(&self, command: DeviceCommand) {
        debug!(
            "Executing command {} ({}) for device {}",
            command.id, command.command_type, command.device_id
        );

        if let Err(e) = self.store.mark_sent(command.id).await {
            error!("Failed to mark command {} as sent: {}", command.id, e);
        }

        match self
            .executor
            .execute(command.device_id, &command.command_type, &command.command_params)
            .await
        {
            Ok(result) => {
                if let Err(e) = self.store.mark_completed(command.id, result).await {
                    error!("Failed to mark command {} as completed: {}", command.id, e);
                }
                self.processed.fetch_add(1, Ordering::Relaxed);
                debug!("Command {} completed", command.id);
            }
            Err(error) => {
                if let Err(e) = self.store.mark_failed(command.id, error.clone()).await {
                    error!("Failed to mark command {} as failed: {}", command.id, e);
                }
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!("Command {} failed: {}", command.id, error);
            }
        }
    }

    async fn expire_stale(&self) {
        match self.store.expire_stale().await {
            Ok(0) => {}
            Ok(count) => info!("Expired {} stale commands", count),
            Err(e) => error!("Error expiring stale commands: {}", e),
        }
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> CommandWorkerStats {
        CommandWorkerStats {
            running: self.task.lock().is_some(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            batch_size: self.batch_size,
            poll_interval_secs: self.poll_interval.as_secs_f64(),
        }
    }
}

/// Command worker statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CommandWorkerStats {
    pub running: bool,
    pub processed: u64,
    pub failed: u64,
    pub batch_size: usize,
    pub poll_interval_secs: f64,
}
