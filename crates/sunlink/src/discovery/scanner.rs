// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Async TCP port sweep over a CIDR range.
//!
//! Host enumeration excludes the network and broadcast addresses. Connects
//! run under a bounded concurrency semaphore with a small per-connect
//! timeout, and results stream back as they land.

use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info};

/// Configuration for one network scan.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Target network in CIDR notation.
    pub network: String,
    pub ports: Vec<u16>,
    pub exclude_ips: HashSet<IpAddr>,
    pub max_concurrent: usize,
    pub connect_timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            network: "192.168.1.0/24".to_string(),
            ports: vec![502, 8502],
            exclude_ips: HashSet::new(),
            max_concurrent: 50,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// A responsive endpoint found by the sweep.
#[derive(Debug, Clone)]
pub struct ScanEndpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub response_time_ms: f64,
}

/// Progress tick emitted once per attempted target.
#[derive(Debug, Clone)]
pub struct ScanTick {
    pub scanned: usize,
    pub total: usize,
    pub ip: IpAddr,
    pub port: u16,
}

/// Async TCP scanner.
pub struct NetworkScanner {
    config: ScanConfig,
    cancelled: Arc<AtomicBool>,
}

impl NetworkScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel an ongoing scan. Pending targets are skipped.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Hosts to scan: the network's host addresses minus exclusions.
    pub fn hosts(&self) -> Vec<IpAddr> {
        let network: IpNet = match self.config.network.parse() {
            Ok(network) => network,
            Err(e) => {
                error!("Invalid network specification '{}': {}", self.config.network, e);
                return Vec::new();
            }
        };

        let hosts: Vec<IpAddr> = network
            .hosts()
            .filter(|ip| !self.config.exclude_ips.contains(ip))
            .collect();
        info!(
            "Prepared {} hosts to scan from {}",
            hosts.len(),
            self.config.network
        );
        hosts
    }

    pub fn total_targets(&self) -> usize {
        self.hosts().len() * self.config.ports.len()
    }

    /// Run the sweep. Responsive endpoints stream out on the returned
    /// channel; `progress` ticks once per attempted target.
    pub fn scan(
        &self,
        progress: Option<mpsc::UnboundedSender<ScanTick>>,
    ) -> mpsc::Receiver<ScanEndpoint> {
        let (tx, rx) = mpsc::channel(64);
        let hosts = self.hosts();
        let ports = self.config.ports.clone();
        let total = hosts.len() * ports.len();
        let connect_timeout = self.config.connect_timeout;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let cancelled = Arc::clone(&self.cancelled);

        tokio::spawn(async move {
            info!(
                "Starting network scan: {} hosts x {} ports = {} targets",
                hosts.len(),
                ports.len(),
                total
            );

            let mut tasks = Vec::with_capacity(total);
            for ip in hosts {
                for &port in &ports {
                    let semaphore = Arc::clone(&semaphore);
                    let cancelled = Arc::clone(&cancelled);
                    tasks.push(tokio::spawn(async move {
                        let _permit = semaphore.acquire_owned().await.ok()?;
                        if cancelled.load(Ordering::SeqCst) {
                            return None;
                        }
                        Some((ip, port, check_port(ip, port, connect_timeout).await))
                    }));
                }
            }

            let mut scanned = 0usize;
            for task in tasks {
                let outcome = match task.await {
                    Ok(Some(outcome)) => outcome,
                    _ => continue,
                };
                scanned += 1;

                let (ip, port, response_time) = outcome;
                if let Some(progress) = &progress {
                    let _ = progress.send(ScanTick {
                        scanned,
                        total,
                        ip,
                        port,
                    });
                }
                if let Some(response_time_ms) = response_time {
                    debug!(
                        "Port {} open on {} (response: {:.1}ms)",
                        port, ip, response_time_ms
                    );
                    if tx
                        .send(ScanEndpoint {
                            ip,
                            port,
                            response_time_ms,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }

            info!("Scan completed: {}/{} targets scanned", scanned, total);
        });

        rx
    }

    /// Scan one host across the configured ports.
    pub async fn scan_host(&self, ip: IpAddr) -> Vec<ScanEndpoint> {
        let mut open = Vec::new();
        for &port in &self.config.ports {
            if let Some(response_time_ms) = check_port(ip, port, self.config.connect_timeout).await
            {
                open.push(ScanEndpoint {
                    ip,
                    port,
                    response_time_ms,
                });
            }
        }
        open
    }

    /// Quick single-port liveness check.
    pub async fn quick_check(&self, ip: IpAddr, port: u16) -> bool {
        check_port(ip, port, self.config.connect_timeout).await.is_some()
    }
}

/// Attempt a TCP connect; `Some(elapsed_ms)` when the port accepts.
async fn check_port(ip: IpAddr, port: u16, timeout: Duration) -> Option<f64> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((ip, port))).await {
        Ok(Ok(_stream)) => Some(started.elapsed().as_secs_f64() * 1000.0),
        _ => None,
    }
}
