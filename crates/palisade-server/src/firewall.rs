//! Per-endpoint bandwidth limiter.
//!
//! Each endpoint gets its own token-bucket: a [`tokio::sync::Semaphore`]
//! seeded with `burst_size` permits, refilled back to `burst_size` on a
//! fixed interval as long as the endpoint has seen activity since the last
//! reset.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

/// Construction-time failure: a non-positive limit was configured.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bandwidth limit must be positive, got {0}")]
pub struct InvalidLimit(pub i64);

/// Configuration for one [`BandwidthLimiter`].
#[derive(Debug, Clone, Copy)]
pub struct FirewallConfig {
    /// Maximum bytes per `reset_interval`.
    pub bytes_per_second: u32,
    /// Permits available in a single burst before throttling kicks in.
    pub burst_size: u32,
    /// How often idle endpoints are reset back to `burst_size`.
    pub reset_interval: Duration,
}

impl FirewallConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// `InvalidLimit` if `bytes_per_second` or `burst_size` is zero.
    pub fn validate(&self) -> Result<(), InvalidLimit> {
        if self.bytes_per_second == 0 {
            return Err(InvalidLimit(0));
        }
        if self.burst_size == 0 {
            return Err(InvalidLimit(0));
        }
        Ok(())
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self { bytes_per_second: 1_000_000, burst_size: 65536, reset_interval: Duration::from_secs(1) }
    }
}

struct Endpoint {
    semaphore: Semaphore,
    used_this_window: AtomicU64,
    touched_since_reset: AtomicBool,
}

impl Endpoint {
    fn new(burst_size: u32) -> Self {
        Self {
            semaphore: Semaphore::new(burst_size as usize),
            used_this_window: AtomicU64::new(0),
            touched_since_reset: AtomicBool::new(false),
        }
    }
}

/// Usage snapshot for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointStats {
    /// Bytes charged against this endpoint in the current window.
    pub used_this_window: u64,
    /// Remaining permits before the next acquire blocks or fails.
    pub available_permits: usize,
}

/// Per-endpoint token-bucket bandwidth limiter.
pub struct BandwidthLimiter {
    config: FirewallConfig,
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
    reset_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl BandwidthLimiter {
    /// Construct a limiter, starting its background reset timer.
    ///
    /// # Errors
    ///
    /// `InvalidLimit` if `config` does not validate.
    pub fn new(config: FirewallConfig) -> Result<Arc<Self>, InvalidLimit> {
        config.validate()?;

        let limiter = Arc::new(Self {
            config,
            endpoints: Mutex::new(HashMap::new()),
            reset_task: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&limiter);
        let interval = config.reset_interval;
        let cancel = limiter.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(limiter) = weak.upgrade() else { break };
                        limiter.reset_idle_endpoints().await;
                    }
                }
            }
        });

        // Safe: no other task can have observed `limiter` before this point,
        // and `try_lock` only fails under contention, never because the
        // option is already occupied.
        *limiter.reset_task.try_lock().expect("uncontended at construction") = Some(handle);

        Ok(limiter)
    }

    async fn endpoint(&self, endpoint: &str) -> Arc<Endpoint> {
        let mut endpoints = self.endpoints.lock().await;
        endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Endpoint::new(self.config.burst_size)))
            .clone()
    }

    async fn try_charge(&self, endpoint: &str, n: u32) -> bool {
        let ep = self.endpoint(endpoint).await;

        // The permit bounds concurrent acquirers to `burst_size` and is
        // released as soon as the byte-budget check below completes; it is
        // not a cumulative counter (that role belongs to `used_this_window`).
        let Ok(Ok(_permit)) =
            tokio::time::timeout(Duration::from_secs(1), ep.semaphore.acquire()).await
        else {
            return false;
        };

        let new_total = ep.used_this_window.fetch_add(u64::from(n), Ordering::SeqCst) + u64::from(n);
        if new_total > u64::from(self.config.bytes_per_second) {
            ep.used_this_window.fetch_sub(u64::from(n), Ordering::SeqCst);
            return false;
        }

        ep.touched_since_reset.store(true, Ordering::SeqCst);
        true
    }

    /// Charge `n` bytes of upload against `endpoint`. Returns `false` if the
    /// endpoint is throttled.
    pub async fn try_upload(&self, endpoint: &str, n: u32) -> bool {
        self.try_charge(endpoint, n).await
    }

    /// Charge `n` bytes of download against `endpoint`. Returns `false` if
    /// the endpoint is throttled.
    pub async fn try_download(&self, endpoint: &str, n: u32) -> bool {
        self.try_charge(endpoint, n).await
    }

    /// Current usage for `endpoint`, if it has ever been charged.
    pub async fn stats(&self, endpoint: &str) -> Option<EndpointStats> {
        let endpoints = self.endpoints.lock().await;
        endpoints.get(endpoint).map(|ep| EndpointStats {
            used_this_window: ep.used_this_window.load(Ordering::SeqCst),
            available_permits: ep.semaphore.available_permits(),
        })
    }

    async fn reset_idle_endpoints(&self) {
        let endpoints = self.endpoints.lock().await;
        for ep in endpoints.values() {
            if ep.touched_since_reset.swap(false, Ordering::SeqCst) {
                continue;
            }
            ep.used_this_window.store(0, Ordering::SeqCst);
            let deficit = self.config.burst_size as usize - ep.semaphore.available_permits();
            if deficit > 0 {
                ep.semaphore.add_permits(deficit);
            }
        }
    }

    /// Cancel the reset timer and clear all endpoint state.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.reset_task.lock().await.take() {
            handle.abort();
        }
        self.endpoints.lock().await.clear();
    }
}
