//! Drives a [`Reconciler`] in the background.
//!
//! The runner performs one pass at startup and then another whenever:
//!
//! - the resync interval elapses,
//! - a store change is observed or [`ControllerRunner::trigger`] is called,
//! - a failed pass asked to be requeued (with exponential backoff).
//!
//! Passes are serialized: a trigger that arrives during a pass causes exactly
//! one follow-up pass.
//!
//! # Example
//!
//! ```ignore
//! let runner = Arc::new(
//!     ControllerRunner::new(Arc::new(watcher), ControllerConfig::default())
//!         .with_changes(store.subscribe()),
//! );
//!
//! let handle = tokio::spawn({
//!     let runner = runner.clone();
//!     async move { runner.run().await }
//! });
//!
//! // later
//! runner.shutdown();
//! handle.await?;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, watch};

use crate::error::ReconcileResult;

/// One unit of reconciliation work.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Runs one full pass.
    async fn sync(&self) -> ReconcileResult;
}

// =============================================================================
// Configuration
// =============================================================================

/// Timing of controller passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Interval between unconditional passes.
    #[serde(with = "humantime_serde")]
    pub resync_interval: Duration,

    /// First delay before retrying a requeued pass. Doubles on every
    /// consecutive failure.
    #[serde(with = "humantime_serde")]
    pub requeue_initial_backoff: Duration,

    /// Upper bound for the requeue delay.
    #[serde(with = "humantime_serde")]
    pub requeue_max_backoff: Duration,

    /// Upper bound for one directory connection probe.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(180),
            requeue_initial_backoff: Duration::from_secs(1),
            requeue_max_backoff: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(90),
        }
    }
}

impl ControllerConfig {
    /// Fast timings for tests. Resync is effectively disabled.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            resync_interval: Duration::from_secs(3600),
            requeue_initial_backoff: Duration::from_millis(10),
            requeue_max_backoff: Duration::from_millis(40),
            probe_timeout: Duration::from_secs(5),
        }
    }

    /// Delay before the next requeued pass.
    #[must_use]
    pub fn next_backoff(&self, current: Option<Duration>) -> Duration {
        match current {
            None => self.requeue_initial_backoff,
            Some(d) => d.saturating_mul(2).min(self.requeue_max_backoff),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters describing what the runner has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub passes: u64,
    pub successful_passes: u64,
    pub requeued_passes: u64,
    pub failed_passes: u64,
    pub triggers_received: u64,
}

// =============================================================================
// Runner
// =============================================================================

/// Runs a reconciler until shut down.
pub struct ControllerRunner {
    reconciler: Arc<dyn Reconciler>,
    config: ControllerConfig,
    trigger: Notify,
    changes: Mutex<Option<watch::Receiver<u64>>>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,

    passes: AtomicU64,
    successful_passes: AtomicU64,
    requeued_passes: AtomicU64,
    failed_passes: AtomicU64,
    triggers_received: AtomicU64,
}

impl ControllerRunner {
    #[must_use]
    pub fn new(reconciler: Arc<dyn Reconciler>, config: ControllerConfig) -> Self {
        Self {
            reconciler,
            config,
            trigger: Notify::new(),
            changes: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            passes: AtomicU64::new(0),
            successful_passes: AtomicU64::new(0),
            requeued_passes: AtomicU64::new(0),
            failed_passes: AtomicU64::new(0),
            triggers_received: AtomicU64::new(0),
        }
    }

    /// Runs a pass whenever `changes` observes a new value.
    #[must_use]
    pub fn with_changes(self, changes: watch::Receiver<u64>) -> Self {
        Self {
            changes: Mutex::new(Some(changes)),
            ..self
        }
    }

    /// Runs until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        let name = self.reconciler.name().to_string();
        tracing::info!(controller = %name, "Controller starting");

        let mut changes = self.changes.lock().await;
        let mut backoff = self.run_pass(&name, None).await;

        loop {
            if self.is_shutting_down() {
                break;
            }

            let wait = backoff.unwrap_or(self.config.resync_interval);
            tokio::select! {
                _ = self.shutdown_notify.notified() => break,
                _ = self.trigger.notified() => {
                    self.triggers_received.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(controller = %name, "Controller triggered");
                }
                _ = next_change(&mut changes) => {
                    self.triggers_received.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(controller = %name, "Store change observed");
                }
                _ = tokio::time::sleep(wait) => {
                    if backoff.is_none() {
                        tracing::debug!(controller = %name, "Periodic resync");
                    }
                }
            }

            if self.is_shutting_down() {
                break;
            }
            backoff = self.run_pass(&name, backoff).await;
        }

        tracing::info!(controller = %name, "Controller shutting down");
    }

    /// Runs one pass and returns the delay before a retry, if one is needed.
    async fn run_pass(&self, name: &str, backoff: Option<Duration>) -> Option<Duration> {
        self.passes.fetch_add(1, Ordering::Relaxed);

        match self.reconciler.sync().await {
            Ok(()) => {
                self.successful_passes.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                let next = self.config.next_backoff(backoff);
                if err.is_requeue() {
                    self.requeued_passes.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        controller = %name,
                        backoff_ms = next.as_millis() as u64,
                        "Pass requested requeue"
                    );
                } else {
                    self.failed_passes.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        controller = %name,
                        error = %err,
                        backoff_ms = next.as_millis() as u64,
                        "Pass failed, retrying"
                    );
                }
                Some(next)
            }
        }
    }

    /// Requests a pass as soon as the current one (if any) completes.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Signals the runner to stop after the current pass.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_one();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            passes: self.passes.load(Ordering::Relaxed),
            successful_passes: self.successful_passes.load(Ordering::Relaxed),
            requeued_passes: self.requeued_passes.load(Ordering::Relaxed),
            failed_passes: self.failed_passes.load(Ordering::Relaxed),
            triggers_received: self.triggers_received.load(Ordering::Relaxed),
        }
    }
}

/// Resolves on the next change; never resolves once the sender is gone.
async fn next_change(changes: &mut Option<watch::Receiver<u64>>) {
    match changes {
        Some(rx) => {
            if rx.changed().await.is_err() {
                *changes = None;
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

// =============================================================================
// Tests
// =============================================================================
