//! Periodic verification loop.
//!
//! Runs a verify pass immediately on start and then once per interval until
//! stopped. A failed cycle is logged and retried after the recovery delay;
//! only an explicit stop ends the loop.

use crate::service::{IntegrityService, VerifySummary};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use watchdog_core::settings::WatchdogSettings;
use watchdog_core::{Result, WatchdogError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub recovery_delay: Duration,
}

impl MonitorConfig {
    pub fn from_settings(settings: &WatchdogSettings) -> Self {
        Self {
            interval: settings.poll_interval(),
            recovery_delay: settings.recovery_delay(),
        }
    }
}

/// One monitoring cycle.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self) -> Result<VerifySummary>;
}

#[async_trait]
impl CycleRunner for IntegrityService {
    async fn run_cycle(&self) -> Result<VerifySummary> {
        self.verify_all().await
    }
}

/// Control handle for a running monitor loop.
pub struct MonitorHandle {
    wake: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    state: Arc<Mutex<MonitorState>>,
    cycles: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Run the next cycle now instead of waiting out the interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn state(&self) -> MonitorState {
        *self.state.lock()
    }

    /// Cycles that completed successfully.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Signal shutdown and wait for the loop to exit. A cycle already in
    /// progress is allowed to finish.
    pub async fn stop(self) -> MonitorState {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "monitor task ended abnormally");
        }
        *self.state.lock() = MonitorState::Idle;
        MonitorState::Idle
    }
}

/// Spawn the monitor loop on the current tokio runtime.
pub fn start<R>(runner: Arc<R>, config: MonitorConfig) -> Result<MonitorHandle>
where
    R: CycleRunner + ?Sized + 'static,
{
    if config.interval.is_zero() {
        return Err(WatchdogError::Config(
            "monitor interval must be greater than zero".into(),
        ));
    }

    let wake = Arc::new(Notify::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let state = Arc::new(Mutex::new(MonitorState::Running));
    let cycles = Arc::new(AtomicU64::new(0));
    let failures = Arc::new(AtomicU64::new(0));

    let wake_clone = wake.clone();
    let state_clone = state.clone();
    let cycles_clone = cycles.clone();
    let failures_clone = failures.clone();

    let task = tokio::spawn(async move {
        info!(
            interval_ms = config.interval.as_millis() as u64,
            "monitor loop started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let delay = match runner.run_cycle().await {
                Ok(summary) => {
                    cycles_clone.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        modified = summary.modified_count,
                        deleted = summary.deleted_count,
                        "monitor cycle complete"
                    );
                    config.interval
                }
                Err(e) => {
                    failures_clone.fetch_add(1, Ordering::SeqCst);
                    error!(
                        error = %e,
                        retry_ms = config.recovery_delay.as_millis() as u64,
                        "monitor cycle failed"
                    );
                    config.recovery_delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wake_clone.notified() => {
                    debug!("monitor loop woken early");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        *state_clone.lock() = MonitorState::Idle;
        info!("monitor loop stopped");
    });

    Ok(MonitorHandle {
        wake,
        shutdown_tx,
        state,
        cycles,
        failures,
        task,
    })
}
