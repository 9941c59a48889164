// src/scheduler.rs
//! Fixed-interval cycle driver.
//!
//! The first cycle starts immediately. Each cycle runs in its own task so a
//! panic is contained; a panicked cycle is followed by the error cooldown
//! instead of the normal interval. Shutdown is cooperative: the flag is
//! checked before each cycle and at least once a second while waiting.

use async_trait::async_trait;
use metrics::counter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::CycleError;
use crate::history::{CycleHistory, CycleOutcome};
use crate::pipeline::{CycleReport, Pipeline};

const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait CycleRunner: Send + Sync + 'static {
    async fn run_cycle(&self) -> Result<CycleReport, CycleError>;
}

#[async_trait]
impl CycleRunner for Pipeline {
    async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        Pipeline::run_cycle(self).await
    }
}

pub struct Scheduler {
    runner: Arc<dyn CycleRunner>,
    interval: Duration,
    error_cooldown: Duration,
    history: Arc<CycleHistory>,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn CycleRunner>,
        interval: Duration,
        error_cooldown: Duration,
        history: Arc<CycleHistory>,
    ) -> Self {
        Self {
            runner,
            interval,
            error_cooldown,
            history,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the loop once set.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until the shutdown flag is set. An in-flight cycle always finishes.
    pub async fn run(&self) {
        tracing::info!(
            target: "scheduler",
            interval_secs = self.interval.as_secs(),
            cooldown_secs = self.error_cooldown.as_secs(),
            "scheduler started"
        );
        while !self.is_shutdown() {
            let wait = self.run_one().await;
            if !self.sleep_unless_shutdown(wait).await {
                break;
            }
        }
        tracing::info!(target: "scheduler", "scheduler stopped");
    }

    /// One cycle in its own task. Returns the pause before the next one.
    pub async fn run_one(&self) -> Duration {
        let runner = self.runner.clone();
        let handle = tokio::spawn(async move { runner.run_cycle().await });

        match handle.await {
            Ok(Ok(report)) => {
                self.history.push_ok(report);
                self.interval
            }
            Ok(Err(e)) => {
                // Store failures retry on the normal schedule.
                tracing::error!(target: "scheduler", error = %e, "cycle aborted");
                self.history.push_failed(CycleOutcome::Aborted, e.to_string());
                self.interval
            }
            Err(join_err) => {
                let msg = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    CycleError::Aborted(join_err.to_string()).to_string()
                };
                counter!("scheduler_cooldowns_total").increment(1);
                tracing::error!(
                    target: "scheduler",
                    error = %msg,
                    cooldown_secs = self.error_cooldown.as_secs(),
                    "cycle crashed, cooling down"
                );
                self.history.push_failed(CycleOutcome::Panicked, msg);
                self.error_cooldown
            }
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// `false` when shutdown was requested during the wait.
    async fn sleep_unless_shutdown(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.is_shutdown() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep((deadline - now).min(SHUTDOWN_POLL)).await;
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "cycle panicked".to_string()
    }
}

/// Set `flag` on Ctrl-C (and SIGTERM on unix).
pub fn spawn_signal_listener(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!(target: "scheduler", "shutdown requested, finishing current work");
        flag.store(true, Ordering::SeqCst);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(target: "scheduler", error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages_are_extracted() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "cycle panicked");
    }
}
