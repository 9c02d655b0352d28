//! Periodic retry sweep.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::DeliveryEngine;

/// Drives [`DeliveryEngine::process_due_retries`] on a fixed interval.
///
/// Each sweep is awaited before the next tick is taken, so sweeps from one
/// scheduler never overlap; ticks missed during a long sweep are skipped.
/// The same loop runs [`DeliveryEngine::cleanup_terminal`] on its own interval.
pub struct RetryScheduler {
    engine: DeliveryEngine,
    interval: Duration,
    cleanup_interval: Option<Duration>,
}

impl RetryScheduler {
    /// Creates a scheduler using the engine's configured intervals.
    pub fn new(engine: DeliveryEngine) -> Self {
        let interval = engine.config().retry_sweep_interval();
        let cleanup_interval = engine.config().cleanup_interval();
        Self {
            engine,
            interval,
            cleanup_interval,
        }
    }

    /// Overrides the sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Overrides the cleanup interval. `None` disables cleanup.
    pub fn with_cleanup_interval(mut self, interval: Option<Duration>) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Spawns the sweep loop.
    pub fn start(self) -> SchedulerHandle {
        let token = CancellationToken::new();
        let join = tokio::spawn(self.run(token.clone()));
        SchedulerHandle { token, join }
    }

    async fn run(self, token: CancellationToken) {
        let period = self.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        let cleanup_enabled = self.cleanup_interval.is_some();
        let cleanup_period = self.cleanup_interval.unwrap_or(period).max(Duration::from_millis(1));
        let mut cleanup = tokio::time::interval(cleanup_period);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);
        cleanup.tick().await;

        info!(
            interval_ms = period.as_millis() as u64,
            cleanup_enabled,
            "retry scheduler started"
        );

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.engine.process_due_retries().await;
                    if report.overlapped {
                        debug!("retry sweep skipped; previous sweep still running");
                    }
                }
                _ = cleanup.tick(), if cleanup_enabled => {
                    self.engine.cleanup_terminal().await;
                }
            }
        }

        info!("retry scheduler stopped");
    }
}

/// Handle to a running [`RetryScheduler`].
pub struct SchedulerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Requests the loop to stop after the current sweep.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Checks whether the loop is still running.
    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "retry scheduler task ended abnormally");
        }
    }
}
