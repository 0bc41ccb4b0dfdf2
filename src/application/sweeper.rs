//! Background sweeping of the fallback limiter.
//!
//! The fallback limiter already sweeps inline at most once per interval, but
//! only while checks keep arriving. A sweeper task bounds its memory when the
//! store recovers and the fallback path goes quiet.

use crate::application::fallback::FallbackLimiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Error returned when a sweeper configuration is invalid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SweeperConfigError {
    #[error("sweep interval must be greater than 0")]
    ZeroInterval,
}

/// Error returned when the sweeper task does not stop cleanly.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("sweeper task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Periodically sweeps a [`FallbackLimiter`].
#[derive(Debug)]
pub struct FallbackSweeper {
    limiter: Arc<FallbackLimiter>,
    interval: Duration,
}

impl FallbackSweeper {
    /// # Errors
    /// Returns `SweeperConfigError::ZeroInterval` if `interval` is zero.
    pub fn new(
        limiter: Arc<FallbackLimiter>,
        interval: Duration,
    ) -> Result<Self, SweeperConfigError> {
        if interval.is_zero() {
            return Err(SweeperConfigError::ZeroInterval);
        }
        Ok(Self { limiter, interval })
    }

    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// Dropping the handle also stops the task, without waiting for it;
    /// [`SweeperHandle::shutdown`] stops it and waits.
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let interval_duration = self.interval;

        let join = tokio::spawn(async move {
            let mut ticker = interval(interval_duration);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            tracing::info!(interval = ?interval_duration, "Fallback sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.limiter.sweep();
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            tracing::info!("Fallback sweeper stopped");
        });

        SweeperHandle {
            shutdown_tx: Some(shutdown_tx),
            join,
        }
    }
}

/// Handle to a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the task to stop and wait for it to finish.
    ///
    /// # Errors
    /// Returns `ShutdownError::TaskFailed` if the task panicked or was aborted.
    pub async fn shutdown(mut self) -> Result<(), ShutdownError> {
        if let Some(tx) = self.shutdown_tx.take() {
            // The task may already be gone; the join below reports why.
            let _ = tx.send(());
        }
        self.join.await?;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
