//! Watchdog that cancels transfers whose output stops growing
//!
//! The monitor polls the combined size of the files a transfer writes to. Any
//! change in size counts as progress. When nothing changes for the stall
//! window, it marks the attempt as stalled and cancels the attempt's token;
//! the transfer observes the same token and stops.
//!
//! Files that do not exist yet count as empty, so a server that accepts the
//! connection but never sends a body stalls out one window after the monitor
//! was started.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;

/// Stall watchdog configuration for one transfer attempt
#[derive(Clone, Debug)]
pub struct StallMonitor {
    paths: Vec<PathBuf>,
    window: Duration,
    tick: Duration,
}

impl StallMonitor {
    /// Monitor the combined size of `paths`
    pub fn new(paths: Vec<PathBuf>, window: Duration, tick: Duration) -> Self {
        Self {
            paths,
            window,
            tick,
        }
    }

    /// Monitor using the configured window and tick
    pub fn from_config(paths: Vec<PathBuf>, config: &TransferConfig) -> Self {
        Self::new(paths, config.stall_window, config.stall_tick)
    }

    /// Start watching; `cancel` is cancelled if the transfer stalls
    pub fn spawn(self, cancel: CancellationToken) -> StallHandle {
        let stop = CancellationToken::new();
        let stalled = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(self.run(cancel, stop.clone(), stalled.clone()));
        StallHandle {
            stop,
            stalled,
            task,
        }
    }

    async fn run(self, cancel: CancellationToken, stop: CancellationToken, stalled: Arc<AtomicBool>) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.tick, self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_size = 0u64;
        let mut last_progress = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }

            let size = crate::utils::total_size(&self.paths).await;
            if size != last_size {
                last_size = size;
                last_progress = Instant::now();
                continue;
            }

            let idle = last_progress.elapsed();
            if idle >= self.window {
                tracing::warn!(
                    bytes = size,
                    idle_ms = idle.as_millis() as u64,
                    "transfer stalled, cancelling"
                );
                stalled.store(true, Ordering::SeqCst);
                cancel.cancel();
                return;
            }
        }
    }
}

/// Running stall monitor; [`StallHandle::stop`] consumes it so it stops exactly once
#[derive(Debug)]
pub struct StallHandle {
    stop: CancellationToken,
    stalled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl StallHandle {
    /// Whether the monitor has fired
    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    /// Stop the monitor and wait for it to exit; returns whether it fired
    pub async fn stop(self) -> bool {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "stall monitor task failed");
        }
        self.stalled.load(Ordering::SeqCst)
    }
}
