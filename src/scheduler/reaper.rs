use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::retry::jittered;
use crate::scheduler::service::{ReapReport, Scheduler};

/// Periodic task that reclaims expired leases.
///
/// Each sweep runs in its own tokio task, so a panic inside one sweep is
/// logged and the next tick runs normally. Lease grants never depend on the
/// reaper being alive.
pub struct Reaper {
    scheduler: Arc<Scheduler>,
    interval: Duration,
    retry: RetryPolicy,
}

impl Reaper {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let interval = scheduler.config().reaper_interval();
        let retry = scheduler.config().retry.clone();
        Self {
            scheduler,
            interval,
            retry,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Reaper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Reaper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Run one sweep, retrying transient errors with backoff.
    pub async fn sweep(&self) -> Option<ReapReport> {
        let mut attempt = 0;
        loop {
            let scheduler = self.scheduler.clone();
            match tokio::spawn(async move { scheduler.reap_expired() }).await {
                Ok(Ok(report)) => return Some(report),
                Ok(Err(e)) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = jittered(self.retry.backoff(attempt));
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Reaper sweep failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Reaper sweep failed");
                    return None;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Reaper sweep panicked");
                    return None;
                }
            }
        }
    }
}
