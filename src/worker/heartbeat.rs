use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::worker::client::SchedulerClient;

/// Keeps one lease alive while its job runs.
///
/// Renews every `ttl / 3` so two heartbeats can be lost before the lease
/// lapses. When the scheduler says the lease is gone (expired, revoked, or
/// the job was cancelled) the `lease_lost` token is cancelled and the
/// sender stops.
pub struct HeartbeatSender {
    client: Arc<dyn SchedulerClient>,
    token: Uuid,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(client: Arc<dyn SchedulerClient>, token: Uuid, lease_ttl_ms: u64) -> Self {
        Self {
            client,
            token,
            interval: Duration::from_millis((lease_ttl_ms / 3).max(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Renew until `done` fires or the lease is lost. Returns the number of
    /// successful renewals.
    pub async fn run(&self, done: CancellationToken, lease_lost: CancellationToken) -> u64 {
        let start = tokio::time::Instant::now() + self.interval;
        let mut interval = tokio::time::interval_at(start, self.interval);
        let mut renewed = 0;

        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.client.renew(self.token).await {
                Ok(expires_at) => {
                    renewed += 1;
                    tracing::trace!(token = %self.token, %expires_at, "Heartbeat sent");
                }
                Err(e) if e.is_lease_lost() => {
                    tracing::warn!(token = %self.token, error = %e, "Lease lost");
                    lease_lost.cancel();
                    break;
                }
                Err(e) => {
                    // Try again next tick; the lease outlives a couple of misses.
                    tracing::warn!(token = %self.token, error = %e, "Heartbeat failed");
                }
            }
        }
        renewed
    }
}
