use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicy;
use crate::error::Result;

/// Spread `delay` by up to +/-25% so retrying callers do not move in lockstep.
pub fn jittered(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    if ms < 4 {
        return delay;
    }
    let spread = ms / 4;
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(ms - spread..=ms + spread))
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's retries are spent.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = jittered(policy.backoff(attempt));
                tracing::warn!(
                    operation = what,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
