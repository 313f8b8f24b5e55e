//! Export of job state transitions to the Logging/Analytics services.
//!
//! Transitions are emitted as structured `tracing` events on the
//! `xeodocs::telemetry` target; the log shipper forwards that target.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scheduler::TransitionEvent;

pub const TELEMETRY_TARGET: &str = "xeodocs::telemetry";

pub fn emit(event: &TransitionEvent) {
    let from_state = event
        .from_state
        .map(|s| s.to_string())
        .unwrap_or_else(|| "submitted".to_string());
    tracing::info!(
        target: TELEMETRY_TARGET,
        job_id = %event.job_id,
        project_id = %event.project_id,
        from_state = %from_state,
        to_state = %event.to_state,
        timestamp = %event.timestamp.to_rfc3339(),
        worker_id = event.worker_id.as_deref().unwrap_or(""),
        attempt_count = event.attempt_count,
        reason = event.reason.as_deref().unwrap_or(""),
        "job_transition"
    );
}

/// Forward every event from `events` until shutdown or the store goes away.
pub fn spawn_exporter(
    mut events: broadcast::Receiver<TransitionEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut exported = 0u64;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        emit(&event);
                        exported += 1;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Telemetry exporter lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        exported
    })
}
