use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::scheduler::JobKind;

/// Liveness record for an ephemeral worker identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub capabilities: Vec<JobKind>,
    pub last_seen_at: DateTime<Utc>,
    pub jobs_granted: u64,
}

impl WorkerInfo {
    pub fn is_alive(&self, now: DateTime<Utc>, timeout_ms: u64) -> bool {
        (now - self.last_seen_at).num_milliseconds() < timeout_ms as i64
    }
}

/// Tracks workers seen through the lease API. Nothing here is durable; a
/// restarted worker shows up under a new id.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: DashMap<String, WorkerInfo>,
    worker_timeout_ms: u64,
}

impl WorkerRegistry {
    pub fn new(worker_timeout_ms: u64) -> Self {
        Self {
            workers: DashMap::new(),
            worker_timeout_ms,
        }
    }

    /// Record that a worker asked for work. Registers it on first sight.
    pub fn observe(&self, worker_id: &str, capabilities: &[JobKind], now: DateTime<Utc>) {
        let mut entry = self
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| {
                tracing::info!(worker_id, ?capabilities, "Worker registered");
                WorkerInfo {
                    id: worker_id.to_string(),
                    capabilities: capabilities.to_vec(),
                    last_seen_at: now,
                    jobs_granted: 0,
                }
            });
        entry.capabilities = capabilities.to_vec();
        entry.last_seen_at = now;
    }

    /// Heartbeat from a worker holding a lease.
    pub fn touch(&self, worker_id: &str, now: DateTime<Utc>) {
        if let Some(mut worker) = self.workers.get_mut(worker_id) {
            worker.last_seen_at = now;
        }
    }

    pub fn record_grant(&self, worker_id: &str) {
        if let Some(mut worker) = self.workers.get_mut(worker_id) {
            worker.jobs_granted += 1;
        }
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.workers.get(worker_id).map(|w| w.clone())
    }

    /// All known workers, sorted by id
    pub fn all(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self.workers.iter().map(|w| w.clone()).collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub fn alive(&self, now: DateTime<Utc>) -> Vec<WorkerInfo> {
        self.all()
            .into_iter()
            .filter(|w| w.is_alive(now, self.worker_timeout_ms))
            .collect()
    }

    /// Forget workers not seen within the timeout. Returns their ids.
    pub fn prune(&self, now: DateTime<Utc>) -> Vec<String> {
        let dead: Vec<String> = self
            .workers
            .iter()
            .filter(|w| !w.is_alive(now, self.worker_timeout_ms))
            .map(|w| w.id.clone())
            .collect();
        for id in &dead {
            self.workers.remove(id);
            tracing::info!(worker_id = %id, "Worker expired from registry");
        }
        dead
    }
}
