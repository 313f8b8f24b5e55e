use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{SharedClock, SystemClock};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::dispatcher::Dispatcher;
use crate::scheduler::job::{Job, JobKind, JobSpec, JobState, Outcome};
use crate::scheduler::lease::{Lease, LeaseManager};
use crate::scheduler::registry::WorkerRegistry;
use crate::scheduler::store::{JobFilter, JobStore, MemoryJobStore, StateChange, TransitionEvent};

/// A lease handed to a worker together with the work it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub job_id: Uuid,
    pub project_id: String,
    pub kind: JobKind,
    pub token: Uuid,
    pub payload: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub lease_ttl_ms: u64,
    pub attempt_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    pub requeued: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    /// Expired leases whose job had already left `leased` (e.g. cancelled)
    pub dropped: usize,
    /// Pending jobs settled by the dependency sweep
    pub resolved: usize,
    pub removed: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty()
            && self.failed.is_empty()
            && self.dropped == 0
            && self.resolved == 0
            && self.removed == 0
    }
}

/// The scheduler core: Job Store, Lease Manager, Dispatcher and worker
/// registry behind one API used by both the HTTP layer and in-process workers.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    leases: LeaseManager,
    dispatcher: Dispatcher,
    workers: WorkerRegistry,
    /// Leased jobs found without a lease on the previous sweep.
    orphan_suspects: Mutex<HashSet<Uuid>>,
    clock: SharedClock,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn JobStore>, clock: SharedClock) -> Self {
        Self {
            dispatcher: Dispatcher::new(store.clone(), config.fairness_window),
            leases: LeaseManager::new(clock.clone()),
            workers: WorkerRegistry::new(config.worker_timeout_ms),
            orphan_suspects: Mutex::new(HashSet::new()),
            store,
            clock,
            config,
        }
    }

    /// Scheduler backed by a fresh [`MemoryJobStore`].
    pub fn in_memory(config: SchedulerConfig, clock: SharedClock) -> Self {
        let store = Arc::new(MemoryJobStore::new(
            config.max_jobs,
            config.event_capacity,
            clock.clone(),
        ));
        Self::new(config, store, clock)
    }

    pub fn with_defaults() -> Self {
        Self::in_memory(SchedulerConfig::default(), Arc::new(SystemClock))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // ------------------------------------------------------------------
    // Caller-facing API
    // ------------------------------------------------------------------

    /// Validate and store a new job. Nothing is stored if validation fails.
    pub fn submit(&self, spec: JobSpec) -> Result<Job> {
        if spec.project_id.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "project_id cannot be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for dep_id in &spec.dependencies {
            if !seen.insert(*dep_id) {
                return Err(SchedulerError::InvalidDependency(format!(
                    "job {} listed more than once",
                    dep_id
                )));
            }
            let dep = match self.store.get(dep_id) {
                Ok(dep) => dep,
                Err(SchedulerError::JobNotFound(_)) => {
                    return Err(SchedulerError::InvalidDependency(format!(
                        "job {} does not exist",
                        dep_id
                    )));
                }
                Err(e) => return Err(e),
            };
            if dep.project_id != spec.project_id {
                return Err(SchedulerError::InvalidDependency(format!(
                    "job {} belongs to project {}, not {}",
                    dep_id, dep.project_id, spec.project_id
                )));
            }
        }

        let job = Job::new(spec, self.config.max_attempts, self.clock.now());
        let stored = self.store.insert(job)?;
        tracing::info!(
            job_id = %stored.id,
            project_id = %stored.project_id,
            kind = %stored.kind,
            dependencies = stored.dependencies.len(),
            "Job submitted"
        );

        self.dispatcher.evaluate(&stored.id)
    }

    pub fn status(&self, job_id: &Uuid) -> Result<Job> {
        self.store.get(job_id)
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.list(filter)
    }

    pub fn history(&self, job_id: &Uuid) -> Result<Vec<TransitionEvent>> {
        self.store.history(job_id)
    }

    /// Cancel a job. Pending and ready jobs stop immediately; a leased job is
    /// marked cancelled and its worker finds out on the next heartbeat.
    /// Cancelling an already cancelled job is a no-op.
    pub fn cancel(&self, job_id: &Uuid) -> Result<Job> {
        let cancelled = loop {
            let job = self.store.get(job_id)?;
            match job.state {
                JobState::Pending | JobState::Ready | JobState::Leased => {
                    let change =
                        StateChange::to(JobState::Cancelled).with_reason("cancelled by caller");
                    match self.store.update_state(job_id, job.state, change) {
                        Ok(updated) => break updated,
                        Err(SchedulerError::Conflict { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                JobState::Cancelled => return Ok(job),
                from => {
                    return Err(SchedulerError::InvalidTransition {
                        job_id: *job_id,
                        from,
                        to: JobState::Cancelled,
                    });
                }
            }
        };

        tracing::info!(job_id = %job_id, project_id = %cancelled.project_id, "Job cancelled");
        if let Err(e) = self.dispatcher.fail_dependents(job_id) {
            // The reaper's pending sweep finishes the propagation.
            tracing::warn!(job_id = %job_id, error = %e, "Failed to propagate cancellation");
        }
        Ok(cancelled)
    }

    // ------------------------------------------------------------------
    // Worker-facing API
    // ------------------------------------------------------------------

    /// One pass over the ready jobs. Returns `None` when nothing matches.
    pub fn try_acquire(&self, worker_id: &str, capabilities: &[JobKind]) -> Result<Option<Grant>> {
        if worker_id.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "worker_id cannot be empty".to_string(),
            ));
        }
        if capabilities.is_empty() {
            return Err(SchedulerError::CapabilityMismatch(
                "worker declared no capabilities".to_string(),
            ));
        }
        // Never grant against a store we cannot trust.
        self.store.health()?;
        self.workers.observe(worker_id, capabilities, self.clock.now());

        let ready = self.store.list_ready(None)?;
        for job in self.dispatcher.order_candidates(ready, capabilities) {
            if !capabilities.contains(&job.kind) {
                continue;
            }

            let ttl = self.config.lease_ttl.for_kind(job.kind);
            let lease = match self.leases.acquire(job.id, worker_id, ttl) {
                Ok(lease) => lease,
                Err(SchedulerError::AlreadyLeased(_)) => continue,
                Err(e) => return Err(e),
            };

            let change = StateChange::to(JobState::Leased).with_worker(worker_id);
            match self.store.update_state(&job.id, JobState::Ready, change) {
                Ok(leased) => {
                    self.dispatcher.record_grant(&leased.project_id);
                    self.workers.record_grant(worker_id);
                    tracing::info!(
                        job_id = %leased.id,
                        project_id = %leased.project_id,
                        kind = %leased.kind,
                        worker_id,
                        attempt = leased.attempt_count,
                        expires_at = %lease.expires_at,
                        "Lease granted"
                    );
                    return Ok(Some(Grant {
                        job_id: leased.id,
                        project_id: leased.project_id,
                        kind: leased.kind,
                        token: lease.token,
                        payload: leased.payload,
                        expires_at: lease.expires_at,
                        lease_ttl_ms: ttl.as_millis() as u64,
                        attempt_count: leased.attempt_count,
                    }));
                }
                Err(SchedulerError::Conflict { .. }) | Err(SchedulerError::JobNotFound(_)) => {
                    // Cancelled or taken between listing and leasing.
                    self.leases.reclaim(&lease);
                    continue;
                }
                Err(e) => {
                    self.leases.reclaim(&lease);
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Long-poll for a ready job matching `capabilities`. Waits up to `wait`
    /// (clamped to the configured maximum). Running out of time is `Ok(None)`.
    pub async fn acquire(
        &self,
        worker_id: &str,
        capabilities: &[JobKind],
        wait: Option<Duration>,
    ) -> Result<Option<Grant>> {
        let wait = wait
            .unwrap_or(Duration::from_millis(self.config.default_wait_ms))
            .min(Duration::from_millis(self.config.max_wait_ms));
        let deadline = tokio::time::Instant::now() + wait;
        let signal = self.dispatcher.ready_signal();

        loop {
            // Register interest before looking so a job readied mid-scan still wakes us.
            let notified = signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(grant) = self.try_acquire(worker_id, capabilities)? {
                return Ok(Some(grant));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::trace!(worker_id, "Acquire timed out with no job");
                    return Ok(None);
                }
            }
        }
    }

    /// Heartbeat: extend the lease behind `token`. A job cancelled while
    /// leased answers with `JobCancelled` and the lease is dropped.
    pub fn renew(&self, token: &Uuid) -> Result<Lease> {
        let lease = self.leases.validate(token)?;
        let job = self.store.get(&lease.job_id)?;

        match job.state {
            JobState::Leased => {}
            JobState::Cancelled => {
                self.leases.reclaim(&lease);
                tracing::info!(
                    job_id = %job.id,
                    worker_id = %lease.worker_id,
                    "Heartbeat on cancelled job, worker told to abandon"
                );
                return Err(SchedulerError::JobCancelled(job.id));
            }
            _ => {
                self.leases.reclaim(&lease);
                return Err(SchedulerError::InvalidLease);
            }
        }

        let renewed = self
            .leases
            .renew(token, self.config.lease_ttl.for_kind(job.kind))?;
        self.workers.touch(&renewed.worker_id, self.clock.now());
        tracing::debug!(
            job_id = %renewed.job_id,
            worker_id = %renewed.worker_id,
            expires_at = %renewed.expires_at,
            "Lease renewed"
        );
        Ok(renewed)
    }

    /// Report the end of a lease. Stale or already-used tokens are rejected
    /// without touching the job.
    pub fn release(
        &self,
        token: &Uuid,
        outcome: Outcome,
        result_ref: Option<String>,
        error: Option<String>,
    ) -> Result<Job> {
        let lease = self.leases.release(token)?;
        self.workers.touch(&lease.worker_id, self.clock.now());

        let released = match outcome {
            Outcome::Succeeded => self.complete(&lease, result_ref),
            Outcome::Failed => {
                let reason = error.unwrap_or_else(|| "worker reported failure".to_string());
                self.requeue_or_fail(&lease, reason, result_ref)
                    .and_then(|job| match job {
                        Some(job) => Ok(job),
                        None => self.store.get(&lease.job_id),
                    })
            }
        };
        if let Err(e) = &released {
            self.restore_lease(lease, e);
        }
        released
    }

    /// The store refused a transition after the lease was removed. Put the
    /// lease back so the worker can retry the release, or the reaper can
    /// reclaim it once it expires.
    fn restore_lease(&self, lease: Lease, error: &SchedulerError) {
        if !error.is_transient() {
            return;
        }
        let job_id = lease.job_id;
        if self.leases.restore(lease) {
            tracing::warn!(job_id = %job_id, error = %error, "Store transition failed, lease restored");
        }
    }

    fn complete(&self, lease: &Lease, result_ref: Option<String>) -> Result<Job> {
        let change = StateChange::to(JobState::Succeeded)
            .with_worker(lease.worker_id.clone())
            .with_result_ref(result_ref);
        let job = match self
            .store
            .update_state(&lease.job_id, JobState::Leased, change)
        {
            Ok(job) => job,
            // Cancelled while the worker was finishing; leave it cancelled.
            Err(SchedulerError::Conflict { .. }) => return self.store.get(&lease.job_id),
            Err(e) => return Err(e),
        };

        tracing::info!(
            job_id = %job.id,
            project_id = %job.project_id,
            worker_id = %lease.worker_id,
            result_ref = ?job.result_ref,
            "Job succeeded"
        );
        match self.dispatcher.resolve_dependents(&job.id) {
            Ok(promoted) if !promoted.is_empty() => {
                tracing::debug!(job_id = %job.id, promoted = promoted.len(), "Dependents ready");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to resolve dependents");
            }
        }
        Ok(job)
    }

    /// A lease cycle ended without success: back to `ready`, or `failed`
    /// once the attempts are used up. `None` if the job had already left
    /// `leased` (cancelled while running).
    fn requeue_or_fail(
        &self,
        lease: &Lease,
        reason: String,
        result_ref: Option<String>,
    ) -> Result<Option<Job>> {
        loop {
            let job = self.store.get(&lease.job_id)?;
            if job.state != JobState::Leased {
                return Ok(None);
            }

            let target = if job.is_last_attempt() {
                JobState::Failed
            } else {
                JobState::Ready
            };
            let change = StateChange::to(target)
                .bump_attempt()
                .with_worker(lease.worker_id.clone())
                .with_result_ref(result_ref.clone())
                .with_reason(reason.clone());

            match self
                .store
                .update_state(&job.id, JobState::Leased, change)
            {
                Ok(updated) => {
                    if target == JobState::Ready {
                        tracing::warn!(
                            job_id = %updated.id,
                            worker_id = %lease.worker_id,
                            attempt = updated.attempt_count,
                            max_attempts = updated.max_attempts,
                            reason = %reason,
                            "Job requeued"
                        );
                        self.dispatcher.notify_ready();
                    } else {
                        tracing::error!(
                            job_id = %updated.id,
                            worker_id = %lease.worker_id,
                            attempt = updated.attempt_count,
                            reason = %reason,
                            "Job failed, attempts exhausted"
                        );
                        if let Err(e) = self.dispatcher.fail_dependents(&updated.id) {
                            tracing::warn!(job_id = %updated.id, error = %e, "Failed to propagate failure");
                        }
                    }
                    return Ok(Some(updated));
                }
                Err(SchedulerError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Requeue `leased` jobs that have no lease record. A job is only touched
    /// once it has been seen without a lease on two consecutive sweeps, so a
    /// release caught between removing its lease and moving the job is left
    /// to finish.
    fn reconcile_orphans(&self, report: &mut ReapReport) -> Result<()> {
        let leased = self.store.list(&JobFilter {
            state: Some(JobState::Leased),
            project_id: None,
        })?;
        let orphans: HashSet<Uuid> = leased
            .iter()
            .filter(|job| !self.leases.contains(&job.id))
            .map(|job| job.id)
            .collect();

        let confirmed: Vec<Job> = {
            let mut suspects = self.orphan_suspects.lock().unwrap_or_else(|e| e.into_inner());
            let confirmed: Vec<Job> = leased
                .into_iter()
                .filter(|job| orphans.contains(&job.id) && suspects.contains(&job.id))
                .collect();
            *suspects = orphans;
            for job in &confirmed {
                suspects.remove(&job.id);
            }
            confirmed
        };

        let now = self.clock.now();
        for job in confirmed {
            let worker_id = job.worker_id.clone().unwrap_or_default();
            tracing::warn!(job_id = %job.id, worker_id = %worker_id, "Leased job had no lease");
            let orphaned = Lease {
                job_id: job.id,
                worker_id,
                token: Uuid::nil(),
                granted_at: now,
                expires_at: now,
            };
            match self.requeue_or_fail(&orphaned, "lease lost".to_string(), None)? {
                Some(job) if job.state == JobState::Failed => report.failed.push(job.id),
                Some(job) => report.requeued.push(job.id),
                None => report.dropped += 1,
            }
        }
        Ok(())
    }

    /// One reaper sweep: reclaim expired leases, finish any dependency
    /// resolution a failed propagation left behind, forget silent workers
    /// and drop finished jobs past retention.
    pub fn reap_expired(&self) -> Result<ReapReport> {
        self.store.health()?;
        let now = self.clock.now();
        let mut report = ReapReport::default();

        for lease in self.leases.expired(now) {
            if !self.leases.reclaim(&lease) {
                // Renewed or released since we looked.
                continue;
            }
            match self.requeue_or_fail(&lease, "lease expired".to_string(), None) {
                Ok(Some(job)) if job.state == JobState::Failed => report.failed.push(job.id),
                Ok(Some(job)) => report.requeued.push(job.id),
                Ok(None) | Err(SchedulerError::JobNotFound(_)) => report.dropped += 1,
                Err(e) => {
                    self.restore_lease(lease, &e);
                    return Err(e);
                }
            }
        }

        self.reconcile_orphans(&mut report)?;

        let pending = self.store.list(&JobFilter {
            state: Some(JobState::Pending),
            project_id: None,
        })?;
        for job in pending {
            if self.dispatcher.evaluate(&job.id)?.state != JobState::Pending {
                report.resolved += 1;
            }
        }

        self.workers.prune(now);

        if let Some(retention_ms) = self.config.retention_ms {
            let cutoff = now - chrono::Duration::milliseconds(retention_ms as i64);
            report.removed = self.store.remove_terminal_before(cutoff)?;
        }

        if !report.is_empty() {
            tracing::info!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                dropped = report.dropped,
                resolved = report.resolved,
                removed = report.removed,
                "Reaper sweep"
            );
        }
        Ok(report)
    }
}
