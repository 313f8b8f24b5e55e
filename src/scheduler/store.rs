//! Job Store: the single source of truth for job lifecycle.
//!
//! Every record is updated with compare-and-swap on its `state`. Callers pass
//! the state they observed; if another writer got there first the update is
//! rejected with [`SchedulerError::Conflict`] and the caller re-reads. Records
//! live in a sharded concurrent map, so an update only ever locks the shard
//! holding that one job.
//!
//! Each transition appends an audit entry and is published on a broadcast
//! channel for the telemetry exporter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{Job, JobState};

/// A requested state transition plus the metadata that travels with it.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub to: JobState,
    pub worker_id: Option<String>,
    pub bump_attempt: bool,
    pub result_ref: Option<String>,
    pub reason: Option<String>,
}

impl StateChange {
    pub fn to(state: JobState) -> Self {
        Self {
            to: state,
            worker_id: None,
            bump_attempt: false,
            result_ref: None,
            reason: None,
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn bump_attempt(mut self) -> Self {
        self.bump_attempt = true;
        self
    }

    pub fn with_result_ref(mut self, result_ref: Option<String>) -> Self {
        self.result_ref = result_ref;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// One entry of a job's audit trail, also the telemetry event shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub job_id: Uuid,
    pub project_id: String,
    /// `None` for the submission record
    pub from_state: Option<JobState>,
    pub to_state: JobState,
    pub timestamp: DateTime<Utc>,
    pub worker_id: Option<String>,
    pub attempt_count: u32,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub project_id: Option<String>,
}

pub trait JobStore: Send + Sync {
    /// Store a new job in `pending`. Assigns the submission sequence.
    fn insert(&self, job: Job) -> Result<Job>;

    fn get(&self, id: &Uuid) -> Result<Job>;

    /// Compare-and-swap on `state`.
    fn update_state(&self, id: &Uuid, expected: JobState, change: StateChange) -> Result<Job>;

    /// Ready jobs in submission order.
    fn list_ready(&self, project_id: Option<&str>) -> Result<Vec<Job>>;

    /// Jobs matching `filter` in submission order.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Jobs that list `id` as a dependency.
    fn dependents_of(&self, id: &Uuid) -> Result<Vec<Uuid>>;

    fn history(&self, id: &Uuid) -> Result<Vec<TransitionEvent>>;

    fn subscribe(&self) -> broadcast::Receiver<TransitionEvent>;

    /// Fails when the store cannot be trusted; no leases are granted then.
    fn health(&self) -> Result<()>;

    /// Drop terminal jobs last updated before `cutoff`. Returns how many were removed.
    fn remove_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory [`JobStore`].
#[derive(Debug)]
pub struct MemoryJobStore {
    jobs: DashMap<Uuid, Job>,
    dependents: DashMap<Uuid, Vec<Uuid>>,
    audit: DashMap<Uuid, Vec<TransitionEvent>>,
    next_seq: AtomicU64,
    max_jobs: usize,
    available: AtomicBool,
    events: broadcast::Sender<TransitionEvent>,
    clock: SharedClock,
}

impl MemoryJobStore {
    pub fn new(max_jobs: usize, event_capacity: usize, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            jobs: DashMap::new(),
            dependents: DashMap::new(),
            audit: DashMap::new(),
            next_seq: AtomicU64::new(1),
            max_jobs,
            available: AtomicBool::new(true),
            events,
            clock,
        }
    }

    /// Mark the store unusable (or usable again). While unavailable every
    /// operation fails with [`SchedulerError::StoreUnavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            tracing::info!("Job store marked available");
        } else {
            tracing::error!("Job store marked unavailable, refusing operations");
        }
    }

    fn record(&self, event: TransitionEvent) {
        self.audit
            .entry(event.job_id)
            .or_default()
            .push(event.clone());
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, mut job: Job) -> Result<Job> {
        self.health()?;
        if self.jobs.len() >= self.max_jobs {
            return Err(SchedulerError::QueueFull);
        }

        job.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        job.state = JobState::Pending;

        match self.jobs.entry(job.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SchedulerError::Internal(format!(
                    "duplicate job id {}",
                    job.id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(job.clone());
                self.record(TransitionEvent {
                    job_id: job.id,
                    project_id: job.project_id.clone(),
                    from_state: None,
                    to_state: JobState::Pending,
                    timestamp: job.created_at,
                    worker_id: None,
                    attempt_count: 0,
                    reason: None,
                });
            }
        }

        for dep in &job.dependencies {
            self.dependents.entry(*dep).or_default().push(job.id);
        }

        Ok(job)
    }

    fn get(&self, id: &Uuid) -> Result<Job> {
        self.health()?;
        self.jobs
            .get(id)
            .map(|j| j.clone())
            .ok_or(SchedulerError::JobNotFound(*id))
    }

    fn update_state(&self, id: &Uuid, expected: JobState, change: StateChange) -> Result<Job> {
        self.health()?;
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or(SchedulerError::JobNotFound(*id))?;
        let job = entry.value_mut();

        if job.state != expected {
            return Err(SchedulerError::Conflict {
                job_id: *id,
                expected,
                actual: job.state,
            });
        }
        if !expected.can_transition_to(change.to) {
            return Err(SchedulerError::InvalidTransition {
                job_id: *id,
                from: expected,
                to: change.to,
            });
        }

        let now = self.clock.now();
        job.state = change.to;
        job.updated_at = now;
        if change.bump_attempt {
            job.attempt_count += 1;
        }
        if change.worker_id.is_some() {
            job.worker_id = change.worker_id.clone();
        }
        if change.result_ref.is_some() {
            job.result_ref = change.result_ref.clone();
        }
        if change.reason.is_some() {
            job.failure_reason = change.reason.clone();
        }
        let updated = job.clone();

        // Audit is appended under the job's guard so entries stay in transition order.
        self.record(TransitionEvent {
            job_id: *id,
            project_id: updated.project_id.clone(),
            from_state: Some(expected),
            to_state: change.to,
            timestamp: now,
            worker_id: change.worker_id,
            attempt_count: updated.attempt_count,
            reason: change.reason,
        });
        drop(entry);

        Ok(updated)
    }

    fn list_ready(&self, project_id: Option<&str>) -> Result<Vec<Job>> {
        self.list(&JobFilter {
            state: Some(JobState::Ready),
            project_id: project_id.map(str::to_string),
        })
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.health()?;
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| filter.state.map_or(true, |s| j.state == s))
            .filter(|j| {
                filter
                    .project_id
                    .as_deref()
                    .map_or(true, |p| j.project_id == p)
            })
            .map(|j| j.clone())
            .collect();
        jobs.sort_by_key(|j| j.seq);
        Ok(jobs)
    }

    fn dependents_of(&self, id: &Uuid) -> Result<Vec<Uuid>> {
        self.health()?;
        Ok(self
            .dependents
            .get(id)
            .map(|d| d.clone())
            .unwrap_or_default())
    }

    fn history(&self, id: &Uuid) -> Result<Vec<TransitionEvent>> {
        self.health()?;
        if !self.jobs.contains_key(id) {
            return Err(SchedulerError::JobNotFound(*id));
        }
        Ok(self.audit.get(id).map(|a| a.clone()).unwrap_or_default())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    fn health(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SchedulerError::StoreUnavailable(
                "job store marked unavailable".to_string(),
            ))
        }
    }

    fn remove_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.health()?;
        let expired: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|j| j.state.is_terminal() && j.updated_at < cutoff)
            .map(|j| j.id)
            .collect();

        let mut removed = 0;
        for id in expired {
            if let Some((_, job)) = self
                .jobs
                .remove_if(&id, |_, j| j.state.is_terminal() && j.updated_at < cutoff)
            {
                self.audit.remove(&id);
                self.dependents.remove(&id);
                for dep in &job.dependencies {
                    if let Some(mut list) = self.dependents.get_mut(dep) {
                        list.retain(|d| *d != id);
                    }
                }
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }
}
