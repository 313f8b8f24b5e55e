//! Queue/Dispatcher: dependency resolution and fair ordering of ready jobs.
//!
//! Dependencies are only checked at the `pending -> ready` edge. Once jobs
//! are ready the only ordering promise is the fairness policy: projects are
//! served round-robin in project-id order, each getting up to
//! `fairness_window` consecutive grants while others wait, and jobs within a
//! project go out in submission order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{Job, JobKind, JobState};
use crate::scheduler::store::{JobStore, StateChange};

#[derive(Debug, Default)]
struct FairnessCursor {
    last_project: Option<String>,
    streak: usize,
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    fairness_window: usize,
    cursor: Mutex<FairnessCursor>,
    ready: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, fairness_window: usize) -> Self {
        Self {
            store,
            fairness_window: fairness_window.max(1),
            cursor: Mutex::new(FairnessCursor::default()),
            ready: Arc::new(Notify::new()),
        }
    }

    /// Signal woken whenever a job becomes ready.
    pub fn ready_signal(&self) -> Arc<Notify> {
        self.ready.clone()
    }

    pub fn notify_ready(&self) {
        self.ready.notify_waiters();
    }

    /// Order `ready` jobs for a worker with `capabilities`. Jobs of other
    /// kinds are dropped. The first entry is the one to try first.
    pub fn order_candidates(&self, ready: Vec<Job>, capabilities: &[JobKind]) -> Vec<Job> {
        let mut by_project: BTreeMap<String, VecDeque<Job>> = BTreeMap::new();
        for job in ready {
            if job.state == JobState::Ready && capabilities.contains(&job.kind) {
                by_project
                    .entry(job.project_id.clone())
                    .or_default()
                    .push_back(job);
            }
        }
        for queue in by_project.values_mut() {
            queue.make_contiguous().sort_by_key(|j| j.seq);
        }
        if by_project.is_empty() {
            return Vec::new();
        }

        let projects: Vec<String> = by_project.keys().cloned().collect();
        let (start, first_quota) = {
            let cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
            match cursor.last_project.as_deref() {
                Some(last) if cursor.streak < self.fairness_window => {
                    match projects.iter().position(|p| p == last) {
                        Some(idx) => (idx, self.fairness_window - cursor.streak),
                        None => (next_after(&projects, last), self.fairness_window),
                    }
                }
                Some(last) => (next_after(&projects, last), self.fairness_window),
                None => (0, self.fairness_window),
            }
        };

        let mut ordered = Vec::new();
        let mut quota = first_quota;
        let mut idx = start;
        while !by_project.is_empty() {
            let project = &projects[idx % projects.len()];
            if let Some(queue) = by_project.get_mut(project) {
                for _ in 0..quota {
                    match queue.pop_front() {
                        Some(job) => ordered.push(job),
                        None => break,
                    }
                }
                if queue.is_empty() {
                    by_project.remove(project);
                }
            }
            quota = self.fairness_window;
            idx += 1;
        }
        ordered
    }

    /// Advance the fairness cursor after `project_id` received a lease.
    pub fn record_grant(&self, project_id: &str) {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        if cursor.last_project.as_deref() == Some(project_id) {
            cursor.streak += 1;
        } else {
            cursor.last_project = Some(project_id.to_string());
            cursor.streak = 1;
        }
    }

    /// Re-check a pending job's dependencies and move it to `ready` or
    /// `failed` accordingly. Returns the job as it stands afterwards.
    pub fn evaluate(&self, job_id: &Uuid) -> Result<Job> {
        loop {
            let job = self.store.get(job_id)?;
            if job.state != JobState::Pending {
                return Ok(job);
            }

            let mut satisfied = true;
            let mut broken: Option<String> = None;
            for dep_id in &job.dependencies {
                match self.store.get(dep_id) {
                    Ok(dep) => match dep.state {
                        JobState::Succeeded => {}
                        JobState::Failed | JobState::Cancelled => {
                            broken = Some(format!("dependency {} {}", dep_id, dep.state));
                            break;
                        }
                        _ => satisfied = false,
                    },
                    Err(SchedulerError::JobNotFound(_)) => {
                        broken = Some(format!("dependency {} no longer exists", dep_id));
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            let change = match (broken, satisfied) {
                (Some(reason), _) => StateChange::to(JobState::Failed).with_reason(reason),
                (None, true) => StateChange::to(JobState::Ready),
                (None, false) => return Ok(job),
            };
            let target = change.to;

            match self.store.update_state(job_id, JobState::Pending, change) {
                Ok(updated) => {
                    if target == JobState::Ready {
                        tracing::info!(
                            job_id = %job_id,
                            project_id = %updated.project_id,
                            "Dependencies satisfied, job ready"
                        );
                        self.notify_ready();
                    } else {
                        tracing::warn!(
                            job_id = %job_id,
                            reason = ?updated.failure_reason,
                            "Job failed on dependency"
                        );
                        self.fail_dependents(job_id)?;
                    }
                    return Ok(updated);
                }
                // Someone else moved it; re-read and decide again.
                Err(SchedulerError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Called after `job_id` succeeded: promote dependents whose
    /// dependencies are now all satisfied. Returns the promoted ids.
    pub fn resolve_dependents(&self, job_id: &Uuid) -> Result<Vec<Uuid>> {
        let mut promoted = Vec::new();
        for dependent in self.store.dependents_of(job_id)? {
            match self.evaluate(&dependent) {
                Ok(job) if job.state == JobState::Ready => promoted.push(dependent),
                Ok(_) => {}
                Err(SchedulerError::JobNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(promoted)
    }

    /// Called after `job_id` reached `failed` or `cancelled`: every pending
    /// job downstream of it fails. Returns the ids that were failed.
    pub fn fail_dependents(&self, job_id: &Uuid) -> Result<Vec<Uuid>> {
        let root = self.store.get(job_id)?;
        let mut failed = Vec::new();
        let mut stack = vec![(root.id, root.state)];

        while let Some((upstream, upstream_state)) = stack.pop() {
            for dependent in self.store.dependents_of(&upstream)? {
                let reason = format!("dependency {} {}", upstream, upstream_state);
                if self.fail_if_pending(&dependent, reason)? {
                    failed.push(dependent);
                    stack.push((dependent, JobState::Failed));
                }
            }
        }

        if !failed.is_empty() {
            tracing::warn!(
                job_id = %job_id,
                failed = failed.len(),
                "Propagated failure to dependent jobs"
            );
        }
        Ok(failed)
    }

    fn fail_if_pending(&self, job_id: &Uuid, reason: String) -> Result<bool> {
        loop {
            let job = match self.store.get(job_id) {
                Ok(job) => job,
                Err(SchedulerError::JobNotFound(_)) => return Ok(false),
                Err(e) => return Err(e),
            };
            if job.state != JobState::Pending {
                return Ok(false);
            }
            let change = StateChange::to(JobState::Failed).with_reason(reason.clone());
            match self.store.update_state(job_id, JobState::Pending, change) {
                Ok(_) => return Ok(true),
                Err(SchedulerError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn next_after(projects: &[String], last: &str) -> usize {
    projects
        .iter()
        .position(|p| p.as_str() > last)
        .unwrap_or(0)
}
