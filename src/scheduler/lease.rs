//! Lease Manager: time-bounded exclusive claims on jobs.
//!
//! Leases reference jobs by id only. Removing a lease record is the point at
//! which a holder (a releasing worker or the reaper) wins the right to move
//! the job out of `leased`; whoever fails to remove it must not touch the job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{Result, SchedulerError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: Uuid,
    pub worker_id: String,
    pub token: Uuid,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug)]
pub struct LeaseManager {
    /// job id -> current lease
    leases: DashMap<Uuid, Lease>,
    /// token -> job id
    tokens: DashMap<Uuid, Uuid>,
    clock: SharedClock,
}

impl LeaseManager {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            leases: DashMap::new(),
            tokens: DashMap::new(),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Grant a lease on `job_id` unless a live one exists. An expired lease
    /// is replaced and its token stops working.
    pub fn acquire(&self, job_id: Uuid, worker_id: &str, ttl: Duration) -> Result<Lease> {
        let now = self.clock.now();
        let lease = Lease {
            job_id,
            worker_id: worker_id.to_string(),
            token: Uuid::new_v4(),
            granted_at: now,
            expires_at: deadline(now, ttl),
        };

        match self.leases.entry(job_id) {
            Entry::Occupied(mut slot) => {
                if !slot.get().is_expired(now) {
                    return Err(SchedulerError::AlreadyLeased(job_id));
                }
                let stale = slot.insert(lease.clone());
                self.tokens.remove(&stale.token);
                tracing::debug!(
                    job_id = %job_id,
                    stale_worker = %stale.worker_id,
                    "Replaced expired lease"
                );
            }
            Entry::Vacant(slot) => {
                slot.insert(lease.clone());
            }
        }
        self.tokens.insert(lease.token, job_id);

        Ok(lease)
    }

    /// Extend a live lease by `ttl` from now.
    pub fn renew(&self, token: &Uuid, ttl: Duration) -> Result<Lease> {
        let job_id = self.job_for_token(token)?;
        let now = self.clock.now();

        let mut lease = self
            .leases
            .get_mut(&job_id)
            .ok_or(SchedulerError::InvalidLease)?;
        if lease.token != *token {
            return Err(SchedulerError::InvalidLease);
        }
        if lease.is_expired(now) {
            return Err(SchedulerError::LeaseExpired(job_id));
        }
        lease.expires_at = deadline(now, ttl);
        Ok(lease.clone())
    }

    /// Look up the live lease behind `token` without changing it.
    pub fn validate(&self, token: &Uuid) -> Result<Lease> {
        let job_id = self.job_for_token(token)?;
        let lease = self
            .leases
            .get(&job_id)
            .map(|l| l.clone())
            .ok_or(SchedulerError::InvalidLease)?;
        if lease.token != *token {
            return Err(SchedulerError::InvalidLease);
        }
        if lease.is_expired(self.clock.now()) {
            return Err(SchedulerError::LeaseExpired(job_id));
        }
        Ok(lease)
    }

    /// Remove the live lease behind `token`. Only one caller can succeed per
    /// grant; a second release with the same token is `InvalidLease`. An
    /// expired lease is left for the reaper.
    pub fn release(&self, token: &Uuid) -> Result<Lease> {
        let job_id = self.job_for_token(token)?;
        let now = self.clock.now();

        let removed = self
            .leases
            .remove_if(&job_id, |_, l| l.token == *token && !l.is_expired(now));
        match removed {
            Some((_, lease)) => {
                self.tokens.remove(token);
                Ok(lease)
            }
            None => match self.leases.get(&job_id) {
                Some(l) if l.token == *token => Err(SchedulerError::LeaseExpired(job_id)),
                _ => {
                    self.tokens.remove(token);
                    Err(SchedulerError::InvalidLease)
                }
            },
        }
    }

    /// Remove `lease` if it is still the current grant for its job.
    pub fn reclaim(&self, lease: &Lease) -> bool {
        let removed = self
            .leases
            .remove_if(&lease.job_id, |_, l| l.token == lease.token)
            .is_some();
        if removed {
            self.tokens.remove(&lease.token);
        }
        removed
    }

    /// Put back a lease whose holder removed it but then failed to move the
    /// job. Does nothing if the job has been leased again since.
    pub fn restore(&self, lease: Lease) -> bool {
        match self.leases.entry(lease.job_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                self.tokens.insert(lease.token, lease.job_id);
                slot.insert(lease);
                true
            }
        }
    }

    /// Whether any lease record, live or expired, exists on `job_id`.
    pub fn contains(&self, job_id: &Uuid) -> bool {
        self.leases.contains_key(job_id)
    }

    /// Drop whatever lease exists on `job_id`.
    pub fn revoke(&self, job_id: &Uuid) -> Option<Lease> {
        let (_, lease) = self.leases.remove(job_id)?;
        self.tokens.remove(&lease.token);
        Some(lease)
    }

    /// Leases past their deadline at `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<Lease> {
        self.leases
            .iter()
            .filter(|l| l.is_expired(now))
            .map(|l| l.clone())
            .collect()
    }

    /// The live lease on `job_id`, if any.
    pub fn active(&self, job_id: &Uuid) -> Option<Lease> {
        let now = self.clock.now();
        self.leases
            .get(job_id)
            .filter(|l| !l.is_expired(now))
            .map(|l| l.clone())
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    fn job_for_token(&self, token: &Uuid) -> Result<Uuid> {
        self.tokens
            .get(token)
            .map(|j| *j)
            .ok_or(SchedulerError::InvalidLease)
    }
}
