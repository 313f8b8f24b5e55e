//! Scheduling core.
//!
//! - [`store`]: Job Store, compare-and-swap per job, audit trail
//! - [`lease`]: Lease Manager, exclusive time-bounded claims
//! - [`dispatcher`]: dependency resolution and per-project fairness
//! - [`registry`]: worker liveness bookkeeping
//! - [`reaper`]: periodic reclamation of expired leases
//! - [`service`]: [`Scheduler`], the composition the API and workers talk to

pub mod dispatcher;
pub mod job;
pub mod lease;
pub mod reaper;
pub mod registry;
pub mod service;
pub mod store;

pub use job::{Job, JobKind, JobSpec, JobState, Outcome};
pub use lease::{Lease, LeaseManager};
pub use reaper::Reaper;
pub use service::{Grant, ReapReport, Scheduler};
pub use store::{JobFilter, JobStore, MemoryJobStore, StateChange, TransitionEvent};
