//! Worker side of the scheduler.
//!
//! A worker agent long-polls for leases, runs the task behind each one and
//! reports the outcome:
//! - **Client**: [`SchedulerClient`] over HTTP or in-process
//! - **Execution**: [`TaskExecutor`], with [`CommandExecutor`] running a shell command per kind
//! - **Heartbeat**: renews the lease at a third of its TTL while the task runs
//!
//! # Lease loss
//!
//! When a renew answers that the lease is gone, the running task is aborted
//! and its result is dropped. Release is never called on a lost lease.

pub mod agent;
pub mod client;
pub mod executor;
pub mod heartbeat;

pub use agent::{AgentStats, JobReport, WorkerAgent};
pub use client::{HttpSchedulerClient, LocalSchedulerClient, SchedulerClient};
pub use executor::{CommandExecutor, ExecutionResult, TaskExecutor};
pub use heartbeat::HeartbeatSender;
