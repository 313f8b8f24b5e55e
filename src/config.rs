use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::scheduler::JobKind;

/// Lease time-to-live per job kind.
///
/// Translation jobs are usually short; builds render a whole documentation
/// tree and get a longer lease by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseTtlConfig {
    pub translation_ms: u64,
    pub build_ms: u64,
}

impl Default for LeaseTtlConfig {
    fn default() -> Self {
        Self {
            translation_ms: 30_000,
            build_ms: 120_000,
        }
    }
}

impl LeaseTtlConfig {
    pub fn for_kind(&self, kind: JobKind) -> Duration {
        let ms = match kind {
            JobKind::Translation => self.translation_ms,
            JobKind::Build => self.build_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn min_ms(&self) -> u64 {
        self.translation_ms.min(self.build_ms)
    }
}

/// Exponential backoff for transient failures (store conflicts, transport errors).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub listen_addr: SocketAddr,
    #[serde(rename = "lease_ttl_by_kind")]
    pub lease_ttl: LeaseTtlConfig,
    pub max_attempts: u32,
    pub reaper_interval_ms: u64,
    /// Consecutive grants a single project may receive while another
    /// project has matching ready work.
    pub fairness_window: usize,
    /// Long-poll wait used when an acquire request does not name one.
    pub default_wait_ms: u64,
    pub max_wait_ms: u64,
    pub max_jobs: usize,
    pub worker_timeout_ms: u64,
    /// Terminal jobs older than this are dropped by the reaper. `None` keeps them forever.
    pub retention_ms: Option<u64>,
    pub event_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
            lease_ttl: LeaseTtlConfig::default(),
            max_attempts: 3,
            reaper_interval_ms: 5_000,
            fairness_window: 1,
            default_wait_ms: 20_000,
            max_wait_ms: 60_000,
            max_jobs: 10_000,
            worker_timeout_ms: 60_000,
            retention_ms: None,
            event_capacity: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_lease_ttl(mut self, kind: JobKind, ttl_ms: u64) -> Self {
        match kind {
            JobKind::Translation => self.lease_ttl.translation_ms = ttl_ms,
            JobKind::Build => self.lease_ttl.build_ms = ttl_ms,
        }
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_reaper_interval_ms(mut self, interval_ms: u64) -> Self {
        self.reaper_interval_ms = interval_ms;
        self
    }

    pub fn with_fairness_window(mut self, window: usize) -> Self {
        self.fairness_window = window;
        self
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| SchedulerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SchedulerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl.min_ms() == 0 {
            return Err(SchedulerError::Config(
                "lease TTLs must be greater than zero".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(SchedulerError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.fairness_window == 0 {
            return Err(SchedulerError::Config(
                "fairness_window must be at least 1".to_string(),
            ));
        }
        // Bounds worst-case stall after a worker dies to roughly 1.5x TTL.
        if self.reaper_interval_ms == 0 || self.reaper_interval_ms > self.lease_ttl.min_ms() / 2 {
            return Err(SchedulerError::Config(format!(
                "reaper_interval_ms ({}) must be between 1 and half the minimum lease TTL ({})",
                self.reaper_interval_ms,
                self.lease_ttl.min_ms() / 2
            )));
        }
        if self.default_wait_ms > self.max_wait_ms {
            return Err(SchedulerError::Config(
                "default_wait_ms must not exceed max_wait_ms".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SchedulerError::Config(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

/// Configuration for a worker agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Base URL of the scheduler HTTP API, e.g. `http://127.0.0.1:8080`
    pub scheduler_url: String,
    /// Kinds this worker can execute
    pub capabilities: Vec<JobKind>,
    /// Shell command run for translation jobs (payload JSON on stdin)
    pub translation_command: Option<String>,
    /// Shell command run for build jobs (payload JSON on stdin)
    pub build_command: Option<String>,
    /// Long-poll wait sent with each acquire request
    pub wait_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scheduler_url: "http://127.0.0.1:8080".to_string(),
            capabilities: vec![JobKind::Translation, JobKind::Build],
            translation_command: None,
            build_command: None,
            wait_ms: 20_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn command_for(&self, kind: JobKind) -> Option<&str> {
        match kind {
            JobKind::Translation => self.translation_command.as_deref(),
            JobKind::Build => self.build_command.as_deref(),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| SchedulerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SchedulerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler_url.is_empty() {
            return Err(SchedulerError::Config("scheduler_url is required".to_string()));
        }
        if self.capabilities.is_empty() {
            return Err(SchedulerError::Config(
                "a worker needs at least one capability".to_string(),
            ));
        }
        for kind in &self.capabilities {
            if self.command_for(*kind).is_none() {
                return Err(SchedulerError::Config(format!(
                    "no command configured for capability {}",
                    kind
                )));
            }
        }
        Ok(())
    }
}
