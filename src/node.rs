use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{run_server, ApiState};
use crate::clock::SystemClock;
use crate::config::{SchedulerConfig, WorkerConfig};
use crate::scheduler::{Reaper, Scheduler};
use crate::telemetry;
use crate::worker::{CommandExecutor, LocalSchedulerClient, WorkerAgent};

/// A scheduler process: the HTTP API plus its background tasks.
pub struct Node {
    pub config: SchedulerConfig,
    pub scheduler: Arc<Scheduler>,
    local_workers: Vec<WorkerConfig>,
}

impl Node {
    pub fn new(config: SchedulerConfig) -> Self {
        let scheduler = Arc::new(Scheduler::in_memory(
            config.clone(),
            Arc::new(SystemClock),
        ));
        Self {
            config,
            scheduler,
            local_workers: Vec::new(),
        }
    }

    /// Run a worker agent inside this process, talking to the scheduler directly.
    pub fn with_local_worker(mut self, worker: WorkerConfig) -> Self {
        self.local_workers.push(worker);
        self
    }

    /// Run the node until `shutdown` fires.
    ///
    /// 1. Spawns the telemetry exporter (subscribes before anything is submitted)
    /// 2. Spawns the reaper
    /// 3. Spawns any in-process worker agents
    /// 4. Runs the HTTP API (blocks until shutdown)
    ///
    /// Background tasks are joined after the server stops so in-flight jobs
    /// on local workers get released.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        let exporter = telemetry::spawn_exporter(self.scheduler.store().subscribe(), shutdown.clone());
        let reaper = Reaper::new(self.scheduler.clone()).spawn(shutdown.clone());

        let mut agents = Vec::with_capacity(self.local_workers.len());
        for worker in &self.local_workers {
            let agent = WorkerAgent::from_config(
                worker,
                Arc::new(LocalSchedulerClient::new(self.scheduler.clone())),
                Arc::new(CommandExecutor::from_config(worker)),
            );
            tracing::info!(worker_id = %agent.id(), "Starting local worker");
            let token = shutdown.clone();
            agents.push(tokio::spawn(async move { agent.run(token).await }));
        }

        tracing::info!(
            listen_addr = %self.config.listen_addr,
            max_attempts = self.config.max_attempts,
            fairness_window = self.config.fairness_window,
            reaper_interval_ms = self.config.reaper_interval_ms,
            local_workers = agents.len(),
            "Starting scheduler node"
        );

        let served = run_server(
            self.config.listen_addr,
            ApiState::new(self.scheduler.clone()),
            shutdown.clone(),
        )
        .await;
        // A bind failure must still stop the background tasks.
        shutdown.cancel();

        for agent in agents {
            if let Err(e) = agent.await {
                tracing::error!(error = %e, "Local worker task failed");
            }
        }
        if let Err(e) = reaper.await {
            tracing::error!(error = %e, "Reaper task failed");
        }
        match exporter.await {
            Ok(exported) => tracing::info!(exported, "Telemetry exporter stopped"),
            Err(e) => tracing::error!(error = %e, "Telemetry exporter failed"),
        }

        served?;
        tracing::info!("Scheduler node stopped");
        Ok(())
    }
}
