use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use xeodocs_scheduler::api::types::JobResponse;
use xeodocs_scheduler::config::{SchedulerConfig, WorkerConfig};
use xeodocs_scheduler::node::Node;
use xeodocs_scheduler::scheduler::{JobFilter, JobKind, JobSpec, JobState};
use xeodocs_scheduler::shutdown::install_shutdown_handler;
use xeodocs_scheduler::worker::{CommandExecutor, HttpSchedulerClient, WorkerAgent};

#[derive(Parser, Debug)]
#[command(name = "xeodocs-scheduler")]
#[command(version)]
#[command(about = "Lease-based job scheduler for documentation build and translation jobs")]
#[command(propagate_version = true)]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler service
    Server(ServerArgs),

    /// Start a worker agent
    Worker(WorkerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<std::net::IpAddr>,

    /// Maximum lease cycles per job
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Consecutive grants one project may take while others wait
    #[arg(long)]
    fairness_window: Option<usize>,

    /// Reaper sweep interval in milliseconds
    #[arg(long)]
    reaper_interval_ms: Option<u64>,

    /// Worker config file for an in-process worker agent (repeatable)
    #[arg(long = "local-worker")]
    local_workers: Vec<PathBuf>,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Scheduler base URL
    #[arg(long)]
    scheduler: Option<String>,

    /// Job kinds this worker executes (repeatable)
    #[arg(long = "capability")]
    capabilities: Vec<JobKind>,

    /// Shell command for translation jobs
    #[arg(long)]
    translation_command: Option<String>,

    /// Shell command for build jobs
    #[arg(long)]
    build_command: Option<String>,

    /// Long-poll wait per acquire in milliseconds
    #[arg(long)]
    wait_ms: Option<u64>,

    /// Stable worker id (random when omitted)
    #[arg(long)]
    id: Option<String>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Scheduler base URL
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// Owning project
        #[arg(long, short = 'p')]
        project: String,

        /// translation or build
        #[arg(long, short = 'k')]
        kind: JobKind,

        /// Payload as a JSON document
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Job this one depends on (repeatable)
        #[arg(long = "depends-on")]
        dependencies: Vec<Uuid>,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// Cancel a job
    Cancel {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// List jobs
    List {
        /// Only jobs in this state
        #[arg(long)]
        state: Option<JobState>,

        /// Only jobs of this project
        #[arg(long, short = 'p')]
        project: Option<String>,
    },
    /// Show the transition history of a job
    History {
        /// The job ID (UUID)
        job_id: Uuid,
    },
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_job(job: &JobResponse) {
    println!("Job ID:          {}", job.id);
    println!("Project:         {}", job.project_id);
    println!("Kind:            {}", job.kind);
    println!("State:           {}", job.state);
    println!("Attempts:        {}/{}", job.attempt_count, job.max_attempts);
    if !job.dependencies.is_empty() {
        let deps: Vec<String> = job.dependencies.iter().map(|d| d.to_string()).collect();
        println!("Depends On:      {}", deps.join(", "));
    }
    if let Some(worker) = &job.worker_id {
        println!("Worker:          {}", worker);
    }
    if let Some(result_ref) = &job.result_ref {
        println!("Result:          {}", result_ref);
    }
    if let Some(reason) = &job.failure_reason {
        println!("Failure:         {}", reason);
    }
    println!("Created:         {}", job.created_at.to_rfc3339());
    println!("Updated:         {}", job.updated_at.to_rfc3339());
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Server and Worker Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SchedulerConfig::from_file(path)?,
        None => SchedulerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.listen_addr = SocketAddr::new(bind, config.listen_addr.port());
    }
    if let Some(port) = args.port {
        config.listen_addr.set_port(port);
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(window) = args.fairness_window {
        config.fairness_window = window;
    }
    if let Some(interval) = args.reaper_interval_ms {
        config.reaper_interval_ms = interval;
    }
    config.validate()?;

    let mut node = Node::new(config);
    for path in &args.local_workers {
        node = node.with_local_worker(WorkerConfig::from_file(path)?);
    }

    let shutdown = install_shutdown_handler();
    node.run(shutdown).await
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(url) = args.scheduler {
        config.scheduler_url = url;
    }
    if !args.capabilities.is_empty() {
        config.capabilities = args.capabilities;
    }
    if args.translation_command.is_some() {
        config.translation_command = args.translation_command;
    }
    if args.build_command.is_some() {
        config.build_command = args.build_command;
    }
    if let Some(wait_ms) = args.wait_ms {
        config.wait_ms = wait_ms;
    }
    config.validate()?;

    let client = Arc::new(HttpSchedulerClient::new(config.scheduler_url.clone())?);
    let executor = Arc::new(CommandExecutor::from_config(&config));
    let mut agent = WorkerAgent::from_config(&config, client, executor);
    if let Some(id) = args.id {
        agent = agent.with_id(id);
    }

    tracing::info!(
        worker_id = %agent.id(),
        scheduler_url = %config.scheduler_url,
        "Starting worker"
    );
    let shutdown = install_shutdown_handler();
    let stats = agent.run(shutdown).await;
    tracing::info!(
        succeeded = stats.succeeded,
        failed = stats.failed,
        abandoned = stats.abandoned,
        "Worker exited"
    );
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_command(
    client: ClientArgs,
    command: JobCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let api = HttpSchedulerClient::new(client.addr)?;
    let output = client.output;

    match command {
        JobCommands::Submit {
            project,
            kind,
            payload,
            dependencies,
        } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)
                .map_err(|e| format!("--payload is not valid JSON: {}", e))?;
            let mut spec = JobSpec::new(project, kind).with_payload(payload);
            for dep in dependencies {
                spec = spec.depends_on(dep);
            }
            let resp = api.submit(&spec).await?;
            match output {
                OutputFormat::Json => print_json(&resp)?,
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", resp.id);
                    println!("State:  {}", resp.state);
                }
            }
        }
        JobCommands::Status { job_id } => {
            let job = api.status(job_id).await?;
            match output {
                OutputFormat::Json => print_json(&job)?,
                OutputFormat::Table => print_job(&job),
            }
        }
        JobCommands::Cancel { job_id } => {
            let job = api.cancel(job_id).await?;
            match output {
                OutputFormat::Json => print_json(&job)?,
                OutputFormat::Table => println!("Job {} is now {}", job.id, job.state),
            }
        }
        JobCommands::List { state, project } => {
            let filter = JobFilter {
                state,
                project_id: project,
            };
            let jobs = api.list(&filter).await?;
            match output {
                OutputFormat::Json => print_json(&jobs)?,
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!(
                            "{:<38} {:<16} {:<12} {:<10} ATTEMPTS",
                            "JOB ID", "PROJECT", "KIND", "STATE"
                        );
                        println!("{}", "-".repeat(88));
                        for job in &jobs {
                            let project = if job.project_id.chars().count() > 16 {
                                let head: String = job.project_id.chars().take(13).collect();
                                format!("{}...", head)
                            } else {
                                job.project_id.clone()
                            };
                            println!(
                                "{:<38} {:<16} {:<12} {:<10} {}/{}",
                                job.id,
                                project,
                                job.kind.to_string(),
                                job.state.to_string(),
                                job.attempt_count,
                                job.max_attempts
                            );
                        }
                        println!();
                        println!("{} jobs", jobs.len());
                    }
                }
            }
        }
        JobCommands::History { job_id } => {
            let events = api.history(job_id).await?;
            match output {
                OutputFormat::Json => print_json(&events)?,
                OutputFormat::Table => {
                    println!("{:<32} {:<10} {:<10} {:<8} WORKER", "TIME", "FROM", "TO", "ATTEMPT");
                    println!("{}", "-".repeat(80));
                    for event in &events {
                        let from = event
                            .from_state
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<32} {:<10} {:<10} {:<8} {}",
                            event.timestamp.to_rfc3339(),
                            from,
                            event.to_state.to_string(),
                            event.attempt_count,
                            event.worker_id.as_deref().unwrap_or("-")
                        );
                        if let Some(reason) = &event.reason {
                            println!("  reason: {}", reason);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            init_tracing(args.log_json);
            run_server(server_args).await?;
        }
        Commands::Worker(worker_args) => {
            init_tracing(args.log_json);
            run_worker(worker_args).await?;
        }
        Commands::Job { client, command } => {
            if let Err(e) = handle_job_command(client, command).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
