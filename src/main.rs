use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use jobmgr_lite::api::{GoalStateApi, JobStatus};
use jobmgr_lite::backoff::BackoffPolicy;
use jobmgr_lite::config::{JobMgrConfig, SimulatedMasterConfig};
use jobmgr_lite::job::{GoalState, JobSpec};
use jobmgr_lite::manager::JobManager;
use jobmgr_lite::master::SimulatedMaster;
use jobmgr_lite::shutdown::install_shutdown_handler;
use jobmgr_lite::store::StateStore;

#[derive(Parser, Debug)]
#[command(name = "jobmgr-lite")]
#[command(version)]
#[command(about = "A job manager that reconciles task goal states against a resource master")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the job manager with an in-process resource master
    Server(ServerArgs),

    /// Job management commands, run directly against the state database
    Job {
        #[command(flatten)]
        store: StoreArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port for the HTTP goal-state API
    #[arg(long, default_value = "5392")]
    port: u16,

    /// SQLite database holding job and task state
    #[arg(long, default_value = "jobmgr.db")]
    db: PathBuf,

    /// Period of the reconcile sweep in milliseconds
    #[arg(long, default_value = "1000")]
    reconcile_interval_ms: u64,

    /// Seconds a task may stay LAUNCHING or KILLING before it is queried
    #[arg(long, default_value = "30")]
    transient_timeout_secs: u64,

    /// First retry delay after the master was unavailable, in milliseconds
    #[arg(long, default_value = "1000")]
    backoff_base_ms: u64,

    /// Upper bound on the retry delay, in milliseconds
    #[arg(long, default_value = "60000")]
    backoff_max_ms: u64,

    // === Simulated master ===
    /// Time a simulated instance spends launching
    #[arg(long, default_value = "200")]
    launch_delay_ms: u64,

    /// Time a simulated instance spends being killed
    #[arg(long, default_value = "200")]
    kill_delay_ms: u64,

    /// Launches asking for more CPUs than this are rejected
    #[arg(long, default_value = "32")]
    max_task_cpus: f64,
}

// =============================================================================
// Store Arguments (shared by job commands)
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// SQLite database holding job and task state
    #[arg(long, default_value = "jobmgr.db")]
    db: PathBuf,

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
    /// Create a job from a JSON job spec
    Create {
        /// Path to the job spec (JSON)
        file: PathBuf,
    },
    /// Show a job and its tasks
    Status {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// List all jobs
    List,
    /// Set the job's goal to KILLED
    Stop {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// Set the job's goal to RUNNING
    Start {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// Wait until every task of the job has reached a goal state
    Wait {
        /// The job ID (UUID)
        job_id: Uuid,

        /// Goal state to wait for (RUNNING or KILLED)
        #[arg(long, default_value = "RUNNING")]
        goal: GoalState,

        /// Give up after this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },
    /// Delete a job whose tasks have all stopped
    Delete {
        /// The job ID (UUID)
        job_id: Uuid,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobCreateOutput {
    job_id: Uuid,
}

#[derive(Serialize)]
struct GoalOutput {
    job_id: Uuid,
    goal_state: GoalState,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;

    let mut config = JobMgrConfig::new(args.db)
        .with_listen_addr(listen_addr)
        .with_backoff(BackoffPolicy::new(args.backoff_base_ms, args.backoff_max_ms));
    config.reconcile_interval_ms = args.reconcile_interval_ms;
    config.transient_timeout_ms = args.transient_timeout_secs.saturating_mul(1000);

    let master = SimulatedMaster::new(SimulatedMasterConfig {
        launch_delay_ms: args.launch_delay_ms,
        kill_delay_ms: args.kill_delay_ms,
        max_task_cpus: args.max_task_cpus,
        ..SimulatedMasterConfig::default()
    });

    tracing::info!(
        listen_addr = %config.listen_addr,
        db = %config.db_path.display(),
        "Starting jobmgr-lite"
    );

    let shutdown = install_shutdown_handler();
    let manager = JobManager::start(config, Arc::new(master)).await?;
    let served = manager.serve(shutdown).await;
    manager.shutdown().await;
    served?;

    Ok(())
}

// =============================================================================
// Job Command Handlers
// =============================================================================

fn print_status(status: &JobStatus, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(status)?),
        OutputFormat::Table => {
            println!("Job ID:     {}", status.job.id);
            println!("Name:       {}", status.job.spec.name);
            println!("Goal:       {}", status.job.goal_state);
            println!("Converged:  {}", status.converged);
            println!("Retries:    {}", status.retries);
            println!("Failures:   {}", status.failures);
            println!();
            println!(
                "{:<10} {:<12} {:<10} {:<8} {:<10} MESSAGE",
                "INSTANCE", "ACTUAL", "DESIRED", "RUN", "PENDING"
            );
            println!("{}", "-".repeat(70));
            for task in &status.tasks {
                println!(
                    "{:<10} {:<12} {:<10} {:<8} {:<10} {}",
                    task.id.instance,
                    task.actual,
                    task.desired,
                    task.run_id,
                    task.pending.as_ref().map(|p| p.kind()).unwrap_or("-"),
                    task.message.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

fn print_goal(
    job_id: Uuid,
    goal_state: GoalState,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&GoalOutput { job_id, goal_state })?
        ),
        OutputFormat::Table => println!("Job {} goal set to {}", job_id, goal_state),
    }
    Ok(())
}

async fn run_job_command(
    args: StoreArgs,
    command: JobCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = JobMgrConfig::new(&args.db);
    let store = Arc::new(StateStore::open(&config.db_path)?);
    let api = GoalStateApi::new(store, &config);
    let output = args.output;

    match command {
        JobCommands::Create { file } => {
            let raw = tokio::fs::read_to_string(&file).await?;
            let spec: JobSpec = serde_json::from_str(&raw)?;
            let job_id = api.create(spec)?;
            match output {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&JobCreateOutput { job_id })?
                ),
                OutputFormat::Table => {
                    println!("Job created successfully!");
                    println!("Job ID: {}", job_id);
                }
            }
        }
        JobCommands::Status { job_id } => {
            print_status(&api.get_job(job_id)?, &output)?;
        }
        JobCommands::List => {
            let jobs = api.list_jobs()?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!(
                            "{:<38} {:<20} {:<10} {:<10}",
                            "JOB ID", "NAME", "INSTANCES", "GOAL"
                        );
                        println!("{}", "-".repeat(80));
                        for job in &jobs {
                            println!(
                                "{:<38} {:<20} {:<10} {:<10}",
                                job.id, job.name, job.instance_count, job.goal_state
                            );
                        }
                        println!();
                        println!("Total: {} jobs", jobs.len());
                    }
                }
            }
        }
        JobCommands::Stop { job_id } => {
            api.stop(job_id)?;
            print_goal(job_id, GoalState::Killed, &output)?;
        }
        JobCommands::Start { job_id } => {
            api.start(job_id)?;
            print_goal(job_id, GoalState::Running, &output)?;
        }
        JobCommands::Wait {
            job_id,
            goal,
            timeout_secs,
        } => {
            let status = api
                .wait_for_state(job_id, goal, Duration::from_secs(timeout_secs))
                .await?;
            print_status(&status, &output)?;
        }
        JobCommands::Delete { job_id } => {
            api.delete_job(job_id)?;
            if let OutputFormat::Table = output {
                println!("Job {} deleted", job_id);
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Job { store, command } => run_job_command(store, command).await,
    }
}
