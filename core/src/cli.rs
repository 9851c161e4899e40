use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::application::{Application, InitBuilder};
use crate::shutdown::install_shutdown_handler;
use crate::services::ScheduleRequest;
use crate::store::ScheduleStore;
use crate::types::{JobListFilter, JobState};
use crate::worker::LoggingExecutor;

#[derive(Debug, Parser)]
#[command(name = "qsched")]
#[command(about = "qsched - per-queue serialized job scheduler", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run database migrations
    Migrate,

    /// Schedule a job on a queue
    Schedule {
        /// Queue key; jobs sharing it never run concurrently
        #[arg(short = 'q', long = "queue")]
        queue: String,

        /// Due time in Unix seconds
        #[arg(long, conflicts_with = "delay", required_unless_present = "delay")]
        at: Option<i64>,

        /// Due time as seconds from now
        #[arg(long = "in", value_name = "SECS")]
        delay: Option<i64>,

        /// Action to execute
        #[arg(short = 'a', long = "action")]
        action: String,
    },

    /// Run a worker pool until interrupted
    Worker {
        /// Number of workers (default: worker.count)
        #[arg(short = 'w', long)]
        workers: Option<usize>,

        /// Seconds between claim attempts per worker
        #[arg(long, value_name = "SECS")]
        poll_interval: Option<u64>,
    },

    /// Run the heartbeat monitor until interrupted
    Monitor {
        /// Seconds between scans
        #[arg(long, value_name = "SECS")]
        poll_interval: Option<u64>,

        /// Claims older than this many seconds are renewed
        #[arg(long, value_name = "SECS")]
        max_running: Option<u64>,
    },

    /// Run a worker pool and the heartbeat monitor in one process
    Run {
        /// Number of workers (default: worker.count)
        #[arg(short = 'w', long)]
        workers: Option<usize>,
    },

    /// Get the status of a job
    Status {
        /// Job ID to query
        job_id: i64,
    },

    /// List jobs
    List {
        /// Filter by queue
        #[arg(short = 'q', long = "queue")]
        queue: Option<String>,

        /// Filter by state: new, running, done
        #[arg(short = 's', long = "state")]
        state: Option<JobState>,

        /// Number of results (default: 20)
        #[arg(short = 'l', long = "limit", default_value = "20")]
        limit: i64,
    },
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

async fn connect(cli: &Cli, auto_migrate: bool) -> Result<Application> {
    let mut builder = InitBuilder::new().auto_migrate(auto_migrate);
    if let Some(url) = &cli.database_url {
        builder = builder.database_url(url.clone());
    }
    if let Some(path) = &cli.config {
        builder = builder.config_path(path.clone());
    }
    builder.init().await
}

/// Unix timestamp `delay` seconds after `now`.
fn due_in(now: i64, delay: i64) -> Result<i64> {
    match now.checked_add(delay) {
        Some(timestamp) => Ok(timestamp),
        None => bail!("--in {} is out of range", delay),
    }
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Migrate => {
            println!("Running migrations...");
            connect(&cli, true).await?;
            println!("Migrations complete!");
        }

        Commands::Schedule {
            queue,
            at,
            delay,
            action,
        } => {
            let timestamp = match (at, delay) {
                (Some(at), _) => *at,
                (None, Some(delay)) => due_in(Utc::now().timestamp(), *delay)?,
                (None, None) => bail!("Either --at or --in is required"),
            };

            let app = connect(&cli, true).await?;
            let job = app
                .schedule_service
                .schedule_job(ScheduleRequest {
                    timestamp,
                    queue_key: queue.clone(),
                    action: action.clone(),
                })
                .await?;

            println!("✓ Job {} scheduled on queue {} at {}", job.id, job.queue_key, job.due_at);
        }

        Commands::Worker {
            workers,
            poll_interval,
        } => {
            let mut app = connect(&cli, true).await?;
            if let Some(secs) = poll_interval {
                app.config.worker.poll_interval_secs = *secs;
            }
            app.config.validate()?;
            let workers = workers.unwrap_or(app.config.worker.count);

            let shutdown = install_shutdown_handler().context("Failed to install signal handler")?;
            let pool = app.worker_pool(Arc::new(LoggingExecutor));
            pool.start(workers)?;

            shutdown.cancelled().await;
            pool.stop().await;
        }

        Commands::Monitor {
            poll_interval,
            max_running,
        } => {
            let mut app = connect(&cli, true).await?;
            if let Some(secs) = poll_interval {
                app.config.monitor.poll_interval_secs = *secs;
            }
            if let Some(secs) = max_running {
                app.config.monitor.max_running_secs = *secs;
            }
            app.config.validate()?;

            let shutdown = install_shutdown_handler().context("Failed to install signal handler")?;
            let monitor = app.heartbeat_monitor();
            monitor.start()?;

            shutdown.cancelled().await;
            monitor.stop().await;
        }

        Commands::Run { workers } => {
            let app = connect(&cli, true).await?;
            let workers = workers.unwrap_or(app.config.worker.count);

            let shutdown = install_shutdown_handler().context("Failed to install signal handler")?;
            let pool = app.worker_pool(Arc::new(LoggingExecutor));
            let monitor = app.heartbeat_monitor();
            pool.start(workers)?;
            monitor.start()?;
            info!(workers, "qsched running");

            shutdown.cancelled().await;
            monitor.stop().await;
            pool.stop().await;
        }

        Commands::Status { job_id } => {
            let app = connect(&cli, false).await?;
            let Some(job) = app.store.get_job(*job_id).await? else {
                bail!("Job {} not found", job_id);
            };

            println!("Job: {}", job.id);
            println!("Queue: {}", job.queue_key);
            println!("Action: {}", job.action);
            println!("State: {}", job.state);
            println!("Due: {}", job.due_at);
            if let Some(claimed_at) = job.last_claimed_at {
                println!("Claimed: {}", claimed_at);
            }

            if let Some(queue) = app.store.get_queue(&job.queue_key).await? {
                println!("Queue state: {}", queue.state);
            }
        }

        Commands::List {
            queue,
            state,
            limit,
        } => {
            let app = connect(&cli, false).await?;
            let filter = JobListFilter {
                queue_key: queue.clone(),
                state: *state,
                limit: Some(*limit),
            };

            let jobs = app.store.list_jobs(filter).await?;
            if jobs.is_empty() {
                println!("No jobs found");
                return Ok(());
            }

            println!("Found {} job(s):\n", jobs.len());
            for job in jobs {
                println!(
                    "  {} | {} | {} | {} | {}",
                    job.id, job.state, job.queue_key, job.due_at, job.action
                );
            }
        }
    }

    Ok(())
}
