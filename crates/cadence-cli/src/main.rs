mod config;
mod config_watcher;

use cadence_core::{JobInput, JobStatus, Phase};
use cadence_orchestrator::{
    CommandBackend, EventBus, JobService, Ledger, Orchestrator, SystemResources,
};
use cadence_store::{FileStateStore, JobFilter, StateStore};
use clap::{Parser, Subcommand};
use config::{parse_config, CadenceConfig, LoggingConfig};
use config_watcher::ConfigWatcher;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

#[derive(Parser)]
#[command(name = "cadence", about = "Cadence: phased orchestration of coding-agent workers")]
struct Cli {
    /// Path to config file. A missing file means all defaults.
    #[arg(short, long, default_value = "cadence.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until interrupted
    Serve {
        /// Concurrent job limit (overrides config)
        #[arg(long)]
        max_jobs: Option<usize>,
    },
    /// Create and steer jobs
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Show the job capacity this host supports
    Estimate,
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a new job
    Create {
        /// What the workers should build
        prompt: String,
        /// Repository the artifacts are committed to (defaults to the current directory)
        #[arg(long)]
        repo: Option<PathBuf>,
        /// Workers per phase
        #[arg(short, long)]
        parallelism: Option<u32>,
        /// Constraint copied into every task (repeatable)
        #[arg(long = "constraint")]
        constraints: Vec<String>,
        #[arg(long)]
        main_branch: Option<String>,
        #[arg(long)]
        develop_branch: Option<String>,
    },
    /// List jobs, oldest first
    List {
        /// Keep only jobs in this status (repeatable)
        #[arg(long, value_parser = parse_status)]
        status: Vec<JobStatus>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print one job, or its full dashboard
    Show {
        job_id: String,
        /// Include tasks, reports, traces and retry state
        #[arg(long)]
        full: bool,
    },
    /// Approve the phase a job is waiting on
    Approve {
        job_id: String,
        #[arg(value_parser = parse_phase)]
        phase: Phase,
    },
    /// Send a phase back for rework
    Reject {
        job_id: String,
        #[arg(value_parser = parse_phase)]
        phase: Phase,
        /// Why the phase is rejected; handed to the next planning round
        #[arg(short, long)]
        reason: String,
    },
    /// Cancel a job
    Cancel { job_id: String },
}

fn parse_phase(value: &str) -> Result<Phase, String> {
    value.parse()
}

fn parse_status(value: &str) -> Result<JobStatus, String> {
    value.parse()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_found = cli.config.exists();
    let config = if config_found {
        parse_config(&cli.config)?
    } else {
        CadenceConfig::default()
    };

    let log_handle = init_logging(&config.logging);
    if !config_found {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Serve { max_jobs } => {
            let _watcher = if config_found {
                Some(watch_log_level(&cli.config, log_handle)?)
            } else {
                None
            };
            serve(&config, max_jobs).await?;
        }
        Commands::Job { action } => {
            let service = open_service(&config).await?;
            run_job_action(&service, action).await?;
        }
        Commands::Estimate => {
            let resources = SystemResources::detect();
            let max_jobs = config.resolve_max_jobs();
            print_json(&serde_json::json!({
                "free_memory_gb": resources.free_memory_gb,
                "cpu_count": resources.cpu_count,
                "max_jobs": max_jobs,
            }))?;
        }
    }

    Ok(())
}

type LogHandle = reload::Handle<EnvFilter, Registry>;

/// `RUST_LOG` when set, otherwise the configured level.
fn init_logging(logging: &LoggingConfig) -> LogHandle {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let (filter, handle) = reload::Layer::new(filter);

    let output = if logging.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .init();

    handle
}

fn watch_log_level(path: &Path, handle: LogHandle) -> anyhow::Result<ConfigWatcher> {
    let pinned_by_env = std::env::var_os("RUST_LOG").is_some();
    let watcher = ConfigWatcher::start(path.to_path_buf(), 500, move |config| {
        if pinned_by_env {
            debug!("Config changed; log level is pinned by RUST_LOG");
            return;
        }
        let level = config.logging.level;
        match handle.reload(EnvFilter::new(&level)) {
            Ok(()) => info!(level = %level, "Log level reloaded"),
            Err(e) => warn!(error = %e, "Failed to reload log level"),
        }
    })?;
    Ok(watcher)
}

async fn serve(config: &CadenceConfig, max_jobs: Option<usize>) -> anyhow::Result<()> {
    let max_jobs = max_jobs
        .filter(|n| *n > 0)
        .unwrap_or_else(|| config.resolve_max_jobs());
    let orchestrator_config = config.orchestrator_config(max_jobs);

    let store: Arc<dyn StateStore> =
        Arc::new(FileStateStore::new(&config.orchestrator.state_dir).await?);
    let bus = EventBus::new();
    let backend = Arc::new(CommandBackend::new(
        config.worker.clone(),
        &config.orchestrator.tmp_dir,
    ));

    let mut events = bus.subscribe("*");
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(job_id = %event.job_id, event = event.name(), "Event");
        }
    });

    info!(
        state_dir = %config.orchestrator.state_dir.display(),
        tmp_dir = %config.orchestrator.tmp_dir.display(),
        max_jobs,
        "Starting Cadence orchestrator"
    );

    let orchestrator = Orchestrator::new(orchestrator_config, store, bus, backend);
    orchestrator
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await?;

    info!("Cadence orchestrator stopped");
    Ok(())
}

/// A service over the shared state directory. Events emitted here have no
/// subscribers; a running `serve` notices the change on its next tick.
async fn open_service(config: &CadenceConfig) -> anyhow::Result<JobService> {
    let store = FileStateStore::new(&config.orchestrator.state_dir).await?;
    let ledger = Ledger::new(Arc::new(store), EventBus::new());
    Ok(JobService::new(
        ledger,
        &config.orchestrator_config(config.orchestrator.max_jobs_hard_limit),
    ))
}

async fn run_job_action(service: &JobService, action: JobAction) -> anyhow::Result<()> {
    match action {
        JobAction::Create {
            prompt,
            repo,
            parallelism,
            constraints,
            main_branch,
            develop_branch,
        } => {
            let repo_root = match repo {
                Some(repo) => std::path::absolute(repo)?,
                None => std::env::current_dir()?,
            };
            let job = service
                .create_job(JobInput {
                    user_prompt: prompt,
                    repo_root,
                    parallelism,
                    constraints,
                    main_branch,
                    develop_branch,
                })
                .await?;
            info!(job_id = %job.job_id, "Job created");
            print_json(&job)?;
        }
        JobAction::List {
            status,
            offset,
            limit,
        } => {
            let filter = JobFilter {
                statuses: status,
                offset,
                limit,
            };
            for job in service.list_jobs(&filter).await? {
                let phase = job
                    .current_phase
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:<16} {:<6} {}",
                    job.job_id,
                    job.status.to_string(),
                    phase,
                    cadence_core::truncate_chars(&job.user_prompt, 60)
                );
            }
        }
        JobAction::Show { job_id, full } => {
            if full {
                print_json(&service.job_dashboard(&job_id).await?)?;
            } else {
                print_json(&service.get_job(&job_id).await?)?;
            }
        }
        JobAction::Approve { job_id, phase } => {
            let job = service.approve_phase(&job_id, phase).await?;
            info!(job_id = %job.job_id, phase = %phase, "Phase approved");
            print_json(&job)?;
        }
        JobAction::Reject {
            job_id,
            phase,
            reason,
        } => {
            let job = service.reject_phase(&job_id, phase, &reason).await?;
            info!(job_id = %job.job_id, phase = %phase, "Phase rejected");
            print_json(&job)?;
        }
        JobAction::Cancel { job_id } => {
            let job = service.cancel_job(&job_id).await?;
            info!(job_id = %job.job_id, "Job canceled");
            print_json(&job)?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
