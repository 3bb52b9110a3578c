//! jobline - inspect and maintain a durable job store.
//!
//! Usage:
//!   jobline list                 List every stored job
//!   jobline pending              Show jobs that would be dispatched now
//!   jobline enqueue <batch.yaml> Insert a batch of jobs
//!   jobline reset                Mark every job as not running
//!   jobline delete <id>...       Delete jobs, optionally with their dependents
//!   jobline validate             Validate the configuration (and a batch file)

use clap::{Parser, Subcommand};
use jobline::{
    GlobalConfig, InMemoryStorage, JobIndex, JobSpec, JobStorage, SqliteStorage, StorageConfig,
    YamlLoader, now_millis,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "jobline.yaml";

/// jobline - durable background-job store maintenance
#[derive(Parser)]
#[command(name = "jobline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the global configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every stored job
    List,

    /// Show jobs that would be dispatched now
    Pending,

    /// Insert a batch of jobs from a YAML file
    Enqueue {
        #[arg(value_name = "BATCH_FILE")]
        batch: PathBuf,
    },

    /// Mark every job as not running
    Reset,

    /// Delete jobs by id
    Delete {
        #[arg(value_name = "JOB_ID", required = true)]
        ids: Vec<String>,

        /// Also delete every job that depends on them
        #[arg(long)]
        cascade: bool,
    },

    /// Validate the configuration, and a batch file if given
    Validate {
        #[arg(long, value_name = "BATCH_FILE")]
        batch: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { batch } => validate(&config, batch.as_deref()),
        command => {
            let index = open_index(&config).await?;
            match command {
                Commands::List => list_jobs(&index).await,
                Commands::Pending => list_pending(&index).await,
                Commands::Enqueue { batch } => enqueue(&index, &batch).await,
                Commands::Reset => reset(&index).await,
                Commands::Delete { ids, cascade } => delete(&index, ids, cascade).await,
                Commands::Validate { .. } => Ok(()),
            }
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<GlobalConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(YamlLoader::load_global_config(path)?),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Ok(YamlLoader::load_global_config(DEFAULT_CONFIG_PATH)?)
        }
        None => Ok(GlobalConfig::default()),
    }
}

async fn open_index(
    config: &GlobalConfig,
) -> Result<JobIndex<dyn JobStorage>, Box<dyn std::error::Error>> {
    let storage: Arc<dyn JobStorage> = match config.storage() {
        StorageConfig::Memory => {
            warn!("Using in-memory storage; changes are discarded on exit");
            Arc::new(InMemoryStorage::new())
        }
        StorageConfig::Sqlite { path } => {
            info!("Using SQLite storage at {}", path);
            Arc::new(SqliteStorage::new(&path).await?)
        }
    };

    Ok(JobIndex::init(storage)
        .await?
        .with_queue_ordering(config.queue_ordering()))
}

fn print_job(job: &JobSpec) {
    println!("ID: {}", job.id);
    println!("  Factory: {}", job.factory_key);
    if let Some(queue) = &job.queue_key {
        println!("  Queue: {}", queue);
    }
    let max_attempts = if job.max_attempts == jobline::UNLIMITED {
        "unlimited".to_string()
    } else {
        job.max_attempts.to_string()
    };
    println!("  Attempts: {} of {}", job.run_attempt, max_attempts);
    println!("  Next run: {}", job.next_run_attempt_time);
    println!("  Running: {}", job.is_running);
}

async fn list_jobs(index: &JobIndex<dyn JobStorage>) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = index.get_all_job_specs().await;
    if jobs.is_empty() {
        println!("No jobs stored");
        return Ok(());
    }

    println!("{} job(s):", jobs.len());
    println!();
    for job in &jobs {
        print_job(job);
        let dependencies = index.get_dependency_specs_for_job(&job.id).await;
        if !dependencies.is_empty() {
            let names: Vec<&str> = dependencies
                .iter()
                .map(|d| d.depends_on_job_id.as_str())
                .collect();
            println!("  Depends on: {}", names.join(", "));
        }
        let constraints = index.get_constraint_specs(&job.id).await;
        if !constraints.is_empty() {
            let names: Vec<&str> = constraints.iter().map(|c| c.factory_key.as_str()).collect();
            println!("  Constraints: {}", names.join(", "));
        }
        println!();
    }
    Ok(())
}

async fn list_pending(index: &JobIndex<dyn JobStorage>) -> Result<(), Box<dyn std::error::Error>> {
    let pending = index
        .get_pending_jobs_with_no_dependencies_in_created_order(now_millis())
        .await;
    if pending.is_empty() {
        println!("No jobs are eligible to run");
        return Ok(());
    }

    println!("{} job(s) eligible to run:", pending.len());
    for job in &pending {
        println!("  - {} ({})", job.id, job.factory_key);
    }
    Ok(())
}

async fn enqueue(
    index: &JobIndex<dyn JobStorage>,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let batch = YamlLoader::load_job_batch(path)?;
    let specs = batch.to_full_specs(now_millis())?;
    let count = specs.len();
    index.insert_jobs(specs).await?;
    info!("Enqueued {} job(s) from {}", count, path.display());
    Ok(())
}

async fn reset(index: &JobIndex<dyn JobStorage>) -> Result<(), Box<dyn std::error::Error>> {
    let running = index
        .get_all_job_specs()
        .await
        .iter()
        .filter(|j| j.is_running)
        .count();
    index.update_all_jobs_to_be_pending().await?;
    info!("Reset {} running job(s) to pending", running);
    Ok(())
}

async fn delete(
    index: &JobIndex<dyn JobStorage>,
    ids: Vec<String>,
    cascade: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut targets: Vec<jobline::JobId> = ids.into_iter().map(jobline::JobId::from).collect();
    if cascade {
        let mut dependents = Vec::new();
        for id in &targets {
            for edge in index.get_dependency_specs_that_depend_on_job(id).await {
                if !targets.contains(&edge.job_id) && !dependents.contains(&edge.job_id) {
                    dependents.push(edge.job_id);
                }
            }
        }
        targets.extend(dependents);
    }

    for id in &targets {
        if index.get_job_spec(id).await.is_none() {
            warn!("Job '{}' is not stored", id);
        }
    }
    index.delete_jobs(&targets).await?;
    info!("Deleted {} job(s)", targets.len());
    Ok(())
}

fn validate(
    config: &GlobalConfig,
    batch: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Configuration OK: {:?} storage, {} worker(s), {:?} queues",
        config.storage(),
        config.max_workers(),
        config.queue_ordering()
    );

    let Some(path) = batch else {
        return Ok(());
    };
    match YamlLoader::load_job_batch(path) {
        Ok(batch) => {
            info!("All {} job(s) in {} are valid", batch.jobs.len(), path.display());
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}
