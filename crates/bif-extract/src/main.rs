//! BIF Extract - command line entry point

use anyhow::{Context, Result};
use bif_common::logging::{init_logging, LogConfig};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use bif_extract::{
    config::AppConfig,
    db::{self, PgCheckpointStore, PgJobStore},
    finalizer::Finalizer,
    interface::InterfaceConfig,
    launcher::{JobHandle, JobLauncher},
    orchestrator::{JobOutcome, PipelineOrchestrator},
    schema::SchemaCache,
    source::PgRecordSource,
    StatusMachine,
};

#[derive(Parser)]
#[command(name = "bif-extract", version, about = "Restart-safe banking interface file extraction")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a job for an interface and run it to completion
    Run {
        /// Interface definition (TOML)
        #[arg(short, long)]
        interface: PathBuf,
        #[arg(long, default_value = "cli")]
        owner: String,
    },
    /// Resume a stopped or queued job from its last checkpoint
    Resume {
        #[arg(short, long)]
        interface: PathBuf,
        #[arg(short, long)]
        job: Uuid,
    },
    /// Resolve jobs interrupted by an unclean shutdown
    Recover {
        /// Interface definitions; defaults to every `*.toml` in BIF_INTERFACE_DIR
        #[arg(short, long)]
        interface: Vec<PathBuf>,
    },
    /// Print a job record
    Status {
        #[arg(short, long)]
        job: Uuid,
    },
    /// Check a final file against its `.sha` sidecar
    Verify { file: PathBuf },
    /// Ask a running job to stop at its next chunk boundary
    Stop {
        #[arg(short, long)]
        job: Uuid,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env().unwrap_or_default();
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Warning: logging disabled: {e}");
    }

    match execute(cli.command).await {
        Ok(true) => {},
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            process::exit(1);
        },
    }
}

/// Run one command; `Ok(false)` means it ran but the job did not succeed
async fn execute(command: Command) -> Result<bool> {
    if let Command::Verify { file } = &command {
        return Ok(verify(file));
    }

    let config = AppConfig::load()?;
    config.validate()?;
    let pool = db::create_pool(&config.database).await?;
    db::migrate(&pool).await?;
    info!("Database migrations completed");

    let machine = StatusMachine::new(
        Arc::new(PgJobStore::new(pool.clone())),
        config.pipeline.status_retry_attempts,
    );

    match command {
        Command::Run { interface, owner } => {
            let launcher = launcher(&config, &pool, &machine, &[interface])?;
            let interface_type = single_interface(&launcher)?;
            let submission = launcher.submit(&interface_type, &owner).await?;
            print_json(&submission.job)?;
            match submission.handle {
                Some(handle) => report(handle).await,
                None => {
                    println!("Interface {interface_type} is busy; job {} queued", submission.job.id);
                    Ok(true)
                },
            }
        },
        Command::Resume { interface, job } => {
            let launcher = launcher(&config, &pool, &machine, &[interface])?;
            match launcher.resume(job).await? {
                Some(handle) => report(handle).await,
                None => Ok(true),
            }
        },
        Command::Recover { interface } => {
            let files = if interface.is_empty() {
                interface_files(&config.pipeline.interface_dir)?
            } else {
                interface
            };
            let launcher = launcher(&config, &pool, &machine, &files)?;
            let recovery = launcher.recover().await?;
            println!(
                "Recovered: {} completed, {} failed, {} resumed",
                recovery.completed.len(),
                recovery.failed.len(),
                recovery.resumed.len()
            );
            let mut all_ok = recovery.failed.is_empty();
            for (_, handle) in recovery.resumed {
                all_ok &= report(handle).await?;
            }
            Ok(all_ok)
        },
        Command::Status { job } => {
            print_json(&machine.load(job).await?)?;
            Ok(true)
        },
        Command::Stop { job } => {
            let record = machine
                .transition(job, bif_extract::JobStatus::Stopped, Some("stopped on request".into()))
                .await?;
            print_json(&record)?;
            Ok(true)
        },
        Command::Verify { .. } => Ok(true),
    }
}

fn verify(file: &Path) -> bool {
    let dir = file.parent().unwrap_or_else(|| Path::new("."));
    let ok = Finalizer::new(dir).verify(file);
    println!("{}: {}", file.display(), if ok { "OK" } else { "FAILED" });
    ok
}

fn launcher(
    config: &AppConfig,
    pool: &PgPool,
    machine: &StatusMachine,
    files: &[PathBuf],
) -> Result<JobLauncher> {
    let checkpoints = Arc::new(PgCheckpointStore::new(pool.clone()));
    let mappings = Arc::new(SchemaCache::new());
    let schemas = Arc::new(SchemaCache::new());

    let mut orchestrators = Vec::with_capacity(files.len());
    for file in files {
        let interface = InterfaceConfig::from_file(file)
            .with_context(|| format!("Failed to load interface {}", file.display()))?;
        let source = Arc::new(PgRecordSource::new(pool.clone(), &interface.source));
        let output_dir = interface
            .output_dir_or(&config.pipeline.output_dir)
            .to_path_buf();
        info!(
            interface = %interface.interface_type,
            output_dir = %output_dir.display(),
            "Interface loaded"
        );
        orchestrators.push(
            PipelineOrchestrator::new(
                Arc::new(interface),
                source,
                machine.clone(),
                checkpoints.clone(),
                output_dir,
            )
            .with_caches(Arc::clone(&mappings), Arc::clone(&schemas)),
        );
    }

    Ok(JobLauncher::new(
        machine.clone(),
        config.pipeline.worker_pool_size,
        orchestrators,
    ))
}

fn single_interface(launcher: &JobLauncher) -> Result<String> {
    launcher
        .interfaces()
        .next()
        .map(str::to_string)
        .context("No interface loaded")
}

fn interface_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read interface directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    files.sort();
    Ok(files)
}

async fn report(handle: JobHandle) -> Result<bool> {
    let outcome = handle.await.context("Job task panicked")??;
    print_json(&outcome)?;
    Ok(matches!(
        outcome,
        JobOutcome::Completed { .. } | JobOutcome::Stopped { .. } | JobOutcome::Deferred
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
