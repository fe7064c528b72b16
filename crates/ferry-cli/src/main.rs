use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use ferry_core::app::{ServiceBuilder, StatusReport, status};
use ferry_core::domain::{FileList, JobDescription, JobId, JobState};
use ferry_core::impls::{ForkBatch, FsJobStore, LocalTransferScheduler, ShellHooks};
use ferry_core::ports::{JobStore, Request};
use ferry_core::{Config, FerryError};

#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(version)]
#[command(about = "Data staging for batch jobs")]
#[command(propagate_version = true)]
struct Args {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the staging service until interrupted
    Run,

    /// Submit a job from a JSON description
    Submit {
        /// Job id; becomes part of the control file names
        id: String,
        /// JSON job description
        description: PathBuf,
    },

    /// Ask for a job to be cancelled
    Cancel { id: String },

    /// Ask for a failed job to be run again
    Rerun { id: String },

    /// Cancel a job and remove all of its records
    Clean { id: String },

    /// Print job states as JSON
    Status {
        /// Only this job
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let store = FsJobStore::open(&config.control_dir)?;

    match args.command {
        Commands::Run => serve(config, store).await?,
        Commands::Submit { id, description } => {
            let id = job_id(&id)?;
            submit(&store, &id, &description)?;
            println!("{id}");
        }
        Commands::Cancel { id } => request(&store, &job_id(&id)?, &[Request::Cancel])?,
        Commands::Rerun { id } => request(&store, &job_id(&id)?, &[Request::Rerun])?,
        Commands::Clean { id } => {
            request(&store, &job_id(&id)?, &[Request::Cancel, Request::Clean])?
        }
        Commands::Status { id: Some(id) } => {
            let report = status::job_status(&store, &job_id(&id)?)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status { id: None } => {
            let report = StatusReport::collect(&store)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn job_id(raw: &str) -> Result<JobId, FerryError> {
    let id = JobId::new(raw);
    if id.is_valid() {
        Ok(id)
    } else {
        Err(FerryError::Other(format!("invalid job id {raw:?}")))
    }
}

/// Write the description and both file lists, then hand the job over by
/// writing its state last.
fn submit(store: &FsJobStore, id: &JobId, path: &Path) -> Result<(), FerryError> {
    if store.read_state(id)?.is_some() {
        return Err(FerryError::Other(format!("job {id} already exists")));
    }
    let text = std::fs::read_to_string(path).map_err(|e| FerryError::io(path, e))?;
    let desc: JobDescription =
        serde_json::from_str(&text).map_err(|e| FerryError::corrupt(path, e.to_string()))?;
    std::fs::create_dir_all(&desc.session_dir)
        .map_err(|e| FerryError::io(&desc.session_dir, e))?;

    store.write_description(id, &desc)?;
    store.write_list(id, FileList::Input, &desc.inputs)?;
    store.write_list(id, FileList::Output, &desc.outputs)?;
    store.write_state(id, JobState::Accepted)?;
    tracing::info!(job_id = %id, inputs = desc.inputs.len(), outputs = desc.outputs.len(), "job submitted");
    Ok(())
}

fn request(store: &FsJobStore, id: &JobId, requests: &[Request]) -> Result<(), FerryError> {
    if store.read_state(id)?.is_none() {
        return Err(FerryError::JobNotFound(id.clone()));
    }
    for request in requests {
        store.place_request(id, *request)?;
    }
    Ok(())
}

async fn serve(config: Config, store: FsJobStore) -> Result<(), Box<dyn std::error::Error>> {
    let builder = ServiceBuilder::new(config.clone());
    let transfers = Arc::new(LocalTransferScheduler::new(
        config.transfer.clone(),
        builder.sink(),
    )?);
    let service = builder
        .store(Arc::new(store))
        .scheduler(transfers.clone())
        .cache(transfers)
        .batch(Arc::new(ForkBatch::new()))
        .hooks(Arc::new(ShellHooks::new(&config.hooks)?))
        .build()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(service.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received");
    // receiver may already be gone
    let _ = shutdown_tx.send(true);
    running.await?;
    Ok(())
}
