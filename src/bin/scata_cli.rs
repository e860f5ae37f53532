use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use scata::{
    about,
    amplicon::parse_tagset_file,
    blob_store::{BlobStore, DirBlobStore},
    config::{DatasetSettings, EngineSettings, JobConfig, RefsetSettings},
    dataset::{check_dataset, check_refset},
    orchestrator::{JobController, JobOutcome},
    transport::LocalTransport,
};
use scata_protocol::JobPhase;
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tracing::info;

#[derive(Parser)]
#[command(name = "scata")]
#[command(about = "Amplicon filtering, detagging and clustering", long_about = None)]
struct Cli {
    /// Engine settings JSON (blob directory, pool sizes, aligner)
    #[arg(short, long, global = true)]
    engine: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Filter and detag a read dataset into the blob store
    CheckDataset {
        /// Dataset settings JSON
        dataset: String,
    },

    /// Cut a reference set to its amplicon and store it
    CheckRefset {
        /// Reference set settings JSON
        refset: String,
    },

    /// Validate a tag-set file
    ParseTagset {
        file: PathBuf,
    },

    /// Deduplicate, cluster and merge one job
    RunJob {
        /// Job JSON
        job: String,
    },

    /// Print version and build number
    Version,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("Could not serialize JSON output")?;
    println!("{text}");
    Ok(())
}

fn load_engine(path: Option<&str>) -> anyhow::Result<EngineSettings> {
    Ok(match path {
        Some(path) => EngineSettings::load_from_path(path)?,
        None => EngineSettings::default(),
    })
}

fn open_store(engine: &EngineSettings) -> anyhow::Result<Arc<dyn BlobStore>> {
    let store = DirBlobStore::open(&engine.blob_dir)
        .with_context(|| format!("Could not open blob store at '{}'", engine.blob_dir.display()))?;
    Ok(Arc::new(store))
}

#[derive(Serialize)]
struct AbortedJob<'a> {
    job: &'a str,
    phase: JobPhase,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Version => {
            println!("{}", about::version_cli_text());
        }
        Commands::ParseTagset { file } => {
            print_json(&parse_tagset_file(&file)?)?;
        }
        Commands::CheckDataset { dataset } => {
            let engine = load_engine(cli.engine.as_deref())?;
            let settings = DatasetSettings::load_from_path(&dataset)?;
            let amplicon = settings.load_amplicon()?;
            let store = open_store(&engine)?;
            let report = check_dataset(&settings, amplicon.as_ref(), &*store, &mut |p| {
                info!(dataset = settings.id.as_str(), "{p}");
            })?;
            print_json(&report)?;
        }
        Commands::CheckRefset { refset } => {
            let engine = load_engine(cli.engine.as_deref())?;
            let settings = RefsetSettings::load_from_path(&refset)?;
            let amplicon = settings.load_amplicon()?;
            let store = open_store(&engine)?;
            let report = check_refset(&settings, amplicon.as_ref(), &*store, &mut |p| {
                info!(refset = settings.id.as_str(), "{p}");
            })?;
            print_json(&report)?;
        }
        Commands::RunJob { job } => {
            let engine = load_engine(cli.engine.as_deref())?;
            let config = JobConfig::load_from_path(&job)?;
            if config.id.is_empty() {
                bail!("Job file '{job}' has no id");
            }
            let store = open_store(&engine)?;
            let transport = Arc::new(LocalTransport::new(engine.worker_threads)?);
            let job_id = config.id.clone();
            let mut controller = JobController::new(store, transport, engine).on_status(|status| {
                info!(job = job_id.as_str(), phase = %status.phase, "{}", status.progress);
            });
            match controller.run(&config)? {
                JobOutcome::Done(summary) => print_json(&summary)?,
                JobOutcome::Aborted => print_json(&AbortedJob {
                    job: &config.id,
                    phase: JobPhase::Aborted,
                })?,
            }
        }
    }
    Ok(())
}
