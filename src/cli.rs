//
// cli.rs
// Dicom-Anonymizer-rs
//
// Defines the CLI surface with Clap and dispatches user-selected commands to the corresponding modules.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::warn;

use crate::allocator::{IdFormat, DEFAULT_MAX_ATTEMPTS};
use crate::config::{AnonymizerConfig, BackendKind};
use crate::logging;
use crate::pipeline::{AnonymizationPipeline, RunReport};

/// Command-line interface glue code: defines the available verbs and dispatches to modules.
#[derive(Parser)]
#[command(name = "dicom-anonymizer")]
#[command(about = "Consistent, repeatable DICOM anonymization", long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Commands,
}

/// Location and format of the association tables.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Subject association table
    #[arg(long, default_value = "subjects.json")]
    pub subjects: PathBuf,
    /// Scan association table
    #[arg(long, default_value = "scans.json")]
    pub scans: PathBuf,
    #[arg(long, value_enum, default_value_t = Backend::Table)]
    pub backend: Backend,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Anonymize every DICOM file under a directory
    Anonymize {
        input: PathBuf,
        #[arg(short, long)]
        destination: PathBuf,
        #[command(flatten)]
        store: StoreArgs,
        /// Extension of the files to pick up
        #[arg(long, default_value = "dcm")]
        extension: String,
        #[arg(long, value_enum, default_value_t = IdStyle::Alphanumeric)]
        id_format: IdStyle,
        #[arg(long, default_value_t = 8)]
        id_length: usize,
        #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
        max_attempts: usize,
        /// Worker threads (defaults to one per core)
        #[arg(short, long)]
        jobs: Option<usize>,
        #[arg(long, default_value = "errors.log")]
        error_log: PathBuf,
        /// Seed identifiers and names for reproducible output
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Show the association stored for a raw subject id
    Lookup {
        raw_id: String,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// List registered scans
    Scans {
        /// Only scans of this raw subject id
        #[arg(long)]
        subject: Option<String>,
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum Backend {
    Table,
    Journal,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum IdStyle {
    Alphanumeric,
    Numeric,
}

impl From<Backend> for BackendKind {
    fn from(value: Backend) -> Self {
        match value {
            Backend::Table => BackendKind::Table,
            Backend::Journal => BackendKind::Journal,
        }
    }
}

impl StoreArgs {
    fn config(&self) -> AnonymizerConfig {
        AnonymizerConfig {
            subjects_file: self.subjects.clone(),
            scans_file: self.scans.clone(),
            backend: self.backend.into(),
            ..Default::default()
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    // Parse the raw CLI arguments once and dispatch to a subcommand handler.
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    match cli.command {
        Commands::Anonymize {
            input,
            destination,
            store,
            extension,
            id_format,
            id_length,
            max_attempts,
            jobs,
            error_log,
            seed,
        } => {
            if id_length == 0 {
                bail!("--id-length must be greater than zero");
            }
            let id_format = match id_format {
                IdStyle::Alphanumeric => IdFormat::Alphanumeric { len: id_length },
                IdStyle::Numeric => IdFormat::Numeric { len: id_length },
            };
            let config = AnonymizerConfig {
                id_format,
                max_attempts,
                extension,
                error_log: Some(error_log),
                jobs,
                seed,
                ..store.config()
            };
            let report = anonymize_tree(&config, input, &destination).await?;
            print_report(&report);
        }
        Commands::Lookup { raw_id, store } => {
            let store = store.config().open_store()?;
            match store.find_subject(&raw_id) {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => bail!("No association stored for subject {}", raw_id),
            }
        }
        Commands::Scans { subject, store } => {
            let store = store.config().open_store()?;
            let scans: Vec<_> = store
                .scans()
                .into_iter()
                .filter(|scan| subject.as_deref().map_or(true, |s| scan.subject_raw_id == s))
                .collect();
            println!("{}", serde_json::to_string_pretty(&scans)?);
        }
    }

    Ok(())
}

async fn anonymize_tree(
    config: &AnonymizerConfig,
    input: PathBuf,
    destination: &Path,
) -> anyhow::Result<RunReport> {
    let pipeline = Arc::new(AnonymizationPipeline::from_config(config, destination)?);

    // Ctrl-C only stops scheduling; files already being written finish normally.
    let cancel = pipeline.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing files in progress");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let worker = Arc::clone(&pipeline);
    tokio::task::spawn_blocking(move || worker.run(&input))
        .await
        .context("Anonymization worker panicked")?
}

fn print_report(report: &RunReport) {
    println!("Found {} files.", report.discovered);
    println!("  Written:          {}", report.written);
    println!("  Already existing: {}", report.skipped_existing);
    println!("  Failed:           {}", report.failed);
    if report.not_started > 0 {
        println!("  Not started:      {}", report.not_started);
    }
    println!("  New subjects:     {}", report.subjects_created);
    println!("  New scans:        {}", report.scans_created);
}
