//! srsforge-gen: build rule-set artifacts from a configuration file.

use clap::{Parser, Subcommand};
use srsforge::compile::ArtifactReader;
use srsforge::pipeline::select_jobs;
use srsforge::{CancelToken, Config, HttpTransport, PipelineOrchestrator};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

/// Exit code after an interrupt, as shells report SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "srsforge-gen")]
#[command(author = "Kaitu.io")]
#[command(version)]
#[command(about = "Download, normalize and compile routing rule sources", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for every configured ruleset
    Run {
        /// Configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,

        /// Only build these rulesets (repeatable)
        #[arg(long)]
        only: Vec<String>,

        /// Write the run summary as JSON to this file
        #[arg(long)]
        summary: Option<PathBuf>,

        /// Drop CIDR blocks covered by a broader block
        #[arg(long)]
        collapse_cidrs: bool,
    },

    /// Decode a native artifact and print what it holds
    Inspect {
        /// Artifact file
        artifact: PathBuf,

        /// Print every decoded record
        #[arg(long)]
        records: bool,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            only,
            summary,
            collapse_cidrs,
        } => run(&config, &only, summary.as_deref(), collapse_cidrs),
        Commands::Inspect { artifact, records } => {
            inspect(&artifact, records).map(|()| ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(
    config_path: &Path,
    only: &[String],
    summary_path: Option<&Path>,
    collapse_cidrs: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut config = Config::load(config_path)?;
    if collapse_cidrs {
        config.normalize.collapse_subsumed_cidrs = true;
    }
    let jobs = select_jobs(config.jobs(), only)?;

    let mut cancel = CancelToken::new();
    if let Some(deadline) = config.deadline() {
        cancel = cancel.with_deadline(deadline);
    }
    if let Err(e) = cancel.install_ctrlc_handler() {
        log::warn!("failed to install Ctrl+C handler: {}", e);
    }

    let transport = Arc::new(HttpTransport::new()?);
    let pipeline = PipelineOrchestrator::from_config(&config, transport)?;
    let summary = pipeline.run(&jobs, &cancel);

    print!("{}", summary);
    if let Some(path) = summary_path {
        fs::write(path, summary.to_json()?)?;
        log::info!("summary written to {:?}", path);
    }

    if cancel.was_interrupted() {
        Ok(ExitCode::from(EXIT_INTERRUPTED))
    } else if summary.has_failures() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn inspect(path: &Path, show_records: bool) -> Result<(), Box<dyn std::error::Error>> {
    let data = fs::read(path)?;
    let reader = ArtifactReader::from_bytes(&data)?;

    println!("Artifact: {:?} ({} bytes)", path, data.len());
    println!("  Layout:   {}", reader.layout());
    println!("  Engine:   {} {}", reader.engine_version(), reader.platform());
    println!("  Records:  {}", reader.record_count());
    println!("  Slices:   {}", reader.slice_count());
    for (slice_type, count) in reader.slices() {
        match slice_type {
            Some(t) => println!("    {:?}: {}", t, count),
            None => println!("    unknown: {}", count),
        }
    }

    if show_records {
        for record in reader.records()? {
            println!("{}", record);
        }
    }
    Ok(())
}
