use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vatload_sync::{check_config, run_once, LoadConfig};

#[derive(Debug, Parser)]
#[command(name = "vatload-cli")]
#[command(about = "Loads VAT report extracts into PostgreSQL")]
struct Cli {
    /// Root that relative dataset folders and config paths are resolved against.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    /// Dataset configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory of statement template overrides.
    #[arg(long, global = true)]
    queries: Option<PathBuf>,
    #[arg(long, global = true)]
    report_dir: Option<PathBuf>,
    /// Exit successfully even when some files failed to load.
    #[arg(long, global = true)]
    tolerate_failures: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Correct, stage, deduplicate and merge every pending file.
    Run,
    /// Validate configuration and print the rendered statements.
    Check,
    /// Write the corrected copy of one source file and stop.
    Correct { file: PathBuf },
}

impl Cli {
    fn config(&self) -> LoadConfig {
        let mut config = LoadConfig::from_env();
        if let Some(root) = &self.workspace {
            config.workspace_root = root.clone();
        }
        if let Some(file) = &self.config {
            config.datasets_file = file.clone();
        }
        if let Some(dir) = &self.queries {
            config.queries_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.report_dir {
            config.reports_dir = Some(dir.clone());
        }
        config
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = run_once(&config).await?;
            println!(
                "load complete: run_id={} files={} cleaned={} failed={} rows_merged={}",
                summary.run_id,
                summary.files_total(),
                summary.files_cleaned(),
                summary.files_failed(),
                summary.rows_merged()
            );
            if summary.has_failures() && !cli.tolerate_failures {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Check => {
            let samples = check_config(&config)?;
            for sample in &samples {
                println!("-- {} / {}\n{}\n", sample.dataset, sample.step, sample.sql.trim_end());
            }
            info!(statements = samples.len(), "configuration is valid");
        }
        Commands::Correct { file } => {
            let datasets = config.load_datasets()?;
            let corrected = datasets
                .corrector()
                .correct(&file)
                .with_context(|| format!("correcting {}", file.display()))?;
            println!(
                "{} rows={} dates_rewritten={} dates_nulled={}",
                corrected.corrected_path.display(),
                corrected.row_count,
                corrected.dates.rewritten,
                corrected.dates.nulled
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}
