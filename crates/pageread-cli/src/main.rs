//! Command-line front end for the pageread document-understanding
//! engine: `parse`, `ensure-ready`, and `verify-offline` subcommands
//! over the same `pageread-pipeline`/`pageread-delivery` entry points a
//! host application would call directly.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use pageread_core::config::{Config, ParseOptions};
use pageread_pdf::loader::InputDocument;
use pageread_pipeline::{CancellationToken, Pipeline};

#[derive(Parser)]
#[command(
    name = "pageread",
    version,
    about = "On-device document-understanding engine: layout detection, recognition, and Markdown assembly",
    long_about = "Converts a page image or multi-page PDF into ordered, labeled regions and a merged Markdown rendering.\n\n\
                  EXAMPLES:\n  \
                  pageread parse report.pdf\n  \
                  pageread parse scan.png --max-pages 3 --dump-diagnostics diagnostics.json\n  \
                  pageread ensure-ready\n  \
                  pageread verify-offline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON configuration file overriding `Config::default()`.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse an image or PDF into Markdown (and, optionally, a diagnostics dump).
    Parse {
        /// Input file: an image (PNG/JPEG) or a PDF.
        input: PathBuf,

        /// Write Markdown to this path instead of stdout.
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Cap the number of pages processed (PDF inputs only).
        #[arg(long, value_name = "N")]
        max_pages: Option<u32>,

        /// Write the run's `DiagnosticBundle` as pretty JSON to this path.
        #[arg(long, value_name = "PATH")]
        dump_diagnostics: Option<PathBuf>,
    },

    /// Resolve and download the configured model snapshots, verifying integrity.
    EnsureReady,

    /// Verify previously-delivered model snapshots without any network access.
    VerifyOffline,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("failed to parse config file {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

fn load_input(path: &Path) -> Result<InputDocument> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read input file {}", path.display()))?;
    if bytes.starts_with(b"%PDF-") {
        Ok(InputDocument::PdfBytes(bytes))
    } else {
        Ok(InputDocument::ImageBytes(bytes))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to install tracing subscriber")?;

    match cli.command {
        Commands::Parse { input, output, max_pages, dump_diagnostics } => {
            let config = load_config(cli.config.as_deref())?;
            let pipeline = Pipeline::from_config(config).await.context("failed to initialize pipeline")?;

            let document = load_input(&input)?;
            let options = ParseOptions { max_pages, ..Default::default() };
            let cancellation = CancellationToken::new();

            let result = pipeline.parse(document, options, &cancellation).await.context("parse failed")?;

            match output {
                Some(path) => std::fs::write(&path, &result.markdown).with_context(|| format!("failed to write {}", path.display()))?,
                None => println!("{}", result.markdown),
            }

            if let Some(path) = dump_diagnostics {
                let json = serde_json::to_string_pretty(&result.diagnostics)?;
                std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
            }
            Ok(())
        }

        Commands::EnsureReady => {
            let config = load_config(cli.config.as_deref())?;
            let recognizer_id = config.recognizer_model_id.clone();
            let layout_id = config.layout_model_id.clone();
            let paths = tokio::task::spawn_blocking(move || pageread_delivery::ensure_ready(&recognizer_id, &layout_id)).await??;
            println!("recognizer snapshot: {}", paths.recognizer_dir.display());
            println!("layout snapshot: {}", paths.layout_dir.display());
            Ok(())
        }

        Commands::VerifyOffline => {
            let config = load_config(cli.config.as_deref())?;
            let model_ids = vec![config.recognizer_model_id, config.layout_model_id];
            tokio::task::spawn_blocking(move || {
                let refs: Vec<&str> = model_ids.iter().map(String::as_str).collect();
                pageread_delivery::verify_offline_readiness(&refs)
            })
            .await??;
            println!("offline readiness verified");
            Ok(())
        }
    }
}
