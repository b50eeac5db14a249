//! iex CLI - Command-line interface
//!
//! Usage:
//!   iex models [--stage ner|re]
//!   iex extract --ner <model> [--re <model>] --text <text>
//!   iex extract --ner <model> --file <path> --fixture <doc.json>

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use iex_core::{AppConfig, LogFormat, LoggingConfig, Stage};
use iex_extractor::{
    ExtractionBackend, FixtureBackend, ModelRegistry, Pipeline, RegistryLoader,
};

#[derive(Parser)]
#[command(name = "iex")]
#[command(about = "Named entity and relation extraction over cached models")]
#[command(version)]
struct Cli {
    /// Config file (TOML); environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List models in the registry
    Models {
        /// Only list one stage (ner or re)
        #[arg(long)]
        stage: Option<Stage>,
    },
    /// Extract entities and optionally relations from a text
    Extract {
        /// NER model name
        #[arg(long)]
        ner: String,
        /// RE model name; relations are skipped when absent
        #[arg(long)]
        re: Option<String>,
        /// Input text
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        text: Option<String>,
        /// Read the input text from a file
        #[arg(long)]
        file: Option<PathBuf>,
        /// Replay a stored document instead of running models
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    // Logs go to stderr so stdout carries only results
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    init_tracing(&config.logging);

    let registry = ModelRegistry::new(&config.inference.model_dir);

    match cli.command {
        Commands::Models { stage } => {
            let stages = match stage {
                Some(stage) => vec![stage],
                None => vec![Stage::Ner, Stage::Re],
            };
            for stage in stages {
                for name in registry.list_models(stage)? {
                    println!("{stage}\t{name}");
                }
            }
        }
        Commands::Extract {
            ner,
            re,
            text,
            file,
            fixture,
        } => {
            let text = match (text, file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => anyhow::bail!("either --text or --file is required"),
            };

            let ner_config = registry.load_config(Stage::Ner, &ner)?;
            let re_config = re
                .map(|name| registry.load_config(Stage::Re, &name))
                .transpose()?;

            let backend: Arc<dyn ExtractionBackend> = match fixture {
                Some(path) => Arc::new(FixtureBackend::from_file(&path)?),
                None => Arc::new(Pipeline::with_loader(Arc::new(RegistryLoader::new(
                    registry.clone(),
                )))),
            };

            let timeout = Duration::from_secs(config.inference.request_timeout_secs);
            info!(
                ner = %ner_config.model_name,
                timeout_secs = timeout.as_secs(),
                "Starting extraction"
            );

            let task = tokio::task::spawn_blocking(move || {
                backend.extract(&ner_config, re_config.as_ref(), &text)
            });
            let document = tokio::time::timeout(timeout, task)
                .await
                .with_context(|| format!("extraction timed out after {}s", timeout.as_secs()))?
                .context("extraction task failed")??;

            println!("{}", document.to_json()?);
        }
    }

    Ok(())
}
