use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conduit_storage::{FilePayloadFetcher, HttpFetcher, PayloadFetcher};
use conduit_sync::{run_source, validate_source, ConnectorConfig, RunSummary, SourceConfig, SourceRegistry};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "conduit")]
#[command(about = "Idempotent feed-to-document-store sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source (or one) and upsert it into its collection.
    Sync {
        #[arg(long)]
        source: Option<String>,
        /// Read the payload from a local file instead of the network. Requires --source.
        #[arg(long, requires = "source")]
        payload_file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Report completeness statistics for a source's collection.
    Validate {
        #[arg(long)]
        source: String,
        #[arg(long)]
        json: bool,
    },
    /// List the configured sources.
    Sources,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "conduit=info".into()))
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = ConnectorConfig::from_env();
    let registry = SourceRegistry::load(&config.registry_path()).await?;

    match cli.command.unwrap_or(Commands::Sync {
        source: None,
        payload_file: None,
        json: false,
    }) {
        Commands::Sync {
            source,
            payload_file,
            json,
        } => sync(&config, &registry, source.as_deref(), payload_file, json).await,
        Commands::Validate { source, json } => {
            let source = find_source(&registry, &source)?;
            let report = validate_source(&config, source, chrono::Utc::now().date_naive()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("collection:          {}", report.collection);
                println!("total records:       {}", report.total_records);
                println!("ingested today:      {}", report.today_records);
                println!("with quality issues: {}", report.records_with_issues);
                println!("with images:         {}", report.records_with_images);
                println!("distinct origins:    {}", report.unique_origins);
                for origin in &report.top_origins {
                    println!("  {:<24} {}", origin.origin, origin.count);
                }
                for (field, avg) in &report.average_lengths {
                    println!("avg {field} length: {avg:.2}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sources => {
            for source in &registry.sources {
                println!(
                    "{:<12} {:<14} {:<8} {} -> {}",
                    source.source_id,
                    source.kind.as_str(),
                    if source.enabled { "enabled" } else { "disabled" },
                    source.url,
                    source.collection
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn find_source<'a>(registry: &'a SourceRegistry, source_id: &str) -> Result<&'a SourceConfig> {
    registry
        .find(source_id)
        .with_context(|| format!("no source `{source_id}` in registry"))
}

async fn sync(
    config: &ConnectorConfig,
    registry: &SourceRegistry,
    source_id: Option<&str>,
    payload_file: Option<PathBuf>,
    json: bool,
) -> Result<ExitCode> {
    let sources: Vec<&SourceConfig> = match source_id {
        Some(id) => vec![find_source(registry, id)?],
        None => registry.enabled().collect(),
    };
    if sources.is_empty() {
        info!("no enabled sources");
        return Ok(ExitCode::SUCCESS);
    }

    let fetcher: Arc<dyn PayloadFetcher> = match payload_file {
        Some(path) => Arc::new(FilePayloadFetcher::new(path)),
        None => Arc::new(HttpFetcher::new(config.http_client_config())?),
    };

    let mut summaries: Vec<RunSummary> = Vec::new();
    let mut failed = false;
    for source in sources {
        let settings = source.settings(|name| std::env::var(name).ok());
        match run_source(config, source, settings, fetcher.clone()).await {
            Ok(summary) => {
                if !json {
                    println!("{}", summary.one_line());
                }
                summaries.push(summary);
            }
            Err(err) => {
                error!(source_id = %source.source_id, "run failed: {err}");
                failed = true;
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}
