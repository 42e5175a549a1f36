use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fedscout_core::Source;
use fedscout_storage::{MemoryCache, PgStore, TracingTelemetry};
use fedscout_sync::{build_pipeline, PipelineConfig, SourceRegistry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "fedscout")]
#[command(about = "Federal opportunity aggregation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the scheduler when enabled).
    Serve,
    /// Fetch and upsert opportunities for the configured sources.
    Ingest {
        /// Restrict the run to specific sources (defaults to all enabled).
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,
        /// Search query passed to every source.
        #[arg(long, default_value = "")]
        query: String,
        /// Re-ingest records even when their stored copy is still fresh.
        #[arg(long)]
        force_refresh: bool,
    },
    /// Delete closed opportunities past the retention window.
    Cleanup {
        #[arg(long)]
        days_old: Option<i64>,
    },
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => fedscout_web::serve_from_env().await?,
        Commands::Ingest {
            sources,
            query,
            force_refresh,
        } => {
            let config = PipelineConfig::from_env();
            let registry = SourceRegistry::load(config.workspace_root.join("sources.yaml"))?;
            let enabled = registry.enabled_sources();
            let selected: Vec<Source> = if sources.is_empty() {
                enabled.clone()
            } else {
                sources
                    .iter()
                    .map(|s| s.parse::<Source>())
                    .collect::<Result<Vec<_>, _>>()?
            };

            let store = PgStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            let pipeline = build_pipeline(
                &config,
                enabled,
                Arc::new(store),
                Arc::new(MemoryCache::new()),
                Arc::new(TracingTelemetry),
            )?;
            let summary = pipeline.ingestion.run(&selected, &query, force_refresh).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Cleanup { days_old } => {
            let config = PipelineConfig::from_env();
            let registry = SourceRegistry::load(config.workspace_root.join("sources.yaml"))?;
            let store = PgStore::connect(&config.database_url).await?;
            let pipeline = build_pipeline(
                &config,
                registry.enabled_sources(),
                Arc::new(store),
                Arc::new(MemoryCache::new()),
                Arc::new(TracingTelemetry),
            )?;
            let removed = pipeline
                .ingestion
                .cleanup(days_old.unwrap_or(config.retention_days))
                .await?;
            println!("cleanup complete: removed={removed}");
        }
        Commands::Migrate => {
            let config = PipelineConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
