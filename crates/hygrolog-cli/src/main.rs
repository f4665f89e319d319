use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use hygrolog_core::{AnomalyKind, ResolutionAction};
use hygrolog_sync::{BulkResolveRequest, HygrologConfig, ImportDocument, ResolveRequest, Services};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "hygrolog")]
#[command(about = "Sensor reading reconciliation and anomaly resolution")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Import a JSON upload batch and print the per-file summary.
    Import {
        path: PathBuf,
        #[arg(long)]
        batch_id: Option<Uuid>,
    },
    /// Print pending anomalies grouped for review.
    Overview,
    Resolve {
        anomaly_id: Uuid,
        #[arg(long)]
        action: ResolutionAction,
        #[arg(long)]
        variant: Option<Uuid>,
    },
    BulkResolve {
        #[arg(long = "type")]
        kind: AnomalyKind,
        #[arg(long)]
        action: ResolutionAction,
        #[arg(required = true)]
        anomaly_ids: Vec<Uuid>,
    },
    /// Show the import tasks of a batch.
    Tasks { batch_id: Uuid },
    /// Physically remove expired anomalies.
    PurgeExpired,
    DeleteBatch { batch_id: Uuid },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = HygrologConfig::from_env();
    let services = Services::connect(&config).await?;

    match cli.command.unwrap_or(Commands::Overview) {
        Commands::Migrate => {
            let pool = services
                .pool
                .as_ref()
                .ok_or_else(|| anyhow!("migrate requires DATABASE_URL"))?;
            hygrolog_storage::run_migrations(pool)
                .await
                .context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Import { path, batch_id } => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let document: ImportDocument = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            let (document_batch, files) = document.into_batch();
            let summary = services
                .pipeline
                .run_batch(batch_id.unwrap_or(document_batch), files)
                .await?;
            print_json(&summary)?;
            if services.pool.is_none() {
                // In-memory anomalies end with this process.
                print_json(&services.anomalies.overview().await?)?;
            }
        }
        Commands::Overview => {
            print_json(&services.anomalies.overview().await?)?;
        }
        Commands::Resolve {
            anomaly_id,
            action,
            variant,
        } => {
            let resolution = services
                .resolutions
                .resolve(
                    anomaly_id,
                    &ResolveRequest {
                        action,
                        variant_id: variant,
                    },
                )
                .await
                .with_context(|| format!("resolving anomaly {anomaly_id}"))?;
            print_json(&resolution)?;
        }
        Commands::BulkResolve {
            kind,
            action,
            anomaly_ids,
        } => {
            let resolutions = services
                .resolutions
                .bulk_resolve(&BulkResolveRequest {
                    kind,
                    action,
                    anomaly_ids,
                })
                .await?;
            println!("resolved {} anomalies", resolutions.len());
        }
        Commands::Tasks { batch_id } => {
            print_json(&services.tasks.tasks_for_batch(batch_id).await?)?;
        }
        Commands::PurgeExpired => {
            let purged = services.anomalies.purge_expired().await?;
            println!("purged {purged} expired anomalies");
        }
        Commands::DeleteBatch { batch_id } => {
            let deletion = services.pipeline.delete_batch(batch_id).await?;
            print_json(&deletion)?;
        }
    }

    Ok(())
}
