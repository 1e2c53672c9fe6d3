use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobwatch_storage::SnapshotStore;
use jobwatch_sync::{CycleOutcome, WatchConfig, WatchPipeline};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "Watches a job listing page and emails new listings")]
struct Cli {
    /// Run a single check and exit (same as the `once` command).
    #[arg(long, global = true)]
    once: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check on an interval until interrupted.
    Watch,
    /// Run one check and print its summary as JSON.
    Once,
    /// Create or upgrade the state database.
    Migrate,
    /// Print the stored listings as JSON.
    Snapshot {
        /// Include the notification ledger.
        #[arg(long)]
        ledger: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let config = WatchConfig::from_env().context("loading configuration")?;

    let command = match cli.command {
        Some(command) => command,
        None if cli.once => Commands::Once,
        None => Commands::Watch,
    };

    match command {
        Commands::Watch if cli.once => run_once(config).await?,
        Commands::Watch => {
            tracing::info!(
                url = %config.watch_url,
                interval_secs = config.check_interval.as_secs(),
                db = %config.state_db_path.display(),
                "starting job watcher"
            );
            let missing = config.smtp.missing_fields();
            if !missing.is_empty() {
                tracing::warn!(missing = %missing.join(", "), "smtp is not fully configured; new listings will stay pending");
            }
            let pipeline = WatchPipeline::new(config).await?;
            pipeline.run_forever().await?;
            pipeline.store().close().await;
        }
        Commands::Once => run_once(config).await?,
        Commands::Migrate => {
            let store = SnapshotStore::open(&config.state_db_path)
                .await
                .with_context(|| format!("opening {}", config.state_db_path.display()))?;
            store.close().await;
            println!("state database ready: {}", config.state_db_path.display());
        }
        Commands::Snapshot { ledger } => {
            let store = SnapshotStore::open(&config.state_db_path)
                .await
                .with_context(|| format!("opening {}", config.state_db_path.display()))?;
            let records = store.load_all().await?.into_records();
            let mut output = json!({ "records": serde_json::to_value(&records)? });
            if ledger {
                let entries = store
                    .load_ledger()
                    .await?
                    .into_iter()
                    .map(|entry| {
                        json!({
                            "job_key": entry.key.as_str(),
                            "change_kind": entry.kind.as_str(),
                            "notified_at": entry.notified_at.to_rfc3339(),
                        })
                    })
                    .collect::<Vec<_>>();
                output["ledger"] = json!(entries);
            }
            store.close().await;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

async fn run_once(config: WatchConfig) -> Result<()> {
    let pipeline = WatchPipeline::new(config).await?;
    let outcome = pipeline.run_once().await;
    pipeline.store().close().await;

    let outcome = outcome?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if let CycleOutcome::Skipped { reason, .. } = &outcome {
        tracing::warn!(%reason, "check skipped");
    }
    Ok(())
}
