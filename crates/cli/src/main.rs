//! Operator CLI for the kuberpult persistence database.

mod config;
mod manifest;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kuberpult_core::{ActorMetadata, EslVersion, SyncStatus};
use kuberpult_db::{DbHandler, EslEvent, FailedEslEvent, MigrationOutcome, Persistence};
use manifest::FileManifestSource;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kuberpult-dbctl")]
#[command(about = "Operator CLI for the kuberpult persistence database")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, env = "KUBERPULT_CONFIG", default_value = "config/dbctl.toml")]
    config: PathBuf,

    #[command(flatten)]
    author: AuthorArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct AuthorArgs {
    /// Author recorded on ledger entries written by this tool
    #[arg(long, env = "KUBERPULT_AUTHOR_NAME", default_value = "kuberpult-dbctl")]
    author_name: String,

    /// Author email recorded on ledger entries written by this tool
    #[arg(
        long,
        env = "KUBERPULT_AUTHOR_EMAIL",
        default_value = "kuberpult-dbctl@localhost"
    )]
    author_email: String,
}

impl AuthorArgs {
    fn actor(&self) -> ActorMetadata {
        ActorMetadata::new(&self.author_name, &self.author_email)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the embedded database schema
    Schema,
    /// Populate empty tables from a manifest repository export
    Migrate {
        /// JSON export of the manifest repository
        #[arg(long)]
        manifest: PathBuf,
    },
    /// Read the event ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
    /// Inspect and resolve failed ledger entries
    Failed {
        #[command(subcommand)]
        command: FailedCommands,
    },
    /// Inspect git-sync status
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
    /// Show or move the manifest export cutoff
    Cutoff {
        #[command(subcommand)]
        command: CutoffCommands,
    },
}

#[derive(Subcommand)]
enum LedgerCommands {
    /// Show the newest entry
    Last,
    /// Show the oldest entry
    First,
    /// Show the first entry after a version
    After { version: EslVersion },
    /// Show one entry
    Get { version: EslVersion },
}

#[derive(Subcommand)]
enum FailedCommands {
    /// List failed entries, newest first
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Drop a failed entry without replaying it
    Skip { version: EslVersion },
    /// Re-append a failed entry to the ledger
    Retry { version: EslVersion },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Count pairs in a status (synced, unsynced, sync_failed)
    Count { status: SyncStatus },
    /// List pairs in a status
    List { status: SyncStatus },
}

#[derive(Subcommand)]
enum CutoffCommands {
    /// Show the last exported ledger version
    Show,
    /// Record a new cutoff
    Set { version: EslVersion },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Cli {
        config: config_path,
        author,
        command,
    } = Cli::parse();

    let config = config::load_config(&config_path)?;
    let persistence = kuberpult_db::from_config(&config)
        .await
        .context("failed to initialize persistence")?;

    match command {
        Commands::Schema => handle_schema_command(&persistence).await,
        Commands::Migrate { manifest } => {
            handle_migrate_command(&persistence, &manifest, &author.actor()).await
        }
        Commands::Ledger { command } => {
            handle_ledger_command(require_handler(&persistence)?, command).await
        }
        Commands::Failed { command } => {
            handle_failed_command(require_handler(&persistence)?, command).await
        }
        Commands::Sync { command } => {
            handle_sync_command(require_handler(&persistence)?, command).await
        }
        Commands::Cutoff { command } => {
            handle_cutoff_command(require_handler(&persistence)?, command).await
        }
    }
}

fn require_handler(persistence: &Persistence) -> Result<&DbHandler> {
    persistence.handler().ok_or_else(|| {
        anyhow::anyhow!(
            "persistence is disabled; set `persistence` to `ledger_only` or `full` \
             (or KUBERPULT_PERSISTENCE) to use this command"
        )
    })
}

async fn handle_schema_command(persistence: &Persistence) -> Result<()> {
    let handler = require_handler(persistence)?;
    handler
        .migrate_schema()
        .await
        .context("failed to apply schema")?;
    handler.health_check().await.context("health check failed")?;
    println!("Schema is up to date");
    Ok(())
}

async fn handle_migrate_command(
    persistence: &Persistence,
    manifest: &Path,
    actor: &ActorMetadata,
) -> Result<()> {
    require_handler(persistence)?;
    let source = FileManifestSource::load(manifest)?;
    tracing::info!(
        manifest = %manifest.display(),
        applications = source.application_count(),
        mode = persistence.mode().as_str(),
        "Running migrations"
    );

    let report = persistence
        .run_migrations(&source, actor)
        .await
        .context("migration failed")?;

    for (name, outcome) in &report.steps {
        let label = match outcome {
            MigrationOutcome::Skipped => "skipped",
            MigrationOutcome::Done => "done",
        };
        println!("{name:<24} {label}");
    }
    if report.is_noop() {
        println!("Database was already migrated");
    }
    Ok(())
}

async fn handle_ledger_command(handler: &DbHandler, command: LedgerCommands) -> Result<()> {
    let mut tx = handler.begin_transaction(true).await?;
    let (event, what) = match command {
        LedgerCommands::Last => (
            handler.read_last_event(&mut tx).await?,
            "Ledger is empty".to_string(),
        ),
        LedgerCommands::First => (
            handler.read_first_event(&mut tx).await?,
            "Ledger is empty".to_string(),
        ),
        LedgerCommands::After { version } => (
            handler.read_event_later_than(&mut tx, version).await?,
            format!("No entry after version {version}"),
        ),
        LedgerCommands::Get { version } => (
            handler.read_event(&mut tx, version).await?,
            format!("No entry with version {version}"),
        ),
    };
    tx.commit().await?;

    match event {
        Some(event) => print_event(&event)?,
        None => println!("{what}"),
    }
    Ok(())
}

async fn handle_failed_command(handler: &DbHandler, command: FailedCommands) -> Result<()> {
    match command {
        FailedCommands::List { limit } => {
            let mut tx = handler.begin_transaction(true).await?;
            let failed = handler.read_failed_events(&mut tx, limit).await?;
            tx.commit().await?;
            if failed.is_empty() {
                println!("No failed events");
            }
            for event in &failed {
                print_failed_event(event)?;
            }
        }
        FailedCommands::Skip { version } => {
            handler
                .with_transaction(false, move |handler, tx| {
                    Box::pin(async move { handler.skip_failed_event(tx, version).await })
                })
                .await
                .with_context(|| format!("failed to skip event {version}"))?;
            println!("Skipped failed event {version}");
        }
        FailedCommands::Retry { version } => {
            let requeued = handler
                .with_transaction_optional(false, move |handler, tx| {
                    Box::pin(async move { handler.retry_failed_event(tx, version).await.map(Some) })
                })
                .await
                .with_context(|| format!("failed to retry event {version}"))?;
            if let Some(requeued) = requeued {
                println!("Requeued failed event {version} as {requeued}");
            }
        }
    }
    Ok(())
}

async fn handle_sync_command(handler: &DbHandler, command: SyncCommands) -> Result<()> {
    let mut tx = handler.begin_transaction(true).await?;
    match command {
        SyncCommands::Count { status } => {
            let count = handler.count_by_status(&mut tx, status).await?;
            println!("{status}: {count}");
        }
        SyncCommands::List { status } => {
            let rows = handler.retrieve_by_status(&mut tx, status).await?;
            if rows.is_empty() {
                println!("No apps with status {status}");
            }
            for row in &rows {
                println!(
                    "{:<40} transformer={:<8} {}",
                    row.env_app.to_string(),
                    row.transformer_id,
                    row.created
                );
            }
        }
    }
    tx.commit().await?;
    Ok(())
}

async fn handle_cutoff_command(handler: &DbHandler, command: CutoffCommands) -> Result<()> {
    match command {
        CutoffCommands::Show => {
            let mut tx = handler.begin_transaction(true).await?;
            let cutoff = handler.read_cutoff(&mut tx).await?;
            tx.commit().await?;
            match cutoff {
                Some(version) => println!("Cutoff: {version}"),
                None => println!("No cutoff recorded"),
            }
        }
        CutoffCommands::Set { version } => {
            handler
                .with_transaction(false, move |handler, tx| {
                    Box::pin(async move { handler.write_cutoff(tx, version).await })
                })
                .await
                .with_context(|| format!("failed to set cutoff to {version}"))?;
            println!("Cutoff set to {version}");
        }
    }
    Ok(())
}

fn print_event(event: &EslEvent) -> Result<()> {
    println!("Version:    {}", event.esl_version);
    println!("Created:    {}", event.created);
    println!("Event type: {}", event.event_type);
    println!("{}", serde_json::to_string_pretty(&event.json)?);
    Ok(())
}

fn print_failed_event(event: &FailedEslEvent) -> Result<()> {
    println!(
        "{} {} {} (transformer {})",
        event.esl_version, event.created, event.event_type, event.transformer_esl_version
    );
    println!("  reason: {}", event.reason);
    println!("  {}", serde_json::to_string(&event.json)?);
    Ok(())
}
