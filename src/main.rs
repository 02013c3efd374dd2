use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use channel_sync::config;
use channel_sync::db::{self, dispatch::{self, OutboxTable}};
use channel_sync::recalc;

#[derive(Debug, Parser)]
#[command(author, version, about = "Channel sync outbox maintenance")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending database migrations
    Migrate,
    /// Print pending row counts per outbox table
    Status,
    /// Recompute reservation aggregates
    Recalculate {
        /// Every reservation in the database
        #[arg(long, conflicts_with = "ids")]
        all: bool,
        /// Reservation ids
        ids: Vec<i64>,
    },
    /// Print an example configuration and exit
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Migrate => info!("migrations applied"),
        Command::Status => {
            for table in OutboxTable::ALL {
                let pending = dispatch::count_pending(&pool, table).await?;
                println!("{:<16} {}", table.as_str(), pending);
            }
        }
        Command::Recalculate { all, ids } => {
            let ids = if all { db::all_reservation_ids(&pool).await? } else { ids };
            if ids.is_empty() {
                bail!("nothing to recalculate: pass reservation ids or --all");
            }
            let updated = recalc::recalculate(&pool, &ids).await?;
            info!(requested = ids.len(), updated, "recalculation sweep finished");
        }
        Command::ExampleConfig => {}
    }

    Ok(())
}
