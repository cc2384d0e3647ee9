use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use donorstats_core::parse_calendar_date;
use donorstats_import::{sample, seed_sample_data, Importer};
use donorstats_storage::{PgRecordStore, RecordStore};
use donorstats_web::ServiceConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "donorstats")]
#[command(about = "Donor statistics dashboard backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (default).
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Import a spreadsheet of recurring donor agreements.
    Import {
        file: PathBuf,
        /// Delete all agreements before importing.
        #[arg(long)]
        clear: bool,
    },
    /// Fill the database with synthetic stats and donors up to today.
    Seed {
        /// First day to generate (YYYY-MM-DD or DD.MM.YYYY).
        #[arg(long, value_parser = parse_date_arg)]
        from: Option<NaiveDate>,
    },
    /// Delete every recurring donor agreement.
    ClearDonors,
}

fn parse_date_arg(raw: &str) -> Result<NaiveDate, String> {
    parse_calendar_date(raw).ok_or_else(|| format!("invalid date: {raw}"))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn connect(config: &ServiceConfig) -> Result<PgRecordStore> {
    let store = PgRecordStore::connect(&config.database_url)
        .await
        .context("failed to connect to the database")?;
    store.migrate().await.context("failed to apply migrations")?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ServiceConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let store = connect(&config).await?;
            donorstats_web::serve(config, Arc::new(store)).await?;
        }
        Commands::Migrate => {
            connect(&config).await?;
            println!("migrations applied");
        }
        Commands::Import { file, clear } => {
            let store = Arc::new(connect(&config).await?);
            if clear {
                let removed = store.clear_agreements().await?;
                info!(removed, "cleared existing agreements");
            }
            let importer = Importer::new(store, config.import.clone());
            let summary = importer
                .import_file(&file)
                .await
                .with_context(|| format!("failed to import {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Seed { from } => {
            let store = connect(&config).await?;
            let from = match from {
                Some(date) => date,
                None => sample::default_seed_start().context("invalid default seed start")?,
            };
            let to = Local::now().date_naive();
            let mut rng = StdRng::from_entropy();
            let report = seed_sample_data(&store, &mut rng, from, to).await?;
            println!(
                "seeded {} days: {} stats, {} agreements ({} removed first)",
                report.days, report.stats_written, report.agreements_written, report.agreements_cleared
            );
        }
        Commands::ClearDonors => {
            let store = connect(&config).await?;
            let removed = store.clear_agreements().await?;
            println!("deleted {removed} recurring donor agreements");
        }
    }

    Ok(())
}
