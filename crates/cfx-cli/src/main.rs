use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cfx_storage::PgCountryStore;
use cfx_sync::{fixture_service, service_from_config, RefreshConfig};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cfx-cli")]
#[command(about = "Country + exchange-rate cache command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch both upstreams, reconcile, and upsert the country table.
    Refresh {
        /// Read countries.json and rates.json from this directory instead of the network.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Print the row count and latest refresh time held by the store.
    Status,
    /// Apply pending Postgres migrations (requires DATABASE_URL).
    Migrate,
    /// Run the JSON API on CFX_WEB_PORT.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RefreshConfig::from_env();

    match cli.command.unwrap_or(Commands::Refresh { fixtures: None }) {
        Commands::Refresh { fixtures } => {
            let service = match fixtures {
                Some(dir) => fixture_service(&config, &dir).await?,
                None => service_from_config(&config).await?,
            };
            let outcome = service.refresh().await?;
            println!(
                "refresh complete: run_id={} written={} no_currency={} unresolved_currency={}",
                outcome.run_id,
                outcome.records_written,
                outcome.countries_with_no_currency.len(),
                outcome.countries_with_unresolved_currency.len()
            );
        }
        Commands::Status => {
            let service = service_from_config(&config).await?;
            let status = service.store_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgCountryStore::connect(url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let service = service_from_config(&config).await?;
            cfx_web::serve(Arc::new(service), config.web_port).await?;
        }
    }

    Ok(())
}
