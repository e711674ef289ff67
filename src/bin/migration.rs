//! Applies (or rolls back) the StockFlow schema against the configured database.
//!
//! Usage: `migration [up|down|status]`, defaulting to `up`.

use anyhow::{bail, Context, Result};
use sea_orm_migration::MigratorTrait;
use tracing::{error, info};

use stockflow::config::{init_tracing, load_config};
use stockflow::db::establish_connection_from_app_config;
use stockflow::migrator::Migrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config().context("failed to load configuration")?;
    init_tracing(cfg.log_level(), cfg.log_json);

    let command = std::env::args().nth(1).unwrap_or_else(|| "up".to_string());
    let pool = establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;

    info!(environment = %cfg.environment, %command, "Running migration command");
    let outcome = match command.as_str() {
        "up" => Migrator::up(&pool, None).await,
        "down" => Migrator::down(&pool, Some(1)).await,
        "status" => Migrator::status(&pool).await,
        other => bail!("unknown migration command '{}', expected up, down or status", other),
    };

    if let Err(e) = outcome {
        error!("Migration command '{}' failed: {}", command, e);
        return Err(e.into());
    }
    info!("Migration command '{}' completed", command);
    Ok(())
}
