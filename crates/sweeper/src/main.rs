use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use wms_infra::idempotency::{IdempotencyGuard, IdempotencySweeper, PostgresIdempotencyStore};
use wms_infra::InfraConfig;

/// Deletes expired idempotency records from Postgres.
///
/// Connection and schedule come from the environment (`DATABASE_URL`,
/// `WMS_SWEEP_INTERVAL_SECS`, ...).
#[derive(Parser, Debug, Clone)]
#[command(name = "wms-sweeper")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    wms_observability::init();

    let config = InfraConfig::from_env().context("invalid configuration")?;

    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresIdempotencyStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to create idempotency schema")?;

    let guard = Arc::new(IdempotencyGuard::new(store, &config.idempotency));
    let sweeper = IdempotencySweeper::new(guard);

    if args.once {
        let deleted = sweeper.sweep_once().await.context("sweep failed")?;
        tracing::info!(deleted, "single sweep finished");
        return Ok(());
    }

    let handle = sweeper
        .spawn(config.sweeper)
        .context("invalid sweeper configuration")?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown requested");
    let stats = handle.shutdown().await;
    tracing::info!(
        sweeps = stats.sweeps,
        deleted = stats.deleted,
        errors = stats.errors,
        "idempotency sweeper stopped"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_flag_is_parsed() {
        assert!(Args::try_parse_from(["wms-sweeper", "--once"]).unwrap().once);
        assert!(!Args::try_parse_from(["wms-sweeper"]).unwrap().once);
    }

    #[test]
    fn unknown_arguments_are_rejected() {
        let err = Args::try_parse_from(["wms-sweeper", "--onec"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }
}
