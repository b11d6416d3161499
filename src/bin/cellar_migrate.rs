//! cellar-migrate: startup gate and ETL entry points for the cellar store.
//!
//! # Usage
//!
//! ```bash
//! # Apply pending migrations (exit code reports the outcome)
//! cellar-migrate run
//!
//! # Show pending / applied / drifted files
//! cellar-migrate status --json
//!
//! # Fail if any applied file was edited
//! cellar-migrate verify
//!
//! # ETL observations
//! cellar-migrate record-price W001 1200.00 2024-02-01
//! cellar-migrate record-inventory W001 24 4 20 2024-02-01T06:00:00Z
//! ```
//!
//! Connection settings come from `CELLAR_DB_*` / `PG*` variables (a `.env`
//! file is honoured). Flags override the environment.

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{error, info};

use cellar::config::{BackendKind, Config};
use cellar::error::{ExitKind, MigrateError};
use cellar::migrations::{MigrationApplier, MigrationTarget};
use cellar::store::PsqlExecTarget;
use cellar::{InventoryObservation, InventoryStore, PriceHistoryStore, ProductCatalog};

#[derive(Parser)]
#[command(name = "cellar-migrate")]
#[command(version)]
#[command(about = "Checksum-verified schema migrations and catalog ETL entry points")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Migrations directory (overrides CELLAR_MIGRATIONS_DIR)
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,

    /// Backend: direct, psql, docker (overrides CELLAR_MIGRATE_BACKEND)
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Container name for the docker backend
    #[arg(long, global = true)]
    container: Option<String>,

    /// Base schema applied before the ordered migrations
    #[arg(long, global = true)]
    base_schema: Option<PathBuf>,

    /// Ready marker written after a successful run
    #[arg(long, global = true)]
    ready_file: Option<PathBuf>,

    /// Readiness timeout in seconds
    #[arg(long, global = true)]
    wait_timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations
    Run,

    /// Classify every migration file without executing anything
    Status {
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fail with a drift exit code if an applied file changed
    Verify,

    /// Record a price observation
    RecordPrice {
        code: String,
        /// Decimal price, or `-` when the observation carries none
        price: String,
        /// RFC 3339 timestamp or YYYY-MM-DD (midnight UTC)
        as_of: String,
        /// Create the product row first if it does not exist
        #[arg(long)]
        ensure_product: bool,
    },

    /// Record an inventory observation
    RecordInventory {
        code: String,
        stock_total: Decimal,
        reserved: Decimal,
        stock_free: Decimal,
        /// RFC 3339 timestamp or YYYY-MM-DD (midnight UTC)
        as_of: String,
        /// Create the product row first if it does not exist
        #[arg(long)]
        ensure_product: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match resolve_config(&cli) {
        Ok(config) => dispatch(cli.command, &config).await,
        Err(e) => Err(e),
    };

    let kind = match result {
        Ok(()) => ExitKind::Success,
        Err(e) => {
            error!("{}", e);
            e.exit_kind()
        }
    };
    ExitCode::from(kind.code() as u8)
}

fn resolve_config(cli: &Cli) -> Result<Config, MigrateError> {
    let mut config = Config::from_env()?;
    if let Some(dir) = &cli.migrations_dir {
        config.migrations_dir = dir.clone();
    }
    if let Some(backend) = &cli.backend {
        config.backend = backend.parse()?;
    }
    if let Some(container) = &cli.container {
        config.container = container.clone();
    }
    if let Some(base) = &cli.base_schema {
        config.base_schema = Some(base.clone());
    }
    if let Some(ready) = &cli.ready_file {
        config.ready_file = Some(ready.clone());
    }
    if let Some(secs) = cli.wait_timeout {
        config.readiness.timeout = Duration::from_secs(secs);
    }
    Ok(config)
}

async fn dispatch(command: Commands, config: &Config) -> Result<(), MigrateError> {
    match command {
        Commands::Run => {
            let target = build_target(config)?;
            info!(
                "Migrating {} via {} backend",
                target.describe(),
                config.backend
            );
            let report = MigrationApplier::new(target.as_ref(), config).run().await?;
            println!("{}", report);
            Ok(())
        }
        Commands::Status { json } => {
            let target = build_target(config)?;
            let plan = MigrationApplier::new(target.as_ref(), config).plan().await?;
            if json {
                let out = serde_json::to_string_pretty(&plan)
                    .map_err(|e| MigrateError::Internal(e.into()))?;
                println!("{}", out);
            } else {
                println!("{}", plan);
            }
            Ok(())
        }
        Commands::Verify => {
            let target = build_target(config)?;
            let plan = MigrationApplier::new(target.as_ref(), config)
                .verify()
                .await?;
            println!("No drift: {} file(s) checked", plan.entries.len());
            Ok(())
        }
        Commands::RecordPrice {
            code,
            price,
            as_of,
            ensure_product,
        } => {
            let price = parse_price(&price)?;
            let as_of = parse_instant(&as_of)?;
            let store = catalog_store(config)?;
            if ensure_product {
                store.ensure_product(&code, None).await.map_err(store_failure)?;
            }
            let outcome = store
                .record_price(&code, price, as_of)
                .await
                .map_err(store_failure)?;
            println!(
                "{}",
                serde_json::to_string(&outcome).map_err(|e| MigrateError::Internal(e.into()))?
            );
            Ok(())
        }
        Commands::RecordInventory {
            code,
            stock_total,
            reserved,
            stock_free,
            as_of,
            ensure_product,
        } => {
            let observation = InventoryObservation {
                code,
                stock_total,
                reserved,
                stock_free,
                as_of: parse_instant(&as_of)?,
            };
            let store = catalog_store(config)?;
            if ensure_product {
                store
                    .ensure_product(&observation.code, None)
                    .await
                    .map_err(store_failure)?;
            }
            store
                .record_inventory(&observation)
                .await
                .map_err(store_failure)?;
            println!("Recorded inventory for {}", observation.code);
            Ok(())
        }
    }
}

fn build_target(config: &Config) -> Result<Box<dyn MigrationTarget>, MigrateError> {
    match config.backend {
        BackendKind::Direct => direct_target(config),
        BackendKind::Psql | BackendKind::DockerExec => {
            Ok(Box::new(PsqlExecTarget::from_config(config)))
        }
    }
}

#[cfg(feature = "database")]
fn direct_target(config: &Config) -> Result<Box<dyn MigrationTarget>, MigrateError> {
    Ok(Box::new(pg_store(config)?))
}

#[cfg(not(feature = "database"))]
fn direct_target(_config: &Config) -> Result<Box<dyn MigrationTarget>, MigrateError> {
    Err(MigrateError::Config(
        "direct backend requires the `database` feature; use --backend psql or docker".to_string(),
    ))
}

#[cfg(feature = "database")]
fn pg_store(config: &Config) -> Result<cellar::store::PgStore, MigrateError> {
    let acquire_timeout = config.readiness.interval.max(Duration::from_secs(5));
    cellar::store::PgStore::connect_lazy(&config.database, acquire_timeout)
}

#[cfg(feature = "database")]
fn catalog_store(config: &Config) -> Result<cellar::store::PgStore, MigrateError> {
    pg_store(config)
}

#[cfg(not(feature = "database"))]
fn catalog_store(_config: &Config) -> Result<cellar::store::MemoryStore, MigrateError> {
    Err(MigrateError::Config(
        "record commands require the `database` feature".to_string(),
    ))
}

fn store_failure(err: cellar::StoreError) -> MigrateError {
    MigrateError::Internal(anyhow!(err))
}

fn parse_price(raw: &str) -> Result<Option<Decimal>, MigrateError> {
    if raw == "-" {
        return Ok(None);
    }
    Decimal::from_str(raw)
        .map(Some)
        .map_err(|e| MigrateError::Config(format!("invalid price '{}': {}", raw, e)))
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, MigrateError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| MigrateError::Config(format!("invalid timestamp '{}': {}", raw, e)))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| MigrateError::Config(format!("invalid timestamp '{}'", raw)))
}
