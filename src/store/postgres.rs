//! Postgres implementations of the ledger, migration target and catalog
//! version stores.
//!
//! One newtype over `PgPool`. All SQL is runtime-checked (`sqlx::query`, not
//! `sqlx::query!`) so building the crate never needs a live database.
//!
//! Every write that must be atomic runs inside a transaction guarded by a
//! transaction-scoped advisory lock: the ledger key for migrations, a hash of
//! the product code for price observations. The table constraints
//! (`EXCLUDE USING gist`, one-open-interval partial index) stay in force as
//! the backstop if two writers ever get past the lock.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use super::temporal::{normalize_instant, plan_price_change, validate_code, PricePlan};
use super::{
    InventoryHistoryEntry, InventoryObservation, InventorySnapshot, InventoryStore,
    PriceHistoryStore, PriceInterval, PriceOutcome, ProductCatalog,
};
use crate::config::DatabaseConfig;
use crate::error::{MigrateError, StoreError, StoreResult};
use crate::migrations::ledger::{
    BackendError, BackendResult, MigrationLedger, MigrationRecord, MigrationTarget, LEDGER_DDL,
    LEDGER_LOCK_KEY,
};

const PG_UNIQUE_VIOLATION: &str = "23505";
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";
const PG_CHECK_VIOLATION: &str = "23514";
const PG_EXCLUSION_VIOLATION: &str = "23P01";

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    label: String,
}

impl PgStore {
    /// Connect eagerly from a URL (tests, ETL callers).
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            label: crate::config::mask_database_url(url),
        })
    }

    /// Build a pool that connects on first use, so the readiness gate owns
    /// the waiting.
    pub fn connect_lazy(db: &DatabaseConfig, acquire_timeout: Duration) -> Result<Self, MigrateError> {
        let url = db.url()?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(&url)
            .map_err(|e| MigrateError::Config(format!("invalid database url: {}", e)))?;
        info!("Using database {}", db.masked_url());
        Ok(Self {
            pool,
            label: db.masked_url(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_error_code(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn backend_err(e: sqlx::Error) -> BackendError {
    match e {
        sqlx::Error::Database(db) => BackendError::Execution(match db.code() {
            Some(code) => format!("{} (SQLSTATE {})", db.message(), code),
            None => db.message().to_string(),
        }),
        other => BackendError::Other(anyhow!(other)),
    }
}

/// Translate constraint violations on catalog writes into typed errors.
fn write_err(code: &str, e: sqlx::Error) -> StoreError {
    match db_error_code(&e).as_deref() {
        Some(PG_EXCLUSION_VIOLATION) | Some(PG_UNIQUE_VIOLATION) => StoreError::OverlapRejected {
            code: code.to_string(),
            detail: e.to_string(),
        },
        Some(PG_FOREIGN_KEY_VIOLATION) => StoreError::UnknownProduct(code.to_string()),
        Some(PG_CHECK_VIOLATION) => StoreError::InvalidObservation(e.to_string()),
        _ => StoreError::Internal(anyhow!(e)),
    }
}

fn read_err(e: sqlx::Error) -> StoreError {
    StoreError::Internal(anyhow!(e))
}

// ── MigrationLedger / MigrationTarget ─────────────────────────

#[async_trait]
impl MigrationLedger for PgStore {
    async fn ensure_exists(&self) -> BackendResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(LEDGER_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        sqlx::query(LEDGER_DDL)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        tx.commit().await.map_err(backend_err)
    }

    async fn lookup(&self, filename: &str) -> BackendResult<Option<MigrationRecord>> {
        sqlx::query_as::<_, MigrationRecord>(
            r#"
            SELECT filename, content_hash::text AS content_hash, applied_at
            FROM schema_migrations
            WHERE filename = $1
            "#,
        )
        .bind(filename)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)
    }

    async fn insert_if_absent(&self, filename: &str, content_hash: &str) -> BackendResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO schema_migrations (filename, content_hash)
            VALUES ($1, $2)
            ON CONFLICT (filename) DO NOTHING
            "#,
        )
        .bind(filename)
        .bind(content_hash)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_applied(&self) -> BackendResult<Vec<MigrationRecord>> {
        sqlx::query_as::<_, MigrationRecord>(
            r#"
            SELECT filename, content_hash::text AS content_hash, applied_at
            FROM schema_migrations
            ORDER BY filename
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)
    }
}

#[async_trait]
impl MigrationTarget for PgStore {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn ping(&self) -> BackendResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(backend_err)
    }

    async fn execute_script(&self, sql: &str) -> BackendResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        // `CREATE ... IF NOT EXISTS` is not atomic across sessions.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(LEDGER_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(sql))
            .await
            .map_err(backend_err)?;
        tx.commit().await.map_err(backend_err)
    }

    async fn apply_migration(
        &self,
        filename: &str,
        content_hash: &str,
        sql: &str,
    ) -> BackendResult<bool> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(LEDGER_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

        // Re-check under the lock: another applier may have won the race.
        let already: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM schema_migrations WHERE filename = $1)",
        )
        .bind(filename)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend_err)?;
        if already {
            tx.rollback().await.map_err(backend_err)?;
            return Ok(false);
        }

        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(sql))
            .await
            .map_err(backend_err)?;
        sqlx::query("INSERT INTO schema_migrations (filename, content_hash) VALUES ($1, $2)")
            .bind(filename)
            .bind(content_hash)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        tx.commit().await.map_err(backend_err)?;
        Ok(true)
    }
}

// ── Catalog ───────────────────────────────────────────────────

#[async_trait]
impl ProductCatalog for PgStore {
    async fn ensure_product(&self, code: &str, name: Option<&str>) -> StoreResult<bool> {
        validate_code(code)?;
        let result = sqlx::query(
            r#"
            INSERT INTO catalog.products (code, name)
            VALUES ($1, $2)
            ON CONFLICT (code) DO NOTHING
            "#,
        )
        .bind(code)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| write_err(code, e))?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl PriceHistoryStore for PgStore {
    async fn record_price(
        &self,
        code: &str,
        price: Option<Decimal>,
        effective_from: DateTime<Utc>,
    ) -> StoreResult<PriceOutcome> {
        if price.is_none() {
            validate_code(code)?;
            return Ok(PriceOutcome::NoPrice);
        }

        let mut tx = self.pool.begin().await.map_err(read_err)?;

        // Serialise writers for this code; other codes proceed in parallel.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(code)
            .execute(&mut *tx)
            .await
            .map_err(read_err)?;

        let open = sqlx::query_as::<_, PriceInterval>(
            r#"
            SELECT id, code, price, effective_from, effective_to
            FROM catalog.price_history
            WHERE code = $1 AND effective_to IS NULL
            FOR UPDATE
            "#,
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await
        .map_err(read_err)?;

        let outcome = match plan_price_change(code, open.as_ref(), price, effective_from)? {
            PricePlan::NoPrice => PriceOutcome::NoPrice,
            PricePlan::Unchanged => PriceOutcome::Unchanged,
            PricePlan::Open { price, at } => {
                insert_open_interval(&mut tx, code, price, at).await?;
                debug!("Opened price interval for {} at {}", code, at);
                PriceOutcome::Opened
            }
            PricePlan::Supersede {
                close_id,
                previous,
                price,
                at,
            } => {
                let closed = sqlx::query(
                    r#"
                    UPDATE catalog.price_history
                    SET effective_to = $2
                    WHERE id = $1 AND effective_to IS NULL
                    "#,
                )
                .bind(close_id)
                .bind(at)
                .execute(&mut *tx)
                .await
                .map_err(|e| write_err(code, e))?;
                if closed.rows_affected() != 1 {
                    return Err(StoreError::OverlapRejected {
                        code: code.to_string(),
                        detail: format!("open interval {} was closed concurrently", close_id),
                    });
                }
                insert_open_interval(&mut tx, code, price, at).await?;
                debug!("Superseded price for {}: {} -> {} at {}", code, previous, price, at);
                PriceOutcome::Superseded { previous }
            }
        };

        tx.commit().await.map_err(|e| write_err(code, e))?;
        Ok(outcome)
    }

    async fn open_interval(&self, code: &str) -> StoreResult<Option<PriceInterval>> {
        sqlx::query_as::<_, PriceInterval>(
            r#"
            SELECT id, code, price, effective_from, effective_to
            FROM catalog.price_history
            WHERE code = $1 AND effective_to IS NULL
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_err)
    }

    async fn price_as_of(&self, code: &str, instant: DateTime<Utc>) -> StoreResult<Option<Decimal>> {
        sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT price
            FROM catalog.price_history
            WHERE code = $1
              AND effective_from <= $2
              AND (effective_to IS NULL OR $2 < effective_to)
            "#,
        )
        .bind(code)
        .bind(normalize_instant(instant))
        .fetch_optional(&self.pool)
        .await
        .map_err(read_err)
    }

    async fn price_history(&self, code: &str) -> StoreResult<Vec<PriceInterval>> {
        sqlx::query_as::<_, PriceInterval>(
            r#"
            SELECT id, code, price, effective_from, effective_to
            FROM catalog.price_history
            WHERE code = $1
            ORDER BY effective_from
            "#,
        )
        .bind(code)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err)
    }
}

async fn insert_open_interval(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    code: &str,
    price: Decimal,
    at: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO catalog.price_history (code, price, effective_from, effective_to)
        VALUES ($1, $2, $3, NULL)
        "#,
    )
    .bind(code)
    .bind(price)
    .bind(at)
    .execute(&mut **tx)
    .await
    .map_err(|e| write_err(code, e))?;
    Ok(())
}

#[async_trait]
impl InventoryStore for PgStore {
    async fn record_inventory(&self, observation: &InventoryObservation) -> StoreResult<()> {
        validate_code(&observation.code)?;
        let code = observation.code.as_str();
        let as_of = normalize_instant(observation.as_of);

        let mut tx = self.pool.begin().await.map_err(read_err)?;

        sqlx::query(
            r#"
            INSERT INTO catalog.inventory_history (code, stock_total, reserved, stock_free, as_of)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(code)
        .bind(observation.stock_total)
        .bind(observation.reserved)
        .bind(observation.stock_free)
        .bind(as_of)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_err(code, e))?;

        sqlx::query(
            r#"
            INSERT INTO catalog.inventory_snapshot
                (code, stock_total, reserved, stock_free, as_of_date, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (code) DO UPDATE SET
                stock_total = EXCLUDED.stock_total,
                reserved    = EXCLUDED.reserved,
                stock_free  = EXCLUDED.stock_free,
                as_of_date  = EXCLUDED.as_of_date,
                updated_at  = now()
            "#,
        )
        .bind(code)
        .bind(observation.stock_total)
        .bind(observation.reserved)
        .bind(observation.stock_free)
        .bind(as_of.date_naive())
        .execute(&mut *tx)
        .await
        .map_err(|e| write_err(code, e))?;

        tx.commit().await.map_err(|e| write_err(code, e))
    }

    async fn snapshot(&self, code: &str) -> StoreResult<Option<InventorySnapshot>> {
        sqlx::query_as::<_, InventorySnapshot>(
            r#"
            SELECT code, stock_total, reserved, stock_free, as_of_date, updated_at
            FROM catalog.inventory_snapshot
            WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_err)
    }

    async fn history(&self, code: &str) -> StoreResult<Vec<InventoryHistoryEntry>> {
        sqlx::query_as::<_, InventoryHistoryEntry>(
            r#"
            SELECT id, code, stock_total, reserved, stock_free, as_of
            FROM catalog.inventory_history
            WHERE code = $1
            ORDER BY id
            "#,
        )
        .bind(code)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err)
    }
}
