//! Migration ledger and target-store port traits.
//!
//! The applier depends only on these traits. Implementations live in
//! `crate::store` (Postgres via sqlx, psql/docker exec, in-memory).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Idempotent ledger DDL. Run under [`LEDGER_LOCK_KEY`] so concurrent
/// bootstraps cannot race on the catalog entry.
pub const LEDGER_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    filename     TEXT PRIMARY KEY,
    content_hash CHAR(64) NOT NULL CHECK (content_hash ~ '^[0-9a-f]{64}$'),
    applied_at   TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// Transaction-scoped advisory lock key serialising ledger bootstrap and
/// migration application across processes.
pub const LEDGER_LOCK_KEY: i64 = 0x6365_6c6c_6172_0001;

/// One applied migration. Never updated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "database", derive(sqlx::FromRow))]
pub struct MigrationRecord {
    pub filename: String,
    pub content_hash: String,
    pub applied_at: DateTime<Utc>,
}

/// Errors from a ledger or target backend, before the applier attributes
/// them to a specific file.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("tool '{0}' is not available")]
    ToolUnavailable(String),

    #[error("{0}")]
    Execution(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Durable record of applied migrations.
#[async_trait]
pub trait MigrationLedger: Send + Sync {
    /// Create the ledger table if absent. Safe to call repeatedly and
    /// concurrently.
    async fn ensure_exists(&self) -> BackendResult<()>;

    async fn lookup(&self, filename: &str) -> BackendResult<Option<MigrationRecord>>;

    /// Record a migration. Returns `false` when a row for the filename
    /// already exists; the existing row is left untouched.
    async fn insert_if_absent(&self, filename: &str, content_hash: &str) -> BackendResult<bool>;

    /// All ledger rows in filename order.
    async fn list_applied(&self) -> BackendResult<Vec<MigrationRecord>>;
}

/// A store the applier can bring up to date.
#[async_trait]
pub trait MigrationTarget: MigrationLedger {
    /// Human-readable target description for logs (no secrets).
    fn describe(&self) -> String;

    /// Confirm client tooling is present. Backends without external tools
    /// return `Ok(())`.
    async fn check_tooling(&self) -> BackendResult<()> {
        Ok(())
    }

    /// One cheap round-trip to the store.
    async fn ping(&self) -> BackendResult<()>;

    /// Execute a script without touching the ledger (base schema).
    async fn execute_script(&self, sql: &str) -> BackendResult<()>;

    /// Execute a migration and record it as one logical step.
    ///
    /// Returns `false` when another writer recorded the same filename first;
    /// in that case the script may or may not have run, which is harmless
    /// because migrations are self-idempotent.
    async fn apply_migration(
        &self,
        filename: &str,
        content_hash: &str,
        sql: &str,
    ) -> BackendResult<bool>;
}
