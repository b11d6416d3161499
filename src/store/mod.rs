//! Catalog version stores
//!
//! Port traits for the two ETL entry points (`record_price`,
//! `record_inventory`) plus their read side, and the row types they return.
//! Backends:
//! - [`memory::MemoryStore`]: in-process, used by tests
//! - [`postgres::PgStore`]: sqlx / Postgres (feature `database`)
//! - [`psql_exec::PsqlExecTarget`]: migration target only, via `psql`

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;
pub mod psql_exec;
pub mod temporal;

pub use memory::MemoryStore;
#[cfg(feature = "database")]
pub use postgres::PgStore;
pub use psql_exec::{ExecMode, PsqlExecTarget};

/// Price validity interval `[effective_from, effective_to)`.
/// `effective_to == None` means open (currently in effect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "database", derive(sqlx::FromRow))]
pub struct PriceInterval {
    pub id: i64,
    pub code: String,
    pub price: Decimal,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
}

impl PriceInterval {
    pub fn is_open(&self) -> bool {
        self.effective_to.is_none()
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.effective_from <= instant && self.effective_to.map_or(true, |to| instant < to)
    }

    /// Half-open overlap test, treating an open end as +infinity.
    pub fn overlaps(&self, other: &PriceInterval) -> bool {
        let starts_before_other_ends = other.effective_to.map_or(true, |to| self.effective_from < to);
        let other_starts_before_self_ends =
            self.effective_to.map_or(true, |to| other.effective_from < to);
        starts_before_other_ends && other_starts_before_self_ends
    }
}

/// What `record_price` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PriceOutcome {
    /// No price in the observation.
    NoPrice,
    /// Open interval already carries this price.
    Unchanged,
    /// First price for the code.
    Opened,
    /// Previous open interval closed at the observation instant.
    Superseded { previous: Decimal },
}

/// One inventory observation from the ETL pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryObservation {
    pub code: String,
    pub stock_total: Decimal,
    pub reserved: Decimal,
    pub stock_free: Decimal,
    pub as_of: DateTime<Utc>,
}

/// Latest known inventory state for a code (last write wins).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "database", derive(sqlx::FromRow))]
pub struct InventorySnapshot {
    pub code: String,
    pub stock_total: Decimal,
    pub reserved: Decimal,
    pub stock_free: Decimal,
    pub as_of_date: NaiveDate,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit row, one per observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "database", derive(sqlx::FromRow))]
pub struct InventoryHistoryEntry {
    pub id: i64,
    pub code: String,
    pub stock_total: Decimal,
    pub reserved: Decimal,
    pub stock_free: Decimal,
    pub as_of: DateTime<Utc>,
}

/// Owning product rows. Price and inventory rows reference a product code.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Create the product if absent. Returns `true` when a row was created.
    async fn ensure_product(&self, code: &str, name: Option<&str>) -> StoreResult<bool>;
}

#[async_trait]
pub trait PriceHistoryStore: Send + Sync {
    /// Record a price observation.
    ///
    /// - `price == None`: no-op
    /// - same price as the open interval: no-op
    /// - otherwise the open interval (if any) is closed at `effective_from`
    ///   and a new open interval starts there, in one transaction
    ///
    /// A change observed at or before the open interval's start is rejected
    /// with `OutOfOrderObservation`.
    async fn record_price(
        &self,
        code: &str,
        price: Option<Decimal>,
        effective_from: DateTime<Utc>,
    ) -> StoreResult<PriceOutcome>;

    async fn open_interval(&self, code: &str) -> StoreResult<Option<PriceInterval>>;

    /// Price in effect at `instant`, if history covers it.
    async fn price_as_of(&self, code: &str, instant: DateTime<Utc>) -> StoreResult<Option<Decimal>>;

    /// Every interval for the code, oldest first.
    async fn price_history(&self, code: &str) -> StoreResult<Vec<PriceInterval>>;
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Append a history entry and upsert the snapshot, in one transaction.
    async fn record_inventory(&self, observation: &InventoryObservation) -> StoreResult<()>;

    async fn snapshot(&self, code: &str) -> StoreResult<Option<InventorySnapshot>>;

    /// Every observation for the code, in insertion order.
    async fn history(&self, code: &str) -> StoreResult<Vec<InventoryHistoryEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn interval(from_day: u32, to_day: Option<u32>) -> PriceInterval {
        PriceInterval {
            id: 0,
            code: "W001".into(),
            price: Decimal::new(100000, 2),
            effective_from: Utc.with_ymd_and_hms(2024, 1, from_day, 0, 0, 0).unwrap(),
            effective_to: to_day.map(|d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()),
        }
    }

    #[test]
    fn test_adjacent_intervals_do_not_overlap() {
        let a = interval(1, Some(10));
        let b = interval(10, None);
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn test_open_interval_overlaps_later_start() {
        let a = interval(1, None);
        let b = interval(5, Some(6));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn test_contains_is_half_open() {
        let a = interval(1, Some(10));
        assert!(a.contains(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        assert!(!a.contains(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()));
        assert!(interval(1, None).contains(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()));
    }
}
