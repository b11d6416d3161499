//! cellar: schema migrations and temporal catalog stores for the wine catalog.
//!
//! - [`migrations`]: checksum-verified migration applier and its ledger
//! - [`store`]: price history (non-overlapping intervals) and inventory
//!   snapshot/history stores, with Postgres, psql and in-memory backends

pub mod config;
pub mod error;
pub mod migrations;
pub mod store;

pub use config::{BackendKind, Config, DatabaseConfig, ReadinessConfig};
pub use error::{ExitKind, MigrateError, StoreError, StoreResult};
pub use migrations::{MigrationApplier, MigrationLedger, MigrationRecord, MigrationTarget};
pub use store::{
    InventoryHistoryEntry, InventoryObservation, InventorySnapshot, InventoryStore,
    PriceHistoryStore, PriceInterval, PriceOutcome, ProductCatalog,
};
