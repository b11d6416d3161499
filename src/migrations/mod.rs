//! Checksum-verified, idempotent schema migrations.
//!
//! Files named `NNNN_description.sql` in the migrations directory are applied
//! once each, in filename order, and sealed in the `schema_migrations` ledger
//! with a SHA-256 of their bytes. Editing a sealed file is drift and stops
//! the run.

pub mod applier;
pub mod checksum;
pub mod discovery;
pub mod ledger;
pub mod readiness;

pub use applier::{MigrationApplier, MigrationPlan, PlanEntry, PlanStatus, RunReport};
pub use discovery::{discover, LoadedMigration, MigrationFile};
pub use ledger::{BackendError, MigrationLedger, MigrationRecord, MigrationTarget};
