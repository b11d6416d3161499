//! Error types for the migration applier and the catalog version stores.
//!
//! Both taxonomies use thiserror. Unexpected failures from the backing
//! store are carried as `anyhow::Error` in the `Internal` variants.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Logical outcome of a migration run, independent of any process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    ToolUnavailable,
    ConnectivityTimeout,
    MigrationsDirMissing,
    DriftDetected,
    ExecutionFailure,
    ConfigurationError,
}

impl ExitKind {
    /// Process exit code reported by `cellar-migrate`.
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::ExecutionFailure => 1,
            Self::ToolUnavailable => 2,
            Self::ConnectivityTimeout => 3,
            Self::MigrationsDirMissing => 4,
            Self::DriftDetected => 5,
            Self::ConfigurationError => 64,
        }
    }
}

/// Fatal conditions of a migration run. Any of these aborts the whole run.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("required tool '{tool}' is not available")]
    ToolUnavailable { tool: String },

    #[error("store {target} not reachable after {waited_secs}s: {last_error}")]
    ConnectivityTimeout {
        target: String,
        waited_secs: u64,
        last_error: String,
    },

    #[error("migrations directory not found: {}", .0.display())]
    MigrationsDirMissing(PathBuf),

    #[error("drift detected in {filename}: recorded {recorded}, current {current}")]
    DriftDetected {
        filename: String,
        recorded: String,
        current: String,
    },

    #[error("migration {filename} failed: {message}")]
    ExecutionFailure { filename: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MigrateError {
    pub fn exit_kind(&self) -> ExitKind {
        match self {
            Self::ToolUnavailable { .. } => ExitKind::ToolUnavailable,
            Self::ConnectivityTimeout { .. } => ExitKind::ConnectivityTimeout,
            Self::MigrationsDirMissing(_) => ExitKind::MigrationsDirMissing,
            Self::DriftDetected { .. } => ExitKind::DriftDetected,
            Self::Config(_) => ExitKind::ConfigurationError,
            Self::ExecutionFailure { .. } | Self::Io(_) | Self::Internal(_) => {
                ExitKind::ExecutionFailure
            }
        }
    }
}

/// Errors surfaced by the price and inventory stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "out-of-order observation for {code}: observed {observed}, open interval starts {open_from}"
    )]
    OutOfOrderObservation {
        code: String,
        open_from: DateTime<Utc>,
        observed: DateTime<Utc>,
    },

    #[error("overlapping interval rejected for {code}: {detail}")]
    OverlapRejected { code: String, detail: String },

    #[error("unknown product code: {0}")]
    UnknownProduct(String),

    #[error("invalid observation: {0}")]
    InvalidObservation(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    // ── exit kinds ─────────────────────────────────────────────

    #[test]
    fn drift_maps_to_drift_exit() {
        let e = MigrateError::DriftDetected {
            filename: "0001_init.sql".into(),
            recorded: "aa".into(),
            current: "bb".into(),
        };
        assert_eq!(e.exit_kind(), ExitKind::DriftDetected);
        assert_eq!(e.exit_kind().code(), 5);
    }

    #[test]
    fn io_and_internal_are_execution_failures() {
        let io = MigrateError::Io(std::io::Error::other("disk"));
        assert_eq!(io.exit_kind(), ExitKind::ExecutionFailure);
        let internal = MigrateError::Internal(anyhow::anyhow!("boom"));
        assert_eq!(internal.exit_kind(), ExitKind::ExecutionFailure);
    }

    #[test]
    fn exit_codes_are_distinct() {
        let kinds = [
            ExitKind::Success,
            ExitKind::ToolUnavailable,
            ExitKind::ConnectivityTimeout,
            ExitKind::MigrationsDirMissing,
            ExitKind::DriftDetected,
            ExitKind::ExecutionFailure,
            ExitKind::ConfigurationError,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert_eq!(ExitKind::Success.code(), 0);
    }

    // ── Display ────────────────────────────────────────────────

    #[test]
    fn display_dir_missing() {
        let e = MigrateError::MigrationsDirMissing(PathBuf::from("/srv/migrations"));
        assert_eq!(
            e.to_string(),
            "migrations directory not found: /srv/migrations"
        );
    }

    #[test]
    fn display_unknown_product() {
        let e = StoreError::UnknownProduct("W001".into());
        assert_eq!(e.to_string(), "unknown product code: W001");
    }
}
