//! Checksum-verified migration applier.
//!
//! One run: tooling check, discovery, readiness gate, ledger bootstrap,
//! optional base schema, then each controlled file in filename order.
//! The run is fail-fast; the first error of any kind aborts it and leaves the
//! ledger exactly as it was before the failing file.

use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::checksum::short_hash;
use super::discovery::{discover, LoadedMigration};
use super::ledger::{BackendError, MigrationTarget};
use super::readiness::wait_until_ready;
use crate::config::Config;
use crate::error::MigrateError;

/// Summary of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    /// No controlled files were found. Logged as a warning, not an error.
    pub empty: bool,
    pub base_schema_applied: bool,
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.empty {
            return write!(f, "No migrations found");
        }
        write!(
            f,
            "{} applied, {} already up to date",
            self.applied.len(),
            self.skipped.len()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Applied,
    Drifted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub filename: String,
    pub status: PlanStatus,
    pub current_hash: String,
    pub recorded_hash: Option<String>,
}

/// Read-only view of where the target stands relative to the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationPlan {
    pub entries: Vec<PlanEntry>,
    /// Ledger rows whose file is no longer on disk.
    pub orphaned: Vec<String>,
}

impl MigrationPlan {
    pub fn pending(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries
            .iter()
            .filter(|e| e.status == PlanStatus::Pending)
    }

    pub fn first_drift(&self) -> Option<&PlanEntry> {
        self.entries
            .iter()
            .find(|e| e.status == PlanStatus::Drifted)
    }
}

impl std::fmt::Display for MigrationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            let status = match entry.status {
                PlanStatus::Pending => "pending",
                PlanStatus::Applied => "applied",
                PlanStatus::Drifted => "DRIFTED",
            };
            writeln!(
                f,
                "  {:<8} {}  {}",
                status,
                short_hash(&entry.current_hash),
                entry.filename
            )?;
        }
        for filename in &self.orphaned {
            writeln!(f, "  orphaned {}", filename)?;
        }
        write!(
            f,
            "{} file(s), {} pending",
            self.entries.len(),
            self.pending().count()
        )
    }
}

/// Contents of the ready marker.
#[derive(Debug, Serialize)]
struct ReadyMarker<'a> {
    target: &'a str,
    applied: usize,
    skipped: usize,
    completed_at: String,
}

pub struct MigrationApplier<'a> {
    target: &'a dyn MigrationTarget,
    config: &'a Config,
}

impl<'a> MigrationApplier<'a> {
    pub fn new(target: &'a dyn MigrationTarget, config: &'a Config) -> Self {
        Self { target, config }
    }

    /// Bring the target up to date.
    pub async fn run(&self) -> Result<RunReport, MigrateError> {
        if let Some(marker) = &self.config.ready_file {
            remove_stale_marker(marker)?;
        }

        self.target
            .check_tooling()
            .await
            .map_err(|e| backend_failure("tooling check", e))?;

        let files = discover(&self.config.migrations_dir)?;
        info!(
            "Found {} controlled migration(s) in {}",
            files.len(),
            self.config.migrations_dir.display()
        );

        wait_until_ready(self.target, &self.config.readiness).await?;

        self.target
            .ensure_exists()
            .await
            .map_err(|e| backend_failure("ledger bootstrap", e))?;

        let mut report = RunReport::default();

        if let Some(base) = &self.config.base_schema {
            self.apply_base_schema(base).await?;
            report.base_schema_applied = true;
        }

        if files.is_empty() {
            warn!(
                "No migrations found in {}",
                self.config.migrations_dir.display()
            );
            report.empty = true;
        }

        for file in &files {
            let migration = file.load()?;
            if self.apply_one(&migration).await? {
                report.applied.push(migration.filename);
            } else {
                report.skipped.push(migration.filename);
            }
        }

        if let Some(marker) = &self.config.ready_file {
            self.write_marker(marker, &report)?;
        }

        info!("Migration run complete: {}", report);
        Ok(report)
    }

    /// Classify every controlled file without executing anything.
    pub async fn plan(&self) -> Result<MigrationPlan, MigrateError> {
        self.target
            .check_tooling()
            .await
            .map_err(|e| backend_failure("tooling check", e))?;
        let files = discover(&self.config.migrations_dir)?;
        wait_until_ready(self.target, &self.config.readiness).await?;
        self.target
            .ensure_exists()
            .await
            .map_err(|e| backend_failure("ledger bootstrap", e))?;

        let mut plan = MigrationPlan::default();
        for file in &files {
            let migration = file.load()?;
            let recorded = self
                .target
                .lookup(&migration.filename)
                .await
                .map_err(|e| backend_failure(&migration.filename, e))?;
            let (status, recorded_hash) = match recorded {
                None => (PlanStatus::Pending, None),
                Some(r) if r.content_hash == migration.hash => {
                    (PlanStatus::Applied, Some(r.content_hash))
                }
                Some(r) => (PlanStatus::Drifted, Some(r.content_hash)),
            };
            plan.entries.push(PlanEntry {
                filename: migration.filename,
                status,
                current_hash: migration.hash,
                recorded_hash,
            });
        }

        let applied = self
            .target
            .list_applied()
            .await
            .map_err(|e| backend_failure("ledger listing", e))?;
        plan.orphaned = applied
            .into_iter()
            .map(|r| r.filename)
            .filter(|name| !files.iter().any(|f| &f.filename == name))
            .collect();

        Ok(plan)
    }

    /// Fail with `DriftDetected` on the first drifted file. Executes nothing.
    pub async fn verify(&self) -> Result<MigrationPlan, MigrateError> {
        let plan = self.plan().await?;
        if let Some(entry) = plan.first_drift() {
            return Err(MigrateError::DriftDetected {
                filename: entry.filename.clone(),
                recorded: entry.recorded_hash.clone().unwrap_or_default(),
                current: entry.current_hash.clone(),
            });
        }
        for filename in &plan.orphaned {
            warn!("Ledger row {} has no file on disk", filename);
        }
        Ok(plan)
    }

    async fn apply_base_schema(&self, path: &Path) -> Result<(), MigrateError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let sql = std::fs::read_to_string(path)?;
        info!("Applying base schema {}", path.display());
        self.target
            .execute_script(&sql)
            .await
            .map_err(|e| backend_failure(&name, e))
    }

    /// Returns `true` when the file was executed, `false` when skipped.
    async fn apply_one(&self, migration: &LoadedMigration) -> Result<bool, MigrateError> {
        let filename = migration.filename.as_str();
        let existing = self
            .target
            .lookup(filename)
            .await
            .map_err(|e| backend_failure(filename, e))?;

        if let Some(record) = existing {
            check_seal(filename, &record.content_hash, &migration.hash)?;
            debug!("Skipping {} (already applied)", filename);
            return Ok(false);
        }

        info!(
            "Applying {} ({})",
            filename,
            short_hash(&migration.hash)
        );
        let recorded = self
            .target
            .apply_migration(filename, &migration.hash, &migration.sql)
            .await
            .map_err(|e| backend_failure(filename, e))?;

        if recorded {
            return Ok(true);
        }

        // Lost the race to another applier: its seal must match ours.
        let winner = self
            .target
            .lookup(filename)
            .await
            .map_err(|e| backend_failure(filename, e))?
            .ok_or_else(|| MigrateError::ExecutionFailure {
                filename: filename.to_string(),
                message: "ledger reported the file as recorded but has no row".to_string(),
            })?;
        check_seal(filename, &winner.content_hash, &migration.hash)?;
        info!("{} was recorded concurrently, skipping", filename);
        Ok(false)
    }

    fn write_marker(&self, path: &Path, report: &RunReport) -> Result<(), MigrateError> {
        let target = self.target.describe();
        let marker = ReadyMarker {
            target: &target,
            applied: report.applied.len(),
            skipped: report.skipped.len(),
            completed_at: Utc::now().to_rfc3339(),
        };
        let body = serde_json::to_string_pretty(&marker)
            .map_err(|e| MigrateError::Internal(e.into()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, body)?;
        debug!("Wrote ready marker {}", path.display());
        Ok(())
    }
}

fn check_seal(filename: &str, recorded: &str, current: &str) -> Result<(), MigrateError> {
    if recorded == current {
        return Ok(());
    }
    error!(
        "Drift in {}: recorded {}, current {}",
        filename,
        short_hash(recorded),
        short_hash(current)
    );
    Err(MigrateError::DriftDetected {
        filename: filename.to_string(),
        recorded: recorded.to_string(),
        current: current.to_string(),
    })
}

fn remove_stale_marker(path: &Path) -> Result<(), MigrateError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed stale ready marker {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn backend_failure(context: &str, err: BackendError) -> MigrateError {
    match err {
        BackendError::ToolUnavailable(tool) => MigrateError::ToolUnavailable { tool },
        other => MigrateError::ExecutionFailure {
            filename: context.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadinessConfig;
    use crate::migrations::ledger::MigrationLedger;
    use crate::store::memory::MemoryStore;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config_for(dir: &Path) -> Config {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.migrations_dir = dir.to_path_buf();
        config.readiness = ReadinessConfig {
            timeout: Duration::from_millis(200),
            interval: Duration::from_millis(10),
        };
        config
    }

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn standard_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "0001_init.sql", "CREATE TABLE IF NOT EXISTS a (id int);");
        write(
            dir.path(),
            "0002_add_col.sql",
            "ALTER TABLE a ADD COLUMN IF NOT EXISTS b int;",
        );
        write(dir.path(), "2025-01-01-adhoc.sql", "DROP TABLE a;");
        dir
    }

    #[tokio::test]
    async fn test_applies_in_order_and_ignores_adhoc() {
        let dir = standard_dir();
        let config = config_for(dir.path());
        let store = MemoryStore::new();

        let report = MigrationApplier::new(&store, &config).run().await.unwrap();
        assert_eq!(report.applied, vec!["0001_init.sql", "0002_add_col.sql"]);
        assert!(report.skipped.is_empty());

        let executed = store.executed_scripts().await;
        assert_eq!(executed.len(), 2);
        assert!(executed[0].contains("CREATE TABLE"));
        assert!(executed.iter().all(|s| !s.contains("DROP TABLE")));
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let dir = standard_dir();
        let config = config_for(dir.path());
        let store = MemoryStore::new();
        let applier = MigrationApplier::new(&store, &config);

        applier.run().await.unwrap();
        let ledger_before = store.list_applied().await.unwrap();

        let report = applier.run().await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(store.executed_scripts().await.len(), 2);
        assert_eq!(store.list_applied().await.unwrap(), ledger_before);
    }

    #[tokio::test]
    async fn test_drift_stops_before_later_files() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "0001_init.sql", "CREATE TABLE IF NOT EXISTS a (id int);");
        let config = config_for(dir.path());
        let store = MemoryStore::new();
        MigrationApplier::new(&store, &config).run().await.unwrap();

        write(dir.path(), "0001_init.sql", "CREATE TABLE IF NOT EXISTS a (id bigint);");
        write(dir.path(), "0002_add_col.sql", "ALTER TABLE a ADD COLUMN b int;");

        let err = MigrationApplier::new(&store, &config)
            .run()
            .await
            .unwrap_err();
        match &err {
            MigrateError::DriftDetected { filename, .. } => assert_eq!(filename, "0001_init.sql"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.exit_kind(), crate::error::ExitKind::DriftDetected);
        assert!(store.lookup("0002_add_col.sql").await.unwrap().is_none());
        assert_eq!(store.executed_scripts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_execution_failure_stops_run() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "0001_ok.sql", "SELECT 1;");
        write(dir.path(), "0002_bad.sql", "SELECT broken;");
        write(dir.path(), "0003_after.sql", "SELECT 3;");
        let config = config_for(dir.path());
        let store = MemoryStore::new().with_failing_script("broken");

        let err = MigrationApplier::new(&store, &config)
            .run()
            .await
            .unwrap_err();
        match &err {
            MigrateError::ExecutionFailure { filename, .. } => assert_eq!(filename, "0002_bad.sql"),
            other => panic!("unexpected error: {other}"),
        }
        let recorded: Vec<String> = store
            .list_applied()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.filename)
            .collect();
        assert_eq!(recorded, vec!["0001_ok.sql"]);
    }

    #[tokio::test]
    async fn test_empty_directory_is_a_warning() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "README.md", "notes");
        let config = config_for(dir.path());
        let store = MemoryStore::new();

        let report = MigrationApplier::new(&store, &config).run().await.unwrap();
        assert!(report.empty);
        assert!(report.applied.is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir.path().join("nope"));
        let store = MemoryStore::new();

        let err = MigrationApplier::new(&store, &config)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::MigrationsDirMissing(_)));
    }

    #[tokio::test]
    async fn test_missing_tool_aborts_before_discovery() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir.path().join("nope"));
        let store = MemoryStore::new().with_missing_tool("psql");

        let err = MigrationApplier::new(&store, &config)
            .run()
            .await
            .unwrap_err();
        match err {
            MigrateError::ToolUnavailable { tool } => assert_eq!(tool, "psql"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_times_out() {
        let dir = standard_dir();
        let config = config_for(dir.path());
        let store = MemoryStore::new();
        store.fail_pings(u32::MAX);

        let err = MigrationApplier::new(&store, &config)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::ConnectivityTimeout { .. }));
        assert!(store.executed_scripts().await.is_empty());
    }

    #[tokio::test]
    async fn test_base_schema_runs_first_every_time() {
        let dir = standard_dir();
        let base_dir = TempDir::new().unwrap();
        let base = write(base_dir.path(), "base_schema.sql", "CREATE SCHEMA IF NOT EXISTS catalog;");
        let mut config = config_for(dir.path());
        config.base_schema = Some(base);
        let store = MemoryStore::new();
        let applier = MigrationApplier::new(&store, &config);

        let report = applier.run().await.unwrap();
        assert!(report.base_schema_applied);
        applier.run().await.unwrap();

        let executed = store.executed_scripts().await;
        assert_eq!(executed.len(), 4);
        assert!(executed[0].contains("CREATE SCHEMA"));
        assert!(executed[3].contains("CREATE SCHEMA"));
        assert!(store.lookup("base_schema.sql").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ready_marker_written_on_success() {
        let dir = standard_dir();
        let out = TempDir::new().unwrap();
        let marker = out.path().join("state").join("migrations.ready");
        let mut config = config_for(dir.path());
        config.ready_file = Some(marker.clone());
        let store = MemoryStore::new();

        MigrationApplier::new(&store, &config).run().await.unwrap();

        let body: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&marker).unwrap()).unwrap();
        assert_eq!(body["applied"], 2);
        assert_eq!(body["target"], "memory");
    }

    #[tokio::test]
    async fn test_stale_marker_removed_on_failure() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "0001_bad.sql", "SELECT broken;");
        let out = TempDir::new().unwrap();
        let marker = write(out.path(), "migrations.ready", "{}");
        let mut config = config_for(dir.path());
        config.ready_file = Some(marker.clone());
        let store = MemoryStore::new().with_failing_script("broken");

        MigrationApplier::new(&store, &config)
            .run()
            .await
            .unwrap_err();
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_lost_race_with_same_seal_is_a_skip() {
        let dir = TempDir::new().unwrap();
        let body = "CREATE TABLE IF NOT EXISTS a (id int);";
        write(dir.path(), "0001_init.sql", body);
        let config = config_for(dir.path());
        let hash = crate::migrations::checksum::content_hash(body.as_bytes());
        let store = MemoryStore::new().with_concurrent_record("0001_init.sql", hash.clone());

        let report = MigrationApplier::new(&store, &config).run().await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.skipped, vec!["0001_init.sql"]);
        assert!(store.executed_scripts().await.is_empty());
        let record = store.lookup("0001_init.sql").await.unwrap().unwrap();
        assert_eq!(record.content_hash, hash);
    }

    #[tokio::test]
    async fn test_lost_race_with_different_seal_is_drift() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "0001_init.sql", "CREATE TABLE IF NOT EXISTS a (id int);");
        write(dir.path(), "0002_add_col.sql", "ALTER TABLE a ADD COLUMN b int;");
        let config = config_for(dir.path());
        let store = MemoryStore::new().with_concurrent_record("0001_init.sql", "c".repeat(64));

        let err = MigrationApplier::new(&store, &config)
            .run()
            .await
            .unwrap_err();
        match err {
            MigrateError::DriftDetected {
                filename, recorded, ..
            } => {
                assert_eq!(filename, "0001_init.sql");
                assert_eq!(recorded, "c".repeat(64));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.executed_scripts().await.is_empty());
        assert!(store.lookup("0002_add_col.sql").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_plan_classifies_files_and_orphans() {
        let dir = standard_dir();
        let config = config_for(dir.path());
        let store = MemoryStore::new();
        store.ensure_exists().await.unwrap();
        store
            .insert_if_absent("0000_removed.sql", &"0".repeat(64))
            .await
            .unwrap();

        let first = std::fs::read(dir.path().join("0001_init.sql")).unwrap();
        store
            .insert_if_absent(
                "0001_init.sql",
                &crate::migrations::checksum::content_hash(&first),
            )
            .await
            .unwrap();

        let plan = MigrationApplier::new(&store, &config).plan().await.unwrap();
        let statuses: Vec<PlanStatus> = plan.entries.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![PlanStatus::Applied, PlanStatus::Pending]);
        assert_eq!(plan.orphaned, vec!["0000_removed.sql"]);
        assert!(store.executed_scripts().await.is_empty());
    }

    #[tokio::test]
    async fn test_verify_reports_drift_without_executing() {
        let dir = standard_dir();
        let config = config_for(dir.path());
        let store = MemoryStore::new();
        store.ensure_exists().await.unwrap();
        store
            .insert_if_absent("0001_init.sql", &"a".repeat(64))
            .await
            .unwrap();

        let err = MigrationApplier::new(&store, &config)
            .verify()
            .await
            .unwrap_err();
        match err {
            MigrateError::DriftDetected {
                filename, recorded, ..
            } => {
                assert_eq!(filename, "0001_init.sql");
                assert_eq!(recorded, "a".repeat(64));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.executed_scripts().await.is_empty());
    }
}
