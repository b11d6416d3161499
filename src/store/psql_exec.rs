//! Migration target driven through the `psql` client.
//!
//! Two modes share one implementation:
//! - local `psql` against host/port
//! - `docker exec -i <container> psql` against the container's own socket
//!
//! Scripts go in on stdin. Filenames and hashes are passed as psql variables
//! (`-v name=value`, referenced as `:'name'`), so psql quotes them as literals
//! and nothing is spliced into statement text.

use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::{BackendKind, Config, DatabaseConfig};
use crate::migrations::ledger::{
    BackendError, BackendResult, MigrationLedger, MigrationRecord, MigrationTarget, LEDGER_DDL,
    LEDGER_LOCK_KEY,
};

const DOCKER_BIN: &str = "docker";
const RECORDED_MARKER: &str = "cellar:recorded";
const APPLIED_AT_FORMAT: &str = r#"'YYYY-MM-DD"T"HH24:MI:SS.US"Z"'"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecMode {
    Local,
    Docker { container: String },
}

#[derive(Debug, Clone)]
pub struct PsqlExecTarget {
    mode: ExecMode,
    psql_bin: String,
    db: DatabaseConfig,
}

impl PsqlExecTarget {
    pub fn new(mode: ExecMode, psql_bin: impl Into<String>, db: DatabaseConfig) -> Self {
        Self {
            mode,
            psql_bin: psql_bin.into(),
            db,
        }
    }

    /// Build from config. Only meaningful for the `psql` and `docker` backends.
    pub fn from_config(config: &Config) -> Self {
        let mode = match config.backend {
            BackendKind::DockerExec => ExecMode::Docker {
                container: config.container.clone(),
            },
            _ => ExecMode::Local,
        };
        Self::new(mode, config.psql_bin.clone(), config.database.clone())
    }

    fn program(&self) -> &str {
        match self.mode {
            ExecMode::Local => &self.psql_bin,
            ExecMode::Docker { .. } => DOCKER_BIN,
        }
    }

    /// Full argument vector for one psql invocation reading a script from stdin.
    pub fn build_args(&self, vars: &[(&str, &str)], single_transaction: bool) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        if let ExecMode::Docker { container } = &self.mode {
            args.extend([
                "exec".to_string(),
                "-i".to_string(),
                "-e".to_string(),
                "PGPASSWORD".to_string(),
                container.clone(),
                self.psql_bin.clone(),
            ]);
        }
        args.extend(
            ["-X", "-q", "-A", "-t", "-v", "ON_ERROR_STOP=1"]
                .iter()
                .map(|s| s.to_string()),
        );
        if self.mode == ExecMode::Local {
            args.extend([
                "-h".to_string(),
                self.db.host.clone(),
                "-p".to_string(),
                self.db.port.to_string(),
            ]);
        }
        args.extend([
            "-U".to_string(),
            self.db.user.clone(),
            "-d".to_string(),
            self.db.database.clone(),
        ]);
        for (name, value) in vars {
            args.push("-v".to_string());
            args.push(format!("{}={}", name, value));
        }
        if single_transaction {
            args.push("--single-transaction".to_string());
        }
        args.extend(["-f".to_string(), "-".to_string()]);
        args
    }

    async fn run(
        &self,
        script: &str,
        vars: &[(&str, &str)],
        single_transaction: bool,
    ) -> BackendResult<String> {
        let mut cmd = Command::new(self.program());
        cmd.args(self.build_args(vars, single_transaction))
            .env("PGPASSWORD", &self.db.password)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| BackendError::Execution(format!("writing script to psql: {}", e)))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackendError::Execution(format!("waiting for psql: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BackendError::Execution(if stderr.is_empty() {
                format!("psql exited with {}", output.status)
            } else {
                stderr
            }));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn_error(&self, e: std::io::Error) -> BackendError {
        if e.kind() == std::io::ErrorKind::NotFound {
            BackendError::ToolUnavailable(self.program().to_string())
        } else {
            BackendError::Execution(format!("spawning {}: {}", self.program(), e))
        }
    }
}

/// Parse `filename|hash|applied_at` rows from unaligned tuples-only output.
fn parse_records(stdout: &str) -> BackendResult<Vec<MigrationRecord>> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let mut parts = line.splitn(3, '|');
            let (Some(filename), Some(hash), Some(at)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(BackendError::Execution(format!(
                    "unexpected ledger row: {}",
                    line
                )));
            };
            let applied_at = DateTime::parse_from_rfc3339(at)
                .map_err(|e| BackendError::Execution(format!("bad applied_at '{}': {}", at, e)))?
                .with_timezone(&Utc);
            Ok(MigrationRecord {
                filename: filename.to_string(),
                content_hash: hash.trim().to_string(),
                applied_at,
            })
        })
        .collect()
}

fn select_records(filter: &str) -> String {
    format!(
        "SELECT filename, content_hash, to_char(applied_at AT TIME ZONE 'UTC', {}) \
         FROM schema_migrations {} ORDER BY filename;\n",
        APPLIED_AT_FORMAT, filter
    )
}

#[async_trait]
impl MigrationLedger for PsqlExecTarget {
    async fn ensure_exists(&self) -> BackendResult<()> {
        let script = format!(
            "SELECT pg_advisory_xact_lock({});\n{};\n",
            LEDGER_LOCK_KEY, LEDGER_DDL
        );
        self.run(&script, &[], true).await.map(|_| ())
    }

    async fn lookup(&self, filename: &str) -> BackendResult<Option<MigrationRecord>> {
        let out = self
            .run(
                &select_records("WHERE filename = :'cellar_filename'"),
                &[("cellar_filename", filename)],
                false,
            )
            .await?;
        Ok(parse_records(&out)?.into_iter().next())
    }

    async fn insert_if_absent(&self, filename: &str, content_hash: &str) -> BackendResult<bool> {
        let script = format!(
            "INSERT INTO schema_migrations (filename, content_hash) \
             VALUES (:'cellar_filename', :'cellar_hash') \
             ON CONFLICT (filename) DO NOTHING RETURNING '{}';\n",
            RECORDED_MARKER
        );
        let out = self
            .run(
                &script,
                &[("cellar_filename", filename), ("cellar_hash", content_hash)],
                false,
            )
            .await?;
        Ok(out.lines().any(|l| l.trim() == RECORDED_MARKER))
    }

    async fn list_applied(&self) -> BackendResult<Vec<MigrationRecord>> {
        let out = self.run(&select_records(""), &[], false).await?;
        parse_records(&out)
    }
}

#[async_trait]
impl MigrationTarget for PsqlExecTarget {
    fn describe(&self) -> String {
        match &self.mode {
            ExecMode::Local => format!(
                "psql://{}@{}:{}/{}",
                self.db.user, self.db.host, self.db.port, self.db.database
            ),
            ExecMode::Docker { container } => {
                format!("docker://{}/{}", container, self.db.database)
            }
        }
    }

    async fn check_tooling(&self) -> BackendResult<()> {
        let status = Command::new(self.program())
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| self.spawn_error(e))?;
        if !status.success() {
            return Err(BackendError::ToolUnavailable(self.program().to_string()));
        }
        Ok(())
    }

    async fn ping(&self) -> BackendResult<()> {
        self.run("SELECT 1;\n", &[], false).await.map(|_| ())
    }

    async fn execute_script(&self, sql: &str) -> BackendResult<()> {
        self.run(&locked_script(sql), &[], true).await.map(|_| ())
    }

    async fn apply_migration(
        &self,
        filename: &str,
        content_hash: &str,
        sql: &str,
    ) -> BackendResult<bool> {
        let script = apply_script(sql);
        debug!("Applying {} via {}", filename, self.describe());
        let out = self
            .run(
                &script,
                &[("cellar_filename", filename), ("cellar_hash", content_hash)],
                true,
            )
            .await?;
        Ok(out.lines().any(|l| l.trim() == RECORDED_MARKER))
    }
}

/// Serialise an unrecorded script (base schema) with other bootstraps.
fn locked_script(body: &str) -> String {
    format!(
        "SELECT pg_advisory_xact_lock({});\n{}\n;\n",
        LEDGER_LOCK_KEY, body
    )
}

/// Wrap a migration body so that, inside one transaction, it runs only when
/// the ledger has no row for the file, and the ledger row is written with it.
fn apply_script(body: &str) -> String {
    format!(
        "SELECT pg_advisory_xact_lock({lock});\n\
         SELECT EXISTS (SELECT 1 FROM schema_migrations WHERE filename = :'cellar_filename') AS cellar_already \\gset\n\
         \\if :cellar_already\n\
         \\else\n\
         {body}\n\
         ;\n\
         INSERT INTO schema_migrations (filename, content_hash) \
         VALUES (:'cellar_filename', :'cellar_hash') \
         ON CONFLICT (filename) DO NOTHING RETURNING '{marker}';\n\
         \\endif\n",
        lock = LEDGER_LOCK_KEY,
        body = body,
        marker = RECORDED_MARKER,
    )
}
