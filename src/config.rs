//! Runtime configuration
//!
//! Built once at startup and passed by reference to the applier and stores.
//! Every field resolves in the same order:
//!
//! 1. command-line flag (applied by the binary on top of the resolved value)
//! 2. specific variable (`CELLAR_*`)
//! 3. generic variable (`PG*`, `MIGRATIONS_DIR`, `DB_WAIT_TIMEOUT`)
//! 4. hardcoded default
//!
//! Malformed numbers are rejected rather than silently replaced by defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::MigrateError;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_USER: &str = "postgres";
pub const DEFAULT_DATABASE: &str = "cellar";
pub const DEFAULT_MIGRATIONS_DIR: &str = "migrations";
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_WAIT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_CONTAINER: &str = "cellar-db";
pub const DEFAULT_PSQL_BIN: &str = "psql";

/// How the applier reaches the target store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// sqlx connection pool (default)
    #[default]
    Direct,
    /// local `psql` client
    Psql,
    /// `docker exec -i <container> psql`
    DockerExec,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Direct => "direct",
            BackendKind::Psql => "psql",
            BackendKind::DockerExec => "docker",
        }
    }
}

impl FromStr for BackendKind {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "direct" | "sqlx" => Ok(BackendKind::Direct),
            "psql" => Ok(BackendKind::Psql),
            "docker" | "container" | "docker-exec" => Ok(BackendKind::DockerExec),
            other => Err(MigrateError::Config(format!(
                "unknown backend '{}'. Valid values: direct, psql, docker",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Connection parameters for the target Postgres database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl DatabaseConfig {
    /// Connection URL for the direct backend. Credentials are percent-encoded.
    pub fn url(&self) -> Result<String, MigrateError> {
        let mut url = url::Url::parse("postgres://localhost")
            .map_err(|e| MigrateError::Config(e.to_string()))?;
        url.set_host(Some(&self.host))
            .map_err(|e| MigrateError::Config(format!("invalid host '{}': {}", self.host, e)))?;
        url.set_port(Some(self.port))
            .map_err(|_| MigrateError::Config("cannot set port".to_string()))?;
        url.set_username(&self.user)
            .map_err(|_| MigrateError::Config("cannot set user".to_string()))?;
        if !self.password.is_empty() {
            url.set_password(Some(&self.password))
                .map_err(|_| MigrateError::Config("cannot set password".to_string()))?;
        }
        url.set_path(&self.database);
        Ok(url.to_string())
    }

    /// Same as [`url`](Self::url) with the password replaced, for logs.
    pub fn masked_url(&self) -> String {
        match self.url() {
            Ok(url) => mask_database_url(&url),
            Err(_) => format!("postgres://{}@{}:{}/{}", self.user, self.host, self.port, self.database),
        }
    }
}

/// Readiness-gate bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
            interval: Duration::from_millis(DEFAULT_WAIT_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub migrations_dir: PathBuf,
    pub readiness: ReadinessConfig,
    pub backend: BackendKind,
    pub container: String,
    pub psql_bin: String,
    /// Optional file applied unconditionally before the ordered migrations.
    pub base_schema: Option<PathBuf>,
    /// Written after a successful run; dependent services poll for it.
    pub ready_file: Option<PathBuf>,
}

impl Config {
    /// Resolve from the process environment.
    pub fn from_env() -> Result<Self, MigrateError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, MigrateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let layered = |specific: &str, generic: Option<&str>| -> Option<String> {
            lookup(specific)
                .filter(|v| !v.is_empty())
                .or_else(|| generic.and_then(|g| lookup(g)).filter(|v| !v.is_empty()))
        };

        let port = match layered("CELLAR_DB_PORT", Some("PGPORT")) {
            Some(raw) => parse_number::<u16>("port", &raw)?,
            None => DEFAULT_PORT,
        };
        let timeout_secs = match layered("CELLAR_DB_WAIT_TIMEOUT", Some("DB_WAIT_TIMEOUT")) {
            Some(raw) => parse_number::<u64>("readiness timeout", &raw)?,
            None => DEFAULT_WAIT_TIMEOUT_SECS,
        };
        let interval_ms = match layered("CELLAR_DB_WAIT_INTERVAL_MS", None) {
            Some(raw) => parse_number::<u64>("readiness interval", &raw)?,
            None => DEFAULT_WAIT_INTERVAL_MS,
        };
        if interval_ms == 0 {
            return Err(MigrateError::Config(
                "readiness interval must be greater than zero".to_string(),
            ));
        }
        let backend = match layered("CELLAR_MIGRATE_BACKEND", None) {
            Some(raw) => raw.parse()?,
            None => BackendKind::default(),
        };

        Ok(Self {
            database: DatabaseConfig {
                host: layered("CELLAR_DB_HOST", Some("PGHOST"))
                    .unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port,
                user: layered("CELLAR_DB_USER", Some("PGUSER"))
                    .unwrap_or_else(|| DEFAULT_USER.to_string()),
                password: layered("CELLAR_DB_PASSWORD", Some("PGPASSWORD")).unwrap_or_default(),
                database: layered("CELLAR_DB_NAME", Some("PGDATABASE"))
                    .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            },
            migrations_dir: layered("CELLAR_MIGRATIONS_DIR", Some("MIGRATIONS_DIR"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MIGRATIONS_DIR)),
            readiness: ReadinessConfig {
                timeout: Duration::from_secs(timeout_secs),
                interval: Duration::from_millis(interval_ms),
            },
            backend,
            container: layered("CELLAR_DB_CONTAINER", None)
                .unwrap_or_else(|| DEFAULT_CONTAINER.to_string()),
            psql_bin: layered("CELLAR_PSQL_BIN", None)
                .unwrap_or_else(|| DEFAULT_PSQL_BIN.to_string()),
            base_schema: layered("CELLAR_BASE_SCHEMA", None).map(PathBuf::from),
            ready_file: layered("CELLAR_READY_FILE", None).map(PathBuf::from),
        })
    }
}

fn parse_number<T: FromStr>(field: &str, raw: &str) -> Result<T, MigrateError> {
    raw.trim()
        .parse()
        .map_err(|_| MigrateError::Config(format!("invalid {}: '{}'", field, raw)))
}

/// Mask the password in a database URL for logging. Anything that does not
/// parse as a URL is hidden entirely.
pub fn mask_database_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() && parsed.set_password(Some("***")).is_err() {
                return "***".to_string();
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
