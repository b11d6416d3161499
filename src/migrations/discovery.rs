//! Migration file discovery
//!
//! Only files named `<4-digit ordinal>_<suffix>` take part in a controlled
//! rollout. Anything else in the directory (date-stamped ad-hoc scripts such
//! as `2025-01-01-adhoc.sql`, READMEs, sub-directories) is ignored.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use super::checksum::content_hash;
use crate::error::MigrateError;

static CONTROLLED_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]{4})_(.+)$").expect("static migration name pattern"));

/// A candidate migration on disk, not yet read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub filename: String,
    pub ordinal: u16,
    pub path: PathBuf,
}

/// A migration file with its contents and content seal.
#[derive(Debug, Clone)]
pub struct LoadedMigration {
    pub filename: String,
    pub ordinal: u16,
    pub sql: String,
    pub hash: String,
}

/// Parse the ordinal out of a controlled filename.
/// Returns `None` for names outside the convention.
pub fn controlled_ordinal(filename: &str) -> Option<u16> {
    let caps = CONTROLLED_NAME_RE.captures(filename)?;
    caps.get(1)?.as_str().parse().ok()
}

/// List controlled migration files in ascending filename order.
///
/// Lexical order on the filename equals ordinal order because the ordinal is
/// a zero-padded fixed-width prefix.
pub fn discover(dir: &Path) -> Result<Vec<MigrationFile>, MigrateError> {
    if !dir.is_dir() {
        return Err(MigrateError::MigrationsDirMissing(dir.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            debug!("Skipping non UTF-8 file name in {}", dir.display());
            continue;
        };
        match controlled_ordinal(filename) {
            Some(ordinal) => files.push(MigrationFile {
                filename: filename.to_string(),
                ordinal,
                path: path.clone(),
            }),
            None => debug!("Ignoring uncontrolled file {}", filename),
        }
    }

    files.sort_by(|a, b| a.filename.cmp(&b.filename));

    for pair in files.windows(2) {
        if pair[0].ordinal == pair[1].ordinal {
            warn!(
                "Duplicate migration ordinal {:04}: {} and {} (applied in filename order)",
                pair[0].ordinal, pair[0].filename, pair[1].filename
            );
        }
    }

    Ok(files)
}

impl MigrationFile {
    /// Read the file and compute its content hash.
    pub fn load(&self) -> Result<LoadedMigration, MigrateError> {
        let bytes = std::fs::read(&self.path)?;
        let hash = content_hash(&bytes);
        let sql = String::from_utf8(bytes).map_err(|_| MigrateError::ExecutionFailure {
            filename: self.filename.clone(),
            message: "file is not valid UTF-8".to_string(),
        })?;
        Ok(LoadedMigration {
            filename: self.filename.clone(),
            ordinal: self.ordinal,
            sql,
            hash,
        })
    }
}
