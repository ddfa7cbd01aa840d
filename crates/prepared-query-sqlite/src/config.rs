// crates/prepared-query-sqlite/src/config.rs
// ============================================================================
// Module: SQLite Connection Config
// Description: Connection settings and validation for the SQLite provider.
// Purpose: Open connections with durable pragmas and bounded paths.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! [`SqliteConnectionConfig`] describes where the database lives and which
//! pragmas apply when it is opened. Paths are validated against length limits
//! and must not point at a directory.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::connection::SqliteError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Default statement cache capacity.
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 64;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;

// ============================================================================
// SECTION: Modes
// ============================================================================

/// `SQLite` journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteJournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteJournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `synchronous` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

// ============================================================================
// SECTION: Config
// ============================================================================

/// Configuration for a file-backed `SQLite` connection.
///
/// # Invariants
/// - `path` must resolve to a file path (not a directory).
/// - `statement_cache_capacity` is the starting capacity; preparing more
///   statements than this grows the cache instead of evicting.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteConnectionConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteJournalMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
    /// Initial prepared statement cache capacity.
    #[serde(default = "default_statement_cache_capacity")]
    pub statement_cache_capacity: usize,
}

impl SqliteConnectionConfig {
    /// Returns a config for `path` with default pragmas.
    #[must_use]
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteJournalMode::default(),
            sync_mode: SqliteSyncMode::default(),
            statement_cache_capacity: DEFAULT_STATEMENT_CACHE_CAPACITY,
        }
    }

    /// Validates path safety and cache limits.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError::Invalid`] when a setting is out of range.
    pub fn validate(&self) -> Result<(), SqliteError> {
        validate_db_path(&self.path)?;
        if self.statement_cache_capacity == 0 {
            return Err(SqliteError::Invalid(
                "statement_cache_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the default busy timeout in milliseconds.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

/// Returns the default statement cache capacity.
const fn default_statement_cache_capacity() -> usize {
    DEFAULT_STATEMENT_CACHE_CAPACITY
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Validates database paths for safety limits.
fn validate_db_path(path: &Path) -> Result<(), SqliteError> {
    if path.as_os_str().is_empty() {
        return Err(SqliteError::Invalid("database path must not be empty".to_string()));
    }
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteError::Invalid("database path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(SqliteError::Invalid(
                "database path contains an overlong component".to_string(),
            ));
        }
    }
    if path.exists() && path.is_dir() {
        return Err(SqliteError::Invalid(
            "database path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Ensures the parent directory for the database exists.
pub(crate) fn ensure_parent_dir(path: &Path) -> Result<(), SqliteError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteError::Io("database path missing parent directory".to_string()));
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).map_err(|err| SqliteError::Io(err.to_string()))
}
