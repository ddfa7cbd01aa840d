// crates/prepared-query-config/src/config.rs
// ============================================================================
// Module: Prepared Query Configuration
// Description: Configuration loading and validation for prepared queries.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: prepared-query-core, prepared-query-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path limits.
//! Query names must be unique here even though [`QueryCatalog::register`]
//! itself is last-write-wins: a duplicate in a config file is almost always a
//! copy-paste mistake and is rejected before anything is registered.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use prepared_query_core::QueryCatalog;
use prepared_query_core::RegistryOptions;
use prepared_query_sqlite::SqliteConnection;
use prepared_query_sqlite::SqliteConnectionConfig;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "prepared-query.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "PREPARED_QUERY_CONFIG";
/// Maximum configuration file size in bytes.
pub const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a query name in bytes.
pub const MAX_QUERY_NAME_LENGTH: usize = 128;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;

// ============================================================================
// SECTION: Configuration Types
// ============================================================================

/// Prepared query configuration.
///
/// # Invariants
/// - After [`PreparedQueryConfig::validate`], query names are non-empty,
///   unique, and bounded, and every query has non-empty SQL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PreparedQueryConfig {
    /// Registry construction options.
    #[serde(default)]
    pub registry: RegistryOptions,
    /// `SQLite` connection settings.
    #[serde(default)]
    pub sqlite: Option<SqliteConnectionConfig>,
    /// Named queries, in file order.
    #[serde(default)]
    pub queries: Vec<QueryConfig>,
}

/// One named query entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    /// Query name used for lookups.
    pub name: String,
    /// SQL text prepared for the name.
    pub sql: String,
}

impl PreparedQueryConfig {
    /// Loads configuration from disk using the default resolution rules.
    ///
    /// Resolution order: explicit `path`, then the `PREPARED_QUERY_CONFIG`
    /// environment variable, then `prepared-query.toml` in the working
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or
    /// validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        validate_path(&resolved)?;
        let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::from_toml_str(content)
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(sqlite) = &self.sqlite {
            sqlite.validate().map_err(|err| ConfigError::Invalid(format!("sqlite: {err}")))?;
        }
        let mut seen = BTreeSet::new();
        for (index, query) in self.queries.iter().enumerate() {
            query.validate(index)?;
            if !seen.insert(query.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "queries[{index}].name duplicates {}",
                    query.name
                )));
            }
        }
        Ok(())
    }

    /// Builds a fresh catalog holding every configured query.
    #[must_use]
    pub fn build_catalog(&self) -> QueryCatalog {
        self.queries.iter().map(|query| (query.name.as_str(), query.sql.as_str())).collect()
    }

    /// Registers every configured query into an existing catalog.
    ///
    /// Existing entries with the same names are replaced. Returns the number
    /// of queries registered.
    pub fn register_into(&self, catalog: &QueryCatalog) -> usize {
        for query in &self.queries {
            catalog.register(query.name.as_str(), query.sql.as_str());
        }
        self.queries.len()
    }

    /// Opens the configured `SQLite` connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when no `[sqlite]` section is present
    /// and [`ConfigError::Io`] when the database cannot be opened.
    pub fn open_sqlite(&self) -> Result<SqliteConnection, ConfigError> {
        let Some(sqlite) = &self.sqlite else {
            return Err(ConfigError::Invalid("sqlite section is not configured".to_string()));
        };
        SqliteConnection::open(sqlite).map_err(|err| ConfigError::Io(err.to_string()))
    }
}

impl QueryConfig {
    /// Validates one query entry at `index`.
    fn validate(&self, index: usize) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("queries[{index}].name must be non-empty")));
        }
        if self.name.len() > MAX_QUERY_NAME_LENGTH {
            return Err(ConfigError::Invalid(format!(
                "queries[{index}].name exceeds {MAX_QUERY_NAME_LENGTH} bytes"
            )));
        }
        if self.sql.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "queries[{index}].sql must be non-empty for {}",
                self.name
            )));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// I/O failure while reading configuration or opening the database.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path from the caller or environment defaults.
fn resolve_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates the resolved path against length limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    if path.to_string_lossy().len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    let overlong = path
        .components()
        .any(|component| component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH);
    if overlong {
        return Err(ConfigError::Invalid("config path component too long".to_string()));
    }
    Ok(())
}
