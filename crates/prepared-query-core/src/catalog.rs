// crates/prepared-query-core/src/catalog.rs
// ============================================================================
// Module: Query Catalog
// Description: Name to SQL text mapping shared by statement registries.
// Purpose: Hold query definitions registered by the composition root.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! The catalog is pure metadata: it never talks to a database. It is created
//! once, populated with `(name, sql)` pairs, and handed to each
//! [`crate::StatementRegistry`] by `Arc`. Registration after a registry has
//! been built is allowed; registries pick up new names through lazy
//! preparation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Catalog registration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// A query with the same name is already registered.
    #[error("query already registered: {name}")]
    Duplicate {
        /// Conflicting query name.
        name: String,
    },
}

// ============================================================================
// SECTION: Catalog
// ============================================================================

/// Process-level mapping of query names to SQL text.
///
/// # Invariants
/// - Names are unique; [`QueryCatalog::register`] overwrites (last write wins).
/// - Entries are never removed.
/// - SQL text is stored verbatim and never validated.
#[derive(Debug, Default)]
pub struct QueryCatalog {
    /// Registered SQL text keyed by query name.
    entries: RwLock<BTreeMap<String, Arc<str>>>,
}

impl QueryCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `sql` under `name`, returning the text it replaced.
    pub fn register(&self, name: impl Into<String>, sql: impl Into<String>) -> Option<Arc<str>> {
        let sql: Arc<str> = Arc::from(sql.into());
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(name.into(), sql)
    }

    /// Stores `sql` under `name` unless the name is already taken.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Duplicate`] when `name` is already registered.
    pub fn try_register(
        &self,
        name: impl Into<String>,
        sql: impl Into<String>,
    ) -> Result<(), CatalogError> {
        let name = name.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&name) {
            return Err(CatalogError::Duplicate {
                name,
            });
        }
        entries.insert(name, Arc::from(sql.into()));
        Ok(())
    }

    /// Returns the SQL text registered under `name`.
    #[must_use]
    pub fn sql(&self, name: &str) -> Option<Arc<str>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Returns true when `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }

    /// Returns the number of registered queries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true when no queries are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the registered query names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    /// Returns a snapshot of every `(name, sql)` pair.
    ///
    /// Callers must not depend on the order of the returned pairs.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Arc<str>)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, sql)| (name.clone(), Arc::clone(sql)))
            .collect()
    }
}

impl<N, S> FromIterator<(N, S)> for QueryCatalog
where
    N: Into<String>,
    S: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, S)>>(iter: I) -> Self {
        let catalog = Self::new();
        for (name, sql) in iter {
            catalog.register(name, sql);
        }
        catalog
    }
}
