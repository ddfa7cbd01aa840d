// crates/prepared-query-sqlite/src/connection.rs
// ============================================================================
// Module: SQLite Connection Provider
// Description: Shared SQLite connection and connection-bound statements.
// Purpose: Implement StatementConnection on top of rusqlite.
// Dependencies: prepared-query-core, rusqlite, thiserror
// ============================================================================

//! ## Overview
//! [`SqliteConnection`] wraps one `rusqlite` connection behind a mutex so the
//! handle can be cloned and shared across threads. Preparing a statement
//! compiles it into the connection's prepared statement cache; the resulting
//! [`SqliteStatement`] re-enters that cache on every execution, so the SQL is
//! parsed and planned once. The cache grows to keep every live handle
//! resident.
//!
//! A thread holding a [`crate::SqliteTransaction`] owns the connection lock.
//! Other threads block until the transaction ends; statements the owning
//! thread runs directly on the connection execute inside the transaction,
//! as `SQLite` scopes transactions per connection.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::ReentrantMutex;
use parking_lot::ReentrantMutexGuard;
use prepared_query_core::StatementConnection;
use prepared_query_core::StatementError;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::Params;
use rusqlite::Row;
use thiserror::Error;

use crate::config::DEFAULT_STATEMENT_CACHE_CAPACITY;
use crate::config::SqliteConnectionConfig;
use crate::config::ensure_parent_dir;
use crate::transaction::SqliteTransaction;
use crate::transaction::SqliteTxBehavior;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` provider errors.
///
/// # Invariants
/// - Error messages avoid embedding bound parameter values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SqliteError {
    /// Filesystem or locking error.
    #[error("sqlite io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite db error: {0}")]
    Db(String),
    /// Invalid configuration or input.
    #[error("sqlite invalid input: {0}")]
    Invalid(String),
}

impl From<rusqlite::Error> for SqliteError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Db(error.to_string())
    }
}

// ============================================================================
// SECTION: Connection
// ============================================================================

/// State shared by a connection and every statement prepared on it.
pub(crate) struct SharedConnection {
    /// Underlying connection; re-entrant so the thread running a transaction
    /// can still prepare and execute on it.
    connection: ReentrantMutex<Connection>,
    /// Handles currently prepared and not yet released.
    live: AtomicUsize,
    /// Current statement cache capacity.
    capacity: AtomicUsize,
}

impl SharedConnection {
    /// Locks the connection for the calling thread.
    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, Connection> {
        self.connection.lock()
    }
}

/// Cloneable handle to a single `SQLite` connection.
///
/// # Invariants
/// - Clones share one underlying connection.
/// - The connection closes when the last clone and the last statement
///   prepared on it are dropped.
#[derive(Clone)]
pub struct SqliteConnection {
    /// Shared connection state.
    shared: Arc<SharedConnection>,
}

impl SqliteConnection {
    /// Opens a file-backed connection with the configured pragmas.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError`] when the config is invalid or the database
    /// cannot be opened.
    pub fn open(config: &SqliteConnectionConfig) -> Result<Self, SqliteError> {
        config.validate()?;
        ensure_parent_dir(&config.path)?;
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let connection = Connection::open_with_flags(&config.path, flags)?;
        apply_pragmas(&connection, config)?;
        Ok(Self::wrap(connection, config.statement_cache_capacity))
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError`] when `SQLite` cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, SqliteError> {
        let connection = Connection::open_in_memory()?;
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self::wrap(connection, DEFAULT_STATEMENT_CACHE_CAPACITY))
    }

    /// Wraps an existing `rusqlite` connection.
    #[must_use]
    pub fn from_connection(connection: Connection) -> Self {
        Self::wrap(connection, DEFAULT_STATEMENT_CACHE_CAPACITY)
    }

    /// Wraps an existing `rusqlite` connection with an explicit starting
    /// statement cache capacity.
    #[must_use]
    pub fn from_connection_with_capacity(connection: Connection, capacity: usize) -> Self {
        Self::wrap(connection, capacity.max(1))
    }

    /// Builds the shared state around an open connection.
    fn wrap(connection: Connection, capacity: usize) -> Self {
        connection.set_prepared_statement_cache_capacity(capacity);
        Self {
            shared: Arc::new(SharedConnection {
                connection: ReentrantMutex::new(connection),
                live: AtomicUsize::new(0),
                capacity: AtomicUsize::new(capacity),
            }),
        }
    }

    /// Runs one or more semicolon-separated statements (schema setup).
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError`] when `SQLite` fails.
    pub fn execute_batch(&self, sql: &str) -> Result<(), SqliteError> {
        let connection = self.shared.lock();
        connection.execute_batch(sql)?;
        Ok(())
    }

    /// Begins a deferred transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError`] when `BEGIN` fails, including when the calling
    /// thread already has a transaction open on this connection.
    pub fn transaction(&self) -> Result<SqliteTransaction<'_>, SqliteError> {
        self.transaction_with(SqliteTxBehavior::Deferred)
    }

    /// Begins a transaction with explicit locking behavior.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError`] when `BEGIN` fails, including when the calling
    /// thread already has a transaction open on this connection.
    pub fn transaction_with(
        &self,
        behavior: SqliteTxBehavior,
    ) -> Result<SqliteTransaction<'_>, SqliteError> {
        let connection = self.shared.lock();
        SqliteTransaction::begin(&self.shared, connection, behavior)
    }

    /// Returns the number of prepared handles not yet released.
    #[must_use]
    pub fn live_statements(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Returns the current statement cache capacity.
    #[must_use]
    pub fn statement_cache_capacity(&self) -> usize {
        self.shared.capacity.load(Ordering::SeqCst)
    }

    /// Returns true when both handles share one underlying connection.
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Grows the statement cache so `live` handles fit without eviction.
    fn reserve_cache_slot(&self, connection: &Connection) {
        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        let capacity = self.shared.capacity.load(Ordering::SeqCst);
        if live > capacity {
            let grown = capacity.saturating_mul(2).max(live);
            connection.set_prepared_statement_cache_capacity(grown);
            self.shared.capacity.store(grown, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("live_statements", &self.live_statements())
            .field("statement_cache_capacity", &self.statement_cache_capacity())
            .finish_non_exhaustive()
    }
}

impl StatementConnection for SqliteConnection {
    type Statement = SqliteStatement;

    fn prepare(&self, sql: &str) -> Result<Self::Statement, StatementError> {
        let connection = self.shared.lock();
        // The slot must exist before the compiled statement re-enters the
        // cache, or the insert evicts an older registry handle.
        self.reserve_cache_slot(&connection);
        let counts = connection
            .prepare_cached(sql)
            .map(|statement| (statement.parameter_count(), statement.column_count()));
        let (parameter_count, column_count) = match counts {
            Ok(counts) => counts,
            Err(error) => {
                self.shared.live.fetch_sub(1, Ordering::SeqCst);
                return Err(classify_prepare_error(error));
            }
        };
        Ok(SqliteStatement {
            sql: Arc::from(sql),
            parameter_count,
            column_count,
            shared: Arc::clone(&self.shared),
        })
    }

    fn release(&self, statement: Self::Statement) {
        if !Arc::ptr_eq(&statement.shared, &self.shared) {
            return;
        }
        let previous = self
            .shared
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| live.checked_sub(1));
        if previous == Ok(1) {
            self.shared.lock().flush_prepared_statement_cache();
        }
    }
}

// ============================================================================
// SECTION: Statement
// ============================================================================

/// Prepared statement bound to one [`SqliteConnection`].
///
/// # Invariants
/// - Holds the connection alive; it can never outlive it.
/// - Executions reuse the compiled statement from the connection cache.
#[derive(Clone)]
pub struct SqliteStatement {
    /// SQL text the statement was prepared from.
    pub(crate) sql: Arc<str>,
    /// Number of bind parameters.
    parameter_count: usize,
    /// Number of result columns.
    column_count: usize,
    /// Connection the statement belongs to.
    pub(crate) shared: Arc<SharedConnection>,
}

impl SqliteStatement {
    /// Returns the SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Returns the number of bind parameters.
    #[must_use]
    pub const fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    /// Returns the number of result columns.
    #[must_use]
    pub const fn column_count(&self) -> usize {
        self.column_count
    }

    /// Returns true when the statement was prepared on `connection`.
    #[must_use]
    pub fn belongs_to(&self, connection: &SqliteConnection) -> bool {
        Arc::ptr_eq(&self.shared, &connection.shared)
    }

    /// Executes the statement and returns the number of changed rows.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError`] when execution fails.
    pub fn execute<P: Params>(&self, params: P) -> Result<usize, SqliteError> {
        execute_on(&self.shared.lock(), &self.sql, params)
    }

    /// Returns the first row mapped through `map`.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError`] when execution fails or no row is returned.
    pub fn query_row<T, P, F>(&self, params: P, map: F) -> Result<T, SqliteError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        query_row_on(&self.shared.lock(), &self.sql, params, map)
    }

    /// Returns the first row mapped through `map`, or `None` without rows.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError`] when execution fails.
    pub fn query_optional<T, P, F>(&self, params: P, map: F) -> Result<Option<T>, SqliteError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        query_optional_on(&self.shared.lock(), &self.sql, params, map)
    }

    /// Returns every row mapped through `map`.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError`] when execution or mapping fails.
    pub fn query_map<T, P, F>(&self, params: P, map: F) -> Result<Vec<T>, SqliteError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        query_map_on(&self.shared.lock(), &self.sql, params, map)
    }
}

impl fmt::Debug for SqliteStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStatement")
            .field("sql", &self.sql)
            .field("parameter_count", &self.parameter_count)
            .field("column_count", &self.column_count)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Applies `SQLite` pragmas required for durability.
fn apply_pragmas(
    connection: &Connection,
    config: &SqliteConnectionConfig,
) -> Result<(), SqliteError> {
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))?;
    connection.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    Ok(())
}

/// Maps a prepare failure to rejected SQL or an unusable connection.
fn classify_prepare_error(error: rusqlite::Error) -> StatementError {
    match error.sqlite_error_code() {
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::OutOfMemory,
        ) => StatementError::Unavailable(error.to_string()),
        _ => StatementError::Rejected(error.to_string()),
    }
}

/// Executes cached `sql` on `connection`.
pub(crate) fn execute_on<P: Params>(
    connection: &Connection,
    sql: &str,
    params: P,
) -> Result<usize, SqliteError> {
    let mut statement = connection.prepare_cached(sql)?;
    Ok(statement.execute(params)?)
}

/// Runs cached `sql` on `connection` and maps the first row.
pub(crate) fn query_row_on<T, P, F>(
    connection: &Connection,
    sql: &str,
    params: P,
    map: F,
) -> Result<T, SqliteError>
where
    P: Params,
    F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut statement = connection.prepare_cached(sql)?;
    Ok(statement.query_row(params, map)?)
}

/// Runs cached `sql` on `connection` and maps the first row if present.
pub(crate) fn query_optional_on<T, P, F>(
    connection: &Connection,
    sql: &str,
    params: P,
    map: F,
) -> Result<Option<T>, SqliteError>
where
    P: Params,
    F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut statement = connection.prepare_cached(sql)?;
    Ok(statement.query_row(params, map).optional()?)
}

/// Runs cached `sql` on `connection` and maps every row.
pub(crate) fn query_map_on<T, P, F>(
    connection: &Connection,
    sql: &str,
    params: P,
    map: F,
) -> Result<Vec<T>, SqliteError>
where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut statement = connection.prepare_cached(sql)?;
    let rows = statement.query_map(params, map)?;
    Ok(rows.collect::<rusqlite::Result<Vec<T>>>()?)
}
