// crates/prepared-query-sqlite/src/transaction.rs
// ============================================================================
// Module: SQLite Transactions
// Description: Transaction guard and transaction-scoped statements.
// Purpose: Implement StatementTransaction on top of rusqlite.
// Dependencies: prepared-query-core, rusqlite
// ============================================================================

//! ## Overview
//! [`SqliteTransaction`] holds the connection lock from `BEGIN` until commit,
//! rollback, or drop (which rolls back). Prepared handles are rebound to it
//! through [`StatementTransaction::bind`], producing [`SqliteTxStatement`]
//! values that execute through the locked connection and therefore inside
//! the transaction.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::ReentrantMutexGuard;
use prepared_query_core::StatementError;
use prepared_query_core::StatementTransaction;
use rusqlite::Connection;
use rusqlite::Params;
use rusqlite::Row;

use crate::connection::SharedConnection;
use crate::connection::SqliteError;
use crate::connection::SqliteStatement;
use crate::connection::execute_on;
use crate::connection::query_map_on;
use crate::connection::query_optional_on;
use crate::connection::query_row_on;

// ============================================================================
// SECTION: Behavior
// ============================================================================

/// Locking behavior requested at `BEGIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqliteTxBehavior {
    /// Acquire locks on first access.
    #[default]
    Deferred,
    /// Acquire the write lock immediately.
    Immediate,
    /// Acquire an exclusive lock immediately.
    Exclusive,
}

impl SqliteTxBehavior {
    /// Returns the `BEGIN` statement for this behavior.
    const fn begin_sql(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

// ============================================================================
// SECTION: Transaction
// ============================================================================

/// Active transaction on a [`crate::SqliteConnection`].
///
/// # Invariants
/// - The connection lock is held for the whole transaction.
/// - Dropping an unfinished transaction rolls it back.
pub struct SqliteTransaction<'c> {
    /// Connection identity used to validate binds.
    shared: &'c Arc<SharedConnection>,
    /// Locked connection.
    connection: ReentrantMutexGuard<'c, Connection>,
    /// True once committed or rolled back.
    finished: bool,
}

impl<'c> SqliteTransaction<'c> {
    /// Issues `BEGIN` on an already locked connection.
    pub(crate) fn begin(
        shared: &'c Arc<SharedConnection>,
        connection: ReentrantMutexGuard<'c, Connection>,
        behavior: SqliteTxBehavior,
    ) -> Result<Self, SqliteError> {
        connection.execute_batch(behavior.begin_sql())?;
        Ok(Self {
            shared,
            connection,
            finished: false,
        })
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError`] when `COMMIT` fails; the transaction is then
    /// rolled back on drop.
    pub fn commit(mut self) -> Result<(), SqliteError> {
        self.connection.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    /// Rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError`] when `ROLLBACK` fails.
    pub fn rollback(mut self) -> Result<(), SqliteError> {
        self.finished = true;
        self.connection.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Runs ad hoc statements inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError`] when `SQLite` fails.
    pub fn execute_batch(&self, sql: &str) -> Result<(), SqliteError> {
        self.connection.execute_batch(sql)?;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.connection.execute_batch("ROLLBACK");
        }
    }
}

impl StatementTransaction<SqliteStatement> for SqliteTransaction<'_> {
    type Bound<'t>
        = SqliteTxStatement<'t>
    where
        Self: 't;

    fn bind<'t>(&'t self, statement: &SqliteStatement) -> Result<Self::Bound<'t>, StatementError> {
        if !Arc::ptr_eq(&statement.shared, self.shared) {
            return Err(StatementError::Bind(
                "statement was prepared on a different connection".to_string(),
            ));
        }
        Ok(SqliteTxStatement {
            sql: Arc::clone(&statement.sql),
            connection: &self.connection,
        })
    }
}

// ============================================================================
// SECTION: Transaction Statement
// ============================================================================

/// Prepared statement rebound to a [`SqliteTransaction`].
pub struct SqliteTxStatement<'t> {
    /// SQL text of the underlying prepared statement.
    sql: Arc<str>,
    /// Locked connection owned by the transaction.
    connection: &'t Connection,
}

impl SqliteTxStatement<'_> {
    /// Returns the SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Executes the statement and returns the number of changed rows.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError`] when execution fails.
    pub fn execute<P: Params>(&self, params: P) -> Result<usize, SqliteError> {
        execute_on(self.connection, &self.sql, params)
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
        query_row_on(self.connection, &self.sql, params, map)
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
        query_optional_on(self.connection, &self.sql, params, map)
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
        query_map_on(self.connection, &self.sql, params, map)
    }
}
