// crates/prepared-query-core/src/interfaces.rs
// ============================================================================
// Module: Prepared Query Interfaces
// Description: Backend seams for statement preparation and transactions.
// Purpose: Decouple the registry from concrete database drivers.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! Database drivers implement [`StatementConnection`] to turn SQL text into a
//! reusable prepared handle, and [`StatementTransaction`] to rebind such a
//! handle to an active transaction. The registry never opens, closes, or
//! otherwise manages the connection behind these traits.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Backend errors raised while preparing or binding statements.
///
/// # Invariants
/// - Messages come from the driver and never include bound parameter values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StatementError {
    /// The backend rejected the SQL text (syntax error, missing object).
    #[error("statement rejected: {0}")]
    Rejected(String),
    /// The backend connection could not be used.
    #[error("connection unavailable: {0}")]
    Unavailable(String),
    /// A prepared handle could not be bound to a transaction.
    #[error("transaction bind failed: {0}")]
    Bind(String),
}

// ============================================================================
// SECTION: Connection
// ============================================================================

/// Connection capable of preparing SQL text into reusable handles.
pub trait StatementConnection {
    /// Connection-bound prepared handle. Clones share the same statement.
    type Statement: Clone;

    /// Prepares `sql` against the connection.
    ///
    /// # Errors
    ///
    /// Returns [`StatementError`] when the SQL is malformed or the connection
    /// is unusable.
    fn prepare(&self, sql: &str) -> Result<Self::Statement, StatementError>;

    /// Returns a handle the registry no longer caches.
    fn release(&self, statement: Self::Statement) {
        drop(statement);
    }
}

impl<T: StatementConnection + ?Sized> StatementConnection for Arc<T> {
    type Statement = T::Statement;

    fn prepare(&self, sql: &str) -> Result<Self::Statement, StatementError> {
        (**self).prepare(sql)
    }

    fn release(&self, statement: Self::Statement) {
        (**self).release(statement);
    }
}

// ============================================================================
// SECTION: Transaction
// ============================================================================

/// Active transaction able to adopt prepared handles.
///
/// Binding must not alter the handle passed in; each call yields an
/// independent transaction-scoped handle.
pub trait StatementTransaction<S> {
    /// Transaction-scoped handle borrowed from the transaction.
    type Bound<'t>
    where
        Self: 't;

    /// Rebinds `statement` so executions run inside this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StatementError`] when the handle cannot join the
    /// transaction.
    fn bind<'t>(&'t self, statement: &S) -> Result<Self::Bound<'t>, StatementError>;
}
