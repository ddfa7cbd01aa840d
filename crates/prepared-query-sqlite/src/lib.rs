// crates/prepared-query-sqlite/src/lib.rs
// ============================================================================
// Module: Prepared Query SQLite Provider
// Description: SQLite-backed connection provider for the statement registry.
// Purpose: Prepare, execute, and transaction-bind statements via rusqlite.
// Dependencies: prepared-query-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides [`SqliteConnection`], a shared `SQLite` connection that
//! implements [`prepared_query_core::StatementConnection`], and
//! [`SqliteTransaction`], which implements
//! [`prepared_query_core::StatementTransaction`]. Prepared handles compile
//! their SQL once into the connection's statement cache and execute against
//! it, either directly or through a transaction.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;
pub mod connection;
pub mod transaction;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::SqliteConnectionConfig;
pub use config::SqliteJournalMode;
pub use config::SqliteSyncMode;
pub use connection::SqliteConnection;
pub use connection::SqliteError;
pub use connection::SqliteStatement;
pub use transaction::SqliteTransaction;
pub use transaction::SqliteTxBehavior;
pub use transaction::SqliteTxStatement;
