// crates/prepared-query-config/src/lib.rs
// ============================================================================
// Module: Prepared Query Config Library
// Description: TOML configuration model for prepared query registries.
// Purpose: Single source of truth for prepared-query.toml semantics.
// Dependencies: prepared-query-core, prepared-query-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! `prepared-query-config` loads the registry miss policy, `SQLite` connection
//! settings, and the named query list from one TOML file. Validation is strict
//! and fails closed; a loaded config can populate a
//! [`prepared_query_core::QueryCatalog`] and open the configured connection.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
