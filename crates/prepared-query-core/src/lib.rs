// crates/prepared-query-core/src/lib.rs
// ============================================================================
// Module: Prepared Query Core Library
// Description: Public API surface for the prepared query registry.
// Purpose: Expose the query catalog, statement registry, and backend seams.
// Dependencies: crate::{catalog, events, interfaces, registry}
// ============================================================================

//! ## Overview
//! `prepared-query-core` maps query names to SQL text through a
//! [`QueryCatalog`] and caches one prepared handle per name in a
//! [`StatementRegistry`] bound to a single database connection. Handles are
//! prepared eagerly at construction, lazily on a cache miss, and can be
//! rebound to an active transaction. The crate is backend agnostic; database
//! drivers plug in through [`StatementConnection`] and
//! [`StatementTransaction`].

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod catalog;
pub mod events;
pub mod interfaces;
pub mod registry;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use catalog::CatalogError;
pub use catalog::QueryCatalog;
pub use events::FileEventSink;
pub use events::NoopEventSink;
pub use events::PrepareTrigger;
pub use events::RegistryEvent;
pub use events::RegistryEventKind;
pub use events::RegistryEventSink;
pub use events::RegistryOutcome;
pub use events::RegistryStats;
pub use events::StderrEventSink;
pub use interfaces::StatementConnection;
pub use interfaces::StatementError;
pub use interfaces::StatementTransaction;
pub use registry::DEFAULT_COALESCE_WAIT_MS;
pub use registry::OnCacheMiss;
pub use registry::RegistryError;
pub use registry::RegistryOptions;
pub use registry::StatementRegistry;
