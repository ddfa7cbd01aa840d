// crates/prepared-query-core/src/registry.rs
// ============================================================================
// Module: Statement Registry
// Description: Per-connection cache of prepared statements keyed by name.
// Purpose: Prepare each catalog query once and reuse the handle afterwards.
// Dependencies: crate::{catalog, events, interfaces}, serde, thiserror
// ============================================================================

//! ## Overview
//! A [`StatementRegistry`] owns one connection handle and a cache mapping
//! query names to prepared handles. Construction prepares every catalog entry
//! and fails as a whole on the first error. Lookups return cached handles,
//! prepare missing ones on demand (or reject them under
//! [`OnCacheMiss::Fail`]), and can rebind a handle to an active transaction.
//!
//! Concurrent first lookups for the same name are coalesced: one caller
//! prepares while the others wait for the in-flight marker to settle.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::catalog::QueryCatalog;
use crate::events::NoopEventSink;
use crate::events::PrepareTrigger;
use crate::events::RegistryEvent;
use crate::events::RegistryEventKind;
use crate::events::RegistryEventSink;
use crate::events::RegistryOutcome;
use crate::events::RegistryStats;
use crate::events::StatsCounters;
use crate::interfaces::StatementConnection;
use crate::interfaces::StatementError;
use crate::interfaces::StatementTransaction;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Source of process-unique registry identifiers for event correlation.
static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);
/// Default bound on waiting for another caller's in-flight preparation.
pub const DEFAULT_COALESCE_WAIT_MS: u64 = 250;

// ============================================================================
// SECTION: Options
// ============================================================================

/// Behavior when a registered query has no cached handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnCacheMiss {
    /// Prepare the statement on demand and cache it.
    #[default]
    LazyPrepare,
    /// Reject the lookup with [`RegistryError::NotPrepared`].
    Fail,
}

impl OnCacheMiss {
    /// Returns the configuration label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LazyPrepare => "lazy_prepare",
            Self::Fail => "fail",
        }
    }
}

/// Construction-time registry options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryOptions {
    /// Cache miss policy.
    #[serde(default)]
    pub on_cache_miss: OnCacheMiss,
    /// Longest a lookup waits on another caller's in-flight preparation
    /// before preparing the statement itself.
    #[serde(default = "default_coalesce_wait_ms")]
    pub coalesce_wait_ms: u64,
}

impl RegistryOptions {
    /// Returns default options with the given miss policy.
    #[must_use]
    pub const fn with_miss_policy(on_cache_miss: OnCacheMiss) -> Self {
        Self {
            on_cache_miss,
            coalesce_wait_ms: DEFAULT_COALESCE_WAIT_MS,
        }
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self::with_miss_policy(OnCacheMiss::default())
    }
}

/// Returns the default coalescing wait in milliseconds.
const fn default_coalesce_wait_ms() -> u64 {
    DEFAULT_COALESCE_WAIT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Statement registry errors.
///
/// # Invariants
/// - Every variant names the query involved.
/// - Messages never embed SQL text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The query name is absent from the catalog.
    #[error("query not registered: {name}")]
    NotRegistered {
        /// Requested query name.
        name: String,
    },
    /// The query is registered but has no cached handle and lazy preparation
    /// is disabled.
    #[error("query registered but not prepared: {name}")]
    NotPrepared {
        /// Requested query name.
        name: String,
    },
    /// The connection rejected the query during bulk or lazy preparation.
    #[error("failed to prepare query {name}: {source}")]
    PreparationFailed {
        /// Query that failed to prepare.
        name: String,
        /// Backend error.
        #[source]
        source: StatementError,
    },
    /// The transaction refused the prepared handle.
    #[error("failed to bind query {name} to transaction: {source}")]
    TransactionBindFailed {
        /// Query that failed to bind.
        name: String,
        /// Backend error.
        #[source]
        source: StatementError,
    },
}

impl RegistryError {
    /// Returns the query name carried by the error.
    #[must_use]
    pub fn query_name(&self) -> &str {
        match self {
            Self::NotRegistered {
                name,
            }
            | Self::NotPrepared {
                name,
            }
            | Self::PreparationFailed {
                name, ..
            }
            | Self::TransactionBindFailed {
                name, ..
            } => name,
        }
    }

    /// Returns a stable label for the error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotRegistered {
                ..
            } => "not_registered",
            Self::NotPrepared {
                ..
            } => "not_prepared",
            Self::PreparationFailed {
                ..
            } => "preparation_failed",
            Self::TransactionBindFailed {
                ..
            } => "transaction_bind_failed",
        }
    }
}

// ============================================================================
// SECTION: Cache Slots
// ============================================================================

/// Per-name cache state.
enum CacheSlot<S> {
    /// A caller is preparing this name; others wait on the condvar.
    Preparing,
    /// Prepared handle ready for reuse.
    Ready(S),
}

/// Name to slot mapping guarded by the registry mutex.
type SlotMap<S> = HashMap<String, CacheSlot<S>>;

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Lazy, name-indexed cache of prepared statements over one connection.
///
/// # Invariants
/// - Every `Ready` entry was prepared successfully against `connection`.
/// - A failed preparation leaves no entry behind.
/// - The registry never closes the connection; cached handles are released
///   on [`StatementRegistry::close`] or drop.
/// - A lookup never waits on an in-flight preparation longer than
///   `coalesce_wait_ms`; the holder may be blocked behind the waiter (for
///   example on a connection lock the waiter's transaction owns).
pub struct StatementRegistry<C: StatementConnection> {
    /// Process-unique identifier used in events.
    id: u64,
    /// Connection the handles are bound to.
    connection: C,
    /// Shared query catalog.
    catalog: Arc<QueryCatalog>,
    /// Construction-time options.
    options: RegistryOptions,
    /// Cached handles and in-flight markers.
    cache: Mutex<SlotMap<C::Statement>>,
    /// Signalled whenever an in-flight marker is resolved.
    settled: Condvar,
    /// Event destination.
    events: Arc<dyn RegistryEventSink>,
    /// Lookup and preparation counters.
    stats: StatsCounters,
    /// Set once construction finished bulk preparation.
    opened: bool,
    /// Set once [`StatementRegistry::close`] has released the cache.
    closed: bool,
}

impl<C: StatementConnection> StatementRegistry<C> {
    /// Builds a registry with default options and no event logging.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::PreparationFailed`] when any catalog query
    /// fails to prepare.
    pub fn new(connection: C, catalog: Arc<QueryCatalog>) -> Result<Self, RegistryError> {
        Self::with_events(connection, catalog, RegistryOptions::default(), Arc::new(NoopEventSink))
    }

    /// Builds a registry with explicit options and no event logging.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::PreparationFailed`] when any catalog query
    /// fails to prepare.
    pub fn with_options(
        connection: C,
        catalog: Arc<QueryCatalog>,
        options: RegistryOptions,
    ) -> Result<Self, RegistryError> {
        Self::with_events(connection, catalog, options, Arc::new(NoopEventSink))
    }

    /// Builds a registry and prepares every catalog entry.
    ///
    /// Construction is all-or-nothing: on failure no registry is returned and
    /// any handles prepared before the failure are released.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::PreparationFailed`] naming the first query
    /// that failed to prepare.
    pub fn with_events(
        connection: C,
        catalog: Arc<QueryCatalog>,
        options: RegistryOptions,
        events: Arc<dyn RegistryEventSink>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            connection,
            cache: Mutex::new(HashMap::with_capacity(catalog.len())),
            catalog,
            options,
            settled: Condvar::new(),
            events,
            stats: StatsCounters::default(),
            opened: false,
            closed: false,
        };
        registry.prepare_all()?;
        registry.opened = true;
        registry.emit(RegistryEvent::new(
            RegistryEventKind::RegistryOpened,
            registry.id,
            RegistryOutcome::Ok,
            registry.len(),
        ));
        Ok(registry)
    }

    /// Prepares every catalog entry and caches the handles.
    ///
    /// Stops at the first failure; entries prepared before it stay cached.
    /// Existing handles for the same names are replaced and released.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::PreparationFailed`] naming the failing query.
    pub fn prepare_all(&self) -> Result<usize, RegistryError> {
        let mut prepared = 0;
        for (name, sql) in self.catalog.entries() {
            let statement = self.prepare_query(&name, &sql, PrepareTrigger::Bulk)?;
            let replaced = {
                let mut cache = self.lock_cache();
                cache.insert(name, CacheSlot::Ready(statement))
            };
            self.settled.notify_all();
            if let Some(CacheSlot::Ready(previous)) = replaced {
                self.connection.release(previous);
            }
            prepared += 1;
        }
        Ok(prepared)
    }

    /// Returns the prepared handle for `name`.
    ///
    /// Cached handles are returned without touching the connection. A
    /// registered but uncached name is prepared on demand under
    /// [`OnCacheMiss::LazyPrepare`]. When another caller is already preparing
    /// the name, this call waits up to `coalesce_wait_ms` for its result and
    /// then prepares the statement itself.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::NotRegistered`] when `name` is not in the catalog.
    /// - [`RegistryError::NotPrepared`] when the miss policy is
    ///   [`OnCacheMiss::Fail`].
    /// - [`RegistryError::PreparationFailed`] when on-demand preparation fails.
    pub fn get(&self, name: &str) -> Result<C::Statement, RegistryError> {
        let mut cache = self.lock_cache();
        let limit = Duration::from_millis(self.options.coalesce_wait_ms);
        let mut waiting_since: Option<Instant> = None;
        let overtaking = loop {
            match cache.get(name) {
                Some(CacheSlot::Ready(statement)) => {
                    StatsCounters::bump(&self.stats.hits);
                    return Ok(statement.clone());
                }
                Some(CacheSlot::Preparing) => {
                    let since = *waiting_since.get_or_insert_with(|| {
                        StatsCounters::bump(&self.stats.coalesced_waits);
                        Instant::now()
                    });
                    let waited = since.elapsed();
                    if waited >= limit {
                        break true;
                    }
                    cache = self
                        .settled
                        .wait_timeout(cache, limit - waited)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => break false,
            }
        };

        let Some(sql) = self.catalog.sql(name) else {
            let prepared = count_ready(&*cache);
            drop(cache);
            StatsCounters::bump(&self.stats.not_registered);
            self.emit(
                RegistryEvent::new(
                    RegistryEventKind::QueryNotRegistered,
                    self.id,
                    RegistryOutcome::Error,
                    prepared,
                )
                .with_query(name)
                .with_error_kind("not_registered"),
            );
            return Err(RegistryError::NotRegistered {
                name: name.to_string(),
            });
        };

        if self.options.on_cache_miss == OnCacheMiss::Fail {
            let prepared = count_ready(&*cache);
            drop(cache);
            StatsCounters::bump(&self.stats.misses_rejected);
            self.emit(
                RegistryEvent::new(
                    RegistryEventKind::CacheMissRejected,
                    self.id,
                    RegistryOutcome::Error,
                    prepared,
                )
                .with_query(name)
                .with_error_kind("not_prepared"),
            );
            return Err(RegistryError::NotPrepared {
                name: name.to_string(),
            });
        }

        if overtaking {
            // The in-flight marker stays with its owner; whichever handle is
            // published first wins.
            drop(cache);
            StatsCounters::bump(&self.stats.wait_timeouts);
            let statement = self.prepare_query(name, &sql, PrepareTrigger::Lazy)?;
            return Ok(self.publish(name, statement));
        }

        cache.insert(name.to_string(), CacheSlot::Preparing);
        drop(cache);
        let marker = InFlight {
            registry: self,
            name,
            armed: true,
        };
        let statement = self.prepare_query(name, &sql, PrepareTrigger::Lazy)?;
        Ok(marker.complete(statement))
    }

    /// Returns the handle for `name` rebound to `transaction`.
    ///
    /// The cache is not modified by binding; each call yields an independent
    /// transaction-scoped handle.
    ///
    /// # Errors
    ///
    /// - Any error from [`StatementRegistry::get`], unchanged; the transaction
    ///   is not touched in that case.
    /// - [`RegistryError::TransactionBindFailed`] when the transaction refuses
    ///   the handle.
    pub fn get_tx<'t, T>(
        &self,
        transaction: &'t T,
        name: &str,
    ) -> Result<T::Bound<'t>, RegistryError>
    where
        T: StatementTransaction<C::Statement>,
    {
        let statement = self.get(name)?;
        match transaction.bind(&statement) {
            Ok(bound) => {
                StatsCounters::bump(&self.stats.tx_binds);
                Ok(bound)
            }
            Err(source) => {
                self.emit(
                    RegistryEvent::new(
                        RegistryEventKind::TransactionBindFailed,
                        self.id,
                        RegistryOutcome::Error,
                        self.len(),
                    )
                    .with_query(name)
                    .with_error_kind("transaction_bind_failed"),
                );
                Err(RegistryError::TransactionBindFailed {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Releases every cached handle and returns how many were released.
    #[must_use = "the released count reports how many handles were returned"]
    pub fn close(mut self) -> usize {
        let released = self.release_all();
        self.closed = true;
        released
    }

    /// Returns the number of cached handles.
    #[must_use]
    pub fn len(&self) -> usize {
        count_ready(&*self.lock_cache())
    }

    /// Returns true when no handles are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true when `name` has a cached handle.
    #[must_use]
    pub fn is_prepared(&self, name: &str) -> bool {
        matches!(self.lock_cache().get(name), Some(CacheSlot::Ready(_)))
    }

    /// Returns the names with cached handles, sorted.
    #[must_use]
    pub fn prepared_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock_cache()
            .iter()
            .filter(|(_, slot)| matches!(slot, CacheSlot::Ready(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Returns the process-unique registry identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Returns the shared query catalog.
    #[must_use]
    pub const fn catalog(&self) -> &Arc<QueryCatalog> {
        &self.catalog
    }

    /// Returns the connection the handles are bound to.
    #[must_use]
    pub const fn connection(&self) -> &C {
        &self.connection
    }

    /// Returns the construction-time options.
    #[must_use]
    pub const fn options(&self) -> RegistryOptions {
        self.options
    }

    /// Returns a snapshot of lookup and preparation counters.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.stats.snapshot()
    }

    /// Prepares one query, recording stats and events.
    fn prepare_query(
        &self,
        name: &str,
        sql: &str,
        trigger: PrepareTrigger,
    ) -> Result<C::Statement, RegistryError> {
        let started = Instant::now();
        let result = self.connection.prepare(sql);
        let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        match result {
            Ok(statement) => {
                let counter = match trigger {
                    PrepareTrigger::Bulk => &self.stats.bulk_prepares,
                    PrepareTrigger::Lazy => &self.stats.lazy_prepares,
                };
                StatsCounters::bump(counter);
                self.emit(
                    RegistryEvent::new(
                        RegistryEventKind::StatementPrepared,
                        self.id,
                        RegistryOutcome::Ok,
                        self.len(),
                    )
                    .with_query(name)
                    .with_trigger(trigger)
                    .with_duration_us(duration_us),
                );
                Ok(statement)
            }
            Err(source) => {
                StatsCounters::bump(&self.stats.prepare_failures);
                self.emit(
                    RegistryEvent::new(
                        RegistryEventKind::StatementPrepareFailed,
                        self.id,
                        RegistryOutcome::Error,
                        self.len(),
                    )
                    .with_query(name)
                    .with_trigger(trigger)
                    .with_duration_us(duration_us)
                    .with_error_kind("preparation_failed"),
                );
                Err(RegistryError::PreparationFailed {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Caches `statement` unless a handle for `name` is already ready, and
    /// returns the cached handle. A losing handle is released.
    fn publish(&self, name: &str, statement: C::Statement) -> C::Statement {
        let mut cache = self.lock_cache();
        let (winner, surplus) = match cache.get(name) {
            Some(CacheSlot::Ready(existing)) => (existing.clone(), Some(statement)),
            _ => {
                cache.insert(name.to_string(), CacheSlot::Ready(statement.clone()));
                (statement, None)
            }
        };
        drop(cache);
        self.settled.notify_all();
        if let Some(surplus) = surplus {
            self.connection.release(surplus);
        }
        winner
    }

    /// Drains the cache and hands every ready handle back to the connection.
    ///
    /// `registry_closed` is only emitted for registries that finished
    /// construction.
    fn release_all(&mut self) -> usize {
        let slots = std::mem::take(self.cache.get_mut().unwrap_or_else(PoisonError::into_inner));
        let mut released = 0;
        for (_, slot) in slots {
            if let CacheSlot::Ready(statement) = slot {
                self.connection.release(statement);
                released += 1;
            }
        }
        if self.opened {
            self.emit(RegistryEvent::new(
                RegistryEventKind::RegistryClosed,
                self.id,
                RegistryOutcome::Ok,
                released,
            ));
        }
        released
    }

    /// Locks the cache; the map stays consistent even if a holder panicked.
    fn lock_cache(&self) -> MutexGuard<'_, SlotMap<C::Statement>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forwards an event to the configured sink.
    fn emit(&self, event: RegistryEvent) {
        self.events.record(&event);
    }
}

impl<C: StatementConnection> Drop for StatementRegistry<C> {
    fn drop(&mut self) {
        if !self.closed {
            self.release_all();
        }
    }
}

// ============================================================================
// SECTION: In-Flight Marker
// ============================================================================

/// Owns a `Preparing` slot until the preparation completes.
///
/// Dropping an armed marker (failed or panicked preparation) removes the slot
/// and wakes waiters so one of them can retry.
struct InFlight<'r, C: StatementConnection> {
    /// Registry holding the slot.
    registry: &'r StatementRegistry<C>,
    /// Query name being prepared.
    name: &'r str,
    /// False once the slot has been resolved.
    armed: bool,
}

impl<C: StatementConnection> InFlight<'_, C> {
    /// Publishes the prepared handle and returns the handle callers should use.
    ///
    /// Bulk preparation or a caller that stopped waiting may have published
    /// a handle first; that handle wins.
    fn complete(mut self, statement: C::Statement) -> C::Statement {
        self.armed = false;
        self.registry.publish(self.name, statement)
    }
}

impl<C: StatementConnection> Drop for InFlight<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut cache = self.registry.lock_cache();
            if matches!(cache.get(self.name), Some(CacheSlot::Preparing)) {
                cache.remove(self.name);
            }
        }
        self.registry.settled.notify_all();
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Counts slots holding a prepared handle.
fn count_ready<S>(slots: &SlotMap<S>) -> usize {
    slots.values().filter(|slot| matches!(slot, CacheSlot::Ready(_))).count()
}
