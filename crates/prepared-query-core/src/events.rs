// crates/prepared-query-core/src/events.rs
// ============================================================================
// Module: Registry Events
// Description: Structured registry events, sinks, and counters.
// Purpose: Emit JSON-line logs and lightweight stats without hard deps.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! The registry reports preparation outcomes, rejected lookups, and teardown
//! as [`RegistryEvent`] payloads routed to a [`RegistryEventSink`]. Sinks are
//! deliberately small so deployments can forward events to any logging
//! pipeline. Events carry query names only; SQL text is never logged.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Serialize;

// ============================================================================
// SECTION: Event Labels
// ============================================================================

/// Registry event classification.
///
/// # Invariants
/// - Variants are stable for log labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryEventKind {
    /// Registry construction finished bulk preparation.
    RegistryOpened,
    /// A statement was prepared and cached.
    StatementPrepared,
    /// Preparing a statement failed.
    StatementPrepareFailed,
    /// A registered but uncached name was rejected by the miss policy.
    CacheMissRejected,
    /// A lookup named a query absent from the catalog.
    QueryNotRegistered,
    /// A prepared handle could not be bound to a transaction.
    TransactionBindFailed,
    /// The registry released its cached handles.
    RegistryClosed,
}

impl RegistryEventKind {
    /// Returns a stable label for the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RegistryOpened => "registry_opened",
            Self::StatementPrepared => "statement_prepared",
            Self::StatementPrepareFailed => "statement_prepare_failed",
            Self::CacheMissRejected => "cache_miss_rejected",
            Self::QueryNotRegistered => "query_not_registered",
            Self::TransactionBindFailed => "transaction_bind_failed",
            Self::RegistryClosed => "registry_closed",
        }
    }
}

/// What caused a statement preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareTrigger {
    /// Bulk preparation of the whole catalog.
    Bulk,
    /// On-demand preparation after a cache miss.
    Lazy,
}

/// Registry event outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryOutcome {
    /// Operation succeeded.
    Ok,
    /// Operation failed.
    Error,
}

// ============================================================================
// SECTION: Event Payload
// ============================================================================

/// Registry event payload.
///
/// # Invariants
/// - Optional fields are `None` when they do not apply to the event kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEvent {
    /// Event identifier.
    pub event: RegistryEventKind,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: u128,
    /// Process-unique registry identifier.
    pub registry_id: u64,
    /// Query name when the event concerns a single query.
    pub query: Option<String>,
    /// Preparation trigger for preparation events.
    pub trigger: Option<PrepareTrigger>,
    /// Event outcome.
    pub outcome: RegistryOutcome,
    /// Backend round-trip duration in microseconds.
    pub duration_us: Option<u64>,
    /// Normalized error kind label.
    pub error_kind: Option<&'static str>,
    /// Number of cached handles after the event.
    pub prepared: usize,
}

impl RegistryEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(
        event: RegistryEventKind,
        registry_id: u64,
        outcome: RegistryOutcome,
        prepared: usize,
    ) -> Self {
        let timestamp_ms =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
        Self {
            event,
            timestamp_ms,
            registry_id,
            query: None,
            trigger: None,
            outcome,
            duration_us: None,
            error_kind: None,
            prepared,
        }
    }

    /// Attaches the query name.
    #[must_use]
    pub fn with_query(mut self, query: &str) -> Self {
        self.query = Some(query.to_string());
        self
    }

    /// Attaches the preparation trigger.
    #[must_use]
    pub const fn with_trigger(mut self, trigger: PrepareTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Attaches the backend round-trip duration.
    #[must_use]
    pub const fn with_duration_us(mut self, duration_us: u64) -> Self {
        self.duration_us = Some(duration_us);
        self
    }

    /// Attaches a normalized error label.
    #[must_use]
    pub const fn with_error_kind(mut self, error_kind: &'static str) -> Self {
        self.error_kind = Some(error_kind);
        self
    }
}

// ============================================================================
// SECTION: Sinks
// ============================================================================

/// Destination for registry events.
pub trait RegistryEventSink: Send + Sync {
    /// Records a registry event.
    fn record(&self, event: &RegistryEvent);
}

/// Event sink that discards everything.
pub struct NoopEventSink;

impl RegistryEventSink for NoopEventSink {
    fn record(&self, _event: &RegistryEvent) {}
}

/// Event sink that logs JSON lines to stderr.
pub struct StderrEventSink;

impl RegistryEventSink for StderrEventSink {
    fn record(&self, event: &RegistryEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            let _ = writeln!(io::stderr(), "{payload}");
        }
    }
}

/// Event sink that appends JSON lines to a file.
pub struct FileEventSink {
    /// File handle used for append-only logging.
    file: Mutex<std::fs::File>,
}

impl FileEventSink {
    /// Opens the event log in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl RegistryEventSink for FileEventSink {
    fn record(&self, event: &RegistryEvent) {
        if let Ok(payload) = serde_json::to_string(event)
            && let Ok(mut file) = self.file.lock()
        {
            let _ = writeln!(file, "{payload}");
            let _ = file.flush();
        }
    }
}

// ============================================================================
// SECTION: Stats
// ============================================================================

/// Snapshot of registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Statements prepared during bulk preparation.
    pub bulk_prepares: u64,
    /// Statements prepared on demand.
    pub lazy_prepares: u64,
    /// Failed preparation attempts.
    pub prepare_failures: u64,
    /// Lookups that waited on another caller's in-flight preparation.
    pub coalesced_waits: u64,
    /// Lookups that stopped waiting and prepared the statement themselves.
    pub wait_timeouts: u64,
    /// Lookups for names absent from the catalog.
    pub not_registered: u64,
    /// Misses rejected by the strict miss policy.
    pub misses_rejected: u64,
    /// Successful transaction binds.
    pub tx_binds: u64,
}

/// Atomic counters behind [`RegistryStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    /// Cache hits.
    pub(crate) hits: AtomicU64,
    /// Bulk preparations.
    pub(crate) bulk_prepares: AtomicU64,
    /// Lazy preparations.
    pub(crate) lazy_prepares: AtomicU64,
    /// Failed preparations.
    pub(crate) prepare_failures: AtomicU64,
    /// Coalesced waits.
    pub(crate) coalesced_waits: AtomicU64,
    /// Coalescing waits that timed out.
    pub(crate) wait_timeouts: AtomicU64,
    /// Unknown names.
    pub(crate) not_registered: AtomicU64,
    /// Strict-policy rejections.
    pub(crate) misses_rejected: AtomicU64,
    /// Transaction binds.
    pub(crate) tx_binds: AtomicU64,
}

impl StatsCounters {
    /// Increments a counter by one.
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub(crate) fn snapshot(&self) -> RegistryStats {
        RegistryStats {
            hits: self.hits.load(Ordering::Relaxed),
            bulk_prepares: self.bulk_prepares.load(Ordering::Relaxed),
            lazy_prepares: self.lazy_prepares.load(Ordering::Relaxed),
            prepare_failures: self.prepare_failures.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            not_registered: self.not_registered.load(Ordering::Relaxed),
            misses_rejected: self.misses_rejected.load(Ordering::Relaxed),
            tx_binds: self.tx_binds.load(Ordering::Relaxed),
        }
    }
}
