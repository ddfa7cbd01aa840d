// crates/prepared-query-core/tests/common/mod.rs
// ============================================================================
// Module: Registry Test Doubles
// Description: Counting stub connection, transaction, and event sink.
// Purpose: Observe prepare/bind/release traffic from registry tests.
// Dependencies: prepared-query-core
// ============================================================================

//! ## Overview
//! Shared stubs for registry integration tests. The connection records every
//! SQL text it is asked to prepare and every handle released back to it.

#![allow(dead_code, reason = "Not every test target uses every helper.")]

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use prepared_query_core::RegistryEvent;
use prepared_query_core::RegistryEventKind;
use prepared_query_core::RegistryEventSink;
use prepared_query_core::StatementConnection;
use prepared_query_core::StatementError;
use prepared_query_core::StatementTransaction;

// ============================================================================
// SECTION: Connection
// ============================================================================

/// Handle produced by [`StubConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubStatement {
    /// Sequence number of the prepare call that produced this handle.
    pub id: usize,
    /// SQL text the handle was prepared from.
    pub sql: String,
}

/// Connection stub that counts prepare calls.
#[derive(Debug, Default)]
pub struct StubConnection {
    /// SQL texts passed to `prepare`, in call order.
    prepared: Mutex<Vec<String>>,
    /// Handle ids passed to `release`.
    released: Mutex<Vec<usize>>,
    /// SQL texts that fail to prepare.
    failing: Mutex<BTreeSet<String>>,
    /// Artificial latency per prepare call.
    delay: Option<Duration>,
    /// Next handle id.
    next_id: AtomicUsize,
}

impl StubConnection {
    /// Creates a stub that prepares everything instantly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a stub that sleeps for `delay` inside every prepare call.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Makes preparing `sql` fail with [`StatementError::Rejected`].
    pub fn fail_on(&self, sql: &str) {
        self.failing.lock().unwrap().insert(sql.to_string());
    }

    /// Lets `sql` prepare successfully again.
    pub fn heal(&self, sql: &str) {
        self.failing.lock().unwrap().remove(sql);
    }

    /// Number of prepare calls observed.
    pub fn prepare_count(&self) -> usize {
        self.prepared.lock().unwrap().len()
    }

    /// SQL texts passed to prepare, in call order.
    pub fn prepared_sql(&self) -> Vec<String> {
        self.prepared.lock().unwrap().clone()
    }

    /// Ids of released handles, in release order.
    pub fn released(&self) -> Vec<usize> {
        self.released.lock().unwrap().clone()
    }
}

impl StatementConnection for StubConnection {
    type Statement = StubStatement;

    fn prepare(&self, sql: &str) -> Result<Self::Statement, StatementError> {
        self.prepared.lock().unwrap().push(sql.to_string());
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.failing.lock().unwrap().contains(sql) {
            return Err(StatementError::Rejected(format!("syntax error near {sql:?}")));
        }
        Ok(StubStatement {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            sql: sql.to_string(),
        })
    }

    fn release(&self, statement: Self::Statement) {
        self.released.lock().unwrap().push(statement.id);
    }
}

// ============================================================================
// SECTION: Transaction
// ============================================================================

/// Transaction stub recording which handles were bound to it.
#[derive(Debug, Default)]
pub struct StubTransaction {
    /// Transaction identity.
    pub id: u64,
    /// Handle ids bound to this transaction.
    binds: Mutex<Vec<usize>>,
    /// Rejects every bind when set.
    reject: bool,
}

/// Handle bound to a [`StubTransaction`].
#[derive(Debug)]
pub struct StubTxStatement<'t> {
    /// Transaction the handle was bound to.
    pub transaction: &'t StubTransaction,
    /// Underlying connection handle.
    pub statement: StubStatement,
}

/// Transaction id source.
static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

impl StubTransaction {
    /// Creates a transaction that accepts every handle.
    pub fn new() -> Self {
        Self {
            id: NEXT_TX_ID.fetch_add(1, Ordering::SeqCst),
            ..Self::default()
        }
    }

    /// Creates a transaction that rejects every handle.
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::new()
        }
    }

    /// Number of bind calls observed.
    pub fn bind_count(&self) -> usize {
        self.binds.lock().unwrap().len()
    }

    /// Handle ids bound so far.
    pub fn bound_ids(&self) -> Vec<usize> {
        self.binds.lock().unwrap().clone()
    }
}

impl StatementTransaction<StubStatement> for StubTransaction {
    type Bound<'t> = StubTxStatement<'t>;

    fn bind<'t>(&'t self, statement: &StubStatement) -> Result<Self::Bound<'t>, StatementError> {
        self.binds.lock().unwrap().push(statement.id);
        if self.reject {
            return Err(StatementError::Bind("transaction already finished".to_string()));
        }
        Ok(StubTxStatement {
            transaction: self,
            statement: statement.clone(),
        })
    }
}

// ============================================================================
// SECTION: Event Sink
// ============================================================================

/// Event sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    /// Recorded events.
    events: Mutex<Vec<RegistryEvent>>,
}

impl RecordingSink {
    /// Returns a copy of all recorded events.
    pub fn events(&self) -> Vec<RegistryEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Returns recorded events of one kind.
    pub fn of_kind(&self, kind: RegistryEventKind) -> Vec<RegistryEvent> {
        self.events().into_iter().filter(|event| event.event == kind).collect()
    }
}

impl RegistryEventSink for RecordingSink {
    fn record(&self, event: &RegistryEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
