// crates/prepared-query-sqlite/tests/sqlite_registry.rs
// ============================================================================
// Module: SQLite Registry Tests
// Description: Statement registry running against a real SQLite database.
// Purpose: Validate preparation, execution, and transaction rebinding.
// Dependencies: prepared-query-core, prepared-query-sqlite, proptest, rusqlite, tempfile
// ============================================================================

//! ## Overview
//! End-to-end tests for the `SQLite` provider:
//! - Bulk preparation and failure reporting for malformed SQL
//! - Execution through cached handles
//! - Transaction-scoped handles, commit, rollback, and rollback on drop
//! - Cross-connection bind rejection
//! - Handle release and statement cache sizing

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use prepared_query_core::OnCacheMiss;
use prepared_query_core::QueryCatalog;
use prepared_query_core::RegistryError;
use prepared_query_core::RegistryOptions;
use prepared_query_core::StatementConnection;
use prepared_query_core::StatementError;
use prepared_query_core::StatementRegistry;
use prepared_query_sqlite::SqliteConnection;
use prepared_query_sqlite::SqliteConnectionConfig;
use prepared_query_sqlite::SqliteError;
use prepared_query_sqlite::SqliteTxBehavior;
use proptest::prelude::*;
use rusqlite::hooks::AuthContext;
use rusqlite::hooks::Authorization;
use rusqlite::params;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

const SCHEMA: &str = "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);";

fn users_connection() -> SqliteConnection {
    let connection = SqliteConnection::open_in_memory().unwrap();
    connection.execute_batch(SCHEMA).unwrap();
    connection
}

fn users_catalog() -> Arc<QueryCatalog> {
    let catalog = QueryCatalog::new();
    catalog.register("insert_user", "INSERT INTO users (id, name) VALUES (?1, ?2)");
    catalog.register("user_name", "SELECT name FROM users WHERE id = ?1");
    catalog.register("count_users", "SELECT COUNT(*) FROM users");
    Arc::new(catalog)
}

fn count(registry: &StatementRegistry<SqliteConnection>) -> i64 {
    registry.get("count_users").unwrap().query_row([], |row| row.get(0)).unwrap()
}

// ============================================================================
// SECTION: Preparation
// ============================================================================

/// Verifies construction prepares every query on the connection.
#[test]
fn registry_prepares_catalog_on_sqlite() {
    let connection = users_connection();
    let registry = StatementRegistry::new(connection.clone(), users_catalog()).unwrap();

    assert_eq!(registry.len(), 3);
    assert_eq!(connection.live_statements(), 3);

    let insert = registry.get("insert_user").unwrap();
    assert_eq!(insert.parameter_count(), 2);
    assert_eq!(insert.column_count(), 0);
    assert!(insert.belongs_to(&connection));
    assert_eq!(registry.get("user_name").unwrap().column_count(), 1);
}

/// Verifies malformed SQL fails construction and names the query.
#[test]
fn malformed_sql_fails_construction() {
    let connection = users_connection();
    let catalog = users_catalog();
    catalog.register("broken", "SELEC name FROM users");

    let Err(err) = StatementRegistry::new(connection.clone(), catalog) else {
        panic!("construction should fail");
    };

    assert_eq!(err.query_name(), "broken");
    assert!(matches!(
        err,
        RegistryError::PreparationFailed {
            source: StatementError::Rejected(_),
            ..
        }
    ));
    assert!(err.to_string().contains("broken"));
    assert_eq!(connection.live_statements(), 0);
}

/// Verifies references to missing tables are rejected at preparation.
#[test]
fn missing_table_is_rejected() {
    let connection = users_connection();
    let catalog = Arc::new(QueryCatalog::new());
    catalog.register("orders", "SELECT * FROM orders");

    let Err(err) = StatementRegistry::new(connection, catalog) else {
        panic!("construction should fail");
    };

    let RegistryError::PreparationFailed {
        name,
        source: StatementError::Rejected(message),
    } = err
    else {
        panic!("expected a rejected preparation");
    };
    assert_eq!(name, "orders");
    assert!(message.contains("orders"));
}

/// Verifies lazily registered queries prepare on the live connection.
#[test]
fn lazy_preparation_on_sqlite() {
    let connection = users_connection();
    let catalog = users_catalog();
    let registry = StatementRegistry::new(connection.clone(), Arc::clone(&catalog)).unwrap();
    catalog.register("delete_user", "DELETE FROM users WHERE id = ?1");

    registry.get("insert_user").unwrap().execute(params![1, "ada"]).unwrap();
    let deleted = registry.get("delete_user").unwrap().execute([1]).unwrap();

    assert_eq!(deleted, 1);
    assert_eq!(connection.live_statements(), 4);
    assert_eq!(count(&registry), 0);
}

/// Verifies the strict policy rejects queries registered after construction.
#[test]
fn strict_policy_on_sqlite() {
    let connection = users_connection();
    let catalog = users_catalog();
    let registry = StatementRegistry::with_options(
        connection,
        Arc::clone(&catalog),
        RegistryOptions::with_miss_policy(OnCacheMiss::Fail),
    )
    .unwrap();
    catalog.register("delete_user", "DELETE FROM users WHERE id = ?1");

    assert_eq!(registry.get("delete_user").unwrap_err().kind(), "not_prepared");
}

// ============================================================================
// SECTION: Execution
// ============================================================================

/// Verifies handles execute and query through the statement cache.
#[test]
fn handles_execute_and_query() {
    let registry = StatementRegistry::new(users_connection(), users_catalog()).unwrap();
    let insert = registry.get("insert_user").unwrap();

    assert_eq!(insert.execute(params![1, "ada"]).unwrap(), 1);
    assert_eq!(insert.execute(params![2, "grace"]).unwrap(), 1);

    let name = registry.get("user_name").unwrap();
    let found: String = name.query_row([2], |row| row.get(0)).unwrap();
    assert_eq!(found, "grace");
    let missing: Option<String> = name.query_optional([9], |row| row.get(0)).unwrap();
    assert!(missing.is_none());
    assert_eq!(count(&registry), 2);
}

/// Verifies constraint violations surface as database errors.
#[test]
fn execution_errors_are_reported() {
    let registry = StatementRegistry::new(users_connection(), users_catalog()).unwrap();
    let insert = registry.get("insert_user").unwrap();
    insert.execute(params![1, "ada"]).unwrap();

    let err = insert.execute(params![1, "again"]).unwrap_err();

    assert!(matches!(err, SqliteError::Db(_)));
}

/// Verifies query_map collects every row.
#[test]
fn query_map_collects_rows() {
    let connection = users_connection();
    let catalog = users_catalog();
    catalog.register("all_names", "SELECT name FROM users ORDER BY id");
    let registry = StatementRegistry::new(connection, catalog).unwrap();
    let insert = registry.get("insert_user").unwrap();
    for (id, name) in [(1, "ada"), (2, "grace"), (3, "barbara")] {
        insert.execute(params![id, name]).unwrap();
    }

    let names: Vec<String> =
        registry.get("all_names").unwrap().query_map([], |row| row.get(0)).unwrap();

    assert_eq!(names, vec!["ada", "grace", "barbara"]);
}

/// Verifies a shared registry can execute from many threads.
#[test]
fn registry_is_shared_across_threads() {
    let registry = StatementRegistry::new(users_connection(), users_catalog()).unwrap();

    thread::scope(|scope| {
        for worker in 0 .. 4_i64 {
            let registry = &registry;
            scope.spawn(move || {
                let insert = registry.get("insert_user").unwrap();
                for offset in 0 .. 25_i64 {
                    insert.execute(params![worker * 100 + offset, "user"]).unwrap();
                }
            });
        }
    });

    assert_eq!(count(&registry), 100);
}

// ============================================================================
// SECTION: Transactions
// ============================================================================

/// Verifies committed transaction writes are visible afterwards.
#[test]
fn transaction_commit_persists_writes() {
    let connection = users_connection();
    let registry = StatementRegistry::new(connection.clone(), users_catalog()).unwrap();

    let tx = connection.transaction().unwrap();
    let insert = registry.get_tx(&tx, "insert_user").unwrap();
    insert.execute(params![1, "ada"]).unwrap();
    insert.execute(params![2, "grace"]).unwrap();
    let inside: i64 =
        registry.get_tx(&tx, "count_users").unwrap().query_row([], |row| row.get(0)).unwrap();
    assert_eq!(inside, 2);
    tx.commit().unwrap();

    assert_eq!(count(&registry), 2);
}

/// Verifies rolled back writes disappear.
#[test]
fn transaction_rollback_discards_writes() {
    let connection = users_connection();
    let registry = StatementRegistry::new(connection.clone(), users_catalog()).unwrap();

    let tx = connection.transaction_with(SqliteTxBehavior::Immediate).unwrap();
    registry.get_tx(&tx, "insert_user").unwrap().execute(params![1, "ada"]).unwrap();
    tx.rollback().unwrap();

    assert_eq!(count(&registry), 0);
}

/// Verifies dropping an unfinished transaction rolls it back.
#[test]
fn dropped_transaction_rolls_back() {
    let connection = users_connection();
    let registry = StatementRegistry::new(connection.clone(), users_catalog()).unwrap();

    {
        let tx = connection.transaction().unwrap();
        registry.get_tx(&tx, "insert_user").unwrap().execute(params![1, "ada"]).unwrap();
    }

    assert_eq!(count(&registry), 0);
}

/// Verifies lazy preparation works while a transaction is open.
#[test]
fn lazy_preparation_inside_transaction() {
    let connection = users_connection();
    let catalog = users_catalog();
    let registry = StatementRegistry::new(connection.clone(), Arc::clone(&catalog)).unwrap();
    catalog.register("rename_user", "UPDATE users SET name = ?2 WHERE id = ?1");
    registry.get("insert_user").unwrap().execute(params![1, "ada"]).unwrap();

    let tx = connection.transaction().unwrap();
    let changed = registry.get_tx(&tx, "rename_user").unwrap().execute(params![1, "lovelace"]);
    assert_eq!(changed.unwrap(), 1);
    tx.commit().unwrap();

    let name: String =
        registry.get("user_name").unwrap().query_row([1], |row| row.get(0)).unwrap();
    assert_eq!(name, "lovelace");
}

/// Verifies handles cannot be bound to another connection's transaction.
#[test]
fn bind_rejects_foreign_transaction() {
    let registry = StatementRegistry::new(users_connection(), users_catalog()).unwrap();
    let other = users_connection();
    let tx = other.transaction().unwrap();

    let Err(err) = registry.get_tx(&tx, "insert_user") else {
        panic!("bind should fail");
    };

    assert!(matches!(
        err,
        RegistryError::TransactionBindFailed {
            ref name,
            source: StatementError::Bind(_),
        } if name == "insert_user"
    ));
}

/// Verifies get_tx propagates lookup errors without binding.
#[test]
fn get_tx_propagates_not_registered() {
    let connection = users_connection();
    let registry = StatementRegistry::new(connection.clone(), users_catalog()).unwrap();
    let tx = connection.transaction().unwrap();

    let Err(err) = registry.get_tx(&tx, "nope") else {
        panic!("lookup should fail");
    };

    assert_eq!(
        err,
        RegistryError::NotRegistered {
            name: "nope".to_string()
        }
    );
}

// ============================================================================
// SECTION: Resources
// ============================================================================

/// Verifies closing the registry releases every live handle.
#[test]
fn close_releases_live_statements() {
    let connection = users_connection();
    let registry = StatementRegistry::new(connection.clone(), users_catalog()).unwrap();
    assert_eq!(connection.live_statements(), 3);

    assert_eq!(registry.close(), 3);
    assert_eq!(connection.live_statements(), 0);

    // The connection stays usable after the registry is gone.
    let statement = connection.prepare("SELECT COUNT(*) FROM users").unwrap();
    let total: i64 = statement.query_row([], |row| row.get(0)).unwrap();
    assert_eq!(total, 0);
}

/// Verifies the statement cache grows past its configured capacity.
#[test]
fn statement_cache_grows_with_catalog() {
    let dir = TempDir::new().unwrap();
    let mut config = SqliteConnectionConfig::for_path(dir.path().join("nested").join("app.db"));
    config.statement_cache_capacity = 2;
    let connection = SqliteConnection::open(&config).unwrap();
    connection.execute_batch(SCHEMA).unwrap();
    let catalog = QueryCatalog::new();
    for index in 0 .. 5 {
        catalog.register(format!("q{index}"), format!("SELECT {index} FROM users"));
    }

    let registry = StatementRegistry::new(connection.clone(), Arc::new(catalog)).unwrap();

    assert_eq!(registry.len(), 5);
    assert!(connection.statement_cache_capacity() >= 5);
    assert!(dir.path().join("nested").join("app.db").exists());
}

/// Verifies invalid connection configs are rejected before opening.
#[test]
fn open_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();

    let directory = SqliteConnectionConfig::for_path(dir.path());
    assert!(matches!(SqliteConnection::open(&directory), Err(SqliteError::Invalid(_))));

    let mut zero_cache = SqliteConnectionConfig::for_path(dir.path().join("app.db"));
    zero_cache.statement_cache_capacity = 0;
    assert!(matches!(SqliteConnection::open(&zero_cache), Err(SqliteError::Invalid(_))));
}

/// Verifies a transaction owner is not stalled by another thread's
/// preparation queued behind the transaction's connection lock.
#[test]
fn transaction_owner_overtakes_blocked_preparation() {
    let connection = users_connection();
    let catalog = users_catalog();
    let registry =
        Arc::new(StatementRegistry::new(connection.clone(), Arc::clone(&catalog)).unwrap());
    catalog.register("late", "SELECT 7");

    let (opened_tx, opened_rx) = mpsc::channel();
    let (owner_tx, owner_rx) = mpsc::channel();
    let owner_registry = Arc::clone(&registry);
    let owner_connection = connection.clone();
    thread::spawn(move || {
        let tx = owner_connection.transaction().unwrap();
        opened_tx.send(()).unwrap();
        // Give the other thread time to claim the in-flight slot.
        thread::sleep(Duration::from_millis(200));
        let value: i64 = owner_registry
            .get_tx(&tx, "late")
            .unwrap()
            .query_row([], |row| row.get(0))
            .unwrap();
        tx.commit().unwrap();
        owner_tx.send(value).unwrap();
    });

    opened_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let (blocked_tx, blocked_rx) = mpsc::channel();
    let blocked_registry = Arc::clone(&registry);
    thread::spawn(move || {
        let value: i64 =
            blocked_registry.get("late").unwrap().query_row([], |row| row.get(0)).unwrap();
        blocked_tx.send(value).unwrap();
    });

    let owner = owner_rx.recv_timeout(Duration::from_secs(5)).expect("transaction owner stalled");
    let blocked = blocked_rx.recv_timeout(Duration::from_secs(5)).expect("lookup never resumed");
    assert_eq!((owner, blocked), (7, 7));
    assert!(registry.is_prepared("late"));
    assert_eq!(connection.live_statements(), registry.len());
}

/// Verifies registry handles stay compiled when the cache starts too small.
#[test]
fn prepared_handles_stay_resident_in_small_cache() {
    let compiles = Arc::new(AtomicUsize::new(0));
    let raw = rusqlite::Connection::open_in_memory().unwrap();
    let counter = Arc::clone(&compiles);
    // SQLite consults the authorizer only while compiling a statement.
    raw.authorizer(Some(move |_: AuthContext<'_>| {
        counter.fetch_add(1, Ordering::SeqCst);
        Authorization::Allow
    }))
    .unwrap();
    let connection = SqliteConnection::from_connection_with_capacity(raw, 1);
    connection.execute_batch(SCHEMA).unwrap();

    let registry = StatementRegistry::new(connection.clone(), users_catalog()).unwrap();
    assert!(connection.statement_cache_capacity() >= 3);

    let compiled = compiles.load(Ordering::SeqCst);
    registry.get("insert_user").unwrap().execute(params![1, "ada"]).unwrap();
    let name: String =
        registry.get("user_name").unwrap().query_row([1], |row| row.get(0)).unwrap();
    assert_eq!(name, "ada");
    assert_eq!(count(&registry), 1);
    assert_eq!(compiles.load(Ordering::SeqCst), compiled);
}

/// Verifies a rejected preparation does not leave a reserved cache slot.
#[test]
fn rejected_preparation_releases_reservation() {
    let connection = users_connection();
    let catalog = users_catalog();
    let registry = StatementRegistry::new(connection.clone(), Arc::clone(&catalog)).unwrap();
    catalog.register("broken", "SELEC nothing");

    assert!(registry.get("broken").is_err());
    assert_eq!(connection.live_statements(), 3);
}

proptest! {
    /// Verifies lazily registered literals each prepare once and evaluate.
    #[test]
    fn lazily_registered_literals_evaluate(
        values in proptest::collection::btree_map("[a-z]{1,12}", -1_000_i64..1_000, 1..12),
    ) {
        let connection = SqliteConnection::open_in_memory().unwrap();
        let catalog = Arc::new(QueryCatalog::new());
        let registry = StatementRegistry::new(connection.clone(), Arc::clone(&catalog)).unwrap();
        for (name, value) in &values {
            catalog.register(name.as_str(), format!("SELECT {value}"));
        }
        for (name, value) in &values {
            let selected: i64 = registry.get(name).unwrap().query_row([], |row| row.get(0)).unwrap();
            prop_assert_eq!(selected, *value);
        }
        prop_assert_eq!(connection.live_statements(), values.len());
        prop_assert_eq!(registry.close(), values.len());
        prop_assert_eq!(connection.live_statements(), 0);
    }
}
