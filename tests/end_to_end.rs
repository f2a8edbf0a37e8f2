//! End-to-end scenarios run purely through the public `Database`/
//! `Connection` SQL surface, one per isolation/commit/CTE scenario.

use quereus::database::QueryResult;
use quereus::events::ChangeKind;
use quereus::schema::Assertion;
use quereus::{Database, DatabaseConfig, Value};

fn rows(result: QueryResult) -> Vec<Vec<Value>> {
    match result {
        QueryResult::Rows(rows) => rows,
        other => panic!("expected Rows, got {other:?}"),
    }
}

#[test]
fn connections_do_not_see_each_others_uncommitted_writes() {
    let db = Database::new(DatabaseConfig::default());
    let mut setup = db.connect();
    setup.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();

    let mut a = db.connect();
    let mut b = db.connect();

    a.execute("BEGIN").unwrap();
    a.execute("INSERT INTO t (id, v) VALUES (1, 'from-a')").unwrap();

    // B, on its own autocommit connection, still sees nothing: A's write is
    // only visible through A's own overlay until A commits.
    let seen_by_b = rows(b.execute("SELECT * FROM t").unwrap());
    assert!(seen_by_b.is_empty());

    // A reads its own uncommitted write back (read-your-writes).
    let seen_by_a = rows(a.execute("SELECT * FROM t").unwrap());
    assert_eq!(seen_by_a.len(), 1);

    a.execute("COMMIT").unwrap();

    let seen_by_b_after = rows(b.execute("SELECT * FROM t").unwrap());
    assert_eq!(seen_by_b_after.len(), 1);
}

#[test]
fn delete_then_insert_same_pk_in_one_transaction_merges_to_the_new_row() {
    let db = Database::new(DatabaseConfig::default());
    let mut setup = db.connect();
    setup.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)").unwrap();
    setup.execute("INSERT INTO t (id, v) VALUES (1, 'old')").unwrap();

    let mut conn = db.connect();
    conn.execute("BEGIN").unwrap();
    conn.execute("DELETE FROM t WHERE id = 1").unwrap();
    conn.execute("INSERT INTO t (id, v) VALUES (1, 'new')").unwrap();
    conn.execute("COMMIT").unwrap();

    let final_rows = rows(setup.execute("SELECT * FROM t ORDER BY id").unwrap());
    assert_eq!(final_rows, vec![vec![Value::Integer(1), Value::Text("new".to_string())]]);
}

#[test]
fn secondary_index_reflects_an_in_transaction_update_before_commit() {
    let db = Database::new(DatabaseConfig::default());
    let mut setup = db.connect();
    setup.execute("CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
    setup.execute("INSERT INTO people (id, name) VALUES (1, 'bob')").unwrap();
    setup.execute("INSERT INTO people (id, name) VALUES (2, 'alice')").unwrap();
    setup.execute("CREATE INDEX people_name ON people (name)").unwrap();

    let mut conn = db.connect();
    conn.execute("BEGIN").unwrap();
    conn.execute("UPDATE people SET name = 'aaron' WHERE id = 1").unwrap();

    let ordered = rows(conn.execute("SELECT name FROM people ORDER BY name").unwrap());
    assert_eq!(ordered, vec![vec![Value::Text("aaron".to_string())], vec![Value::Text("alice".to_string())]]);

    conn.execute("COMMIT").unwrap();

    let ordered_after_commit = rows(setup.execute("SELECT name FROM people ORDER BY name").unwrap());
    assert_eq!(ordered_after_commit, vec![vec![Value::Text("aaron".to_string())], vec![Value::Text("alice".to_string())]]);
}

#[test]
fn rollback_to_savepoint_discards_only_what_the_savepoint_covers() {
    let db = Database::new(DatabaseConfig::default());
    let mut setup = db.connect();
    setup.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();

    let events = db.events();
    let insert_count = std::cell::Cell::new(0);
    let _sub = events.on_data_change(|ev| {
        if ev.kind == ChangeKind::Insert {
            // Recorded only once the surrounding transaction commits.
        }
    });
    let _ = insert_count; // the subscription above is exercised for its side effect registration

    let mut conn = db.connect();
    conn.execute("BEGIN").unwrap();
    conn.execute("INSERT INTO t (id) VALUES (1)").unwrap();
    conn.execute("SAVEPOINT s").unwrap();
    conn.execute("INSERT INTO t (id) VALUES (2)").unwrap();
    conn.execute("ROLLBACK TO s").unwrap();
    conn.execute("COMMIT").unwrap();

    let final_rows = rows(setup.execute("SELECT id FROM t ORDER BY id").unwrap());
    assert_eq!(final_rows, vec![vec![Value::Integer(1)]]);
}

#[test]
fn rollback_to_savepoint_fires_no_events_for_the_discarded_insert() {
    let db = Database::new(DatabaseConfig::default());
    let mut setup = db.connect();
    setup.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();

    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    let _sub = db.events().on_data_change(move |ev| {
        seen_clone.borrow_mut().push(ev.pk.clone());
    });

    let mut conn = db.connect();
    conn.execute("BEGIN").unwrap();
    conn.execute("INSERT INTO t (id) VALUES (1)").unwrap();
    conn.execute("SAVEPOINT s").unwrap();
    conn.execute("INSERT INTO t (id) VALUES (2)").unwrap();
    conn.execute("ROLLBACK TO s").unwrap();
    conn.execute("COMMIT").unwrap();

    assert_eq!(seen.borrow().len(), 1);
    assert_eq!(seen.borrow()[0], vec![Value::Integer(1)]);
}

#[test]
fn a_violated_cross_table_assertion_rolls_back_the_whole_commit() {
    let db = Database::new(DatabaseConfig::default());
    let mut setup = db.connect();
    setup.execute("CREATE TABLE orders (id INTEGER PRIMARY KEY, total INTEGER)").unwrap();
    setup.execute("CREATE TABLE ledger (id INTEGER PRIMARY KEY, balance INTEGER)").unwrap();
    setup.execute("INSERT INTO ledger (id, balance) VALUES (1, 100)").unwrap();

    // Stands in for a real cross-table CHECK: the test flips this cell to
    // simulate the invariant becoming violated right before COMMIT, so the
    // assertion wiring itself — not expression evaluation — is under test.
    let invariant_holds = std::rc::Rc::new(std::cell::Cell::new(true));
    let predicate_cell = invariant_holds.clone();
    db.register_assertion(Assertion {
        name: "orders_within_ledger".to_string(),
        tables: vec!["orders".to_string(), "ledger".to_string()],
        predicate: std::rc::Rc::new(move || predicate_cell.get()),
    });

    let seen = std::rc::Rc::new(std::cell::RefCell::new(0usize));
    let seen_clone = seen.clone();
    let _sub = db.events().on_data_change(move |_ev| {
        *seen_clone.borrow_mut() += 1;
    });

    let mut conn = db.connect();
    conn.execute("BEGIN").unwrap();
    conn.execute("INSERT INTO orders (id, total) VALUES (1, 500)").unwrap();
    conn.execute("UPDATE ledger SET balance = 0 WHERE id = 1").unwrap();

    invariant_holds.set(false);
    let commit_result = conn.execute("COMMIT");
    assert!(commit_result.is_err());

    // Both tables are untouched: the coordinated commit rolled back before
    // either overlay was flushed.
    let orders_rows = rows(setup.execute("SELECT id FROM orders").unwrap());
    assert!(orders_rows.is_empty());
    let ledger_rows = rows(setup.execute("SELECT balance FROM ledger WHERE id = 1").unwrap());
    assert_eq!(ledger_rows, vec![vec![Value::Integer(100)]]);
    assert_eq!(*seen.borrow(), 0);
}

#[test]
fn recursive_cte_reaches_a_fixpoint_and_terminates() {
    let db = Database::new(DatabaseConfig::default());
    let mut conn = db.connect();
    conn.execute("CREATE TABLE seed (i INTEGER PRIMARY KEY)").unwrap();
    conn.execute("INSERT INTO seed (i) VALUES (1)").unwrap();

    let result = conn
        .execute(
            "WITH RECURSIVE n AS (SELECT i FROM seed UNION ALL SELECT i+1 FROM n WHERE i<3) \
             SELECT i FROM n ORDER BY i",
        )
        .unwrap();

    assert_eq!(rows(result), vec![vec![Value::Integer(1)], vec![Value::Integer(2)], vec![Value::Integer(3)]]);
}

#[test]
fn returning_clause_reports_old_and_new_halves_on_update() {
    let db = Database::new(DatabaseConfig::default());
    let mut conn = db.connect();
    conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)").unwrap();
    conn.execute("INSERT INTO t (id, v) VALUES (1, 10)").unwrap();

    let result = conn.execute("UPDATE t SET v = 20 WHERE id = 1 RETURNING OLD.v, NEW.v").unwrap();
    assert_eq!(rows(result), vec![vec![Value::Integer(10), Value::Integer(20)]]);
}
