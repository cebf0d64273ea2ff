//! Integration tests for the serialized store adapter (dump/load cycle)

use rusqlite::Connection;
use snapvault_core::dump_store::{self, LoadError};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Create a small research-project store with a few coded sources.
fn create_test_store(path: &Path) -> Connection {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE source (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            fulltext TEXT,
            memo TEXT
        );
        CREATE TABLE code_name (
            cid INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            color TEXT,
            memo TEXT
        );
        CREATE TABLE code_text (
            ctid INTEGER PRIMARY KEY,
            cid INTEGER NOT NULL,
            fid INTEGER NOT NULL,
            pos0 INTEGER,
            pos1 INTEGER,
            seltext TEXT
        );
        CREATE TABLE journal (
            jid INTEGER PRIMARY KEY,
            name TEXT,
            jentry TEXT
        );
        CREATE INDEX idx_code_text_fid ON code_text (fid);",
    )
    .unwrap();

    conn.execute(
        "INSERT INTO source (id, name, fulltext, memo) VALUES
            (1, 'interview_01.txt', 'I think trust matters…', NULL),
            (2, 'interview_02.txt', 'Zürich field notes', 'follow up')",
        [],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO code_name (cid, name, color, memo) VALUES
            (1, 'trust', '#FF0000', NULL),
            (2, 'doubt', '#0000FF', 'tentative')",
        [],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO code_text (ctid, cid, fid, pos0, pos1, seltext) VALUES
            (1, 1, 1, 0, 22, 'I think trust matters…'),
            (2, 2, 2, 7, 18, 'field notes')",
        [],
    )
    .unwrap();
    conn
}

fn no_excludes() -> BTreeSet<String> {
    BTreeSet::new()
}

fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .unwrap()
}

#[test]
fn test_dump_writes_one_unit_per_table_plus_schema() {
    let tmp = TempDir::new().unwrap();
    let store = tmp.path().join("study.db");
    create_test_store(&store);

    let dest = tmp.path().join("units");
    let summary = dump_store::dump(&store, &dest, &no_excludes()).unwrap();

    assert_eq!(summary.units, 4);
    assert_eq!(summary.rows, 6);
    assert!(dest.join("schema.sql").exists());
    for unit in ["source", "code_name", "code_text", "journal"] {
        assert!(dest.join(format!("{unit}.dump")).exists(), "missing {unit}");
    }
    // empty tables still get a (zero-length) unit file
    assert_eq!(fs::read(dest.join("journal.dump")).unwrap().len(), 0);
}

#[test]
fn test_round_trip_preserves_rows_and_values() {
    let tmp = TempDir::new().unwrap();
    let store = tmp.path().join("study.db");
    let conn = create_test_store(&store);

    // exercise every storage class, including blobs and negatives
    conn.execute(
        "INSERT INTO journal (jid, name, jentry) VALUES (1, 'day one', NULL)",
        [],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO source (id, name, fulltext, memo) VALUES (3, 'audio_01', NULL, NULL)",
        [],
    )
    .unwrap();
    conn.execute_batch("CREATE TABLE extras (k INTEGER PRIMARY KEY, f REAL, b BLOB)")
        .unwrap();
    conn.execute(
        "INSERT INTO extras (k, f, b) VALUES (?1, ?2, ?3)",
        rusqlite::params![-5, 3.25, vec![0u8, 1, 2, 255]],
    )
    .unwrap();
    drop(conn);

    let dest = tmp.path().join("units");
    dump_store::dump(&store, &dest, &no_excludes()).unwrap();

    let rebuilt = tmp.path().join("rebuilt.db");
    dump_store::load(&rebuilt, &dest, false).unwrap();

    let conn = Connection::open(&rebuilt).unwrap();
    assert_eq!(count(&conn, "source"), 3);
    assert_eq!(count(&conn, "code_name"), 2);
    assert_eq!(count(&conn, "code_text"), 2);
    assert_eq!(count(&conn, "journal"), 1);

    let name: String = conn
        .query_row("SELECT name FROM source WHERE id = 2", [], |r| r.get(0))
        .unwrap();
    assert_eq!(name, "interview_02.txt");
    let fulltext: String = conn
        .query_row("SELECT fulltext FROM source WHERE id = 2", [], |r| r.get(0))
        .unwrap();
    assert_eq!(fulltext, "Zürich field notes");
    let memo: Option<String> = conn
        .query_row("SELECT memo FROM source WHERE id = 3", [], |r| r.get(0))
        .unwrap();
    assert_eq!(memo, None);

    let (f, b): (f64, Vec<u8>) = conn
        .query_row("SELECT f, b FROM extras WHERE k = -5", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .unwrap();
    assert_eq!(f, 3.25);
    assert_eq!(b, vec![0u8, 1, 2, 255]);
}

#[test]
fn test_unchanged_store_dumps_byte_identical() {
    let tmp = TempDir::new().unwrap();
    let store = tmp.path().join("study.db");
    create_test_store(&store);

    let first = tmp.path().join("first");
    let second = tmp.path().join("second");
    dump_store::dump(&store, &first, &no_excludes()).unwrap();
    dump_store::dump(&store, &second, &no_excludes()).unwrap();

    for entry in fs::read_dir(&first).unwrap() {
        let entry = entry.unwrap();
        if entry.file_type().unwrap().is_dir() {
            continue;
        }
        let name = entry.file_name();
        let a = fs::read(entry.path()).unwrap();
        let b = fs::read(second.join(&name)).unwrap();
        assert_eq!(a, b, "unit {name:?} differs between identical dumps");
    }
}

#[test]
fn test_rows_ordered_by_primary_key() {
    let tmp = TempDir::new().unwrap();
    let store = tmp.path().join("study.db");
    let conn = Connection::open(&store).unwrap();
    conn.execute_batch("CREATE TABLE source (id INTEGER PRIMARY KEY, name TEXT)")
        .unwrap();
    // insertion order deliberately scrambled
    for id in [3, 1, 2] {
        conn.execute(
            "INSERT INTO source (id, name) VALUES (?1, ?2)",
            rusqlite::params![id, format!("doc{id}")],
        )
        .unwrap();
    }
    drop(conn);

    let dest = tmp.path().join("units");
    dump_store::dump(&store, &dest, &no_excludes()).unwrap();

    let contents = fs::read_to_string(dest.join("source.dump")).unwrap();
    let ids: Vec<i64> = contents
        .lines()
        .map(|line| {
            let row: serde_json::Value = serde_json::from_str(line).unwrap();
            row["id"].as_i64().unwrap()
        })
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn test_excluded_unit_keeps_schema_but_no_rows() {
    let tmp = TempDir::new().unwrap();
    let store = tmp.path().join("study.db");
    create_test_store(&store);

    let dest = tmp.path().join("units");
    let exclude: BTreeSet<String> = ["code_text".to_string()].into_iter().collect();
    dump_store::dump(&store, &dest, &exclude).unwrap();

    assert!(!dest.join("code_text.dump").exists());
    let schema = fs::read_to_string(dest.join("schema.sql")).unwrap();
    assert!(schema.contains("CREATE TABLE code_text"));

    // a restore recreates the excluded table empty
    let rebuilt = tmp.path().join("rebuilt.db");
    dump_store::load(&rebuilt, &dest, false).unwrap();
    let conn = Connection::open(&rebuilt).unwrap();
    assert_eq!(count(&conn, "code_text"), 0);
    assert_eq!(count(&conn, "source"), 2);
}

#[test]
fn test_load_refuses_existing_target() {
    let tmp = TempDir::new().unwrap();
    let store = tmp.path().join("study.db");
    create_test_store(&store);
    let dest = tmp.path().join("units");
    dump_store::dump(&store, &dest, &no_excludes()).unwrap();

    let result = dump_store::load(&store, &dest, false);
    assert!(matches!(result, Err(LoadError::AlreadyExists(_))));
}

#[test]
fn test_failed_load_leaves_target_untouched() {
    let tmp = TempDir::new().unwrap();
    let store = tmp.path().join("study.db");
    create_test_store(&store);
    let dest = tmp.path().join("units");
    dump_store::dump(&store, &dest, &no_excludes()).unwrap();

    // corrupt one unit so the rebuild fails part-way
    fs::write(dest.join("source.dump"), "this is not a row\n").unwrap();

    let result = dump_store::load(&store, &dest, true);
    assert!(matches!(result, Err(LoadError::MalformedUnit { .. })));

    // the pre-load store must be fully intact
    let conn = Connection::open(&store).unwrap();
    assert_eq!(count(&conn, "source"), 2);
    assert_eq!(count(&conn, "code_name"), 2);
    assert!(!tmp.path().join("study.db.rebuild").exists());
}

#[test]
fn test_redump_removes_stale_units() {
    let tmp = TempDir::new().unwrap();
    let store = tmp.path().join("study.db");
    let conn = create_test_store(&store);

    let dest = tmp.path().join("units");
    dump_store::dump(&store, &dest, &no_excludes()).unwrap();
    assert!(dest.join("journal.dump").exists());

    conn.execute_batch("DROP TABLE journal").unwrap();
    drop(conn);
    dump_store::dump(&store, &dest, &no_excludes()).unwrap();

    assert!(!dest.join("journal.dump").exists());
    let schema = fs::read_to_string(dest.join("schema.sql")).unwrap();
    assert!(!schema.contains("CREATE TABLE journal"));
}

#[test]
fn test_dump_missing_source_fails_cleanly() {
    let tmp = TempDir::new().unwrap();
    let dest = tmp.path().join("units");
    let result = dump_store::dump(&tmp.path().join("absent.db"), &dest, &no_excludes());
    assert!(result.is_err());
}
