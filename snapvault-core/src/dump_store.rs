//! Serialized store adapter
//!
//! Bidirectional conversion between the live SQLite store and a directory
//! of line-diffable files: one JSON Lines `<table>.dump` per tracked table
//! plus a `schema.sql` carrying the full DDL. Output is deterministic
//! (stable table order, declared column order, primary-key-ascending rows)
//! so an unchanged store dumps to byte-identical files.
//!
//! Dumps stage into a scratch directory and are renamed into place only on
//! full success; loads rebuild into a scratch database and swap it in by
//! rename, so a failure part-way never leaves the target half-rebuilt.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File carrying the store DDL inside a snapshot directory.
pub const SCHEMA_UNIT: &str = "schema.sql";

/// Extension of per-table row files.
pub const UNIT_EXT: &str = "dump";

/// Scratch directory used while a dump is in progress. Sits inside the
/// destination but is excluded from revision tracking.
pub const STAGING_DIR: &str = ".staging";

/// JSON object key marking a base64-encoded BLOB column value.
const BLOB_KEY: &str = "$binary";

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("source store {path} is unavailable: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("unit '{unit}' cannot be serialized: {reason}")]
    UnsupportedUnit { unit: String, reason: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for DumpError {
    fn from(e: rusqlite::Error) -> Self {
        DumpError::Database(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("target store {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("snapshot at {0} has no {SCHEMA_UNIT}")]
    MissingSchema(PathBuf),

    #[error("unit '{unit}' is malformed: {reason}")]
    MalformedUnit { unit: String, reason: String },

    /// The rename swap failed after the rebuild succeeded. When the
    /// original store could not be moved back the primary datastore is in
    /// an ambiguous state and the caller must not continue silently.
    #[error("store swap failed (original intact: {original_intact}): {source}")]
    SwapFailed {
        original_intact: bool,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for LoadError {
    fn from(e: rusqlite::Error) -> Self {
        LoadError::Database(e.to_string())
    }
}

/// What a dump wrote, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpSummary {
    pub units: usize,
    pub rows: u64,
}

/// Serialize the store at `source` into `dest_dir`.
///
/// Tables named in `exclude_units` keep their DDL in `schema.sql` but get
/// no row file; a restore recreates them empty for the host to rebuild.
/// On any error the destination directory is left exactly as it was.
pub fn dump(
    source: &Path,
    dest_dir: &Path,
    exclude_units: &BTreeSet<String>,
) -> Result<DumpSummary, DumpError> {
    let conn = Connection::open_with_flags(source, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(
        |e| DumpError::SourceUnavailable {
            path: source.to_path_buf(),
            reason: e.to_string(),
        },
    )?;

    fs::create_dir_all(dest_dir)?;
    let staging = dest_dir.join(STAGING_DIR);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    match dump_into(&conn, &staging, exclude_units) {
        Ok((summary, files)) => {
            promote(dest_dir, &staging, &files)?;
            let _ = fs::remove_dir_all(&staging);
            debug!(units = summary.units, rows = summary.rows, "store dumped");
            Ok(summary)
        }
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            Err(e)
        }
    }
}

/// Rebuild the store at `target` from the units in `snapshot_dir`.
///
/// All-or-nothing: rows are loaded into `<target>.rebuild` and the rebuilt
/// database replaces the target by rename only after every unit loaded.
pub fn load(target: &Path, snapshot_dir: &Path, replace_existing: bool) -> Result<(), LoadError> {
    let schema_path = snapshot_dir.join(SCHEMA_UNIT);
    if !schema_path.exists() {
        return Err(LoadError::MissingSchema(snapshot_dir.to_path_buf()));
    }
    if target.exists() && !replace_existing {
        return Err(LoadError::AlreadyExists(target.to_path_buf()));
    }

    let rebuild = sibling(target, "rebuild");
    if rebuild.exists() {
        fs::remove_file(&rebuild)?;
    }

    if let Err(e) = build_store(&rebuild, &schema_path, snapshot_dir) {
        let _ = fs::remove_file(&rebuild);
        return Err(e);
    }

    swap_in(target, &rebuild)
}

// ── dump internals ─────────────────────────────────────────

fn dump_into(
    conn: &Connection,
    staging: &Path,
    exclude_units: &BTreeSet<String>,
) -> Result<(DumpSummary, Vec<String>), DumpError> {
    write_schema(conn, &staging.join(SCHEMA_UNIT))?;

    let mut files = vec![SCHEMA_UNIT.to_string()];
    let mut rows_total = 0u64;

    let tables = list_tables(conn)?;
    for table in &tables {
        if exclude_units.contains(table) {
            continue;
        }
        let file_name = format!("{table}.{UNIT_EXT}");
        rows_total += dump_table(conn, table, &staging.join(&file_name))?;
        files.push(file_name);
    }

    Ok((
        DumpSummary {
            units: files.len() - 1,
            rows: rows_total,
        },
        files,
    ))
}

/// User tables in name order, skipping SQLite's internal bookkeeping.
fn list_tables(conn: &Connection) -> Result<Vec<String>, DumpError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Full DDL, tables first so `execute_batch` can replay it in file order.
fn write_schema(conn: &Connection, path: &Path) -> Result<(), DumpError> {
    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master \
         WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%' \
         ORDER BY CASE type WHEN 'table' THEN 0 WHEN 'index' THEN 1 ELSE 2 END, name",
    )?;
    let statements = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = BufWriter::new(File::create(path)?);
    for statement in statements {
        out.write_all(statement.trim_end().as_bytes())?;
        out.write_all(b";\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Columns that order a table's dump: declared primary key, else rowid.
fn order_clause(conn: &Connection, table: &str) -> Result<String, DumpError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let mut pk_cols: Vec<(i64, String)> = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(5)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|(pk, _)| *pk > 0)
        .collect();

    if pk_cols.is_empty() {
        return Ok("rowid".to_string());
    }
    pk_cols.sort();
    Ok(pk_cols
        .iter()
        .map(|(_, name)| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", "))
}

fn dump_table(conn: &Connection, table: &str, path: &Path) -> Result<u64, DumpError> {
    let order = order_clause(conn, table)?;
    let sql = format!("SELECT * FROM {} ORDER BY {order}", quote_ident(table));
    let mut stmt = conn.prepare(&sql).map_err(|e| DumpError::UnsupportedUnit {
        unit: table.to_string(),
        reason: e.to_string(),
    })?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut out = BufWriter::new(File::create(path)?);
    let mut count = 0u64;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut object = Map::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            object.insert(column.clone(), encode_value(table, row.get_ref(i)?)?);
        }
        serde_json::to_writer(&mut out, &Value::Object(object))
            .map_err(|e| DumpError::Database(e.to_string()))?;
        out.write_all(b"\n")?;
        count += 1;
    }
    out.flush()?;
    Ok(count)
}

fn encode_value(table: &str, value: ValueRef<'_>) -> Result<Value, DumpError> {
    match value {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(i) => Ok(Value::from(i)),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).ok_or_else(|| {
            DumpError::UnsupportedUnit {
                unit: table.to_string(),
                reason: format!("non-finite REAL value {f}"),
            }
        }),
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => Ok(Value::from(s)),
            Err(e) => Err(DumpError::UnsupportedUnit {
                unit: table.to_string(),
                reason: format!("non-UTF-8 TEXT value: {e}"),
            }),
        },
        ValueRef::Blob(bytes) => {
            let mut object = Map::with_capacity(1);
            object.insert(BLOB_KEY.to_string(), Value::from(BASE64.encode(bytes)));
            Ok(Value::Object(object))
        }
    }
}

/// Move staged files over the destination and drop units that no longer
/// exist in the store. Runs only after every unit serialized cleanly.
fn promote(dest_dir: &Path, staging: &Path, files: &[String]) -> Result<(), DumpError> {
    let fresh: BTreeSet<&str> = files.iter().map(String::as_str).collect();

    for entry in fs::read_dir(dest_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_unit = name == SCHEMA_UNIT
            || Path::new(&name).extension().is_some_and(|e| e == UNIT_EXT);
        if is_unit && !fresh.contains(name.as_str()) {
            fs::remove_file(entry.path())?;
        }
    }

    for name in files {
        fs::rename(staging.join(name), dest_dir.join(name))?;
    }
    Ok(())
}

// ── load internals ─────────────────────────────────────────

fn build_store(rebuild: &Path, schema_path: &Path, snapshot_dir: &Path) -> Result<(), LoadError> {
    let conn = Connection::open(rebuild)?;
    conn.pragma_update(None, "synchronous", "OFF")?;

    let schema = fs::read_to_string(schema_path)?;
    conn.execute_batch(&schema).map_err(|e| LoadError::MalformedUnit {
        unit: SCHEMA_UNIT.to_string(),
        reason: e.to_string(),
    })?;

    let mut unit_files: Vec<PathBuf> = fs::read_dir(snapshot_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|e| e == UNIT_EXT))
        .collect();
    unit_files.sort();

    let tx = conn.unchecked_transaction()?;
    for unit_path in &unit_files {
        load_unit(&tx, unit_path)?;
    }
    tx.commit()?;
    Ok(())
}

fn load_unit(conn: &Connection, unit_path: &Path) -> Result<(), LoadError> {
    let table = unit_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let malformed = |reason: String| LoadError::MalformedUnit {
        unit: table.clone(),
        reason,
    };

    let reader = BufReader::new(File::open(unit_path)?);
    let mut insert: Option<(rusqlite::Statement<'_>, Vec<String>)> = None;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let object: Map<String, Value> = serde_json::from_str(&line)
            .map_err(|e| malformed(format!("line {}: {e}", line_no + 1)))?;

        // All rows of a unit share one column set; prepare once.
        if insert.is_none() {
            let columns: Vec<String> = object.keys().cloned().collect();
            let placeholders = (1..=columns.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({placeholders})",
                quote_ident(&table),
                columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            );
            let stmt = conn
                .prepare(&sql)
                .map_err(|e| malformed(format!("cannot prepare insert: {e}")))?;
            insert = Some((stmt, columns));
        }

        let Some((stmt, columns)) = insert.as_mut() else {
            continue;
        };
        if object.len() != columns.len() {
            return Err(malformed(format!(
                "line {}: expected {} columns, found {}",
                line_no + 1,
                columns.len(),
                object.len()
            )));
        }
        let mut params: Vec<rusqlite::types::Value> = Vec::with_capacity(columns.len());
        for column in columns.iter() {
            let value = object
                .get(column)
                .ok_or_else(|| malformed(format!("line {}: missing column '{column}'", line_no + 1)))?;
            params.push(decode_value(value).map_err(|reason| malformed(format!("line {}: {reason}", line_no + 1)))?);
        }
        stmt.execute(rusqlite::params_from_iter(params))
            .map_err(|e| malformed(format!("line {}: {e}", line_no + 1)))?;
    }
    Ok(())
}

fn decode_value(value: &Value) -> Result<rusqlite::types::Value, String> {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Ok(Sql::Null),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Sql::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Sql::Real(f))
            } else {
                Err(format!("unrepresentable number {n}"))
            }
        }
        Value::String(s) => Ok(Sql::Text(s.clone())),
        Value::Object(map) => match map.get(BLOB_KEY) {
            Some(Value::String(encoded)) if map.len() == 1 => BASE64
                .decode(encoded)
                .map(Sql::Blob)
                .map_err(|e| format!("invalid base64 blob: {e}")),
            _ => Err("unexpected object value".to_string()),
        },
        other => Err(format!("unexpected value {other}")),
    }
}

/// Replace `target` with the rebuilt database, keeping the original under a
/// backup name until the swap completes.
fn swap_in(target: &Path, rebuild: &Path) -> Result<(), LoadError> {
    if !target.exists() {
        fs::rename(rebuild, target)?;
        return Ok(());
    }

    let backup = sibling(target, "pre-restore");
    if backup.exists() {
        fs::remove_file(&backup)?;
    }
    fs::rename(target, &backup)?;

    if let Err(e) = fs::rename(rebuild, target) {
        let rolled_back = fs::rename(&backup, target).is_ok();
        return Err(LoadError::SwapFailed {
            original_intact: rolled_back,
            source: e,
        });
    }

    // Stale WAL/SHM sidecars from the replaced store must not shadow the
    // rebuilt file.
    for ext in ["wal", "shm"] {
        let _ = fs::remove_file(sidecar(target, ext));
    }
    let _ = fs::remove_file(&backup);
    Ok(())
}

/// `store.db` -> `store.db.rebuild`, `store.db.pre-restore`, ...
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// `store.db` -> `store.db-wal` / `store.db-shm` (SQLite sidecar naming).
fn sidecar(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push("-");
    name.push(ext);
    path.with_file_name(name)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn test_sibling_and_sidecar_naming() {
        let p = Path::new("/proj/study.db");
        assert_eq!(sibling(p, "rebuild"), Path::new("/proj/study.db.rebuild"));
        assert_eq!(sidecar(p, "wal"), Path::new("/proj/study.db-wal"));
    }

    #[test]
    fn test_blob_round_trip() {
        let raw = vec![0u8, 1, 2, 254, 255];
        let encoded = encode_value("t", ValueRef::Blob(&raw)).unwrap();
        match decode_value(&encoded).unwrap() {
            rusqlite::types::Value::Blob(out) => assert_eq!(out, raw),
            other => panic!("expected blob, got {other:?}"),
        }
    }

    #[test]
    fn test_null_and_integer_round_trip() {
        assert_eq!(
            decode_value(&encode_value("t", ValueRef::Null).unwrap()).unwrap(),
            rusqlite::types::Value::Null
        );
        assert_eq!(
            decode_value(&encode_value("t", ValueRef::Integer(-42)).unwrap()).unwrap(),
            rusqlite::types::Value::Integer(-42)
        );
    }
}
