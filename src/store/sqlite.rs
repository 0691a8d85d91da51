//! The SQLite-backed storage file.
//!
//! One file per database, shared by every key-store. The connection is
//! serialized behind a mutex; write transactions additionally take an
//! in-process writer slot so that exactly one write transaction is open at
//! a time, with nested `begin` calls reference-counting the outermost one.
//! A process-global registry refuses to open the same file writeable twice.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::body;
use crate::error::{Error, Result};

/// How long a writer waits for the in-process writer slot.
const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Name of the database file inside the bundle directory.
pub const DB_FILE_NAME: &str = "db.sqlite3";

static OPEN_REGISTRY: Mutex<Option<HashMap<PathBuf, bool>>> = Mutex::new(None);

fn register_open(path: &Path, writeable: bool) -> Result<()> {
    let mut registry = OPEN_REGISTRY.lock();
    let map = registry.get_or_insert_with(HashMap::new);
    match map.get(path) {
        Some(true) => {
            return Err(Error::Busy(format!(
                "{} is already open writeable",
                path.display()
            )))
        }
        Some(false) if writeable => {
            return Err(Error::Busy(format!(
                "{} is already open read-only",
                path.display()
            )))
        }
        _ => {}
    }
    map.insert(path.to_path_buf(), writeable);
    Ok(())
}

fn unregister_open(path: &Path) {
    if let Some(map) = OPEN_REGISTRY.lock().as_mut() {
        map.remove(path);
    }
}

#[derive(Debug, Default)]
struct TxnState {
    depth: u32,
    owner: Option<ThreadId>,
    aborted: bool,
    wal_flush: bool,
}

/// Handle to one open storage file.
#[derive(Debug)]
pub struct SqliteStorage {
    path: PathBuf,
    writeable: bool,
    conn: Mutex<Connection>,
    txn: Mutex<TxnState>,
    txn_released: Condvar,
}

impl SqliteStorage {
    /// Open (creating if `writeable`) the storage file in `dir`.
    pub fn open(dir: &Path, writeable: bool) -> Result<Self> {
        let file = dir.join(DB_FILE_NAME);
        if !writeable && !file.is_file() {
            return Err(Error::CantOpenFile(file.display().to_string()));
        }
        let canonical = dir
            .canonicalize()
            .map_err(|err| Error::CantOpenFile(format!("{}: {err}", dir.display())))?;
        register_open(&canonical, writeable)?;
        let flags = if writeable {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        } else {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        };
        let conn = match Connection::open_with_flags(&file, flags) {
            Ok(conn) => conn,
            Err(err) => {
                unregister_open(&canonical);
                return Err(Error::CantOpenFile(format!("{}: {err}", file.display())));
            }
        };
        let storage = SqliteStorage {
            path: canonical,
            writeable,
            conn: Mutex::new(conn),
            txn: Mutex::new(TxnState::default()),
            txn_released: Condvar::new(),
        };
        storage.init_connection()?;
        Ok(storage)
    }

    fn init_connection(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.busy_timeout(WRITE_LOCK_TIMEOUT)?;
        if self.writeable {
            let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS store_info (
                     store TEXT PRIMARY KEY,
                     last_sequence INTEGER NOT NULL DEFAULT 0,
                     purge_count INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE TABLE IF NOT EXISTS indexes (
                     store TEXT NOT NULL,
                     name TEXT NOT NULL,
                     kind TEXT NOT NULL,
                     expression TEXT NOT NULL,
                     dimensions INTEGER,
                     PRIMARY KEY (store, name)
                 );",
            )?;
        }
        register_functions(&conn)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writeable(&self) -> bool {
        self.writeable
    }

    /// Run `f` with the connection, serialized against other users but
    /// without starting a transaction.
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Serialize an operation against the file without a DB-level
    /// transaction.
    pub fn with_file_lock<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let _guard: MutexGuard<'_, Connection> = self.conn.lock();
        f()
    }

    /// Begin (or nest into) the write transaction.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        if !self.writeable {
            return Err(Error::NotWriteable);
        }
        let me = thread::current().id();
        let mut state = self.txn.lock();
        let deadline = Instant::now() + WRITE_LOCK_TIMEOUT;
        loop {
            if state.depth == 0 {
                break;
            }
            if state.owner == Some(me) {
                state.depth += 1;
                return Ok(Transaction {
                    storage: self,
                    finished: false,
                });
            }
            if self.txn_released.wait_until(&mut state, deadline).timed_out() {
                return Err(Error::Busy("another write transaction is open".into()));
            }
        }
        state.depth = 1;
        state.owner = Some(me);
        state.aborted = false;
        state.wal_flush = false;
        drop(state);
        if let Err(err) = self.with_conn(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(())
        }) {
            let mut state = self.txn.lock();
            state.depth = 0;
            state.owner = None;
            self.txn_released.notify_all();
            return Err(err);
        }
        Ok(Transaction {
            storage: self,
            finished: false,
        })
    }

    /// Whether a write transaction is currently open on this handle.
    pub fn in_transaction(&self) -> bool {
        self.txn.lock().depth > 0
    }

    /// Current transaction nesting depth (0 = none).
    pub fn transaction_depth(&self) -> u32 {
        self.txn.lock().depth
    }

    /// Returns `true` when the outermost transaction was closed.
    fn end_transaction(&self, abort: bool) -> Result<bool> {
        let mut state = self.txn.lock();
        if state.depth == 0 {
            return Err(Error::NotInTransaction);
        }
        if abort {
            state.aborted = true;
        }
        state.depth -= 1;
        if state.depth > 0 {
            return Ok(false);
        }
        let aborted = state.aborted;
        let wal_flush = state.wal_flush;
        state.owner = None;
        drop(state);
        let result = self.with_conn(|conn| {
            if aborted {
                conn.execute_batch("ROLLBACK")?;
            } else {
                conn.execute_batch("COMMIT")?;
                if wal_flush {
                    conn.query_row("PRAGMA wal_checkpoint(FULL)", [], |_row| Ok(()))?;
                }
            }
            Ok(())
        });
        self.txn_released.notify_all();
        result.map(|_| true)
    }

    /// Delete every file belonging to a database bundle directory.
    pub fn delete_files(dir: &Path) -> Result<()> {
        if let Ok(canonical) = dir.canonicalize() {
            let registry = OPEN_REGISTRY.lock();
            if registry
                .as_ref()
                .map(|m| m.contains_key(&canonical))
                .unwrap_or(false)
            {
                return Err(Error::Busy("database is open".into()));
            }
        }
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}

impl Drop for SqliteStorage {
    fn drop(&mut self) {
        if self.txn.lock().depth > 0 {
            warn!(path = %self.path.display(), "storage dropped with an open transaction");
        }
        unregister_open(&self.path);
    }
}

/// An open (possibly nested) write transaction.
///
/// Dropping without [`commit`](Transaction::commit) aborts. Aborting any
/// nesting level aborts the outermost transaction.
#[derive(Debug)]
pub struct Transaction<'a> {
    storage: &'a SqliteStorage,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub fn storage(&self) -> &'a SqliteStorage {
        self.storage
    }

    /// Force a WAL checkpoint when the outermost transaction commits.
    pub fn set_wal_flush(&self) {
        self.storage.txn.lock().wal_flush = true;
    }

    /// Commit this nesting level. Returns `true` when the outermost
    /// transaction committed and writes became visible.
    pub fn commit(mut self) -> Result<bool> {
        self.finished = true;
        self.storage.end_transaction(false)
    }

    /// Abort: the outermost transaction will roll back even if enclosing
    /// levels commit. Returns `true` when the rollback happened.
    pub fn abort(mut self) -> Result<bool> {
        self.finished = true;
        self.storage.end_transaction(true)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("transaction dropped without commit; aborting");
            let _ = self.storage.end_transaction(true);
        }
    }
}

/// Decode a packed little-endian f32 vector column.
pub(crate) fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

pub(crate) fn encode_vector(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn json_to_sql(value: &serde_json::Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        serde_json::Value::Null => Sql::Null,
        serde_json::Value::Bool(b) => Sql::Integer(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

fn vector_from_json(value: &serde_json::Value) -> Option<Vec<f32>> {
    let items = value.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(item.as_f64()? as f32);
    }
    Some(out)
}

/// Register the scalar functions generated SQL depends on.
///
/// `fl_value` navigates a stored body by dotted path; `fl_text` and
/// `fl_vector` are its typed variants used by index-maintenance triggers;
/// `encode_vector`/`vec_distance` implement the vector-search surface the
/// planner compiles `APPROX_VECTOR_DISTANCE` against.
fn register_functions(conn: &Connection) -> Result<()> {
    let det = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("fl_value", 2, det, |ctx| {
        let data: Option<Vec<u8>> = ctx.get(0)?;
        let path: String = ctx.get(1)?;
        let Some(data) = data else {
            return Ok(rusqlite::types::Value::Null);
        };
        let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&data) else {
            return Ok(rusqlite::types::Value::Null);
        };
        Ok(match body::eval_path(&parsed, &path) {
            Some(value) => json_to_sql(value),
            None => rusqlite::types::Value::Null,
        })
    })?;

    conn.create_scalar_function("fl_text", 2, det, |ctx| {
        let data: Option<Vec<u8>> = ctx.get(0)?;
        let path: String = ctx.get(1)?;
        let Some(data) = data else { return Ok(None) };
        let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&data) else {
            return Ok(None);
        };
        Ok(body::eval_path(&parsed, &path)
            .and_then(|v| v.as_str())
            .map(str::to_owned))
    })?;

    conn.create_scalar_function("fl_vector", 2, det, |ctx| {
        let data: Option<Vec<u8>> = ctx.get(0)?;
        let path: String = ctx.get(1)?;
        let Some(data) = data else { return Ok(None) };
        let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&data) else {
            return Ok(None);
        };
        Ok(body::eval_path(&parsed, &path)
            .and_then(vector_from_json)
            .map(|v| encode_vector(&v)))
    })?;

    conn.create_scalar_function("encode_vector", 1, det, |ctx| {
        let raw = ctx.get_raw(0);
        match raw {
            rusqlite::types::ValueRef::Blob(b) => Ok(Some(b.to_vec())),
            rusqlite::types::ValueRef::Text(t) => {
                let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(t) else {
                    return Ok(None);
                };
                Ok(vector_from_json(&parsed).map(|v| encode_vector(&v)))
            }
            _ => Ok(None),
        }
    })?;

    conn.create_scalar_function("vec_distance", 3, det, |ctx| {
        let a: Option<Vec<u8>> = ctx.get(0)?;
        let b: Option<Vec<u8>> = ctx.get(1)?;
        let metric: String = ctx.get(2)?;
        let (Some(a), Some(b)) = (a, b) else {
            return Ok(None);
        };
        let (Some(a), Some(b)) = (decode_vector(&a), decode_vector(&b)) else {
            return Ok(None);
        };
        if a.len() != b.len() {
            return Ok(None);
        }
        let dist = match metric.as_str() {
            "cosine" => cosine_distance(&a, &b),
            _ => euclidean2(&a, &b),
        };
        Ok(Some(dist))
    })?;

    Ok(())
}

fn euclidean2(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = (*x - *y) as f64;
            d * d
        })
        .sum()
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - dot / (na.sqrt() * nb.sqrt())
}
