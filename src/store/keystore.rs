//! Key-store operations over the storage file.
//!
//! Each key-store is one table `kv_<name>` plus a row in `store_info`
//! carrying its sequence counter and purge count. Secondary indexes are
//! kept in sync by triggers so that replication and local writes go
//! through the same path.

use bytes::Bytes;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::debug;

use super::{
    ContentOption, DocumentFlags, EnumerateOptions, IndexInfo, IndexKind, IndexSpec, Record,
    SqliteStorage, Transaction,
};
use crate::error::{Error, Result};

/// Handle to one key-store.
#[derive(Debug, Clone)]
pub struct KeyStore {
    storage: Arc<SqliteStorage>,
    name: String,
}

fn validate_store_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(Error::invalid_parameter(format!(
            "invalid store name: {name:?}"
        )));
    }
    Ok(())
}

impl KeyStore {
    /// Open a key-store, creating its table when the file is writeable.
    pub fn open(storage: Arc<SqliteStorage>, name: &str) -> Result<Self> {
        validate_store_name(name)?;
        let store = KeyStore {
            storage,
            name: name.to_string(),
        };
        if store.storage.writeable() {
            let table = store.table();
            store.storage.with_conn(|conn| {
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                         key TEXT PRIMARY KEY,
                         sequence INTEGER NOT NULL DEFAULT 0,
                         flags INTEGER NOT NULL DEFAULT 0,
                         meta BLOB,
                         body BLOB,
                         expiration INTEGER
                     );
                     CREATE INDEX IF NOT EXISTS {seq_index} ON {table} (sequence);
                     CREATE INDEX IF NOT EXISTS {exp_index} ON {table} (expiration)
                         WHERE expiration IS NOT NULL;"
                    ,
                    table = table,
                    seq_index = quote_ident(&format!("kv_{}::seq", store.name)),
                    exp_index = quote_ident(&format!("kv_{}::exp", store.name)),
                ))?;
                conn.execute(
                    "INSERT OR IGNORE INTO store_info (store) VALUES (?1)",
                    [&store.name],
                )?;
                Ok(())
            })?;
        }
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> &Arc<SqliteStorage> {
        &self.storage
    }

    /// Quoted SQL table name for this store.
    pub fn table(&self) -> String {
        quote_ident(&format!("kv_{}", self.name))
    }

    /// Quoted SQL table name of a full-text index on this store.
    pub fn fts_table(&self, index: &str) -> String {
        quote_ident(&format!("fts_{}::{index}", self.name))
    }

    /// Quoted SQL table name of a vector index on this store.
    pub fn vector_table(&self, index: &str) -> String {
        quote_ident(&format!("vec_{}::{index}", self.name))
    }

    pub fn get(&self, key: &str, content: ContentOption) -> Result<Option<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE key = ?1",
            columns(content),
            self.table()
        );
        self.storage.with_conn(|conn| {
            Ok(conn
                .query_row(&sql, [key], |row| read_record(row, content))
                .optional()?)
        })
    }

    pub fn get_by_sequence(&self, sequence: u64, content: ContentOption) -> Result<Option<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE sequence = ?1",
            columns(content),
            self.table()
        );
        self.storage.with_conn(|conn| {
            Ok(conn
                .query_row(&sql, [sequence as i64], |row| read_record(row, content))
                .optional()?)
        })
    }

    /// Write a record, assigning and returning the next sequence.
    pub fn set(
        &self,
        _txn: &Transaction<'_>,
        key: &str,
        meta: &[u8],
        record_body: &[u8],
        flags: DocumentFlags,
        expiration: Option<i64>,
    ) -> Result<u64> {
        let sequence = self.bump_sequence()?;
        let updated = self.storage.with_conn(|conn| {
            Ok(conn.execute(
                &format!(
                    "UPDATE {} SET sequence = ?2, flags = ?3, meta = ?4, body = ?5,
                     expiration = ?6 WHERE key = ?1",
                    self.table()
                ),
                params![
                    key,
                    sequence as i64,
                    flags.0 as i64,
                    meta,
                    record_body,
                    expiration
                ],
            )?)
        })?;
        if updated == 0 {
            self.storage.with_conn(|conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {} (key, sequence, flags, meta, body, expiration)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        self.table()
                    ),
                    params![
                        key,
                        sequence as i64,
                        flags.0 as i64,
                        meta,
                        record_body,
                        expiration
                    ],
                )?;
                Ok(())
            })?;
        }
        Ok(sequence)
    }

    /// Remove a record outright, bumping the purge count.
    pub fn del(&self, _txn: &Transaction<'_>, key: &str) -> Result<bool> {
        let removed = self.storage.with_conn(|conn| {
            Ok(conn.execute(
                &format!("DELETE FROM {} WHERE key = ?1", self.table()),
                [key],
            )?)
        })?;
        if removed > 0 {
            self.storage.with_conn(|conn| {
                conn.execute(
                    "UPDATE store_info SET purge_count = purge_count + 1 WHERE store = ?1",
                    [&self.name],
                )?;
                Ok(())
            })?;
        }
        Ok(removed > 0)
    }

    /// Store a raw value (non-document stores: checkpoints, cookies, info).
    pub fn put_raw(&self, txn: &Transaction<'_>, key: &str, value: &[u8]) -> Result<()> {
        self.set(txn, key, &[], value, DocumentFlags::default(), None)?;
        Ok(())
    }

    pub fn get_raw(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self
            .get(key, ContentOption::CurrentRevOnly)?
            .map(|record| record.body))
    }

    /// Enumerate records. Rows are collected eagerly under the connection
    /// lock and handed back as an iterator.
    pub fn enumerate(
        &self,
        options: &EnumerateOptions,
    ) -> Result<impl Iterator<Item = Record>> {
        let mut sql = format!("SELECT {} FROM {}", columns(options.content), self.table());
        let mut clauses: Vec<String> = Vec::new();
        if let Some(since) = options.since {
            clauses.push(format!("sequence > {since}"));
        }
        if !options.include_deleted {
            clauses.push(format!("(flags & {}) = 0", DocumentFlags::DELETED.0));
        }
        if options.only_conflicts {
            clauses.push(format!("(flags & {}) != 0", DocumentFlags::CONFLICTED.0));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        if !options.unsorted {
            let dir = if options.descending { "DESC" } else { "ASC" };
            if options.since.is_some() {
                sql.push_str(&format!(" ORDER BY sequence {dir}"));
            } else {
                sql.push_str(&format!(" ORDER BY key {dir}"));
            }
        }
        let content = options.content;
        let rows = self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], |row| read_record(row, content))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        Ok(rows.into_iter())
    }

    pub fn last_sequence(&self) -> Result<u64> {
        self.storage.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT last_sequence FROM store_info WHERE store = ?1",
                    [&self.name],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .unwrap_or(0) as u64)
        })
    }

    pub fn document_count(&self) -> Result<u64> {
        self.storage.with_conn(|conn| {
            Ok(conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE (flags & {}) = 0",
                    self.table(),
                    DocumentFlags::DELETED.0
                ),
                [],
                |row| row.get::<_, i64>(0),
            )? as u64)
        })
    }

    pub fn purge_count(&self) -> Result<u64> {
        self.storage.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT purge_count FROM store_info WHERE store = ?1",
                    [&self.name],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .unwrap_or(0) as u64)
        })
    }

    fn bump_sequence(&self) -> Result<u64> {
        if !self.storage.in_transaction() {
            return Err(Error::NotInTransaction);
        }
        self.storage.with_conn(|conn| {
            conn.execute(
                "UPDATE store_info SET last_sequence = last_sequence + 1 WHERE store = ?1",
                [&self.name],
            )?;
            Ok(conn.query_row(
                "SELECT last_sequence FROM store_info WHERE store = ?1",
                [&self.name],
                |row| row.get::<_, i64>(0),
            )? as u64)
        })
    }

    /// Change (or clear) a record's expiration without assigning a sequence.
    pub fn set_expiration(
        &self,
        _txn: &Transaction<'_>,
        key: &str,
        when: Option<i64>,
    ) -> Result<bool> {
        let updated = self.storage.with_conn(|conn| {
            Ok(conn.execute(
                &format!("UPDATE {} SET expiration = ?2 WHERE key = ?1", self.table()),
                params![key, when],
            )?)
        })?;
        Ok(updated > 0)
    }

    /// Earliest scheduled expiration, if any.
    pub fn next_expiration(&self) -> Result<Option<i64>> {
        self.storage.with_conn(|conn| {
            Ok(conn.query_row(
                &format!(
                    "SELECT MIN(expiration) FROM {} WHERE expiration IS NOT NULL",
                    self.table()
                ),
                [],
                |row| row.get::<_, Option<i64>>(0),
            )?)
        })
    }

    /// Keys whose expiration is at or before `now` (milliseconds).
    pub fn expired_keys(&self, now: i64) -> Result<Vec<String>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT key FROM {} WHERE expiration IS NOT NULL AND expiration <= ?1",
                self.table()
            ))?;
            let keys = stmt
                .query_map([now], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(keys)
        })
    }

    /// Create a secondary index and backfill it from existing records.
    pub fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        validate_store_name(&spec.name)?;
        let txn = self.storage.begin()?;
        let existing = self.lookup_index(&spec.name)?;
        if let Some(existing) = existing {
            if existing.kind == spec.kind && existing.expression == spec.expression {
                txn.commit()?;
                return Ok(());
            }
            self.drop_index_objects(&existing)?;
        }
        let (kind_text, dimensions) = match &spec.kind {
            IndexKind::Value => ("value", None),
            IndexKind::FullText => ("fts", None),
            IndexKind::Vector { dimensions } => ("vector", Some(*dimensions as i64)),
        };
        self.storage.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO indexes (store, name, kind, expression, dimensions)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![self.name, spec.name, kind_text, spec.expression, dimensions],
            )?;
            Ok(())
        })?;
        match spec.kind {
            IndexKind::Value => self.create_value_index(spec)?,
            IndexKind::FullText => self.create_fts_index(spec)?,
            IndexKind::Vector { .. } => self.create_vector_index(spec)?,
        }
        debug!(store = %self.name, index = %spec.name, "created index");
        txn.commit()?;
        Ok(())
    }

    fn create_value_index(&self, spec: &IndexSpec) -> Result<()> {
        let index = quote_ident(&format!("idx_{}::{}", self.name, spec.name));
        self.storage.with_conn(|conn| {
            conn.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {table} (fl_value(body, {expr}))",
                table = self.table(),
                expr = quote_string(&spec.expression),
            ))?;
            Ok(())
        })
    }

    fn create_fts_index(&self, spec: &IndexSpec) -> Result<()> {
        let fts = self.fts_table(&spec.name);
        let table = self.table();
        let expr = quote_string(&spec.expression);
        self.storage.with_conn(|conn| {
            conn.execute_batch(&format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS {fts} USING fts5(text);
                 CREATE TRIGGER IF NOT EXISTS {t_ins} AFTER INSERT ON {table} BEGIN
                     INSERT INTO {fts} (rowid, text) VALUES (new.rowid, fl_text(new.body, {expr}));
                 END;
                 CREATE TRIGGER IF NOT EXISTS {t_del} AFTER DELETE ON {table} BEGIN
                     DELETE FROM {fts} WHERE rowid = old.rowid;
                 END;
                 CREATE TRIGGER IF NOT EXISTS {t_upd} AFTER UPDATE OF body ON {table} BEGIN
                     DELETE FROM {fts} WHERE rowid = old.rowid;
                     INSERT INTO {fts} (rowid, text) VALUES (new.rowid, fl_text(new.body, {expr}));
                 END;
                 INSERT INTO {fts} (rowid, text)
                     SELECT rowid, fl_text(body, {expr}) FROM {table};",
                fts = fts,
                table = table,
                expr = expr,
                t_ins = quote_ident(&format!("fts_{}::{}::ins", self.name, spec.name)),
                t_del = quote_ident(&format!("fts_{}::{}::del", self.name, spec.name)),
                t_upd = quote_ident(&format!("fts_{}::{}::upd", self.name, spec.name)),
            ))?;
            Ok(())
        })
    }

    fn create_vector_index(&self, spec: &IndexSpec) -> Result<()> {
        let vec = self.vector_table(&spec.name);
        let table = self.table();
        let expr = quote_string(&spec.expression);
        self.storage.with_conn(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {vec} (rowid INTEGER PRIMARY KEY, vector BLOB);
                 CREATE TRIGGER IF NOT EXISTS {t_ins} AFTER INSERT ON {table} BEGIN
                     INSERT INTO {vec} (rowid, vector) VALUES (new.rowid, fl_vector(new.body, {expr}));
                 END;
                 CREATE TRIGGER IF NOT EXISTS {t_del} AFTER DELETE ON {table} BEGIN
                     DELETE FROM {vec} WHERE rowid = old.rowid;
                 END;
                 CREATE TRIGGER IF NOT EXISTS {t_upd} AFTER UPDATE OF body ON {table} BEGIN
                     DELETE FROM {vec} WHERE rowid = old.rowid;
                     INSERT INTO {vec} (rowid, vector) VALUES (new.rowid, fl_vector(new.body, {expr}));
                 END;
                 INSERT INTO {vec} (rowid, vector)
                     SELECT rowid, fl_vector(body, {expr}) FROM {table};",
                vec = vec,
                table = table,
                expr = expr,
                t_ins = quote_ident(&format!("vec_{}::{}::ins", self.name, spec.name)),
                t_del = quote_ident(&format!("vec_{}::{}::del", self.name, spec.name)),
                t_upd = quote_ident(&format!("vec_{}::{}::upd", self.name, spec.name)),
            ))?;
            Ok(())
        })
    }

    pub fn delete_index(&self, name: &str) -> Result<()> {
        let txn = self.storage.begin()?;
        let info = self.lookup_index(name)?.ok_or(Error::NotFound)?;
        self.drop_index_objects(&info)?;
        self.storage.with_conn(|conn| {
            conn.execute(
                "DELETE FROM indexes WHERE store = ?1 AND name = ?2",
                params![self.name, name],
            )?;
            Ok(())
        })?;
        txn.commit()?;
        Ok(())
    }

    fn drop_index_objects(&self, info: &IndexInfo) -> Result<()> {
        let statements = match info.kind {
            IndexKind::Value => vec![format!(
                "DROP INDEX IF EXISTS {}",
                quote_ident(&format!("idx_{}::{}", self.name, info.name))
            )],
            IndexKind::FullText => self.drop_shadow_statements("fts", &info.name),
            IndexKind::Vector { .. } => self.drop_shadow_statements("vec", &info.name),
        };
        self.storage.with_conn(|conn| {
            for sql in &statements {
                conn.execute_batch(sql)?;
            }
            Ok(())
        })
    }

    fn drop_shadow_statements(&self, prefix: &str, name: &str) -> Vec<String> {
        vec![
            format!(
                "DROP TABLE IF EXISTS {}",
                quote_ident(&format!("{prefix}_{}::{name}", self.name))
            ),
            format!(
                "DROP TRIGGER IF EXISTS {}",
                quote_ident(&format!("{prefix}_{}::{name}::ins", self.name))
            ),
            format!(
                "DROP TRIGGER IF EXISTS {}",
                quote_ident(&format!("{prefix}_{}::{name}::del", self.name))
            ),
            format!(
                "DROP TRIGGER IF EXISTS {}",
                quote_ident(&format!("{prefix}_{}::{name}::upd", self.name))
            ),
        ]
    }

    fn lookup_index(&self, name: &str) -> Result<Option<IndexInfo>> {
        self.storage.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT name, kind, expression, dimensions FROM indexes
                     WHERE store = ?1 AND name = ?2",
                    params![self.name, name],
                    read_index_info,
                )
                .optional()?)
        })
    }

    pub fn get_indexes_info(&self) -> Result<Vec<IndexInfo>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, kind, expression, dimensions FROM indexes
                 WHERE store = ?1 ORDER BY name",
            )?;
            let infos = stmt
                .query_map([&self.name], read_index_info)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(infos)
        })
    }
}

fn read_index_info(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexInfo> {
    let kind_text: String = row.get(1)?;
    let dimensions: Option<i64> = row.get(3)?;
    let kind = match kind_text.as_str() {
        "fts" => IndexKind::FullText,
        "vector" => IndexKind::Vector {
            dimensions: dimensions.unwrap_or(0) as usize,
        },
        _ => IndexKind::Value,
    };
    Ok(IndexInfo {
        name: row.get(0)?,
        kind,
        expression: row.get(2)?,
    })
}

fn columns(content: ContentOption) -> &'static str {
    match content {
        ContentOption::MetaOnly => "key, sequence, flags, expiration",
        ContentOption::CurrentRevOnly => "key, sequence, flags, expiration, body",
        ContentOption::EntireBody => "key, sequence, flags, expiration, body, meta",
    }
}

fn read_record(row: &rusqlite::Row<'_>, content: ContentOption) -> rusqlite::Result<Record> {
    let mut record = Record {
        key: row.get(0)?,
        sequence: row.get::<_, i64>(1)? as u64,
        flags: DocumentFlags(row.get::<_, i64>(2)? as u8),
        expiration: row.get(3)?,
        ..Record::default()
    };
    if !matches!(content, ContentOption::MetaOnly) {
        let body: Option<Vec<u8>> = row.get(4)?;
        record.body = body.map(Bytes::from).unwrap_or_default();
    }
    if matches!(content, ContentOption::EntireBody) {
        let meta: Option<Vec<u8>> = row.get(5)?;
        record.meta = meta.map(Bytes::from).unwrap_or_default();
    }
    Ok(record)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_string(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, Arc<SqliteStorage>, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SqliteStorage::open(dir.path(), true).unwrap());
        let store = KeyStore::open(storage.clone(), "default").unwrap();
        (dir, storage, store)
    }

    #[test]
    fn set_assigns_monotonic_sequences() -> anyhow::Result<()> {
        let (_dir, storage, store) = open_store();
        let txn = storage.begin()?;
        let s1 = store.set(&txn, "a", b"m", b"b", DocumentFlags::default(), None)?;
        let s2 = store.set(&txn, "b", b"m", b"b", DocumentFlags::default(), None)?;
        let s3 = store.set(&txn, "a", b"m2", b"b2", DocumentFlags::default(), None)?;
        txn.commit()?;
        assert_eq!((s1, s2, s3), (1, 2, 3));
        assert_eq!(store.last_sequence()?, 3);
        let record = store.get("a", ContentOption::EntireBody)?.unwrap();
        assert_eq!(record.sequence, 3);
        assert_eq!(&record.meta[..], b"m2");
        assert_eq!(&record.body[..], b"b2");
        Ok(())
    }

    #[test]
    fn set_outside_transaction_fails() {
        let (_dir, storage, store) = open_store();
        let txn = storage.begin().unwrap();
        txn.commit().unwrap();
        // A stale Transaction value cannot be constructed once committed, so
        // the contract is enforced on the sequence bump.
        let err = store.bump_sequence().unwrap_err();
        assert!(matches!(err, Error::NotInTransaction));
    }

    #[test]
    fn abort_restores_last_sequence() -> anyhow::Result<()> {
        let (_dir, storage, store) = open_store();
        let txn = storage.begin()?;
        store.set(&txn, "a", b"", b"", DocumentFlags::default(), None)?;
        txn.commit()?;
        let txn = storage.begin()?;
        store.set(&txn, "b", b"", b"", DocumentFlags::default(), None)?;
        txn.abort()?;
        assert_eq!(store.last_sequence()?, 1);
        assert!(store.get("b", ContentOption::MetaOnly)?.is_none());
        Ok(())
    }

    #[test]
    fn enumerate_filters_and_orders() -> anyhow::Result<()> {
        let (_dir, storage, store) = open_store();
        let txn = storage.begin()?;
        store.set(&txn, "a", b"", b"", DocumentFlags::default(), None)?;
        store.set(&txn, "b", b"", b"", DocumentFlags::DELETED, None)?;
        store.set(
            &txn,
            "c",
            b"",
            b"",
            DocumentFlags::default().with(DocumentFlags::CONFLICTED),
            None,
        )?;
        txn.commit()?;

        let keys: Vec<String> = store
            .enumerate(&EnumerateOptions::default())?
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["a", "c"]);

        let keys: Vec<String> = store
            .enumerate(&EnumerateOptions {
                include_deleted: true,
                descending: true,
                ..Default::default()
            })?
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["c", "b", "a"]);

        let keys: Vec<String> = store
            .enumerate(&EnumerateOptions {
                only_conflicts: true,
                ..Default::default()
            })?
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["c"]);

        let seqs: Vec<u64> = store
            .enumerate(&EnumerateOptions {
                since: Some(1),
                include_deleted: true,
                ..Default::default()
            })?
            .map(|r| r.sequence)
            .collect();
        assert_eq!(seqs, vec![2, 3]);
        Ok(())
    }

    #[test]
    fn purge_counts() -> anyhow::Result<()> {
        let (_dir, storage, store) = open_store();
        let txn = storage.begin()?;
        store.set(&txn, "a", b"", b"", DocumentFlags::default(), None)?;
        txn.commit()?;
        let txn = storage.begin()?;
        assert!(store.del(&txn, "a")?);
        assert!(!store.del(&txn, "a")?);
        txn.commit()?;
        assert_eq!(store.purge_count()?, 1);
        assert_eq!(store.document_count()?, 0);
        Ok(())
    }

    #[test]
    fn expiration_index() -> anyhow::Result<()> {
        let (_dir, storage, store) = open_store();
        let txn = storage.begin()?;
        store.set(&txn, "a", b"", b"", DocumentFlags::default(), Some(1000))?;
        store.set(&txn, "b", b"", b"", DocumentFlags::default(), Some(2000))?;
        store.set(&txn, "c", b"", b"", DocumentFlags::default(), None)?;
        txn.commit()?;
        assert_eq!(store.next_expiration()?, Some(1000));
        assert_eq!(store.expired_keys(1500)?, vec!["a"]);
        let txn = storage.begin()?;
        store.set_expiration(&txn, "a", None)?;
        txn.commit()?;
        assert_eq!(store.next_expiration()?, Some(2000));
        Ok(())
    }

    #[test]
    fn raw_round_trip() -> anyhow::Result<()> {
        let (_dir, storage, _store) = open_store();
        let raw = KeyStore::open(storage.clone(), "checkpoints")?;
        let txn = storage.begin()?;
        raw.put_raw(&txn, "cp-1", br#"{"local":"10"}"#)?;
        txn.commit()?;
        assert_eq!(raw.get_raw("cp-1")?.as_deref(), Some(&br#"{"local":"10"}"#[..]));
        assert_eq!(raw.get_raw("cp-2")?, None);
        Ok(())
    }

    #[test]
    fn index_info_round_trip() -> anyhow::Result<()> {
        let (_dir, _storage, store) = open_store();
        store.create_index(&IndexSpec {
            name: "by-name".into(),
            kind: IndexKind::Value,
            expression: "name".into(),
        })?;
        store.create_index(&IndexSpec {
            name: "by-text".into(),
            kind: IndexKind::FullText,
            expression: "text".into(),
        })?;
        let infos = store.get_indexes_info()?;
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, "by-name");
        assert_eq!(infos[1].kind, IndexKind::FullText);
        store.delete_index("by-name")?;
        assert_eq!(store.get_indexes_info()?.len(), 1);
        assert!(matches!(store.delete_index("gone"), Err(Error::NotFound)));
        Ok(())
    }
}
