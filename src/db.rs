//! The database facade: bundle directory, collections, transactions.
//!
//! A database is a directory `<name>.cblite2/` holding the SQLite file and
//! the `Attachments/` blob tree. Collections partition documents, each with
//! its own sequence counter, expiration schedule, and observers. Raw
//! key-stores (`info`, `checkpoints`, `cookies`) share the same file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use rand::RngCore;
use serde_json::Value;
use tracing::{debug, error_span, info, warn};

use crate::blob::{BlobKey, BlobStore, EncryptionKey, PendingBlob};
use crate::body;
use crate::document::{Document, RevIdStyle};
use crate::error::{Error, Result};
use crate::query::Query;
use crate::revid::{PeerId, RevId};
use crate::store::{
    ContentOption, EnumerateOptions, IndexInfo, IndexSpec, KeyStore, Record, SqliteStorage,
    Transaction,
};
use crate::tracker::{Change, ChangesSince, ObserverToken, SequenceTracker};

/// Extension of a database bundle directory.
pub const BUNDLE_EXTENSION: &str = "cblite2";
/// Name of the implicit default collection.
pub const DEFAULT_COLLECTION: &str = "_default";
/// Raw store holding database metadata (UUIDs, revision-id style).
pub const INFO_STORE: &str = "info";
/// Raw store holding replication checkpoints.
pub const CHECKPOINTS_STORE: &str = "checkpoints";
/// Raw store holding the persisted cookie jar.
pub const COOKIES_STORE: &str = "cookies";

const ATTACHMENTS_DIR: &str = "Attachments";
const SWEEP_FALLBACK: Duration = Duration::from_secs(60);

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis() as i64
}

/// Options for opening a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub read_only: bool,
    pub encryption_key: Option<EncryptionKey>,
    /// Revision-id form for new revisions. Applied when the database is
    /// created; reopening uses the persisted style.
    pub rev_id_style: RevIdStyle,
    /// Retention depth enforced when saving documents.
    pub max_rev_tree_depth: usize,
    /// Run the background expiration sweeper.
    pub expiration_sweeper: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            read_only: false,
            encryption_key: None,
            rev_id_style: RevIdStyle::default(),
            max_rev_tree_depth: 20,
            expiration_sweeper: true,
        }
    }
}

struct PendingEffects {
    changes: Vec<(Arc<SequenceTracker>, Change)>,
    blobs: Vec<(PendingBlob, Option<BlobKey>)>,
}

pub(crate) struct DbInner {
    dir: PathBuf,
    name: String,
    storage: Arc<SqliteStorage>,
    blobs: BlobStore,
    rev_id_style: RevIdStyle,
    max_rev_tree_depth: usize,
    public_uuid: [u8; 16],
    private_uuid: [u8; 16],
    collections: Mutex<HashMap<String, Collection>>,
    pending: Mutex<PendingEffects>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

/// An open database. Cheap to clone; the last clone dropped releases the
/// file.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("dir", &self.inner.dir)
            .finish()
    }
}

impl Database {
    /// Open (creating unless read-only) the database bundle at `path`.
    ///
    /// `path` may name the bundle directory directly or omit the
    /// `.cblite2` extension.
    pub fn open(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Database> {
        let mut dir = path.as_ref().to_path_buf();
        if dir.extension().map(|e| e != BUNDLE_EXTENSION).unwrap_or(true) {
            dir.set_extension(BUNDLE_EXTENSION);
        }
        let name = dir
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("db")
            .to_string();
        if !config.read_only {
            std::fs::create_dir_all(&dir)?;
        }
        let storage = Arc::new(SqliteStorage::open(&dir, !config.read_only)?);
        let blobs = BlobStore::open(dir.join(ATTACHMENTS_DIR), config.encryption_key.clone())?;
        let info = KeyStore::open(storage.clone(), INFO_STORE)?;

        let (public_uuid, private_uuid, rev_id_style) =
            Self::load_or_init_info(&storage, &info, &config)?;

        let inner = Arc::new(DbInner {
            dir,
            name,
            storage,
            blobs,
            rev_id_style,
            max_rev_tree_depth: config.max_rev_tree_depth,
            public_uuid,
            private_uuid,
            collections: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingEffects {
                changes: Vec::new(),
                blobs: Vec::new(),
            }),
            sweeper: Mutex::new(None),
        });
        let db = Database { inner };
        if !config.read_only && config.expiration_sweeper {
            db.start_sweeper();
        }
        info!(name = %db.inner.name, "opened database");
        Ok(db)
    }

    fn load_or_init_info(
        storage: &Arc<SqliteStorage>,
        info: &KeyStore,
        config: &DatabaseConfig,
    ) -> Result<([u8; 16], [u8; 16], RevIdStyle)> {
        let read_uuid = |key: &str| -> Result<Option<[u8; 16]>> {
            Ok(info.get_raw(key)?.and_then(|raw| {
                hex::decode(&raw[..]).ok().and_then(|b| b.try_into().ok())
            }))
        };
        if let (Some(public), Some(private)) = (read_uuid("publicUUID")?, read_uuid("privateUUID")?)
        {
            let style = match info.get_raw("revIDStyle")?.as_deref() {
                Some(b"vector") => RevIdStyle::VersionVector,
                Some(_) => RevIdStyle::Tree,
                // Databases created before the flag existed wrote tree ids.
                None => RevIdStyle::Tree,
            };
            if style != config.rev_id_style {
                warn!("ignoring configured revision-id style; database already uses another");
            }
            return Ok((public, private, style));
        }
        if !storage.writeable() {
            return Err(Error::corrupt("database is missing its info records"));
        }
        let mut rng = rand::thread_rng();
        let mut public = [0u8; 16];
        let mut private = [0u8; 16];
        rng.fill_bytes(&mut public);
        rng.fill_bytes(&mut private);
        let style_text: &[u8] = match config.rev_id_style {
            RevIdStyle::Tree => b"tree",
            RevIdStyle::VersionVector => b"vector",
        };
        let txn = storage.begin()?;
        info.put_raw(&txn, "publicUUID", hex::encode(public).as_bytes())?;
        info.put_raw(&txn, "privateUUID", hex::encode(private).as_bytes())?;
        info.put_raw(&txn, "revIDStyle", style_text)?;
        txn.commit()?;
        Ok((public, private, config.rev_id_style))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    /// Stable `(public, private)` UUID pair minted at creation.
    pub fn uuids(&self) -> ([u8; 16], [u8; 16]) {
        (self.inner.public_uuid, self.inner.private_uuid)
    }

    /// This database's identity in version vectors and checkpoints.
    pub fn peer_id(&self) -> PeerId {
        PeerId(self.inner.public_uuid)
    }

    pub fn rev_id_style(&self) -> RevIdStyle {
        self.inner.rev_id_style
    }

    pub fn max_rev_tree_depth(&self) -> usize {
        self.inner.max_rev_tree_depth
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    pub(crate) fn storage(&self) -> &Arc<SqliteStorage> {
        &self.inner.storage
    }

    /// The implicit default collection.
    pub fn default_collection(&self) -> Result<Collection> {
        self.collection(DEFAULT_COLLECTION)
    }

    /// Open (creating) a named collection.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        let mut collections = self.inner.collections.lock();
        if let Some(existing) = collections.get(name) {
            return Ok(existing.clone());
        }
        let store = KeyStore::open(self.inner.storage.clone(), name)?;
        let collection = Collection {
            inner: Arc::new(CollectionInner {
                store,
                tracker: Arc::new(SequenceTracker::default()),
                db: Arc::downgrade(&self.inner),
            }),
        };
        collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    /// Begin a write transaction. Nested calls reference-count the
    /// outermost one.
    pub fn begin_transaction(&self) -> Result<DbTransaction<'_>> {
        let txn = self.inner.storage.begin()?;
        Ok(DbTransaction {
            db: &self.inner,
            txn: Some(txn),
        })
    }

    /// Read from a raw (non-document) key-store.
    pub fn get_raw(&self, store: &str, key: &str) -> Result<Option<bytes::Bytes>> {
        KeyStore::open(self.inner.storage.clone(), store)?.get_raw(key)
    }

    /// Write to a raw key-store in its own transaction.
    pub fn put_raw(&self, store: &str, key: &str, value: &[u8]) -> Result<()> {
        let ks = KeyStore::open(self.inner.storage.clone(), store)?;
        let txn = self.inner.storage.begin()?;
        ks.put_raw(&txn, key, value)?;
        txn.commit()?;
        Ok(())
    }

    /// Vacuum the file and sweep blobs unreferenced by any retained
    /// revision body.
    pub fn compact(&self) -> Result<()> {
        if self.inner.storage.in_transaction() {
            return Err(Error::TransactionNotClosed);
        }
        let mut referenced: Vec<BlobKey> = Vec::new();
        let names: Vec<String> = self.inner.collections.lock().keys().cloned().collect();
        for name in names {
            let collection = self.collection(&name)?;
            for record in collection.inner.store.enumerate(&EnumerateOptions {
                include_deleted: true,
                content: ContentOption::EntireBody,
                ..Default::default()
            })? {
                let doc = Document::from_record(record)?;
                let tree = doc.tree();
                for i in 0..tree.len() as u32 {
                    if let Some(raw) = &tree.rev(i).body {
                        if let Ok(value) = body::decode(raw) {
                            referenced.extend(body::blob_refs(&value).into_iter().map(|r| r.key));
                        }
                    }
                }
            }
        }
        for key in self.inner.blobs.all_keys()? {
            if !referenced.contains(&key) {
                debug!(blob = %key, "deleting orphaned blob");
                let _ = self.inner.blobs.delete(&key);
            }
        }
        self.inner.storage.with_conn(|conn| {
            conn.execute_batch("VACUUM")?;
            Ok(())
        })
    }

    /// Rotate (or remove) the key protecting attachment files.
    ///
    /// Requires no open transaction. Later opens must pass the new key in
    /// [`DatabaseConfig::encryption_key`].
    pub fn rekey(&self, new_key: Option<EncryptionKey>) -> Result<()> {
        if self.inner.storage.in_transaction() {
            return Err(Error::TransactionNotClosed);
        }
        self.inner.blobs.rekey(new_key)?;
        info!(name = %self.inner.name, "database rekeyed");
        Ok(())
    }

    /// Close, failing with `TransactionNotClosed` if a transaction is
    /// still open on this handle.
    pub fn close(self) -> Result<()> {
        if self.inner.storage.in_transaction() {
            return Err(Error::TransactionNotClosed);
        }
        self.stop_sweeper();
        Ok(())
    }

    /// Whether a bundle exists at `path`.
    pub fn exists(path: impl AsRef<Path>) -> bool {
        let mut dir = path.as_ref().to_path_buf();
        if dir.extension().map(|e| e != BUNDLE_EXTENSION).unwrap_or(true) {
            dir.set_extension(BUNDLE_EXTENSION);
        }
        dir.join(crate::store::DB_FILE_NAME).is_file()
    }

    /// Delete a closed database bundle.
    pub fn delete_files(path: impl AsRef<Path>) -> Result<()> {
        let mut dir = path.as_ref().to_path_buf();
        if dir.extension().map(|e| e != BUNDLE_EXTENSION).unwrap_or(true) {
            dir.set_extension(BUNDLE_EXTENSION);
        }
        SqliteStorage::delete_files(&dir)
    }

    fn start_sweeper(&self) {
        let weak = Arc::downgrade(&self.inner);
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_signal = signal.clone();
        let name = self.inner.name.clone();
        let thread = std::thread::spawn(move || {
            let span = error_span!("expiration", db = %name);
            let _enter = span.enter();
            loop {
                let Some(inner) = weak.upgrade() else { break };
                let db = Database { inner };
                let now = now_ms();
                let mut wait = SWEEP_FALLBACK;
                let names: Vec<String> = db.inner.collections.lock().keys().cloned().collect();
                for name in names {
                    let Ok(collection) = db.collection(&name) else {
                        continue;
                    };
                    match collection.purge_expired(now) {
                        Ok(purged) if purged > 0 => {
                            debug!(collection = %name, purged, "expired documents purged");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(collection = %name, "expiration sweep failed: {err}"),
                    }
                    if let Ok(Some(next)) = collection.next_expiration() {
                        let until = Duration::from_millis(next.saturating_sub(now_ms()).max(0) as u64);
                        wait = wait.min(until.max(Duration::from_millis(50)));
                    }
                }
                drop(db);
                let (lock, condvar) = &*thread_signal;
                let mut shutdown = lock.lock();
                if *shutdown {
                    break;
                }
                condvar.wait_for(&mut shutdown, wait);
                if *shutdown {
                    break;
                }
            }
        });
        *self.inner.sweeper.lock() = Some(SweeperHandle { thread, signal });
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            {
                let (lock, condvar) = &*handle.signal;
                *lock.lock() = true;
                condvar.notify_all();
            }
            let _ = handle.thread.join();
        }
    }
}

struct SweeperHandle {
    thread: std::thread::JoinHandle<()>,
    signal: Arc<(Mutex<bool>, Condvar)>,
}

struct CollectionInner {
    store: KeyStore,
    tracker: Arc<SequenceTracker>,
    db: Weak<DbInner>,
}

/// A named partition of documents.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.store.name())
            .finish()
    }
}

/// Options for [`Collection::put`].
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub deleted: bool,
    pub allow_conflict: bool,
    /// Parent revision; defaults to the current leaf.
    pub parent: Option<RevId>,
}

impl Collection {
    fn db(&self) -> Result<Database> {
        self.inner
            .db
            .upgrade()
            .map(|inner| Database { inner })
            .ok_or(Error::NotFound)
    }

    pub fn name(&self) -> &str {
        self.inner.store.name()
    }

    pub(crate) fn store(&self) -> &KeyStore {
        &self.inner.store
    }

    pub(crate) fn tracker(&self) -> &Arc<SequenceTracker> {
        &self.inner.tracker
    }

    /// Load a document (an empty shell when it does not exist yet).
    pub fn get(&self, doc_id: &str) -> Result<Document> {
        Document::load(&self.inner.store, doc_id)
    }

    /// Load an existing document or fail with `NotFound`.
    pub fn get_existing(&self, doc_id: &str) -> Result<Document> {
        let doc = self.get(doc_id)?;
        if !doc.exists() {
            return Err(Error::NotFound);
        }
        Ok(doc)
    }

    /// Load the document holding a given sequence.
    pub fn get_by_sequence(&self, sequence: u64) -> Result<Document> {
        let record = self
            .inner
            .store
            .get_by_sequence(sequence, ContentOption::EntireBody)?
            .ok_or(Error::NotFound)?;
        Document::from_record(record)
    }

    /// Create a new revision and commit it.
    pub fn put(&self, doc_id: &str, body: &Value, options: PutOptions) -> Result<(RevId, u64)> {
        let db = self.db()?;
        let mut doc = self.get(doc_id)?;
        if let Some(parent) = &options.parent {
            doc.select_rev(parent)?;
        }
        let rev_id = doc.put_new_revision(
            body,
            options.deleted,
            options.allow_conflict,
            db.rev_id_style(),
            db.peer_id(),
        )?;
        let mut txn = db.begin_transaction()?;
        let sequence = self.save(&mut txn, &mut doc)?;
        txn.commit()?;
        Ok((rev_id, sequence))
    }

    /// Tombstone the current revision.
    pub fn delete(&self, doc_id: &str) -> Result<(RevId, u64)> {
        self.put(
            doc_id,
            &Value::Object(Default::default()),
            PutOptions {
                deleted: true,
                ..Default::default()
            },
        )
    }

    /// Save a document inside an open transaction, deferring observer
    /// notification to commit.
    ///
    /// Every blob the current body references must already be stored or
    /// staged in this transaction; a persisted body never points at a
    /// missing attachment.
    pub fn save(&self, txn: &mut DbTransaction<'_>, doc: &mut Document) -> Result<u64> {
        let db = self.db()?;
        let tree = doc.tree();
        if let Some(current) = tree.current() {
            if let Some(raw) = &tree.rev(current).body {
                if let Ok(value) = body::decode(raw) {
                    for blob_ref in body::blob_refs(&value) {
                        if !db.blobs().has(&blob_ref.key) && !txn.has_pending_blob(&blob_ref.key) {
                            return Err(Error::invalid_parameter(format!(
                                "body references missing blob {}",
                                blob_ref.key
                            )));
                        }
                    }
                }
            }
        }
        let change = doc.save(&self.inner.store, txn.inner()?, db.max_rev_tree_depth())?;
        let sequence = change.sequence;
        txn.record_change(self.inner.tracker.clone(), change);
        Ok(sequence)
    }

    /// Remove a document entirely and post a purge notification.
    pub fn purge(&self, doc_id: &str) -> Result<()> {
        let db = self.db()?;
        let txn = db.storage().begin()?;
        if !self.inner.store.del(&txn, doc_id)? {
            txn.abort()?;
            return Err(Error::NotFound);
        }
        txn.commit()?;
        self.inner.tracker.post_changes(&[Change {
            doc_id: doc_id.to_string(),
            sequence: self.inner.store.last_sequence()?,
            rev_id: None,
            flags: Default::default(),
            purged: true,
        }]);
        Ok(())
    }

    pub fn document_count(&self) -> Result<u64> {
        self.inner.store.document_count()
    }

    pub fn last_sequence(&self) -> Result<u64> {
        self.inner.store.last_sequence()
    }

    pub fn purge_count(&self) -> Result<u64> {
        self.inner.store.purge_count()
    }

    /// Schedule (or clear) a document's expiration.
    pub fn set_expiration(&self, doc_id: &str, when: Option<i64>) -> Result<()> {
        let db = self.db()?;
        let txn = db.storage().begin()?;
        let found = self.inner.store.set_expiration(&txn, doc_id, when)?;
        txn.commit()?;
        if !found {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub fn get_expiration(&self, doc_id: &str) -> Result<Option<i64>> {
        Ok(self
            .inner
            .store
            .get(doc_id, ContentOption::MetaOnly)?
            .ok_or(Error::NotFound)?
            .expiration)
    }

    pub fn next_expiration(&self) -> Result<Option<i64>> {
        self.inner.store.next_expiration()
    }

    /// Purge every document expired at `now`. Returns how many went.
    pub fn purge_expired(&self, now: i64) -> Result<usize> {
        let expired = self.inner.store.expired_keys(now)?;
        if expired.is_empty() {
            return Ok(0);
        }
        let db = self.db()?;
        let txn = db.storage().begin()?;
        let mut changes = Vec::new();
        for key in &expired {
            if self.inner.store.del(&txn, key)? {
                changes.push(Change {
                    doc_id: key.clone(),
                    sequence: self.inner.store.last_sequence()?,
                    rev_id: None,
                    flags: Default::default(),
                    purged: true,
                });
            }
        }
        txn.commit()?;
        let count = changes.len();
        self.inner.tracker.post_changes(&changes);
        Ok(count)
    }

    /// Enumerate records; see [`EnumerateOptions`].
    pub fn enumerate(&self, options: &EnumerateOptions) -> Result<Vec<Record>> {
        Ok(self.inner.store.enumerate(options)?.collect())
    }

    /// Records changed since `since`, in sequence order, with meta loaded
    /// so callers can read the current revision id.
    pub fn changes_since(&self, since: u64, limit: usize) -> Result<Vec<Record>> {
        let mut records: Vec<Record> = self
            .inner
            .store
            .enumerate(&EnumerateOptions {
                since: Some(since),
                include_deleted: true,
                content: ContentOption::EntireBody,
                ..Default::default()
            })?
            .take(limit)
            .collect();
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    // --- observers ---

    pub fn observe(&self, callback: impl Fn() + Send + Sync + 'static) -> ObserverToken {
        self.inner.tracker.observe(callback)
    }

    pub fn observe_document(
        &self,
        doc_id: &str,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> ObserverToken {
        self.inner.tracker.observe_document(doc_id, callback)
    }

    pub fn poll_changes(&self, token: ObserverToken, since: u64, max: usize) -> ChangesSince {
        self.inner.tracker.poll(token, since, max)
    }

    pub fn remove_observer(&self, token: ObserverToken) -> bool {
        self.inner.tracker.remove_observer(token)
    }

    // --- indexes & queries ---

    pub fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        self.inner.store.create_index(spec)
    }

    pub fn delete_index(&self, name: &str) -> Result<()> {
        self.inner.store.delete_index(name)
    }

    pub fn get_indexes_info(&self) -> Result<Vec<IndexInfo>> {
        self.inner.store.get_indexes_info()
    }

    /// Compile a JSON query AST against this collection.
    pub fn query(&self, ast: Value) -> Result<Query> {
        Query::compile(self.clone(), ast)
    }
}

/// A database-level write transaction: storage writes plus deferred side
/// effects (blob installs, observer notifications).
pub struct DbTransaction<'a> {
    db: &'a Arc<DbInner>,
    txn: Option<Transaction<'a>>,
}

impl<'a> DbTransaction<'a> {
    pub(crate) fn inner(&self) -> Result<&Transaction<'a>> {
        self.txn.as_ref().ok_or(Error::NotInTransaction)
    }

    fn record_change(&mut self, tracker: Arc<SequenceTracker>, change: Change) {
        self.db.pending.lock().changes.push((tracker, change));
    }

    /// Register a finished blob write to be installed when the outermost
    /// transaction commits.
    pub fn install_blob_on_commit(&mut self, pending: PendingBlob, expected: Option<BlobKey>) {
        self.db.pending.lock().blobs.push((pending, expected));
    }

    /// Whether a blob with this key is staged to install on commit.
    pub fn has_pending_blob(&self, key: &BlobKey) -> bool {
        self.db.pending.lock().blobs.iter().any(|(p, _)| p.key == *key)
    }

    /// Convenience: stream `data` into the blob store and register it.
    pub fn put_blob(&mut self, data: &[u8]) -> Result<BlobKey> {
        let db = Database {
            inner: self.db.clone(),
        };
        let mut stream = db.blobs().open_write_stream()?;
        stream.write_all(data)?;
        let pending = stream.finish()?;
        let key = pending.key;
        self.install_blob_on_commit(pending, None);
        Ok(key)
    }

    /// Force a WAL checkpoint when the outermost transaction commits.
    pub fn set_wal_flush(&self) -> Result<()> {
        self.inner()?.set_wal_flush();
        Ok(())
    }

    pub fn commit(mut self) -> Result<()> {
        let txn = self.txn.take().ok_or(Error::NotInTransaction)?;
        let outermost = txn.storage().transaction_depth() == 1;
        if outermost {
            // Install blobs before the SQL commit so a committed body never
            // references a missing attachment. A failed commit can leave
            // freshly installed blobs orphaned; compaction reclaims them.
            let blobs: Vec<_> = std::mem::take(&mut self.db.pending.lock().blobs);
            let db = Database {
                inner: self.db.clone(),
            };
            for (pending, expected) in blobs {
                db.blobs().install(pending, expected.as_ref())?;
            }
        }
        let committed = txn.commit()?;
        if committed {
            let changes: Vec<_> = std::mem::take(&mut self.db.pending.lock().changes);
            let mut by_tracker: Vec<(Arc<SequenceTracker>, Vec<Change>)> = Vec::new();
            for (tracker, change) in changes {
                match by_tracker.iter_mut().find(|(t, _)| Arc::ptr_eq(t, &tracker)) {
                    Some((_, list)) => list.push(change),
                    None => by_tracker.push((tracker, vec![change])),
                }
            }
            for (tracker, mut list) in by_tracker {
                list.sort_by_key(|c| c.sequence);
                tracker.post_changes(&list);
            }
        }
        Ok(())
    }

    pub fn abort(mut self) -> Result<()> {
        let txn = self.txn.take().ok_or(Error::NotInTransaction)?;
        let rolled_back = txn.abort()?;
        if rolled_back {
            self.discard_pending();
        }
        Ok(())
    }

    fn discard_pending(&self) {
        let mut pending = self.db.pending.lock();
        pending.changes.clear();
        let blobs = std::mem::take(&mut pending.blobs);
        drop(pending);
        let db = Database {
            inner: self.db.clone(),
        };
        for (blob, _) in blobs {
            db.blobs().discard(blob);
        }
    }
}

impl Drop for DbTransaction<'_> {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            if let Ok(rolled_back) = txn.abort() {
                if rolled_back {
                    self.discard_pending();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test"), DatabaseConfig::default()).unwrap();
        (dir, db)
    }

    #[test]
    fn put_get_round_trip() -> anyhow::Result<()> {
        let (_dir, db) = open_db();
        let coll = db.default_collection()?;
        let (rev_id, seq) = coll.put("doc1", &json!({"x": 1}), PutOptions::default())?;
        assert!(rev_id.to_string().starts_with("1-"));
        assert_eq!(seq, 1);
        let mut doc = coll.get_existing("doc1")?;
        let selected = doc.select_current().unwrap();
        assert_eq!(selected.rev_id, rev_id);
        assert_eq!(doc.sequence(), 1);
        assert_eq!(doc.body()?, json!({"x": 1}));
        Ok(())
    }

    #[test]
    fn uuids_survive_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test");
        let db = Database::open(&path, DatabaseConfig::default())?;
        let uuids = db.uuids();
        db.close()?;
        let db = Database::open(&path, DatabaseConfig::default())?;
        assert_eq!(db.uuids(), uuids);
        Ok(())
    }

    #[test]
    fn blob_abort_and_commit() -> anyhow::Result<()> {
        let (_dir, db) = open_db();
        let data = vec![9u8; 64 * 1024];

        let mut txn = db.begin_transaction()?;
        let key = txn.put_blob(&data)?;
        txn.abort()?;
        assert!(matches!(db.blobs().get_contents(&key), Err(Error::NotFound)));

        let mut txn = db.begin_transaction()?;
        let key = txn.put_blob(&data)?;
        txn.commit()?;
        let contents = db.blobs().get_contents(&key)?;
        assert_eq!(contents.len(), data.len());
        assert_eq!(BlobKey::compute(&contents), key);
        Ok(())
    }

    #[test]
    fn observers_fire_after_commit() -> anyhow::Result<()> {
        let (_dir, db) = open_db();
        let coll = db.default_collection()?;
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired2 = fired.clone();
        let token = coll.observe(move || {
            fired2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        coll.put("doc1", &json!({}), PutOptions::default())?;
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        match coll.poll_changes(token, 0, 10) {
            ChangesSince::Changes(changes) => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].doc_id, "doc1");
            }
            ChangesSince::Overflow => panic!("overflow"),
        }
        Ok(())
    }

    #[test]
    fn expiration_purges_and_notifies() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Database::open(
            dir.path().join("test"),
            DatabaseConfig {
                expiration_sweeper: false,
                ..Default::default()
            },
        )?;
        let coll = db.default_collection()?;
        coll.put("doc1", &json!({"x": 1}), PutOptions::default())?;
        coll.set_expiration("doc1", Some(now_ms() - 1000))?;
        let purged = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let purged2 = purged.clone();
        coll.observe_document("doc1", move || {
            purged2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        assert_eq!(coll.purge_expired(now_ms())?, 1);
        assert_eq!(purged.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(matches!(coll.get_existing("doc1"), Err(Error::NotFound)));
        assert_eq!(coll.purge_expired(now_ms())?, 0);
        Ok(())
    }

    #[test]
    fn compact_sweeps_orphan_blobs() -> anyhow::Result<()> {
        let (_dir, db) = open_db();
        let coll = db.default_collection()?;
        let mut txn = db.begin_transaction()?;
        let kept = txn.put_blob(b"kept attachment")?;
        let orphan_key = txn.put_blob(b"orphan attachment")?;
        txn.commit()?;
        coll.put(
            "doc1",
            &json!({"file": crate::body::blob_ref_value(&kept, 15, None)}),
            PutOptions::default(),
        )?;
        db.compact()?;
        assert!(db.blobs().has(&kept));
        assert!(!db.blobs().has(&orphan_key));
        Ok(())
    }

    #[test]
    fn rekey_survives_reopen_with_new_key() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test");
        let db = Database::open(&path, DatabaseConfig::default())?;
        let mut txn = db.begin_transaction()?;
        let blob = txn.put_blob(b"rotated attachment")?;
        txn.commit()?;

        db.rekey(Some(EncryptionKey([9u8; 32])))?;
        assert_eq!(&db.blobs().get_contents(&blob)?[..], b"rotated attachment");
        db.close()?;

        let db = Database::open(
            &path,
            DatabaseConfig {
                encryption_key: Some(EncryptionKey([9u8; 32])),
                ..Default::default()
            },
        )?;
        assert_eq!(&db.blobs().get_contents(&blob)?[..], b"rotated attachment");

        // Rekeying is refused while a transaction is open.
        let txn = db.begin_transaction()?;
        assert!(matches!(db.rekey(None), Err(Error::TransactionNotClosed)));
        txn.abort()?;
        db.rekey(None)?;
        assert_eq!(
            std::fs::read(db.blobs().file_path(&blob))?,
            b"rotated attachment"
        );
        Ok(())
    }

    #[test]
    fn raw_store_round_trip_across_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test");
        let db = Database::open(&path, DatabaseConfig::default())?;
        db.put_raw(CHECKPOINTS_STORE, "cp", b"state")?;
        db.close()?;
        let db = Database::open(&path, DatabaseConfig::default())?;
        assert_eq!(db.get_raw(CHECKPOINTS_STORE, "cp")?.as_deref(), Some(&b"state"[..]));
        Ok(())
    }
}
