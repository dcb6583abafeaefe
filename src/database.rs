//! # Databases and Transactions
//!
//! A [`Database`] is one handle on a database file: the engine connection, the
//! default document keystore (a live/dead split store), and a cache of named
//! keystores opened on demand. All handles on the same path share a
//! [`FileState`](crate::registry::FileState), so the single-writer discipline
//! holds process-wide no matter how many handles exist.
//!
//! ## Transactions
//!
//! [`Transaction`] is scoped acquisition of the writer slot. Its disposition
//! starts as commit and can only get weaker: an engine error observed through
//! [`Transaction::check`] flips it to abort before propagating, so a partially
//! applied transaction cannot commit. Dropping the transaction releases the
//! slot and applies whatever the disposition is by then; constructing it with
//! `begin = false` takes the slot without starting an engine transaction, for
//! callers that only need mutual exclusion (delete-database).
//!
//! [`ReadOnlyTransaction`] grants a read snapshot without touching the writer
//! slot; the query layer uses it so `last_sequence` and the query execution
//! observe the same committed state.
//!
//! ## Deleted Handles
//!
//! `delete_database` closes the handle and nulls it out; every later operation
//! fails with [`Error::NotOpen`]. The `FileState` survives, on purpose.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use tracing::warn;

use crate::both::BothKeyStore;
use crate::codec::SharedKeys;
use crate::engine::{EngineFile, EngineInfo, LOG_READ_NOT_FOUND};
use crate::error::{Error, Result};
use crate::keystore::{ContentOption, DocumentFlags, EnumeratorOptions, KeyStore, KvStore, SortOption};
use crate::registry::{self, FileState};

/// Name of the live half of the default document store.
const LIVE_STORE: &str = "docs";
/// Name of the dead (tombstone) half; shares the live half's sequences.
const DEAD_STORE: &str = "del_docs";

const META_PUBLIC_UUID: &str = "publicUUID";
const META_PRIVATE_UUID: &str = "privateUUID";
const META_SHARED_KEYS: &str = "sharedKeys";

// =============================================================================
// Configuration
// =============================================================================

/// Open-time configuration for a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub read_only: bool,
    /// Upper bound on revision-history depth served to replicators.
    pub max_rev_tree_depth: u32,
    /// When set, registered for the path before open so record values are
    /// encrypted at rest.
    pub encryption_key: Option<[u8; 32]>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            read_only: false,
            max_rev_tree_depth: 20,
            encryption_key: None,
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// One open handle on a database file.
pub struct Database {
    path: PathBuf,
    config: DatabaseConfig,
    file: Arc<FileState>,
    engine: Mutex<Option<Arc<EngineFile>>>,
    stores: Mutex<HashMap<String, Arc<KvStore>>>,
    default_store: Mutex<Option<Arc<BothKeyStore>>>,
    doc_keys: Arc<SharedKeys>,
    doc_keys_persisted: Mutex<usize>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Database {
    /// Opens a database, creating the file if needed.
    pub fn open(path: &Path, config: DatabaseConfig) -> Result<Database> {
        if let Some(key) = config.encryption_key {
            crate::crypto::register_encryption_key(path, key);
        }
        let file = registry::for_path(path);
        let db = Database {
            path: path.to_path_buf(),
            config,
            file,
            engine: Mutex::new(None),
            stores: Mutex::new(HashMap::new()),
            default_store: Mutex::new(None),
            doc_keys: SharedKeys::new(),
            doc_keys_persisted: Mutex::new(0),
        };
        db.reopen()?;
        Ok(db)
    }

    fn reopen(&self) -> Result<()> {
        if let Some(key) = self.config.encryption_key {
            crate::crypto::register_encryption_key(&self.path, key);
        }
        let engine = Arc::new(EngineFile::open(&self.path, self.config.read_only)?);

        // Silence read-not-found: versioned documents trigger it when probing
        // for revisions that are gone. Everything else is worth a warning,
        // tagged with the handle for correlation.
        let handle = Arc::as_ptr(&engine) as usize;
        engine.set_log_callback(Box::new(move |code, message| {
            if code == LOG_READ_NOT_FOUND {
                return;
            }
            warn!("engine error {code}: {message} (handle={handle:#x})");
        }));

        if !self.config.read_only {
            engine.open_keystore(LIVE_STORE, None)?;
            engine.open_keystore(DEAD_STORE, Some(LIVE_STORE))?;
            if engine.get_meta(META_PRIVATE_UUID)?.is_none() {
                let mut uuid = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut uuid);
                engine.put_meta(META_PUBLIC_UUID, &uuid)?;
                rand::thread_rng().fill_bytes(&mut uuid);
                engine.put_meta(META_PRIVATE_UUID, &uuid)?;
            }
        }

        // Reload the persisted document shared-keys table.
        if let Some(raw) = engine.get_meta(META_SHARED_KEYS)? {
            let keys: Vec<String> = serde_json::from_slice(&raw)
                .map_err(|e| Error::Codec(format!("bad shared-keys metadata: {e}")))?;
            if self.doc_keys.is_empty() {
                self.doc_keys.preload(&keys);
            }
            *self.doc_keys_persisted.lock().unwrap() = self.doc_keys.len();
        }

        *self.engine.lock().unwrap() = Some(engine);
        Ok(())
    }

    /// The engine handle; [`Error::NotOpen`] once the database was deleted.
    pub(crate) fn engine(&self) -> Result<Arc<EngineFile>> {
        self.engine.lock().unwrap().clone().ok_or(Error::NotOpen)
    }

    pub(crate) fn file(&self) -> &Arc<FileState> {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filename(&self) -> Result<String> {
        Ok(self.engine()?.info()?.filename)
    }

    pub fn get_info(&self) -> Result<EngineInfo> {
        self.engine()?.info()
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    pub fn max_rev_tree_depth(&self) -> u32 {
        self.config.max_rev_tree_depth
    }

    /// The shared-keys table document bodies are encoded with. Persisted at
    /// commit time and reloaded on open.
    pub fn document_keys(&self) -> Arc<SharedKeys> {
        Arc::clone(&self.doc_keys)
    }

    /// The database's (public, private) UUIDs.
    pub fn uuids(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let engine = self.engine()?;
        let public = engine.get_meta(META_PUBLIC_UUID)?.ok_or(Error::NotFound)?;
        let private = engine.get_meta(META_PRIVATE_UUID)?.ok_or(Error::NotFound)?;
        Ok((public, private))
    }

    // =========================================================================
    // KeyStores
    // =========================================================================

    /// The default document store: live and tombstoned documents behind one
    /// merged surface.
    pub fn default_keystore(&self) -> Result<Arc<BothKeyStore>> {
        let mut slot = self.default_store.lock().unwrap();
        if let Some(store) = slot.as_ref() {
            return Ok(Arc::clone(store));
        }
        let live = self.open_keystore(LIVE_STORE)?;
        let dead = self.open_keystore_sharing(DEAD_STORE, LIVE_STORE)?;
        let store = Arc::new(BothKeyStore::new(live, dead));
        *slot = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Opens a named keystore, caching the handle; repeated lookups return the
    /// same handle.
    pub fn open_keystore(&self, name: &str) -> Result<Arc<KvStore>> {
        self.open_keystore_inner(name, None)
    }

    fn open_keystore_sharing(&self, name: &str, seq_owner: &str) -> Result<Arc<KvStore>> {
        self.open_keystore_inner(name, Some(seq_owner))
    }

    fn open_keystore_inner(&self, name: &str, seq_owner: Option<&str>) -> Result<Arc<KvStore>> {
        let mut stores = self.stores.lock().unwrap();
        if let Some(store) = stores.get(name) {
            return Ok(Arc::clone(store));
        }
        let engine = self.engine()?;
        if !self.config.read_only {
            engine.open_keystore(name, seq_owner)?;
        }
        let store = Arc::new(KvStore::new(
            Arc::clone(&engine),
            name,
            seq_owner.unwrap_or(name),
        ));
        stores.insert(name.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Closes (uncaches) a keystore handle.
    pub fn close_keystore(&self, name: &str) -> Result<()> {
        self.stores.lock().unwrap().remove(name);
        Ok(())
    }

    /// Closes a keystore and removes its data from the file.
    pub fn delete_keystore(&self, name: &str) -> Result<()> {
        self.close_keystore(name)?;
        self.engine()?.delete_keystore(name)
    }

    /// True iff the cache maps the store's name to this same handle.
    pub fn contains(&self, store: &Arc<KvStore>) -> bool {
        self.stores
            .lock()
            .unwrap()
            .get(store.name())
            .is_some_and(|cached| Arc::ptr_eq(cached, store))
    }

    // =========================================================================
    // Raw Documents
    // =========================================================================

    /// Reads a raw document (meta + body) from a named store. `None` when the
    /// store or document does not exist.
    pub fn get_raw(&self, store_name: &str, key: &[u8]) -> Result<Option<RawDocument>> {
        let store = self.open_keystore(store_name)?;
        Ok(store.get(key, ContentOption::WithBody)?.map(|rec| RawDocument {
            key: rec.key,
            meta: rec.version,
            body: rec.value,
        }))
    }

    /// Writes a raw document under a write transaction.
    pub fn put_raw(
        &self,
        txn: &mut Transaction<'_>,
        store_name: &str,
        key: &[u8],
        meta: &[u8],
        body: &[u8],
    ) -> Result<()> {
        let store = self.open_keystore(store_name)?;
        store.set(txn, key, meta, body, DocumentFlags::NONE, None, true)?;
        Ok(())
    }

    // =========================================================================
    // Mutating Operations
    // =========================================================================

    /// Flushes committed state durably to disk.
    pub fn commit(&self) -> Result<()> {
        self.engine()?.execute_raw("PRAGMA wal_checkpoint(FULL)")
    }

    /// Compacts the file in place.
    pub fn compact(&self) -> Result<()> {
        self.engine()?.compact()
    }

    /// Copies the whole file, optionally re-encrypting for the target.
    pub fn copy_to_file(&self, dst: &Path, encryption_key: Option<[u8; 32]>) -> Result<()> {
        self.engine()?.copy_to_file(dst, encryption_key)
    }

    /// Deletes the database's file. Holds the writer gate (without beginning
    /// an engine transaction) so no writer races the teardown, closes and
    /// nulls the handles, re-registers the encryption key (destroy reopens the
    /// file internally), destroys the path, and optionally reopens.
    pub fn delete_database(&self, and_reopen: bool) -> Result<()> {
        let txn = Transaction::with_begin(self, false)?;

        self.stores.lock().unwrap().clear();
        *self.default_store.lock().unwrap() = None;
        *self.engine.lock().unwrap() = None;

        if let Some(key) = self.config.encryption_key {
            crate::crypto::register_encryption_key(&self.path, key);
        }
        EngineFile::destroy(&self.path)?;
        if and_reopen {
            self.reopen()?;
        }
        drop(txn);
        Ok(())
    }

    /// Persists any newly interned document keys; returns the new table size
    /// for the post-commit watermark.
    fn stage_document_keys(&self, engine: &EngineFile) -> Result<usize> {
        let persisted = *self.doc_keys_persisted.lock().unwrap();
        let total = self.doc_keys.len();
        if total > persisted {
            let all = self.doc_keys.entries_from(0);
            let raw = serde_json::to_vec(&all)
                .map_err(|e| Error::Codec(format!("cannot serialize shared keys: {e}")))?;
            engine.put_meta(META_SHARED_KEYS, &raw)?;
        }
        Ok(total)
    }
}

/// A raw document: opaque meta and body bytes under a key.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub key: Vec<u8>,
    pub meta: Vec<u8>,
    pub body: Vec<u8>,
}

// =============================================================================
// Transactions
// =============================================================================

/// Final disposition of a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Commit,
    Abort,
    NoOp,
}

/// Scoped ownership of the file's writer slot.
///
/// Move-only by construction; the slot is released exactly once, either by
/// [`commit`](Transaction::commit)/[`end`](Transaction::end) or on drop.
pub struct Transaction<'db> {
    db: &'db Database,
    state: TransactionState,
    token: u64,
    ended: bool,
}

impl<'db> Transaction<'db> {
    /// Acquires the writer slot and begins an engine transaction. Blocks
    /// while another transaction holds the slot, on any handle to this path.
    pub fn new(db: &'db Database) -> Result<Transaction<'db>> {
        Transaction::with_begin(db, true)
    }

    /// Acquires the writer slot; with `begin = false` no engine transaction
    /// starts and the disposition is no-op (pure mutual exclusion).
    pub fn with_begin(db: &'db Database, begin: bool) -> Result<Transaction<'db>> {
        let engine = db.engine()?;

        // Acquiring the slot also fires pre-transaction observers, draining
        // any live one-shot query enumerators before `begin` runs.
        let token = db.file().new_token();
        db.file().acquire_writer(token, || {
            if begin {
                engine.begin_transaction()
            } else {
                Ok(())
            }
        })?;
        Ok(Transaction {
            db,
            state: if begin {
                TransactionState::Commit
            } else {
                TransactionState::NoOp
            },
            token,
            ended: false,
        })
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Downgrades the disposition to abort; the engine transaction will be
    /// rolled back at scope exit.
    pub fn abort(&mut self) {
        self.state = TransactionState::Abort;
    }

    /// Routes an engine result through the transaction: an error flips the
    /// disposition to abort before propagating.
    pub fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.state = TransactionState::Abort;
        }
        result
    }

    /// Ends the transaction explicitly, surfacing any commit error.
    pub fn commit(mut self) -> Result<()> {
        self.end()
    }

    fn end(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;

        let engine = self.db.engine.lock().unwrap().clone();
        let state = self.state;
        let db = self.db;

        let mut keys_total = None;
        let result = db.file().release_writer(self.token, || match (state, &engine) {
            (TransactionState::Commit, Some(engine)) => {
                keys_total = Some(db.stage_document_keys(engine)?);
                engine.commit_transaction()
            }
            (TransactionState::Abort, Some(engine)) => {
                // The rollback's own status is ignored, like the engine's
                // abort path; the original failure is what matters.
                let _ = engine.abort_transaction();
                Ok(())
            }
            _ => Ok(()),
        });

        if result.is_ok() && state == TransactionState::Commit {
            if let Some(total) = keys_total {
                *db.doc_keys_persisted.lock().unwrap() = total;
            }
            db.file().notify_commit();
        }
        result
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.ended {
            if let Err(err) = self.end() {
                warn!("transaction failed to end cleanly: {err}");
            }
        }
    }
}

/// A read snapshot against the file, without touching the writer slot.
pub struct ReadOnlyTransaction {
    engine: Arc<EngineFile>,
    began: bool,
}

impl ReadOnlyTransaction {
    pub fn new(db: &Database) -> Result<ReadOnlyTransaction> {
        ReadOnlyTransaction::for_engine(db.engine()?)
    }

    pub(crate) fn for_engine(engine: Arc<EngineFile>) -> Result<ReadOnlyTransaction> {
        let began = engine.begin_read()?;
        Ok(ReadOnlyTransaction { engine, began })
    }
}

impl Drop for ReadOnlyTransaction {
    fn drop(&mut self) {
        if self.began {
            if let Err(err) = self.engine.end_read() {
                warn!("read snapshot failed to end cleanly: {err}");
            }
        }
    }
}

// =============================================================================
// Change Observation
// =============================================================================

/// One observed change: a document, its current revision, and the sequence the
/// change landed at.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeInfo {
    pub doc_id: Vec<u8>,
    pub rev_id: Vec<u8>,
    pub sequence: u64,
    pub deleted: bool,
}

/// Watches the default document store for committed changes.
///
/// The callback fires (synchronously, on the committer's thread) after each
/// commit on the file; [`changes`](DatabaseObserver::changes) then drains what
/// happened since the last drain, up to a batch limit.
pub struct DatabaseObserver {
    file: Arc<FileState>,
    store: Arc<BothKeyStore>,
    observer_id: u64,
    last_seq: Mutex<u64>,
}

impl DatabaseObserver {
    pub fn new(db: &Database, callback: Box<dyn Fn() + Send + Sync>) -> Result<DatabaseObserver> {
        let store = db.default_keystore()?;
        let last_seq = store.last_sequence()?;
        let observer_id = db.file().add_commit_observer(callback);
        Ok(DatabaseObserver {
            file: Arc::clone(db.file()),
            store,
            observer_id,
            last_seq: Mutex::new(last_seq),
        })
    }

    /// Drains up to `max` changes past the watermark, advancing it.
    pub fn changes(&self, max: usize) -> Result<Vec<ChangeInfo>> {
        let mut last_seq = self.last_seq.lock().unwrap();
        let mut enumerator = self.store.enumerate_by_sequence(
            *last_seq,
            EnumeratorOptions {
                include_deleted: true,
                sort: SortOption::Ascending,
                content: ContentOption::MetaOnly,
            },
        )?;

        let mut changes = Vec::new();
        while changes.len() < max && enumerator.next() {
            let record = enumerator.record();
            changes.push(ChangeInfo {
                doc_id: record.key.clone(),
                rev_id: record.version.clone(),
                sequence: record.sequence,
                deleted: record.flags.is_deleted(),
            });
            *last_seq = record.sequence;
        }
        Ok(changes)
    }
}

impl Drop for DatabaseObserver {
    fn drop(&mut self) {
        self.file.remove_commit_observer(self.observer_id);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("db.roost"), DatabaseConfig::default()).unwrap();
        (dir, db)
    }

    #[test]
    fn test_open_creates_uuids() {
        let (_dir, db) = open_temp();
        let (public, private) = db.uuids().unwrap();
        assert_eq!(public.len(), 16);
        assert_eq!(private.len(), 16);
        assert_ne!(public, private);
    }

    #[test]
    fn test_keystore_cache_returns_same_handle() {
        let (_dir, db) = open_temp();
        let a = db.open_keystore("checkpoints").unwrap();
        let b = db.open_keystore("checkpoints").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(db.contains(&a));

        db.close_keystore("checkpoints").unwrap();
        assert!(!db.contains(&a));
        let c = db.open_keystore("checkpoints").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_transaction_commit_persists() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        let mut txn = Transaction::new(&db).unwrap();
        let seq = store
            .set(&mut txn, b"doc1", b"1-aa", b"body", DocumentFlags::NONE, None, true)
            .unwrap();
        assert_eq!(seq, 1);
        txn.commit().unwrap();

        let rec = store.get(b"doc1", ContentOption::WithBody).unwrap().unwrap();
        assert_eq!(rec.value, b"body");
    }

    #[test]
    fn test_transaction_abort_rolls_back() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        let mut txn = Transaction::new(&db).unwrap();
        store
            .set(&mut txn, b"doc1", b"1-aa", b"body", DocumentFlags::NONE, None, true)
            .unwrap();
        txn.abort();
        drop(txn);

        assert!(store.get(b"doc1", ContentOption::MetaOnly).unwrap().is_none());
    }

    #[test]
    fn test_check_flips_disposition_to_abort() {
        let (_dir, db) = open_temp();
        let mut txn = Transaction::new(&db).unwrap();
        assert_eq!(txn.state(), TransactionState::Commit);

        let result: Result<()> = txn.check(Err(Error::NotFound));
        assert!(result.is_err());
        assert_eq!(txn.state(), TransactionState::Abort);
    }

    #[test]
    fn test_delete_database_marks_not_open() {
        let (_dir, db) = open_temp();
        db.delete_database(false).unwrap();
        assert!(matches!(db.filename(), Err(Error::NotOpen)));
        assert!(matches!(db.open_keystore("x"), Err(Error::NotOpen)));
    }

    #[test]
    fn test_delete_database_and_reopen_is_empty() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();
        let mut txn = Transaction::new(&db).unwrap();
        store
            .set(&mut txn, b"doc1", b"1-aa", b"body", DocumentFlags::NONE, None, true)
            .unwrap();
        txn.commit().unwrap();
        drop(store);

        db.delete_database(true).unwrap();
        let store = db.default_keystore().unwrap();
        assert_eq!(store.record_count(true).unwrap(), 0);
        assert!(store.get(b"doc1", ContentOption::MetaOnly).unwrap().is_none());
    }

    #[test]
    fn test_raw_documents() {
        let (_dir, db) = open_temp();
        assert!(db.get_raw("checkpoints", b"cp-1").unwrap().is_none());

        let mut txn = Transaction::new(&db).unwrap();
        db.put_raw(&mut txn, "checkpoints", b"cp-1", b"1-cc", b"progress").unwrap();
        txn.commit().unwrap();

        let doc = db.get_raw("checkpoints", b"cp-1").unwrap().unwrap();
        assert_eq!(doc.meta, b"1-cc");
        assert_eq!(doc.body, b"progress");
    }

    #[test]
    fn test_observer_sees_committed_changes() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let observer = {
            let fired = Arc::clone(&fired);
            DatabaseObserver::new(
                &db,
                Box::new(move || {
                    fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }),
            )
            .unwrap()
        };

        let mut txn = Transaction::new(&db).unwrap();
        store
            .set(&mut txn, b"doc1", b"1-aa", b"v", DocumentFlags::NONE, None, true)
            .unwrap();
        store
            .set(&mut txn, b"doc2", b"1-bb", b"v", DocumentFlags::NONE, None, true)
            .unwrap();
        txn.commit().unwrap();

        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        let changes = observer.changes(100).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].doc_id, b"doc1");
        assert_eq!(changes[0].rev_id, b"1-aa");
        assert_eq!(changes[1].sequence, 2);

        // Watermark advanced; nothing new to drain.
        assert!(observer.changes(100).unwrap().is_empty());
    }

    #[test]
    fn test_shared_keys_persist_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db.roost");
        {
            let db = Database::open(&path, DatabaseConfig::default()).unwrap();
            db.document_keys().encode("title");
            db.document_keys().encode("author");
            let txn = Transaction::new(&db).unwrap();
            txn.commit().unwrap();
        }
        let db = Database::open(&path, DatabaseConfig::default()).unwrap();
        let keys = db.document_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.decode(0).as_deref(), Some("title"));
        assert_eq!(keys.decode(1).as_deref(), Some("author"));
    }
}
