//! # File Registry and Writer Gate
//!
//! Every database handle opened on the same filesystem path shares one
//! [`FileState`], found through a process-wide registry. The `FileState` owns
//! the single-writer gate: a mutex-and-condvar protected slot holding the
//! current writer transaction, if any. Readers never touch the gate; they
//! coordinate through the engine's snapshot isolation.
//!
//! ```text
//!  Database #1 ──┐
//!  Database #2 ──┼──► FileState { writer slot, condvar, observers }
//!  Database #3 ──┘         │
//!                          ▼
//!                 at most ONE live writer Transaction per path,
//!                 process-wide
//! ```
//!
//! The `FileState` also carries the two observer registries tied to the file's
//! write lifecycle:
//!
//! - **pre-transaction observers**: fired synchronously before a writer takes
//!   the gate, so live one-shot query enumerators can drain first;
//! - **commit observers**: fired after a successful commit, feeding the
//!   replication actor's continuous changes feed.
//!
//! `FileState`s are created on first open of a path and kept for the life of
//! the process; the registry never shrinks. That is intentional: the gate must
//! survive any close/reopen interleaving.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};

use crate::error::Result;

// =============================================================================
// Observer Contracts
// =============================================================================

/// Implemented by one-shot query enumerators: called synchronously before a
/// writer enters the gate, after which the writer may proceed.
pub trait PreTransactionObserver: Send {
    fn pre_transaction(&mut self);
}

type SharedObserver = Weak<Mutex<dyn PreTransactionObserver>>;
type CommitCallback = Box<dyn Fn() + Send + Sync>;

// =============================================================================
// File State
// =============================================================================

/// Per-path coordination object shared by all database handles on that path.
pub struct FileState {
    /// Token of the transaction currently holding the writer slot.
    writer: Mutex<Option<u64>>,
    cond: Condvar,
    pre_txn_observers: Mutex<Vec<(u64, SharedObserver)>>,
    commit_observers: Mutex<HashMap<u64, CommitCallback>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileState")
            .field("writer", &self.writer.lock().unwrap())
            .finish_non_exhaustive()
    }
}

impl FileState {
    fn new() -> FileState {
        FileState {
            writer: Mutex::new(None),
            cond: Condvar::new(),
            pre_txn_observers: Mutex::new(Vec::new()),
            commit_observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates a unique token (for transactions and observers).
    pub fn new_token(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Acquires the writer slot for `token`, blocking while another writer
    /// holds it. Once the wait resolves, but before `begin` runs, every
    /// pre-transaction observer fires: outstanding one-shot queries drain
    /// while no transaction is open anywhere on the file. If `begin` fails
    /// the slot is not taken.
    pub fn acquire_writer(&self, token: u64, begin: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut slot = self.writer.lock().unwrap();
        while slot.is_some() {
            slot = self.cond.wait(slot).unwrap();
        }
        self.fire_pre_transaction();
        begin()?;
        *slot = Some(token);
        Ok(())
    }

    /// Releases the writer slot held by `token`. `end` (commit/abort/no-op)
    /// runs first; the slot is cleared and a waiter woken regardless of its
    /// outcome, and only then does any error propagate. No caller is ever
    /// left holding the gate on error.
    pub fn release_writer(&self, token: u64, end: impl FnOnce() -> Result<()>) -> Result<()> {
        let result = end();
        let mut slot = self.writer.lock().unwrap();
        debug_assert_eq!(*slot, Some(token), "writer slot released by non-holder");
        *slot = None;
        self.cond.notify_one();
        drop(slot);
        result
    }

    /// Whether a writer currently holds the slot.
    pub fn has_writer(&self) -> bool {
        self.writer.lock().unwrap().is_some()
    }

    // =========================================================================
    // Pre-Transaction Observers
    // =========================================================================

    pub fn add_pre_transaction_observer(
        &self,
        observer: Weak<Mutex<dyn PreTransactionObserver>>,
    ) -> u64 {
        let id = self.new_token();
        self.pre_txn_observers.lock().unwrap().push((id, observer));
        id
    }

    pub fn remove_pre_transaction_observer(&self, id: u64) {
        self.pre_txn_observers
            .lock()
            .unwrap()
            .retain(|(oid, _)| *oid != id);
    }

    /// Fires every live observer synchronously and prunes dead ones. Called by
    /// a writer before it enters the gate.
    pub fn fire_pre_transaction(&self) {
        // Take a snapshot so observers may unregister themselves re-entrantly.
        let observers: Vec<(u64, SharedObserver)> =
            self.pre_txn_observers.lock().unwrap().clone();
        let mut dead = Vec::new();
        for (id, weak) in &observers {
            match weak.upgrade() {
                Some(observer) => observer.lock().unwrap().pre_transaction(),
                None => dead.push(*id),
            }
        }
        if !dead.is_empty() {
            self.pre_txn_observers
                .lock()
                .unwrap()
                .retain(|(id, _)| !dead.contains(id));
        }
    }

    // =========================================================================
    // Commit Observers
    // =========================================================================

    pub fn add_commit_observer(&self, callback: CommitCallback) -> u64 {
        let id = self.new_token();
        self.commit_observers.lock().unwrap().insert(id, callback);
        id
    }

    pub fn remove_commit_observer(&self, id: u64) {
        self.commit_observers.lock().unwrap().remove(&id);
    }

    /// Notifies commit observers that the file changed.
    pub fn notify_commit(&self) {
        let observers = self.commit_observers.lock().unwrap();
        for callback in observers.values() {
            callback();
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

fn registry() -> &'static Mutex<HashMap<PathBuf, Arc<FileState>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<FileState>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the `FileState` for a path, creating it on first use. Paths are
/// normalized to absolute form so relative spellings coordinate correctly.
pub fn for_path(path: &Path) -> Arc<FileState> {
    let normalized = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut map = registry().lock().unwrap();
    Arc::clone(
        map.entry(normalized)
            .or_insert_with(|| Arc::new(FileState::new())),
    )
}

// =============================================================================
// Tests
// =============================================================================
