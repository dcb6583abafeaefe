//! # Replication Database Actor
//!
//! [`DbActor`] owns all database access for one peer connection. It is
//! single-threaded by construction: a dedicated thread drains a mailbox one
//! message at a time, so the insertion queue, the change observer, and the
//! memoized checkpoint id are touched from exactly one place and need no
//! locks. Public methods only enqueue.
//!
//! ```text
//!  handlers / pusher / timers          actor thread
//!  ───────────────────────────        ─────────────────────────────
//!  get_changes(...) ──► mailbox ──►   read changes, install observer
//!  insert_revision() ─► mailbox ──►   queue rev, debounce flush
//!  commit observer ───► mailbox ──►   drain observer, push to pusher
//! ```
//!
//! ## Insert Batching
//!
//! Incoming revisions accumulate in a queue. The first queued revision arms a
//! [`INSERTION_DELAY`] timer; hitting [`MAX_REVS_TO_INSERT`] flushes
//! immediately. A flush drains the whole queue inside a single transaction,
//! reporting per-revision outcomes through each revision's callback; one bad
//! revision does not stop the rest of the batch. The timer/threshold pair
//! bounds both latency and per-transaction work.
//!
//! ## Checkpoints
//!
//! Local replication progress is stored under the `checkpoints` raw store,
//! keyed by `cp-<base64(SHA1(encode([privateUUID, remoteAddress])))>`. Peer
//! checkpoints live under `peerCheckpoints`, keyed by the peer's `client`
//! property, with a `<generation>-cc` revision rolled forward on every store.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use base64::Engine as _;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::both::BothKeyStore;
use crate::codec::{Encoder, Value};
use crate::database::{ChangeInfo, Database, DatabaseObserver, Transaction};
use crate::error::{Error, Result};
use crate::keystore::{ContentOption, EnumeratorOptions, KeyStore, SortOption};
use crate::revtree::{put_existing_revision, VersionedDoc};
use crate::transport::{
    MessageBuilder, MessageIn, MessageSink, ProgressCallback, BLIP_DOMAIN, HTTP_DOMAIN,
};

/// Raw store holding this side's own replication checkpoints.
pub const LOCAL_CHECKPOINT_STORE: &str = "checkpoints";
/// Raw store holding checkpoints saved on behalf of peers.
pub const PEER_CHECKPOINT_STORE: &str = "peerCheckpoints";

/// How long queued revisions wait for company before a flush.
pub const INSERTION_DELAY: Duration = Duration::from_millis(20);
/// Queue size that triggers an immediate flush.
pub const MAX_REVS_TO_INSERT: usize = 100;
/// Bodies at least this large are flagged for wire compression.
pub const MIN_BODY_SIZE_TO_COMPRESS: usize = 500;
/// Cap on ancestor revisions offered per requested revision.
pub const MAX_POSSIBLE_ANCESTORS: usize = 10;

/// Changes drained from the observer per batch.
const MAX_OBSERVED_CHANGES: usize = 100;

// =============================================================================
// Replication Types
// =============================================================================

/// A change-feed entry: one document revision at a sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Rev {
    pub doc_id: Vec<u8>,
    pub rev_id: String,
    pub sequence: u64,
    pub deleted: bool,
}

impl From<ChangeInfo> for Rev {
    fn from(change: ChangeInfo) -> Rev {
        Rev {
            doc_id: change.doc_id,
            rev_id: String::from_utf8_lossy(&change.rev_id).into_owned(),
            sequence: change.sequence,
            deleted: change.deleted,
        }
    }
}

/// Callback reporting the outcome of one revision insert.
pub type InsertedCallback = Box<dyn FnOnce(Option<&Error>) + Send>;

/// An incoming revision queued for batched insertion.
pub struct RevToInsert {
    pub doc_id: Vec<u8>,
    pub rev_id: String,
    /// Comma-separated ancestor revision ids, newest first, excluding
    /// `rev_id` itself.
    pub history: String,
    /// The revision body as JSON text, the way it arrives on the wire; it is
    /// re-encoded into binary document form on insert. Empty for tombstones.
    pub body: Vec<u8>,
    pub deleted: bool,
    pub on_inserted: Option<InsertedCallback>,
}

/// A request to send one revision to the peer.
#[derive(Debug, Clone)]
pub struct RevRequest {
    pub doc_id: Vec<u8>,
    pub rev_id: String,
    pub sequence: u64,
    /// Revisions the peer is known to have; history stops at the first match.
    pub ancestor_rev_ids: Vec<String>,
    /// Upper bound on history length.
    pub max_history: u32,
}

/// Receives batches from the changes feed (the pusher side of replication).
pub trait ChangesListener: Send + Sync {
    fn got_changes(&self, changes: Vec<Rev>, error: Option<Error>);
}

/// Callback for local checkpoint reads: (checkpoint id, body, error).
pub type CheckpointCallback = Box<dyn FnOnce(Vec<u8>, Vec<u8>, Option<Error>) + Send>;

// =============================================================================
// Mailbox
// =============================================================================

enum DbMessage {
    GetCheckpoint {
        callback: CheckpointCallback,
    },
    SetCheckpoint {
        body: Vec<u8>,
        on_complete: Box<dyn FnOnce() + Send>,
    },
    Request(MessageIn),
    GetChanges {
        since: u64,
        limit: usize,
        continuous: bool,
        pusher: Arc<dyn ChangesListener>,
    },
    DbChanged,
    FindOrRequestRevs {
        request: MessageIn,
        callback: Option<Box<dyn FnOnce(Vec<String>) + Send>>,
    },
    SendRevision {
        request: RevRequest,
        on_progress: Option<ProgressCallback>,
    },
    InsertRevision(RevToInsert),
    Stop,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle to a running replication actor. All methods enqueue into the
/// actor's mailbox and return immediately.
pub struct DbActor {
    tx: mpsc::UnboundedSender<DbMessage>,
    thread: Option<JoinHandle<()>>,
}

impl DbActor {
    /// Spawns the actor on its own thread, taking ownership of the database
    /// handle.
    pub fn spawn(
        db: Database,
        sink: Arc<dyn MessageSink>,
        remote_address: impl Into<String>,
    ) -> DbActor {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = DbActorState {
            db,
            sink,
            remote_address: remote_address.into(),
            checkpoint_doc_id: None,
            revs_to_insert: Vec::new(),
            pusher: None,
            change_observer: None,
            self_tx: tx.clone(),
        };

        let thread = std::thread::Builder::new()
            .name("roostdb-repl".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .expect("failed to create replicator runtime");
                rt.block_on(run_db_actor(state, rx));
            })
            .expect("failed to spawn replicator thread");

        DbActor {
            tx,
            thread: Some(thread),
        }
    }

    /// Reads the local checkpoint; absence is an empty body, not an error.
    pub fn get_checkpoint(&self, callback: CheckpointCallback) {
        let _ = self.tx.send(DbMessage::GetCheckpoint { callback });
    }

    /// Stores the local checkpoint.
    pub fn set_checkpoint(&self, body: Vec<u8>, on_complete: Box<dyn FnOnce() + Send>) {
        let _ = self.tx.send(DbMessage::SetCheckpoint { body, on_complete });
    }

    /// Dispatches an inbound peer message (`getCheckpoint` / `setCheckpoint`).
    pub fn handle_message(&self, request: MessageIn) {
        let _ = self.tx.send(DbMessage::Request(request));
    }

    /// Requests a batch of changes after `since`; with `continuous`, keeps
    /// feeding the pusher as further commits land.
    pub fn get_changes(
        &self,
        since: u64,
        limit: usize,
        continuous: bool,
        pusher: Arc<dyn ChangesListener>,
    ) {
        let _ = self.tx.send(DbMessage::GetChanges {
            since,
            limit,
            continuous,
            pusher,
        });
    }

    /// Answers a peer's `changes` message: which revisions we want, and the
    /// known ancestors for each.
    pub fn find_or_request_revs(
        &self,
        request: MessageIn,
        callback: Option<Box<dyn FnOnce(Vec<String>) + Send>>,
    ) {
        let _ = self.tx.send(DbMessage::FindOrRequestRevs { request, callback });
    }

    /// Sends one revision to the peer as a `rev` message.
    pub fn send_revision(&self, request: RevRequest, on_progress: Option<ProgressCallback>) {
        let _ = self.tx.send(DbMessage::SendRevision {
            request,
            on_progress,
        });
    }

    /// Queues an incoming revision for batched insertion.
    pub fn insert_revision(&self, rev: RevToInsert) {
        let _ = self.tx.send(DbMessage::InsertRevision(rev));
    }

    /// Stops the actor, flushing any queued revisions first.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(DbMessage::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DbActor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_db_actor(mut state: DbActorState, mut rx: mpsc::UnboundedReceiver<DbMessage>) {
    let mut flush_deadline: Option<tokio::time::Instant> = None;

    loop {
        let message = match flush_deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(message) => message,
                Err(_) => {
                    state.insert_revisions_now();
                    flush_deadline = None;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match message {
            Some(DbMessage::InsertRevision(rev)) => {
                state.revs_to_insert.push(rev);
                if state.revs_to_insert.len() >= MAX_REVS_TO_INSERT {
                    state.insert_revisions_now();
                    flush_deadline = None;
                } else if state.revs_to_insert.len() == 1 {
                    flush_deadline = Some(tokio::time::Instant::now() + INSERTION_DELAY);
                }
            }
            Some(DbMessage::GetCheckpoint { callback }) => state.get_checkpoint(callback),
            Some(DbMessage::SetCheckpoint { body, on_complete }) => {
                state.set_checkpoint(body, on_complete)
            }
            Some(DbMessage::Request(request)) => state.dispatch(request),
            Some(DbMessage::GetChanges {
                since,
                limit,
                continuous,
                pusher,
            }) => state.get_changes(since, limit, continuous, pusher),
            Some(DbMessage::DbChanged) => state.db_changed(),
            Some(DbMessage::FindOrRequestRevs { request, callback }) => {
                state.find_or_request_revs(request, callback)
            }
            Some(DbMessage::SendRevision {
                request,
                on_progress,
            }) => state.send_revision(request, on_progress),
            Some(DbMessage::Stop) | None => {
                state.insert_revisions_now();
                break;
            }
        }
    }
}

// =============================================================================
// Actor State
// =============================================================================

struct DbActorState {
    db: Database,
    sink: Arc<dyn MessageSink>,
    remote_address: String,
    checkpoint_doc_id: Option<String>,
    revs_to_insert: Vec<RevToInsert>,
    pusher: Option<Arc<dyn ChangesListener>>,
    change_observer: Option<DatabaseObserver>,
    self_tx: mpsc::UnboundedSender<DbMessage>,
}

impl DbActorState {
    /// Hook for errors that have no message to answer; they end up in the log.
    fn got_error(&self, error: &Error) {
        warn!("replicator database error: {error}");
    }

    fn documents(&self) -> Result<Arc<BothKeyStore>> {
        self.db.default_keystore()
    }

    // =========================================================================
    // Checkpoints (local)
    // =========================================================================

    /// The id of this replication's local checkpoint document, derived from
    /// the database's private UUID and the remote address. Memoized.
    fn effective_checkpoint_doc_id(&mut self) -> Result<String> {
        if let Some(id) = &self.checkpoint_doc_id {
            return Ok(id.clone());
        }
        let (_public, private) = self.db.uuids()?;
        let mut enc = Encoder::new();
        enc.begin_array();
        enc.write_string(&private);
        enc.write_string(self.remote_address.as_bytes());
        enc.end_array()?;
        let digest = Sha1::digest(enc.finish()?);
        let id = format!(
            "cp-{}",
            base64::engine::general_purpose::STANDARD.encode(digest)
        );
        self.checkpoint_doc_id = Some(id.clone());
        Ok(id)
    }

    fn get_checkpoint(&mut self, callback: CheckpointCallback) {
        let id = match self.effective_checkpoint_doc_id() {
            Ok(id) => id,
            Err(err) => return callback(Vec::new(), Vec::new(), Some(err)),
        };
        match self.db.get_raw(LOCAL_CHECKPOINT_STORE, id.as_bytes()) {
            Ok(Some(doc)) => callback(id.into_bytes(), doc.body, None),
            // Not-found is not an error; report an empty body.
            Ok(None) => callback(id.into_bytes(), Vec::new(), None),
            Err(err) => callback(id.into_bytes(), Vec::new(), Some(err)),
        }
    }

    fn set_checkpoint(&mut self, body: Vec<u8>, on_complete: Box<dyn FnOnce() + Send>) {
        let result = (|| -> Result<String> {
            let id = self.effective_checkpoint_doc_id()?;
            let mut txn = Transaction::new(&self.db)?;
            self.db
                .put_raw(&mut txn, LOCAL_CHECKPOINT_STORE, id.as_bytes(), b"", &body)?;
            txn.commit()?;
            Ok(id)
        })();
        match result {
            Ok(id) => info!("saved local checkpoint {id} to db"),
            Err(err) => self.got_error(&err),
        }
        on_complete();
    }

    // =========================================================================
    // Checkpoints (peer)
    // =========================================================================

    fn dispatch(&mut self, request: MessageIn) {
        match request.name() {
            "getCheckpoint" => self.handle_get_checkpoint(request),
            "setCheckpoint" => self.handle_set_checkpoint(request),
            other => {
                warn!("no handler for '{other}' message");
                request.respond_with_error(BLIP_DOMAIN, 404);
            }
        }
    }

    /// Looks up the peer checkpoint doc named by the request's `client`
    /// property. `None` means a response was already sent.
    fn get_peer_checkpoint_doc(
        &self,
        request: &MessageIn,
        getting: bool,
    ) -> Option<(String, Option<crate::database::RawDocument>)> {
        let client = match request.property("client") {
            Some(client) if !client.is_empty() => client.to_string(),
            _ => {
                request.respond_with_error(BLIP_DOMAIN, 400);
                return None;
            }
        };
        info!(
            "request to {} checkpoint '{client}'",
            if getting { "get" } else { "set" }
        );

        match self.db.get_raw(PEER_CHECKPOINT_STORE, client.as_bytes()) {
            Ok(Some(doc)) => Some((client, Some(doc))),
            Ok(None) if getting => {
                request.respond_with_error(HTTP_DOMAIN, 404);
                None
            }
            // Absence is fine when storing; there's just no rev to match.
            Ok(None) => Some((client, None)),
            Err(_) => {
                request.respond_with_error(HTTP_DOMAIN, 502);
                None
            }
        }
    }

    fn handle_get_checkpoint(&mut self, request: MessageIn) {
        let Some((_client, Some(doc))) = self.get_peer_checkpoint_doc(&request, true) else {
            return;
        };
        let response = MessageBuilder::new("")
            .property("rev", String::from_utf8_lossy(&doc.meta).into_owned())
            .body(doc.body);
        request.respond(response);
    }

    fn handle_set_checkpoint(&mut self, request: MessageIn) {
        let mut txn = match Transaction::new(&self.db) {
            Ok(txn) => txn,
            Err(_) => return request.respond_with_error(HTTP_DOMAIN, 502),
        };

        // Read the existing doc under the transaction so its rev can't move
        // underneath the compare-and-store.
        let Some((client, doc)) = self.get_peer_checkpoint_doc(&request, false) else {
            txn.abort();
            return;
        };

        let actual_rev = doc
            .map(|d| String::from_utf8_lossy(&d.meta).into_owned())
            .unwrap_or_default();
        if request.property("rev").unwrap_or("") != actual_rev {
            txn.abort();
            return request.respond_with_error(HTTP_DOMAIN, 409);
        }

        // The generation is the decimal prefix of the stored rev; a malformed
        // rev parses as generation 0 and rolls forward to 1-cc.
        let generation = crate::revtree::generation(&actual_rev);
        let new_rev = format!("{}-cc", generation + 1);

        if self
            .db
            .put_raw(
                &mut txn,
                PEER_CHECKPOINT_STORE,
                client.as_bytes(),
                new_rev.as_bytes(),
                request.body(),
            )
            .is_err()
            || txn.commit().is_err()
        {
            return request.respond_with_error(HTTP_DOMAIN, 502);
        }

        request.respond(MessageBuilder::new("").property("rev", new_rev));
    }

    // =========================================================================
    // Changes Feed
    // =========================================================================

    fn get_changes(
        &mut self,
        since: u64,
        limit: usize,
        continuous: bool,
        pusher: Arc<dyn ChangesListener>,
    ) {
        info!("reading {limit} local changes from {since}");
        let mut changes = Vec::new();
        let mut error = None;

        match self.read_changes(since, limit) {
            Ok(read) => changes = read,
            Err(err) => error = Some(err),
        }

        if continuous && changes.len() < limit && self.change_observer.is_none() {
            // Reached the end of history; start observing future commits.
            self.pusher = Some(Arc::clone(&pusher));
            let tx = self.self_tx.clone();
            match DatabaseObserver::new(
                &self.db,
                Box::new(move || {
                    let _ = tx.send(DbMessage::DbChanged);
                }),
            ) {
                Ok(observer) => self.change_observer = Some(observer),
                Err(err) => self.got_error(&err),
            }
        }

        pusher.got_changes(changes, error);
    }

    fn read_changes(&self, since: u64, limit: usize) -> Result<Vec<Rev>> {
        let store = self.documents()?;
        let mut enumerator = store.enumerate_by_sequence(
            since,
            EnumeratorOptions {
                include_deleted: true,
                sort: SortOption::Ascending,
                content: ContentOption::MetaOnly,
            },
        )?;
        let mut changes = Vec::with_capacity(limit.min(1024));
        while changes.len() < limit && enumerator.next() {
            let record = enumerator.record();
            changes.push(Rev {
                doc_id: record.key.clone(),
                rev_id: String::from_utf8_lossy(&record.version).into_owned(),
                sequence: record.sequence,
                deleted: record.flags.is_deleted(),
            });
        }
        Ok(changes)
    }

    fn db_changed(&mut self) {
        let Some(observer) = &self.change_observer else {
            return;
        };
        loop {
            let changes = match observer.changes(MAX_OBSERVED_CHANGES) {
                Ok(changes) => changes,
                Err(err) => {
                    self.got_error(&err);
                    return;
                }
            };
            if changes.is_empty() {
                return;
            }
            info!(
                "notified of {} db changes {} ... {}",
                changes.len(),
                changes[0].sequence,
                changes[changes.len() - 1].sequence
            );
            let revs: Vec<Rev> = changes.into_iter().map(Rev::from).collect();
            if let Some(pusher) = &self.pusher {
                pusher.got_changes(revs, None);
            }
        }
    }

    // =========================================================================
    // Changes Response
    // =========================================================================

    /// Walks the peer's `changes` array. For revisions we already have, the
    /// response holds `0` (sparse: gaps are zero-filled on demand); for
    /// revisions we want, a nested array of known ancestor ids. Sequences of
    /// requested revisions go to the completion callback.
    fn find_or_request_revs(
        &mut self,
        request: MessageIn,
        callback: Option<Box<dyn FnOnce(Vec<String>) + Send>>,
    ) {
        let changes = match request.json_body() {
            Ok(serde_json::Value::Array(items)) => items,
            _ => {
                warn!("malformed 'changes' message body");
                return;
            }
        };
        info!("looking up {} revisions in the db ...", changes.len());

        let store = match self.documents() {
            Ok(store) => store,
            Err(err) => {
                self.got_error(&err);
                return;
            }
        };

        let mut response_items: Vec<serde_json::Value> = Vec::new();
        let mut requested_sequences = Vec::new();
        let mut requested = 0usize;

        for (i, item) in changes.iter().enumerate() {
            let change = item.as_array();
            let doc_id = change
                .and_then(|c| c.get(1))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let rev_id = change
                .and_then(|c| c.get(2))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if doc_id.is_empty() || rev_id.is_empty() {
                warn!("invalid entry in 'changes' message");
                return; // abort the whole response
            }

            let mut ancestors = Vec::new();
            if !self.find_ancestors(&store, doc_id.as_bytes(), rev_id, &mut ancestors) {
                // We don't have this revision; request it.
                requested += 1;
                while response_items.len() < i {
                    response_items.push(0.into());
                }
                response_items.push(serde_json::Value::Array(
                    ancestors.into_iter().map(serde_json::Value::from).collect(),
                ));

                if callback.is_some() {
                    let sequence = change.and_then(|c| c.first());
                    let sequence_str = match sequence {
                        Some(serde_json::Value::Null) | None => String::new(),
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                    };
                    if sequence_str.is_empty() {
                        warn!("empty/invalid sequence in 'changes' message");
                    } else {
                        requested_sequences.push(sequence_str);
                    }
                }
            }
        }

        if let Some(callback) = callback {
            callback(requested_sequences);
        }

        info!("responding w/request for {requested} revs");
        let response = MessageBuilder::new("")
            .property("maxHistory", self.db.max_rev_tree_depth().to_string())
            .json_body(&serde_json::Value::Array(response_items));
        request.respond(response);
    }

    /// True if the revision exists locally. Otherwise fills `ancestors` with
    /// revisions we do have (empty when the doc is unknown entirely).
    fn find_ancestors(
        &self,
        store: &Arc<BothKeyStore>,
        doc_id: &[u8],
        rev_id: &str,
        ancestors: &mut Vec<String>,
    ) -> bool {
        ancestors.clear();
        match VersionedDoc::load(store, doc_id) {
            Ok(Some(mut doc)) => {
                if doc.select_revision(rev_id) {
                    return true;
                }
                *ancestors = doc.possible_ancestors(rev_id, MAX_POSSIBLE_ANCESTORS);
                false
            }
            // An unknown doc is the normal "send me everything" case.
            Ok(None) => false,
            Err(err) => {
                self.got_error(&err);
                false
            }
        }
    }

    // =========================================================================
    // Revision Send
    // =========================================================================

    fn send_revision(&mut self, request: RevRequest, on_progress: Option<ProgressCallback>) {
        debug!(
            "sending revision '{}' #{}",
            String::from_utf8_lossy(&request.doc_id),
            request.rev_id
        );
        match self.build_rev_message(&request) {
            Ok(mut message) => {
                message.no_reply = on_progress.is_none();
                self.sink.send_request(message, on_progress);
            }
            Err(err) => self.got_error(&err),
        }
    }

    fn build_rev_message(&self, request: &RevRequest) -> Result<MessageBuilder> {
        let store = self.documents()?;
        let mut doc = VersionedDoc::load(&store, &request.doc_id)?.ok_or(Error::NotFound)?;
        if !doc.select_revision(&request.rev_id) {
            return Err(Error::NotFound);
        }
        let deleted = doc.selected_deleted();
        let body = doc.selected_body().unwrap_or_default().to_vec();

        // History: parent chain up to max_history entries, stopping once an
        // ancestor the peer already holds is included.
        let known: HashSet<&String> = request.ancestor_rev_ids.iter().collect();
        let mut history = String::new();
        for _ in 0..request.max_history {
            if !doc.select_parent() {
                break;
            }
            let rev_id = doc.selected_rev_id().unwrap_or_default().to_string();
            if !history.is_empty() {
                history.push(',');
            }
            history.push_str(&rev_id);
            if known.contains(&rev_id) {
                break;
            }
        }

        // Re-encode the stored binary body as JSON under the database's
        // shared keys.
        let wire_body = if body.is_empty() {
            Vec::new()
        } else {
            let root = Value::from_data(&body, Some(&self.db.document_keys()))
                .map_err(|_| Error::CorruptRevisionData)?;
            root.to_json().to_string().into_bytes()
        };

        let mut message = MessageBuilder::new("rev")
            .property("id", String::from_utf8_lossy(&request.doc_id).into_owned())
            .property("rev", request.rev_id.clone())
            .property("sequence", request.sequence.to_string());
        if deleted {
            message = message.property("deleted", "1");
        }
        if !history.is_empty() {
            message = message.property("history", history);
        }
        message.compressed = body.len() >= MIN_BODY_SIZE_TO_COMPRESS;
        message.body = wire_body;
        Ok(message)
    }

    // =========================================================================
    // Revision Insert Batching
    // =========================================================================

    /// Drains the queue under one transaction. Each revision's callback gets
    /// its own outcome; a logically bad revision doesn't abort the loop for
    /// the rest.
    fn insert_revisions_now(&mut self) {
        if self.revs_to_insert.is_empty() {
            return;
        }
        let revs = std::mem::take(&mut self.revs_to_insert);
        info!("inserting {} revs", revs.len());

        let store = match self.documents() {
            Ok(store) => store,
            Err(err) => {
                for rev in revs {
                    if let Some(callback) = rev.on_inserted {
                        callback(Some(&err));
                    }
                }
                return;
            }
        };
        let mut txn = match Transaction::new(&self.db) {
            Ok(txn) => txn,
            Err(err) => {
                for rev in revs {
                    if let Some(callback) = rev.on_inserted {
                        callback(Some(&err));
                    }
                }
                return;
            }
        };

        let mut outcomes: Vec<(Option<InsertedCallback>, Option<Error>)> =
            Vec::with_capacity(revs.len());
        for rev in revs {
            debug!(
                "    {{'{}' #{}}}",
                String::from_utf8_lossy(&rev.doc_id),
                rev.rev_id
            );
            let body = match encode_rev_body(&self.db, &rev.body) {
                Ok(body) => body,
                Err(err) => {
                    outcomes.push((rev.on_inserted, Some(err)));
                    continue;
                }
            };
            let mut history = vec![rev.rev_id.clone()];
            if !rev.history.is_empty() {
                history.extend(rev.history.split(',').map(str::to_string));
            }
            let result = put_existing_revision(
                &store,
                &mut txn,
                &rev.doc_id,
                &history,
                &body,
                rev.deleted,
                true,
            );
            outcomes.push((rev.on_inserted, result.err()));
        }

        let commit_error = match txn.commit() {
            Ok(()) => None,
            Err(err) => Some(err),
        };
        for (callback, error) in outcomes {
            if let Some(callback) = callback {
                callback(error.as_ref().or(commit_error.as_ref()));
            }
        }
    }
}

/// Converts a wire-form JSON revision body into the stored binary document
/// form, interning map keys into the database's document keys.
fn encode_rev_body(db: &Database, body: &[u8]) -> Result<Vec<u8>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let json: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| Error::CorruptRevisionData)?;
    let mut enc = Encoder::new();
    enc.set_shared_keys(db.document_keys());
    enc.write_value(&Value::from_json(&json));
    enc.finish()
}

// =============================================================================
// Tests
// =============================================================================
