//! # Versioned Documents
//!
//! Replicated documents carry a revision tree: every revision has an opaque
//! id of the form `<generation>-<suffix>`, an optional parent, a deleted
//! flag, and (for leaves) a body. The tree is encoded into the document
//! record's value; the record's version field holds the winning revision id
//! and its flags mirror the winner's deleted state, which is what routes the
//! record between the live and dead halves of the document store.
//!
//! ## Winner Selection
//!
//! The winning revision is the "best" leaf: non-deleted leaves beat deleted
//! ones, then higher generation, then the lexicographically larger id. A
//! document whose leaves include more than one non-deleted revision is in
//! conflict.
//!
//! ## Ancestry
//!
//! `possible_ancestors(rev)` walks revisions with a lower generation than
//! `rev`, newest first. The replicator sends these to a peer so it can ship a
//! delta against a revision both sides hold.

use std::sync::Arc;

use crate::both::BothKeyStore;
use crate::codec::{Encoder, Value};
use crate::database::Transaction;
use crate::error::{Error, Result};
use crate::keystore::{ContentOption, DocumentFlags, KeyStore, Record};

/// Parses the decimal generation prefix of a revision id. A malformed id
/// without leading digits yields generation 0.
pub fn generation(rev_id: &str) -> u64 {
    let digits: String = rev_id.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

// =============================================================================
// Revision Trees
// =============================================================================

#[derive(Debug, Clone)]
struct RevNode {
    rev_id: String,
    parent: Option<usize>,
    deleted: bool,
    body: Option<Vec<u8>>,
}

/// A document's revision tree.
#[derive(Debug, Clone, Default)]
pub struct RevTree {
    revs: Vec<RevNode>,
}

impl RevTree {
    /// Decodes a tree from a record value.
    pub fn decode(value: &[u8]) -> Result<RevTree> {
        if value.is_empty() {
            return Ok(RevTree::default());
        }
        let root = Value::from_data(value, None).map_err(|_| Error::CorruptRevisionData)?;
        let entries = root.as_array().ok_or(Error::CorruptRevisionData)?;

        let mut revs = Vec::with_capacity(entries.len());
        for entry in entries {
            let rev_id = entry
                .get("id")
                .and_then(Value::as_string)
                .ok_or(Error::CorruptRevisionData)?;
            let parent = match entry.get("parent").and_then(Value::as_i64) {
                Some(p) if p >= 0 => Some(p as usize),
                _ => None,
            };
            let deleted = matches!(entry.get("del"), Some(Value::Bool(true)));
            let body = entry.get("body").and_then(|b| match b {
                Value::Blob(bytes) => Some(bytes.clone()),
                _ => None,
            });
            revs.push(RevNode {
                rev_id,
                parent,
                deleted,
                body,
            });
        }
        // Parent indexes must stay inside the tree.
        for rev in &revs {
            if rev.parent.is_some_and(|p| p >= revs.len()) {
                return Err(Error::CorruptRevisionData);
            }
        }
        Ok(RevTree { revs })
    }

    /// Encodes the tree into a record value.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        enc.begin_array_hint(self.revs.len());
        for rev in &self.revs {
            enc.begin_map();
            enc.write_key("id");
            enc.write_string(rev.rev_id.as_bytes());
            enc.write_key("parent");
            enc.write_int(rev.parent.map(|p| p as i64).unwrap_or(-1));
            enc.write_key("del");
            enc.write_bool(rev.deleted);
            if let Some(body) = &rev.body {
                enc.write_key("body");
                enc.write_blob(body);
            }
            enc.end_map()?;
        }
        enc.end_array()?;
        enc.finish()
    }

    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    fn find(&self, rev_id: &str) -> Option<usize> {
        self.revs.iter().position(|rev| rev.rev_id == rev_id)
    }

    fn is_leaf(&self, index: usize) -> bool {
        !self.revs.iter().any(|rev| rev.parent == Some(index))
    }

    fn leaves(&self) -> Vec<usize> {
        (0..self.revs.len()).filter(|&i| self.is_leaf(i)).collect()
    }

    /// The winning leaf: alive beats deleted, then generation, then id.
    fn winner(&self) -> Option<usize> {
        self.leaves().into_iter().max_by_key(|&i| {
            let rev = &self.revs[i];
            (
                !rev.deleted,
                generation(&rev.rev_id),
                rev.rev_id.clone(),
            )
        })
    }

    /// More than one live leaf means an unresolved conflict.
    fn in_conflict(&self) -> bool {
        self.leaves()
            .iter()
            .filter(|&&i| !self.revs[i].deleted)
            .count()
            > 1
    }

    /// Grafts a revision history (newest first) onto the tree, setting the
    /// leaf's body and deleted flag. Returns false when the revision was
    /// already present (nothing to do).
    ///
    /// With `allow_conflict` false, the graft is rejected when it would create
    /// a second live branch.
    pub fn insert_history(
        &mut self,
        history: &[String],
        body: &[u8],
        deleted: bool,
        allow_conflict: bool,
    ) -> Result<bool> {
        let new_rev = history.first().ok_or(Error::CorruptRevisionData)?;
        if self.find(new_rev).is_some() {
            return Ok(false);
        }

        // Find the deepest ancestor already in the tree; everything above it
        // is new.
        let mut attach_at = None;
        let mut first_new = history.len();
        for (i, rev_id) in history.iter().enumerate().skip(1) {
            if let Some(index) = self.find(rev_id) {
                attach_at = Some(index);
                first_new = i;
                break;
            }
        }

        if !allow_conflict && !self.revs.is_empty() {
            let extends_leaf = attach_at.is_some_and(|index| self.is_leaf(index));
            if !extends_leaf {
                return Err(Error::Conflict);
            }
        }

        // Graft the missing chain, oldest first.
        let mut parent = attach_at;
        for rev_id in history[..first_new].iter().rev() {
            self.revs.push(RevNode {
                rev_id: rev_id.clone(),
                parent,
                deleted: false,
                body: None,
            });
            parent = Some(self.revs.len() - 1);
        }

        // The newest revision carries the body and the tombstone flag; its
        // parent no longer needs a body.
        let leaf = parent.expect("at least one revision was grafted");
        self.revs[leaf].deleted = deleted;
        self.revs[leaf].body = Some(body.to_vec());
        if let Some(parent) = self.revs[leaf].parent {
            if !self.is_leaf(parent) {
                self.revs[parent].body = None;
            }
        }
        Ok(true)
    }

    /// Revisions with a lower generation than `rev_id`, newest first.
    pub fn possible_ancestors(&self, rev_id: &str) -> Vec<String> {
        let target_gen = generation(rev_id);
        let mut candidates: Vec<&RevNode> = self
            .revs
            .iter()
            .filter(|rev| generation(&rev.rev_id) < target_gen)
            .collect();
        candidates.sort_by_key(|rev| std::cmp::Reverse(generation(&rev.rev_id)));
        candidates.into_iter().map(|rev| rev.rev_id.clone()).collect()
    }
}

// =============================================================================
// Versioned Documents
// =============================================================================

/// A document loaded with its revision tree, plus a selection cursor over the
/// tree.
pub struct VersionedDoc {
    doc_id: Vec<u8>,
    record: Record,
    tree: RevTree,
    selected: Option<usize>,
}

impl VersionedDoc {
    /// Loads a document from the split store; `None` when it does not exist
    /// in either half. The winning revision starts selected.
    pub fn load(store: &Arc<BothKeyStore>, doc_id: &[u8]) -> Result<Option<VersionedDoc>> {
        let record = match store.get(doc_id, ContentOption::WithBody)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let tree = RevTree::decode(&record.value)?;
        let selected = tree.winner();
        Ok(Some(VersionedDoc {
            doc_id: doc_id.to_vec(),
            record,
            tree,
            selected,
        }))
    }

    pub fn doc_id(&self) -> &[u8] {
        &self.doc_id
    }

    pub fn sequence(&self) -> u64 {
        self.record.sequence
    }

    pub fn flags(&self) -> DocumentFlags {
        self.record.flags
    }

    /// Selects a revision by id, non-creating. False when absent.
    pub fn select_revision(&mut self, rev_id: &str) -> bool {
        match self.tree.find(rev_id) {
            Some(index) => {
                self.selected = Some(index);
                true
            }
            None => false,
        }
    }

    /// Moves the selection to the selected revision's parent.
    pub fn select_parent(&mut self) -> bool {
        match self.selected.and_then(|i| self.tree.revs[i].parent) {
            Some(parent) => {
                self.selected = Some(parent);
                true
            }
            None => false,
        }
    }

    pub fn selected_rev_id(&self) -> Option<&str> {
        self.selected.map(|i| self.tree.revs[i].rev_id.as_str())
    }

    pub fn selected_deleted(&self) -> bool {
        self.selected
            .map(|i| self.tree.revs[i].deleted)
            .unwrap_or(false)
    }

    pub fn selected_body(&self) -> Option<&[u8]> {
        self.selected
            .and_then(|i| self.tree.revs[i].body.as_deref())
    }

    /// Possible ancestors of `rev_id` this document holds, capped at `max`.
    pub fn possible_ancestors(&self, rev_id: &str, max: usize) -> Vec<String> {
        let mut ancestors = self.tree.possible_ancestors(rev_id);
        ancestors.truncate(max);
        ancestors
    }
}

/// Inserts a revision with its history into a document, creating the document
/// when needed, and saves the updated record through the split store (the
/// winner's deleted flag routes it live or dead).
///
/// Returns the record's new sequence, or 0 when the revision was already
/// present and nothing changed.
pub fn put_existing_revision(
    store: &Arc<BothKeyStore>,
    txn: &mut Transaction<'_>,
    doc_id: &[u8],
    history: &[String],
    body: &[u8],
    deleted: bool,
    allow_conflict: bool,
) -> Result<u64> {
    let mut tree = match store.get(doc_id, ContentOption::WithBody)? {
        Some(record) => RevTree::decode(&record.value)?,
        None => RevTree::default(),
    };

    if !tree.insert_history(history, body, deleted, allow_conflict)? {
        return Ok(0);
    }

    let winner = tree.winner().expect("non-empty tree has a winner");
    let winner_id = tree.revs[winner].rev_id.clone();
    let mut flags = if tree.revs[winner].deleted {
        DocumentFlags::DELETED
    } else {
        DocumentFlags::NONE
    };
    if tree.in_conflict() {
        flags = flags.with(DocumentFlags::CONFLICTED);
    }

    let value = tree.encode()?;
    store.set(txn, doc_id, winner_id.as_bytes(), &value, flags, None, true)
}

// =============================================================================
// Tests
// =============================================================================
