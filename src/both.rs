//! # Live/Dead Split KeyStore
//!
//! [`BothKeyStore`] presents one keystore surface over two physical stores: a
//! live store for current documents and a dead store for tombstones. The two
//! share a sequence generator, so sequences stay globally unique and monotonic
//! across the pair.
//!
//! ## Routing
//!
//! Writes route by the deleted flag: tombstones land in the dead store,
//! everything else in the live store, and a successful write removes any
//! leftover record from the counterpart. The invariant: for every key, at most
//! one of the two stores holds a record.
//!
//! ## MVCC Across the Split
//!
//! A precondition of 0 (must-not-exist) also probes the counterpart, because
//! "exists as a tombstone" still counts as existing. A conflicting write whose
//! record may have migrated to the counterpart at the expected sequence
//! deletes it there (under the same precondition) and retries cleanly.
//!
//! ## Merged Enumeration
//!
//! Enumerating with deleted records included merges the two stores like a
//! merge-sort, comparing keys (or sequences) in the current direction. On a
//! tie both sides advance but the LIVE record is surfaced; the dead record for
//! that key is never seen. Unsorted enumeration silently upgrades to
//! ascending, because merging requires an order.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::database::Transaction;
use crate::error::Result;
use crate::keystore::{
    ContentOption, DocumentFlags, EnumeratorImpl, EnumeratorOptions, KeyStore, KvStore, Record,
    SortOption,
};

// =============================================================================
// BothKeyStore
// =============================================================================

/// A keystore fronting a live store and a dead (tombstone) store.
pub struct BothKeyStore {
    live: Arc<KvStore>,
    dead: Arc<KvStore>,
}

impl BothKeyStore {
    /// Composes the pair. The dead store must share the live store's sequence
    /// generator.
    pub fn new(live: Arc<KvStore>, dead: Arc<KvStore>) -> BothKeyStore {
        debug_assert_eq!(live.seq_owner(), dead.seq_owner());
        BothKeyStore { live, dead }
    }

    pub fn live_store(&self) -> &Arc<KvStore> {
        &self.live
    }

    pub fn dead_store(&self) -> &Arc<KvStore> {
        &self.dead
    }
}

impl KeyStore for BothKeyStore {
    fn name(&self) -> &str {
        self.live.name()
    }

    fn get(&self, key: &[u8], content: ContentOption) -> Result<Option<Record>> {
        match self.live.get(key, content)? {
            Some(record) => Ok(Some(record)),
            None => self.dead.get(key, content),
        }
    }

    fn set(
        &self,
        txn: &mut Transaction<'_>,
        key: &[u8],
        version: &[u8],
        value: &[u8],
        flags: DocumentFlags,
        replacing: Option<u64>,
        new_sequence: bool,
    ) -> Result<u64> {
        let deleting = flags.is_deleted();
        let (target, other) = if deleting {
            (&self.dead, &self.live)
        } else {
            (&self.live, &self.dead)
        };

        match replacing {
            None => {
                // Overwrite: set in the target, then drop any counterpart.
                let seq = target.set(txn, key, version, value, flags, None, new_sequence)?;
                if seq > 0 {
                    other.del(txn, key, None)?;
                }
                Ok(seq)
            }
            Some(expected) => {
                if expected == 0 {
                    // Must-not-exist: a tombstone in the counterpart still
                    // counts as existing.
                    if other.get(key, ContentOption::MetaOnly)?.is_some() {
                        return Ok(0);
                    }
                }

                let mut seq =
                    target.set(txn, key, version, value, flags, Some(expected), new_sequence)?;

                if seq == 0 && expected > 0 {
                    // Conflict. The record may have migrated to the other
                    // store at that sequence; if so, delete it there and
                    // retry without the precondition.
                    debug_assert!(new_sequence);
                    if other.del(txn, key, Some(expected))? {
                        seq = target.set(txn, key, version, value, flags, None, true)?;
                    }
                }
                Ok(seq)
            }
        }
    }

    fn del(&self, txn: &mut Transaction<'_>, key: &[u8], replacing: Option<u64>) -> Result<bool> {
        let in_live = self.live.del(txn, key, replacing)?;
        if in_live {
            return Ok(true);
        }
        self.dead.del(txn, key, replacing)
    }

    fn set_expiration(&self, txn: &mut Transaction<'_>, key: &[u8], when: u64) -> Result<bool> {
        if self.live.set_expiration(txn, key, when)? {
            return Ok(true);
        }
        self.dead.set_expiration(txn, key, when)
    }

    fn record_count(&self, include_deleted: bool) -> Result<u64> {
        // Counting with tombstones included is cheaper, and the live store
        // holds none anyway.
        let mut count = self.live.record_count(true)?;
        if include_deleted {
            count += self.dead.record_count(true)?;
        }
        Ok(count)
    }

    fn last_sequence(&self) -> Result<u64> {
        self.live.last_sequence()
    }

    fn next_expiration(&self) -> Result<u64> {
        let live_exp = self.live.next_expiration()?;
        let dead_exp = self.dead.next_expiration()?;
        if live_exp > 0 && dead_exp > 0 {
            Ok(live_exp.min(dead_exp))
        } else {
            Ok(live_exp.max(dead_exp))
        }
    }

    fn with_doc_bodies(&self, doc_ids: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>> {
        // Ask the live store first, then retry the empty slots against the
        // dead store.
        let mut bodies = self.live.with_doc_bodies(doc_ids)?;

        let mut recheck_ids = Vec::new();
        let mut recheck_slots = Vec::new();
        for (i, body) in bodies.iter().enumerate() {
            if body.is_none() {
                recheck_ids.push(doc_ids[i]);
                recheck_slots.push(i);
            }
        }
        if !recheck_ids.is_empty() {
            let dead_bodies = self.dead.with_doc_bodies(&recheck_ids)?;
            for (slot, body) in recheck_slots.into_iter().zip(dead_bodies) {
                if body.is_some() {
                    bodies[slot] = body;
                }
            }
        }
        Ok(bodies)
    }

    fn new_enumerator_impl(
        &self,
        by_sequence: bool,
        since: u64,
        mut options: EnumeratorOptions,
    ) -> Result<Box<dyn EnumeratorImpl>> {
        if options.include_deleted {
            if options.sort == SortOption::Unsorted {
                options.sort = SortOption::Ascending; // merging requires an order
            }
            Ok(Box::new(BothEnumeratorImpl::new(
                self.live.new_enumerator_impl(by_sequence, since, options)?,
                self.dead.new_enumerator_impl(by_sequence, since, options)?,
                by_sequence,
                options.sort == SortOption::Descending,
            )))
        } else {
            // Only the live store matters, and it holds no tombstones to
            // filter out.
            options.include_deleted = true;
            self.live.new_enumerator_impl(by_sequence, since, options)
        }
    }
}

// =============================================================================
// Merge Enumerator
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Side {
    Live,
    Dead,
    Neither,
}

/// Enumerates both stores in parallel, always surfacing the lowest-sorting
/// record. `cmp` starts at 0 so the first `next` advances both sides.
struct BothEnumeratorImpl {
    live: Option<Box<dyn EnumeratorImpl>>,
    dead: Option<Box<dyn EnumeratorImpl>>,
    current: Side,
    cmp: i32,
    by_sequence: bool,
    descending: bool,
}

impl BothEnumeratorImpl {
    fn new(
        live: Box<dyn EnumeratorImpl>,
        dead: Box<dyn EnumeratorImpl>,
        by_sequence: bool,
        descending: bool,
    ) -> BothEnumeratorImpl {
        BothEnumeratorImpl {
            live: Some(live),
            dead: Some(dead),
            current: Side::Neither,
            cmp: 0,
            by_sequence,
            descending,
        }
    }
}

impl EnumeratorImpl for BothEnumeratorImpl {
    fn next(&mut self) -> bool {
        // Advance the side with the lowest key, or both when tied.
        if self.cmp <= 0 {
            if let Some(live) = self.live.as_mut() {
                if !live.next() {
                    self.live = None;
                }
            }
        }
        if self.cmp >= 0 {
            if let Some(dead) = self.dead.as_mut() {
                if !dead.next() {
                    self.dead = None;
                }
            }
        }

        self.cmp = match (&self.live, &self.dead) {
            (Some(live), Some(dead)) => {
                let ordering = if self.by_sequence {
                    live.sequence().cmp(&dead.sequence())
                } else {
                    live.key().cmp(dead.key())
                };
                match ordering {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                }
            }
            (Some(_), None) => -1,
            (None, Some(_)) => 1,
            (None, None) => {
                self.current = Side::Neither;
                self.cmp = 0;
                return false;
            }
        };

        if self.descending {
            self.cmp = -self.cmp;
        }

        // Live wins ties: it has priority for the same key or sequence.
        self.current = if self.cmp <= 0 { Side::Live } else { Side::Dead };
        true
    }

    fn record(&self) -> &Record {
        match self.current {
            Side::Live => self.live.as_ref().expect("live side gone").record(),
            Side::Dead => self.dead.as_ref().expect("dead side gone").record(),
            Side::Neither => panic!("enumerator is not positioned on a record"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, DatabaseConfig, Transaction};

    fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("db.roost"), DatabaseConfig::default()).unwrap();
        (dir, db)
    }

    fn set(
        db: &Database,
        store: &BothKeyStore,
        key: &[u8],
        value: &[u8],
        flags: DocumentFlags,
        replacing: Option<u64>,
    ) -> u64 {
        let mut txn = Transaction::new(db).unwrap();
        let seq = store
            .set(&mut txn, key, b"", value, flags, replacing, true)
            .unwrap();
        txn.commit().unwrap();
        seq
    }

    #[test]
    fn test_create_if_absent() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        // Fresh key: must-not-exist precondition holds.
        assert_eq!(set(&db, &store, b"a", b"V", DocumentFlags::NONE, Some(0)), 1);
        // Now it exists; the same precondition fails without writing.
        assert_eq!(set(&db, &store, b"a", b"V2", DocumentFlags::NONE, Some(0)), 0);
        // Replacing the actual sequence succeeds.
        assert_eq!(set(&db, &store, b"a", b"V2", DocumentFlags::NONE, Some(1)), 2);
    }

    #[test]
    fn test_must_not_exist_sees_tombstones() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        set(&db, &store, b"a", b"", DocumentFlags::DELETED, None);
        // The doc exists as a tombstone in the dead store, so create-if-absent
        // must fail even though the live store has no record.
        assert_eq!(set(&db, &store, b"a", b"V", DocumentFlags::NONE, Some(0)), 0);
    }

    #[test]
    fn test_live_dead_migration() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        let seq1 = set(&db, &store, b"a", b"V", DocumentFlags::NONE, None);
        assert!(store.live_store().get(b"a", ContentOption::MetaOnly).unwrap().is_some());

        // Delete: record migrates to the dead store.
        let seq2 = set(&db, &store, b"a", b"", DocumentFlags::DELETED, None);
        assert_eq!(seq2, seq1 + 1);
        assert!(store.live_store().get(b"a", ContentOption::MetaOnly).unwrap().is_none());
        assert!(store.dead_store().get(b"a", ContentOption::MetaOnly).unwrap().is_some());

        // Recreate with the tombstone's sequence as the precondition: the
        // conflict path deletes from the counterpart and retries.
        let seq3 = set(&db, &store, b"a", b"V2", DocumentFlags::NONE, Some(seq2));
        assert_eq!(seq3, seq2 + 1);
        assert!(store.live_store().get(b"a", ContentOption::MetaOnly).unwrap().is_some());
        assert!(store.dead_store().get(b"a", ContentOption::MetaOnly).unwrap().is_none());
    }

    #[test]
    fn test_at_most_one_store_holds_a_key() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        for (flags, _) in [
            (DocumentFlags::NONE, "live"),
            (DocumentFlags::DELETED, "dead"),
            (DocumentFlags::NONE, "live"),
            (DocumentFlags::DELETED, "dead"),
        ] {
            set(&db, &store, b"k", b"v", flags, None);
            let in_live = store.live_store().get(b"k", ContentOption::MetaOnly).unwrap().is_some();
            let in_dead = store.dead_store().get(b"k", ContentOption::MetaOnly).unwrap().is_some();
            assert!(in_live ^ in_dead, "key must live in exactly one store");
        }
    }

    #[test]
    fn test_sequences_monotonic_across_halves() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        let mut last = 0;
        for (key, flags) in [
            (b"a".as_slice(), DocumentFlags::NONE),
            (b"b", DocumentFlags::DELETED),
            (b"c", DocumentFlags::NONE),
            (b"a", DocumentFlags::DELETED),
        ] {
            let seq = set(&db, &store, key, b"", flags, None);
            assert!(seq > last, "sequence {seq} must exceed {last}");
            last = seq;
        }
        assert_eq!(store.last_sequence().unwrap(), last);
    }

    #[test]
    fn test_merge_enumeration_order_and_tie_break() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        // live: a, c, e / dead: b, c, d -- "c" exists in both for the merge
        // (written directly into the halves to stage the tie).
        let mut txn = Transaction::new(&db).unwrap();
        for key in [b"a".as_slice(), b"c", b"e"] {
            store
                .live_store()
                .set(&mut txn, key, b"", b"live", DocumentFlags::NONE, None, true)
                .unwrap();
        }
        for key in [b"b".as_slice(), b"c", b"d"] {
            store
                .dead_store()
                .set(&mut txn, key, b"", b"dead", DocumentFlags::DELETED, None, true)
                .unwrap();
        }
        txn.commit().unwrap();

        let options = EnumeratorOptions {
            include_deleted: true,
            ..EnumeratorOptions::default()
        };
        let mut e = store.enumerate_by_key(options).unwrap();
        let mut seen = Vec::new();
        while e.next() {
            seen.push((e.record().key.clone(), e.record().value.clone()));
        }

        let keys: Vec<&[u8]> = seen.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b", b"c", b"d", b"e"]);
        // The tied key surfaces the live record.
        assert_eq!(seen[2].1, b"live");
    }

    #[test]
    fn test_merge_enumeration_descending() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        set(&db, &store, b"a", b"", DocumentFlags::NONE, None);
        set(&db, &store, b"b", b"", DocumentFlags::DELETED, None);
        set(&db, &store, b"c", b"", DocumentFlags::NONE, None);

        let options = EnumeratorOptions {
            include_deleted: true,
            sort: SortOption::Descending,
            ..EnumeratorOptions::default()
        };
        let mut e = store.enumerate_by_key(options).unwrap();
        let mut keys = Vec::new();
        while e.next() {
            keys.push(e.record().key.clone());
        }
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_enumeration_without_deleted_skips_dead_store() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        set(&db, &store, b"a", b"", DocumentFlags::NONE, None);
        set(&db, &store, b"b", b"", DocumentFlags::DELETED, None);

        let mut e = store.enumerate_by_key(EnumeratorOptions::default()).unwrap();
        let mut keys = Vec::new();
        while e.next() {
            keys.push(e.record().key.clone());
        }
        assert_eq!(keys, vec![b"a".to_vec()]);
    }

    #[test]
    fn test_merge_by_sequence() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        set(&db, &store, b"a", b"", DocumentFlags::NONE, None); // seq 1
        set(&db, &store, b"b", b"", DocumentFlags::DELETED, None); // seq 2
        set(&db, &store, b"c", b"", DocumentFlags::NONE, None); // seq 3

        let options = EnumeratorOptions {
            include_deleted: true,
            ..EnumeratorOptions::default()
        };
        let mut e = store.enumerate_by_sequence(1, options).unwrap();
        let mut seqs = Vec::new();
        while e.next() {
            seqs.push(e.record().sequence);
        }
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn test_next_expiration_minimum_of_nonzero() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        set(&db, &store, b"a", b"", DocumentFlags::NONE, None);
        set(&db, &store, b"b", b"", DocumentFlags::DELETED, None);
        assert_eq!(store.next_expiration().unwrap(), 0);

        let mut txn = Transaction::new(&db).unwrap();
        store.set_expiration(&mut txn, b"a", 900).unwrap();
        txn.commit().unwrap();
        assert_eq!(store.next_expiration().unwrap(), 900);

        let mut txn = Transaction::new(&db).unwrap();
        store.set_expiration(&mut txn, b"b", 400).unwrap();
        txn.commit().unwrap();
        assert_eq!(store.next_expiration().unwrap(), 400);
    }

    #[test]
    fn test_with_doc_bodies_backfills_from_dead() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        set(&db, &store, b"live1", b"L1", DocumentFlags::NONE, None);
        set(&db, &store, b"gone1", b"G1", DocumentFlags::DELETED, None);

        let bodies = store
            .with_doc_bodies(&[b"live1", b"gone1", b"missing"])
            .unwrap();
        assert_eq!(bodies[0].as_deref(), Some(b"L1".as_slice()));
        assert_eq!(bodies[1].as_deref(), Some(b"G1".as_slice()));
        assert!(bodies[2].is_none());
    }

    #[test]
    fn test_record_counts() {
        let (_dir, db) = open_temp();
        let store = db.default_keystore().unwrap();

        set(&db, &store, b"a", b"", DocumentFlags::NONE, None);
        set(&db, &store, b"b", b"", DocumentFlags::NONE, None);
        set(&db, &store, b"c", b"", DocumentFlags::DELETED, None);

        assert_eq!(store.record_count(false).unwrap(), 2);
        assert_eq!(store.record_count(true).unwrap(), 3);
    }
}
