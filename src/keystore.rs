//! # KeyStores
//!
//! A keystore is a named ordered collection of records within a database
//! file. This module defines the uniform [`KeyStore`] surface consumed by the
//! storage, query, and replication layers, the [`Record`] tuple, enumeration
//! options, and [`KvStore`], the engine-backed implementation.
//!
//! The live/dead composition over two keystores lives in
//! [`both`](crate::both).
//!
//! ## Record Model
//!
//! A record is `(key, version, value, flags, sequence, expiration)`. The
//! sequence is assigned from the store's sequence generator on first store and
//! reassigned only when a write explicitly asks for a new one; generators may
//! be shared between stores, in which case sequences are unique across all
//! sharing stores.
//!
//! ## MVCC Preconditions
//!
//! `set` and `del` accept an optional expected prior sequence. `Some(0)` means
//! "must not exist"; any other value must match the record's current sequence
//! for the write to apply. A conflicting `set` returns sequence 0 instead of
//! writing.

use std::sync::Arc;

use crate::database::Transaction;
use crate::engine::EngineFile;
use crate::error::Result;

// =============================================================================
// Flags
// =============================================================================

/// Per-record flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DocumentFlags(u32);

impl DocumentFlags {
    pub const NONE: DocumentFlags = DocumentFlags(0);
    /// The record is a tombstone; it lives in the dead half of a split store.
    pub const DELETED: DocumentFlags = DocumentFlags(1);
    /// The document has unresolved conflicting leaf revisions.
    pub const CONFLICTED: DocumentFlags = DocumentFlags(2);

    pub fn from_bits(bits: u32) -> DocumentFlags {
        DocumentFlags(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: DocumentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_deleted(self) -> bool {
        self.contains(DocumentFlags::DELETED)
    }

    pub fn with(self, other: DocumentFlags) -> DocumentFlags {
        DocumentFlags(self.0 | other.0)
    }
}

// =============================================================================
// Records
// =============================================================================

/// A stored record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub key: Vec<u8>,
    pub version: Vec<u8>,
    pub value: Vec<u8>,
    pub flags: DocumentFlags,
    pub sequence: u64,
    pub expiration: u64,
}

/// How much of a record to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentOption {
    /// Key, version, flags, sequence, expiration; no body.
    MetaOnly,
    /// Everything.
    WithBody,
}

// =============================================================================
// Enumeration
// =============================================================================

/// Sort order for enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOption {
    Ascending,
    Descending,
    /// No ordering requirement. A merged enumerator silently upgrades this to
    /// ascending, because merging requires an order.
    Unsorted,
}

/// Options for record enumeration.
#[derive(Debug, Clone, Copy)]
pub struct EnumeratorOptions {
    pub include_deleted: bool,
    pub sort: SortOption,
    pub content: ContentOption,
}

impl Default for EnumeratorOptions {
    fn default() -> Self {
        EnumeratorOptions {
            include_deleted: false,
            sort: SortOption::Ascending,
            content: ContentOption::WithBody,
        }
    }
}

/// The stepping interface concrete stores implement.
///
/// `next` advances to the following record and reports whether one exists;
/// `record`, `key`, and `sequence` read the current position and must only be
/// called after a successful `next`.
pub trait EnumeratorImpl: Send {
    fn next(&mut self) -> bool;
    fn record(&self) -> &Record;

    fn key(&self) -> &[u8] {
        &self.record().key
    }

    fn sequence(&self) -> u64 {
        self.record().sequence
    }
}

/// A record enumerator over a keystore, by key or by sequence.
pub struct RecordEnumerator {
    inner: Box<dyn EnumeratorImpl>,
    positioned: bool,
}

impl RecordEnumerator {
    pub(crate) fn new(inner: Box<dyn EnumeratorImpl>) -> RecordEnumerator {
        RecordEnumerator {
            inner,
            positioned: false,
        }
    }

    /// Advances to the next record; false at the end.
    pub fn next(&mut self) -> bool {
        self.positioned = self.inner.next();
        self.positioned
    }

    /// The current record. Panics when not positioned on one.
    pub fn record(&self) -> &Record {
        assert!(self.positioned, "enumerator is not positioned on a record");
        self.inner.record()
    }
}

/// An enumerator impl over a pre-fetched batch of records.
pub(crate) struct VecEnumerator {
    records: std::vec::IntoIter<Record>,
    current: Option<Record>,
}

impl VecEnumerator {
    pub(crate) fn new(records: Vec<Record>) -> VecEnumerator {
        VecEnumerator {
            records: records.into_iter(),
            current: None,
        }
    }
}

impl EnumeratorImpl for VecEnumerator {
    fn next(&mut self) -> bool {
        self.current = self.records.next();
        self.current.is_some()
    }

    fn record(&self) -> &Record {
        self.current.as_ref().expect("not positioned")
    }
}

// =============================================================================
// KeyStore Trait
// =============================================================================

/// The uniform keystore surface.
pub trait KeyStore: Send + Sync {
    /// The store's name.
    fn name(&self) -> &str;

    /// Reads a record by key. `None` when absent.
    fn get(&self, key: &[u8], content: ContentOption) -> Result<Option<Record>>;

    /// Writes a record, optionally under an MVCC precondition.
    ///
    /// Returns the assigned sequence, or 0 when the precondition failed.
    /// `new_sequence` controls whether a precondition-matching overwrite gets
    /// a fresh sequence or keeps the old one.
    #[allow(clippy::too_many_arguments)]
    fn set(
        &self,
        txn: &mut Transaction<'_>,
        key: &[u8],
        version: &[u8],
        value: &[u8],
        flags: DocumentFlags,
        replacing: Option<u64>,
        new_sequence: bool,
    ) -> Result<u64>;

    /// Deletes a record, optionally under an MVCC precondition. Returns true
    /// if a record was removed.
    fn del(&self, txn: &mut Transaction<'_>, key: &[u8], replacing: Option<u64>) -> Result<bool>;

    /// Sets a record's expiration timestamp. Returns false when the record
    /// does not exist.
    fn set_expiration(&self, txn: &mut Transaction<'_>, key: &[u8], when: u64) -> Result<bool>;

    /// Number of records, optionally counting tombstones.
    fn record_count(&self, include_deleted: bool) -> Result<u64>;

    /// The store's high-water sequence.
    fn last_sequence(&self) -> Result<u64>;

    /// The earliest nonzero expiration, or 0 when nothing expires.
    fn next_expiration(&self) -> Result<u64>;

    /// Bulk body lookup: one slot per requested docID, `None` where absent.
    fn with_doc_bodies(&self, doc_ids: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Creates the stepping implementation for an enumeration.
    fn new_enumerator_impl(
        &self,
        by_sequence: bool,
        since: u64,
        options: EnumeratorOptions,
    ) -> Result<Box<dyn EnumeratorImpl>>;

    /// Enumerates records in key order.
    fn enumerate_by_key(&self, options: EnumeratorOptions) -> Result<RecordEnumerator> {
        Ok(RecordEnumerator::new(self.new_enumerator_impl(
            false,
            0,
            options,
        )?))
    }

    /// Enumerates records in sequence order, strictly after `since`.
    fn enumerate_by_sequence(
        &self,
        since: u64,
        options: EnumeratorOptions,
    ) -> Result<RecordEnumerator> {
        Ok(RecordEnumerator::new(self.new_enumerator_impl(
            true, since, options,
        )?))
    }
}

// =============================================================================
// Engine-Backed Store
// =============================================================================

/// A keystore backed by one engine table.
///
/// Handles are cached and shared by the owning
/// [`Database`](crate::database::Database); two lookups of the same name
/// return the same handle.
pub struct KvStore {
    engine: Arc<EngineFile>,
    name: String,
    /// The sequence-generator row this store allocates from. Normally the
    /// store's own name; the dead half of a split store points at the live
    /// half's row.
    seq_owner: String,
}

impl KvStore {
    pub(crate) fn new(engine: Arc<EngineFile>, name: &str, seq_owner: &str) -> KvStore {
        KvStore {
            engine,
            name: name.to_string(),
            seq_owner: seq_owner.to_string(),
        }
    }

    /// The engine table this store reads and writes. Query compilers build
    /// statements against it.
    pub fn table_name(&self) -> String {
        crate::engine::table_name(&self.name)
    }

    pub(crate) fn engine(&self) -> &Arc<EngineFile> {
        &self.engine
    }

    pub(crate) fn seq_owner(&self) -> &str {
        &self.seq_owner
    }
}

impl KeyStore for KvStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8], content: ContentOption) -> Result<Option<Record>> {
        self.engine.get_record(&self.name, key, content)
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
        txn.check(self.engine.set_record(
            &self.name,
            &self.seq_owner,
            key,
            version,
            value,
            flags,
            replacing,
            new_sequence,
        ))
    }

    fn del(&self, txn: &mut Transaction<'_>, key: &[u8], replacing: Option<u64>) -> Result<bool> {
        txn.check(self.engine.del_record(&self.name, key, replacing))
    }

    fn set_expiration(&self, txn: &mut Transaction<'_>, key: &[u8], when: u64) -> Result<bool> {
        txn.check(self.engine.set_expiration(&self.name, key, when))
    }

    fn record_count(&self, _include_deleted: bool) -> Result<u64> {
        // A plain store holds no tombstones, so the flag changes nothing here.
        self.engine.record_count(&self.name)
    }

    fn last_sequence(&self) -> Result<u64> {
        self.engine.last_sequence(&self.seq_owner)
    }

    fn next_expiration(&self) -> Result<u64> {
        self.engine.next_expiration(&self.name)
    }

    fn with_doc_bodies(&self, doc_ids: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut bodies = Vec::with_capacity(doc_ids.len());
        for doc_id in doc_ids {
            bodies.push(
                self.engine
                    .get_record(&self.name, doc_id, ContentOption::WithBody)?
                    .map(|rec| rec.value),
            );
        }
        Ok(bodies)
    }

    fn new_enumerator_impl(
        &self,
        by_sequence: bool,
        since: u64,
        options: EnumeratorOptions,
    ) -> Result<Box<dyn EnumeratorImpl>> {
        let records = self
            .engine
            .read_records(&self.name, by_sequence, since, options)?;
        Ok(Box::new(VecEnumerator::new(records)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = DocumentFlags::NONE;
        assert!(!flags.is_deleted());

        let flags = flags.with(DocumentFlags::DELETED);
        assert!(flags.is_deleted());
        assert!(flags.contains(DocumentFlags::DELETED));
        assert!(!flags.contains(DocumentFlags::CONFLICTED));

        assert_eq!(DocumentFlags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn test_vec_enumerator() {
        let records = vec![
            Record {
                key: b"a".to_vec(),
                sequence: 1,
                ..Record::default()
            },
            Record {
                key: b"b".to_vec(),
                sequence: 2,
                ..Record::default()
            },
        ];
        let mut e = RecordEnumerator::new(Box::new(VecEnumerator::new(records)));
        assert!(e.next());
        assert_eq!(e.record().key, b"a");
        assert!(e.next());
        assert_eq!(e.record().sequence, 2);
        assert!(!e.next());
    }
}
