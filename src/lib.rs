//! # RoostDB - Embedded Document Store
//!
//! RoostDB is an embedded, single-process document store built on SQLite. It
//! layers four subsystems over the ordered key/value engine:
//!
//! - **Transactional storage**: MVCC record writes behind a process-wide
//!   single-writer gate per file
//! - **Split keystore**: one surface over live documents and tombstones,
//!   merged in global sequence order
//! - **Compiled queries**: selector compilation, parameter binding, and
//!   paged result recording into self-contained binary documents
//! - **Replication actor**: per-peer checkpoints, change feeds, revision
//!   exchange, and debounced batched inserts
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │      Query layer                  Replication (per peer)        │
//! │  Query / QueryEnumerator              DbActor (mailbox)         │
//! └────────────┬────────────────────────────────┬───────────────────┘
//!              │                                │
//!              ▼                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Database / Transaction                         │
//! │    writer gate (FileRegistry)  ·  keystores  ·  observers       │
//! │                                                                 │
//! │   ┌────────────────────────┐   ┌──────────────────────────┐     │
//! │   │      BothKeyStore      │   │   named raw keystores    │     │
//! │   │   (live / dead split)  │   │ (checkpoints, peer cps)  │     │
//! │   └────────────────────────┘   └──────────────────────────┘     │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    SQLite (ordered KV engine)                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single writer per file**: at most one live write transaction per
//!    path, across every handle in the process
//! 2. **Durable ordering**: sequences strictly increase per file, shared
//!    between the live and dead halves of the document store
//! 3. **Split exclusivity**: a document key lives in exactly one of the
//!    live/dead stores after any committed write
//! 4. **Snapshot queries**: an enumerator's results are consistent with the
//!    `last_sequence` it captured, even with a writer right behind it

/// Error types for all RoostDB operations.
pub mod error;

/// Binary document encoding: typed values, shared keys, streaming encoder.
pub mod codec;

/// Record encryption at rest and the process-wide key registry.
pub mod crypto;

/// The consumed ordered key/value engine, realized over `rusqlite`.
pub mod engine;

/// Process-wide per-path coordination: the writer gate and observers.
pub mod registry;

/// The uniform keystore surface and the engine-backed store.
pub mod keystore;

/// The live/dead split keystore with merged enumeration.
pub mod both;

/// Databases, transactions, raw documents, and change observation.
pub mod database;

/// Compiled queries, paged enumerators, and the compiler contract.
pub mod query;

/// Versioned documents and revision trees.
pub mod revtree;

/// The request/response transport contract consumed by replication.
pub mod transport;

/// The per-peer replication database actor.
pub mod actor;

pub use actor::{
    ChangesListener, DbActor, Rev, RevRequest, RevToInsert, INSERTION_DELAY, MAX_REVS_TO_INSERT,
};
pub use both::BothKeyStore;
pub use database::{
    ChangeInfo, Database, DatabaseConfig, DatabaseObserver, RawDocument, ReadOnlyTransaction,
    Transaction, TransactionState,
};
pub use error::{Error, Result};
pub use keystore::{
    ContentOption, DocumentFlags, EnumeratorOptions, KeyStore, KvStore, Record, RecordEnumerator,
    SortOption,
};
pub use query::{
    CompiledSelect, FullTextTerm, Query, QueryEnumerator, QueryOptions, SelectorCompiler, PAGE_SIZE,
};
pub use revtree::VersionedDoc;
pub use transport::{MessageBuilder, MessageIn, MessageSink, Response};
