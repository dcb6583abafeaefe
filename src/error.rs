//! # Error Handling for RoostDB
//!
//! This module defines the error types used throughout RoostDB. We use a single
//! error enum ([`Error`]) to represent all failure modes, which keeps function
//! signatures simple and lets callers match uniformly.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Engine | SQLite error, I/O error | Log and investigate |
//! | Query | unknown parameter, bad seek | Fix the call site |
//! | Data | corrupt revision body | Treat the document as damaged |
//! | Lifecycle | operation on a deleted database | Reopen |
//!
//! A failed engine call inside a [`Transaction`](crate::database::Transaction)
//! also flips the transaction's disposition to abort before the error
//! propagates, so a partially applied transaction can never commit.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in RoostDB operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The underlying engine reported a failure.
    ///
    /// Wraps any error from the `rusqlite` crate: a locked or corrupted file,
    /// a full disk, or a malformed statement (the latter indicates a bug in
    /// the query compiler feeding us SQL).
    #[error("engine failure: {0}")]
    Engine(#[from] rusqlite::Error),

    /// A query requires a full-text index that does not exist, or matched-text
    /// lookup was attempted on a query with no FTS tables.
    #[error("no such index: {0}")]
    NoSuchIndex(String),

    /// A malformed argument: parameter bindings whose root is not a map, or a
    /// seek past the end of query results.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A bound query parameter name is not known to the compiled statement.
    #[error("unknown query property '{0}'")]
    InvalidQueryParam(String),

    /// The operation is not legal in the current state, e.g. seeking backward
    /// across pages or refreshing on a one-shot enumerator.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A stored revision body failed to parse as a binary document.
    #[error("corrupt revision data")]
    CorruptRevisionData,

    /// The requested record, document, or revision does not exist.
    ///
    /// Only an error when the calling operation requires existence. Checkpoint
    /// reads translate it to an empty body, peer checkpoint GETs to HTTP 404,
    /// and ancestor discovery ignores it entirely.
    #[error("not found")]
    NotFound,

    /// The database has been deleted; its handles are gone and every further
    /// operation fails with this error.
    #[error("database is not open")]
    NotOpen,

    /// Encryption or decryption of a record failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// A binary document could not be decoded, or the encoder was misused.
    #[error("codec error: {0}")]
    Codec(String),

    /// The document already has a conflicting revision branch and the write
    /// did not allow conflicts.
    #[error("document revision conflict")]
    Conflict,
}

impl Error {
    /// True if this error means "the thing does not exist" rather than
    /// "something went wrong".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound | Error::Engine(rusqlite::Error::QueryReturnedNoRows)
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
