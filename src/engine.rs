//! # Underlying Ordered Key/Value Engine
//!
//! This module realizes the storage engine the rest of the crate consumes,
//! over a SQLite connection via `rusqlite`. Each keystore is one table of
//! records keyed by a BLOB primary key; sequence generators live in a shared
//! `kv_sequences` table so stores can share a generator.
//!
//! ## Tables
//!
//! ```text
//! kv_catalog     name (PK), seq_owner
//! kv_sequences   owner (PK), last_seq
//! file_meta      key (PK), value          (UUIDs, shared keys, ...)
//! kv_<name>      key (PK), version, flags, sequence, expiration, value
//! ```
//!
//! ## Concurrency
//!
//! The connection sits behind a mutex so a file handle is `Send + Sync`;
//! serialization of mutation is the caller's job (the per-file writer gate),
//! not this module's. Write transactions map to `BEGIN IMMEDIATE`, read
//! snapshots to a deferred `BEGIN`. WAL mode keeps readers unblocked.
//!
//! ## Encryption
//!
//! When an encryption key is registered for the file's path, record values are
//! sealed through [`RecordCryptor`] on the way in and opened on the way out.
//! Keys, versions, and metadata stay in the clear; they are needed for ordered
//! enumeration.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, ToSql};

use crate::crypto::RecordCryptor;
use crate::error::{Error, Result};
use crate::keystore::{ContentOption, DocumentFlags, EnumeratorOptions, Record, SortOption};

// =============================================================================
// Log Callback
// =============================================================================

/// Engine log code for a failed record read. Expected during ancestor probing
/// of versioned documents, so callers usually silence it.
pub const LOG_READ_NOT_FOUND: i32 = -9;

/// Engine log code for everything else.
pub const LOG_ERROR: i32 = -1;

pub type LogCallback = Box<dyn Fn(i32, &str) + Send + Sync>;

// =============================================================================
// Sort helpers
// =============================================================================

/// The engine table backing a keystore.
pub fn table_name(store: &str) -> String {
    format!("kv_{store}")
}

fn quoted_table(store: &str) -> String {
    format!("\"{}\"", table_name(store))
}

fn validate_store_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::InvalidParameter(format!(
            "invalid keystore name '{name}'"
        )));
    }
    Ok(())
}

// =============================================================================
// SQL Values
// =============================================================================

/// A value read from a statement column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(Vec<u8>),
    Blob(Vec<u8>),
}

impl SqlValue {
    fn from_ref(value: ValueRef<'_>) -> SqlValue {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Float(f),
            ValueRef::Text(t) => SqlValue::Text(t.to_vec()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

/// A parameter bound into a compiled statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Int(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::ToSqlOutput;
        Ok(match self {
            SqlParam::Int(i) => ToSqlOutput::from(*i),
            SqlParam::Double(d) => ToSqlOutput::from(*d),
            SqlParam::Text(s) => ToSqlOutput::from(s.as_str()),
            SqlParam::Blob(b) => ToSqlOutput::from(b.as_slice()),
        })
    }
}

/// One row of a query plan: three engine integers and the detail text.
pub type PlanRow = (i64, i64, i64, String);

/// Basic file information.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub filename: String,
    pub file_size: u64,
}

// =============================================================================
// Engine File
// =============================================================================

/// An open handle on one database file.
pub struct EngineFile {
    conn: Mutex<Connection>,
    path: PathBuf,
    read_only: bool,
    cryptor: Option<RecordCryptor>,
    in_transaction: AtomicBool,
    log: Mutex<Option<LogCallback>>,
}

impl std::fmt::Debug for EngineFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineFile")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl EngineFile {
    /// Opens (creating if needed) the file at `path`. Picks up any encryption
    /// key registered for the path.
    pub fn open(path: &Path, read_only: bool) -> Result<EngineFile> {
        let conn = if read_only {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            Connection::open(path)?
        };

        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;

        if !read_only {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kv_catalog (
                    name      TEXT PRIMARY KEY,
                    seq_owner TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS kv_sequences (
                    owner    TEXT PRIMARY KEY,
                    last_seq INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE IF NOT EXISTS file_meta (
                    key   TEXT PRIMARY KEY,
                    value BLOB NOT NULL
                );",
            )?;
        }

        let cryptor = RecordCryptor::for_registered_path(path)?;

        Ok(EngineFile {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            read_only,
            cryptor,
            in_transaction: AtomicBool::new(false),
            log: Mutex::new(None),
        })
    }

    /// Removes a database file and its WAL sidecars from disk.
    pub fn destroy(path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let mut p = path.as_os_str().to_owned();
            p.push(suffix);
            match std::fs::remove_file(PathBuf::from(p)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::InvalidParameter(format!(
                        "cannot destroy {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn info(&self) -> Result<EngineInfo> {
        let file_size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(EngineInfo {
            filename: self.path.to_string_lossy().into_owned(),
            file_size,
        })
    }

    /// Installs the log callback. Read-not-found reports go through it with
    /// [`LOG_READ_NOT_FOUND`].
    pub fn set_log_callback(&self, callback: LogCallback) {
        *self.log.lock().unwrap() = Some(callback);
    }

    fn report(&self, code: i32, message: &str) {
        if let Some(cb) = self.log.lock().unwrap().as_ref() {
            cb(code, message);
        }
    }

    // =========================================================================
    // Keystores
    // =========================================================================

    /// Opens (creating if needed) a named keystore. `seq_owner` names the
    /// sequence generator; `None` means the store owns its own.
    pub fn open_keystore(&self, name: &str, seq_owner: Option<&str>) -> Result<()> {
        validate_store_name(name)?;
        let owner = seq_owner.unwrap_or(name);
        validate_store_name(owner)?;

        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key        BLOB PRIMARY KEY NOT NULL,
                version    BLOB NOT NULL DEFAULT x'',
                flags      INTEGER NOT NULL DEFAULT 0,
                sequence   INTEGER NOT NULL,
                expiration INTEGER NOT NULL DEFAULT 0,
                value      BLOB NOT NULL DEFAULT x''
            );
            CREATE UNIQUE INDEX IF NOT EXISTS \"{index}\" ON {table} (sequence);",
            table = quoted_table(name),
            index = format!("{}_by_seq", table_name(name)),
        ))?;
        conn.execute(
            "INSERT OR IGNORE INTO kv_catalog (name, seq_owner) VALUES (?1, ?2)",
            params![name, owner],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO kv_sequences (owner, last_seq) VALUES (?1, 0)",
            params![owner],
        )?;
        Ok(())
    }

    /// Drops a keystore and its catalog entries.
    pub fn delete_keystore(&self, name: &str) -> Result<()> {
        validate_store_name(name)?;
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quoted_table(name)))?;
        conn.execute("DELETE FROM kv_catalog WHERE name = ?1", params![name])?;
        conn.execute(
            "DELETE FROM kv_sequences
             WHERE owner = ?1
               AND NOT EXISTS (SELECT 1 FROM kv_catalog WHERE seq_owner = ?1)",
            params![name],
        )?;
        Ok(())
    }

    /// Names of all keystores in the file, in catalog order.
    pub fn keystore_names(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name, seq_owner FROM kv_catalog ORDER BY name")?;
        let names = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Reads a record by key. A miss is reported to the log callback with
    /// [`LOG_READ_NOT_FOUND`] before returning `None`.
    pub fn get_record(
        &self,
        store: &str,
        key: &[u8],
        content: ContentOption,
    ) -> Result<Option<Record>> {
        let conn = self.conn.lock().unwrap();
        let sql = match content {
            ContentOption::MetaOnly => format!(
                "SELECT version, flags, sequence, expiration FROM {} WHERE key = ?1",
                quoted_table(store)
            ),
            ContentOption::WithBody => format!(
                "SELECT version, flags, sequence, expiration, value FROM {} WHERE key = ?1",
                quoted_table(store)
            ),
        };
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![key])?;
        let row = match rows.next()? {
            Some(row) => row,
            None => {
                drop(rows);
                drop(stmt);
                drop(conn);
                self.report(LOG_READ_NOT_FOUND, "record not found");
                return Ok(None);
            }
        };

        let mut record = Record {
            key: key.to_vec(),
            version: row.get(0)?,
            flags: DocumentFlags::from_bits(row.get::<_, i64>(1)? as u32),
            sequence: row.get::<_, i64>(2)? as u64,
            expiration: row.get::<_, i64>(3)? as u64,
            value: Vec::new(),
        };
        if content == ContentOption::WithBody {
            record.value = self.open_value(row.get(4)?)?;
        }
        Ok(Some(record))
    }

    /// Writes a record, optionally under an MVCC precondition.
    ///
    /// Returns the record's sequence after the write, or 0 when the
    /// precondition did not hold. Sequences are allocated only for writes that
    /// actually apply, keeping them dense and strictly increasing.
    #[allow(clippy::too_many_arguments)]
    pub fn set_record(
        &self,
        store: &str,
        seq_owner: &str,
        key: &[u8],
        version: &[u8],
        value: &[u8],
        flags: DocumentFlags,
        replacing: Option<u64>,
        new_sequence: bool,
    ) -> Result<u64> {
        let sealed = self.seal_value(value)?;
        let conn = self.conn.lock().unwrap();
        let table = quoted_table(store);

        let current: Option<u64> = conn
            .query_row(
                &format!("SELECT sequence FROM {table} WHERE key = ?1"),
                params![key],
                |row| row.get::<_, i64>(0).map(|s| s as u64),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match replacing {
            Some(0) if current.is_some() => return Ok(0),
            Some(expected) if expected > 0 && current != Some(expected) => return Ok(0),
            _ => {}
        }

        let sequence = match (replacing, new_sequence) {
            (Some(expected), false) if expected > 0 => expected,
            _ => Self::allocate_sequence(&conn, seq_owner)?,
        };

        conn.execute(
            &format!(
                "INSERT INTO {table} (key, version, flags, sequence, expiration, value)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                     version = excluded.version,
                     flags = excluded.flags,
                     sequence = excluded.sequence,
                     value = excluded.value"
            ),
            params![key, version, flags.bits() as i64, sequence as i64, sealed],
        )?;
        Ok(sequence)
    }

    /// Deletes a record, optionally requiring its current sequence to match.
    pub fn del_record(&self, store: &str, key: &[u8], replacing: Option<u64>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = match replacing {
            None => conn.execute(
                &format!("DELETE FROM {} WHERE key = ?1", quoted_table(store)),
                params![key],
            )?,
            Some(expected) => conn.execute(
                &format!(
                    "DELETE FROM {} WHERE key = ?1 AND sequence = ?2",
                    quoted_table(store)
                ),
                params![key, expected as i64],
            )?,
        };
        Ok(changed > 0)
    }

    pub fn set_expiration(&self, store: &str, key: &[u8], when: u64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET expiration = ?2 WHERE key = ?1",
                quoted_table(store)
            ),
            params![key, when as i64],
        )?;
        Ok(changed > 0)
    }

    pub fn record_count(&self, store: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quoted_table(store)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn last_sequence(&self, owner: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let seq: Option<i64> = conn
            .query_row(
                "SELECT last_seq FROM kv_sequences WHERE owner = ?1",
                params![owner],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(seq.unwrap_or(0) as u64)
    }

    pub fn next_expiration(&self, store: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let min: Option<i64> = conn.query_row(
            &format!(
                "SELECT MIN(expiration) FROM {} WHERE expiration > 0",
                quoted_table(store)
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(min.unwrap_or(0) as u64)
    }

    /// Reads the records an enumeration will visit, already filtered and
    /// ordered. `since` applies to by-sequence enumeration only and is
    /// exclusive.
    pub fn read_records(
        &self,
        store: &str,
        by_sequence: bool,
        since: u64,
        options: EnumeratorOptions,
    ) -> Result<Vec<Record>> {
        let conn = self.conn.lock().unwrap();
        let table = quoted_table(store);

        let body_col = match options.content {
            ContentOption::MetaOnly => "x''",
            ContentOption::WithBody => "value",
        };
        let mut sql = format!(
            "SELECT key, version, flags, sequence, expiration, {body_col} FROM {table} WHERE 1=1"
        );
        if by_sequence {
            sql.push_str(&format!(" AND sequence > {since}"));
        }
        if !options.include_deleted {
            sql.push_str(&format!(
                " AND (flags & {}) = 0",
                DocumentFlags::DELETED.bits()
            ));
        }
        let order_col = if by_sequence { "sequence" } else { "key" };
        match options.sort {
            SortOption::Ascending => sql.push_str(&format!(" ORDER BY {order_col} ASC")),
            SortOption::Descending => sql.push_str(&format!(" ORDER BY {order_col} DESC")),
            SortOption::Unsorted => {}
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let stored: Vec<u8> = row.get(5)?;
            let record = Record {
                key: row.get(0)?,
                version: row.get(1)?,
                flags: DocumentFlags::from_bits(row.get::<_, i64>(2)? as u32),
                sequence: row.get::<_, i64>(3)? as u64,
                expiration: row.get::<_, i64>(4)? as u64,
                value: match options.content {
                    ContentOption::WithBody => self.open_value(stored)?,
                    ContentOption::MetaOnly => stored,
                },
            };
            records.push(record);
        }
        Ok(records)
    }

    fn allocate_sequence(conn: &Connection, owner: &str) -> Result<u64> {
        conn.execute(
            "UPDATE kv_sequences SET last_seq = last_seq + 1 WHERE owner = ?1",
            params![owner],
        )?;
        let seq: i64 = conn.query_row(
            "SELECT last_seq FROM kv_sequences WHERE owner = ?1",
            params![owner],
            |row| row.get(0),
        )?;
        Ok(seq as u64)
    }

    fn seal_value(&self, value: &[u8]) -> Result<Vec<u8>> {
        match &self.cryptor {
            Some(cryptor) => cryptor.seal(value),
            None => Ok(value.to_vec()),
        }
    }

    fn open_value(&self, stored: Vec<u8>) -> Result<Vec<u8>> {
        match &self.cryptor {
            Some(cryptor) if !stored.is_empty() => cryptor.open(&stored),
            _ => Ok(stored),
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Begins a write transaction at read-committed isolation.
    pub fn begin_transaction(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn commit_transaction(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute_batch("COMMIT");
        self.in_transaction.store(false, Ordering::SeqCst);
        result.map_err(Error::from)
    }

    pub fn abort_transaction(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute_batch("ROLLBACK");
        self.in_transaction.store(false, Ordering::SeqCst);
        result.map_err(Error::from)
    }

    /// Begins a read snapshot, unless a transaction is already open on this
    /// handle. Returns whether a snapshot was actually begun (and must be
    /// ended).
    pub fn begin_read(&self) -> Result<bool> {
        if self.in_transaction.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let conn = self.conn.lock().unwrap();
        match conn.execute_batch("BEGIN") {
            Ok(()) => Ok(true),
            Err(e) => {
                self.in_transaction.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    pub fn end_read(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute_batch("COMMIT");
        self.in_transaction.store(false, Ordering::SeqCst);
        result.map_err(Error::from)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Compacts the file in place.
    pub fn compact(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Copies the whole file to `dst`, re-sealing record values under the
    /// target's optional encryption key. Any existing file at `dst` is
    /// replaced.
    pub fn copy_to_file(&self, dst: &Path, key: Option<[u8; 32]>) -> Result<()> {
        EngineFile::destroy(dst)?;
        let dst_cryptor = match key {
            Some(key) => Some(RecordCryptor::new(dst, &key)?),
            None => None,
        };

        let dst_file = EngineFile::open(dst, false)?;

        // Metadata rows copy verbatim.
        {
            let src = self.conn.lock().unwrap();
            let dst_conn = dst_file.conn.lock().unwrap();
            let mut stmt = src.prepare("SELECT key, value FROM file_meta")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                dst_conn.execute(
                    "INSERT OR REPLACE INTO file_meta (key, value) VALUES (?1, ?2)",
                    params![row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?],
                )?;
            }
            let mut stmt = src.prepare("SELECT owner, last_seq FROM kv_sequences")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                dst_conn.execute(
                    "INSERT OR REPLACE INTO kv_sequences (owner, last_seq) VALUES (?1, ?2)",
                    params![row.get::<_, String>(0)?, row.get::<_, i64>(1)?],
                )?;
            }
        }

        for (name, seq_owner) in self.keystore_names()? {
            dst_file.open_keystore(&name, Some(&seq_owner))?;
            let records = self.read_records(
                &name,
                false,
                0,
                EnumeratorOptions {
                    include_deleted: true,
                    sort: SortOption::Unsorted,
                    content: ContentOption::WithBody,
                },
            )?;
            let dst_conn = dst_file.conn.lock().unwrap();
            for record in records {
                let sealed = match &dst_cryptor {
                    Some(cryptor) => cryptor.seal(&record.value)?,
                    None => record.value.clone(),
                };
                dst_conn.execute(
                    &format!(
                        "INSERT OR REPLACE INTO {}
                         (key, version, flags, sequence, expiration, value)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        quoted_table(&name)
                    ),
                    params![
                        record.key,
                        record.version,
                        record.flags.bits() as i64,
                        record.sequence as i64,
                        record.expiration as i64,
                        sealed
                    ],
                )?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // File Metadata
    // =========================================================================

    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM file_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
    }

    pub fn put_meta(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO file_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // =========================================================================
    // Query Support
    // =========================================================================

    /// True if a table or view with this exact name exists.
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Creates the partial index queries with expiration predicates rely on.
    pub fn create_expiration_index(&self, store: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS \"{}_by_exp\" ON {} (expiration) WHERE expiration > 0",
            table_name(store),
            quoted_table(store),
        ))?;
        Ok(())
    }

    /// Compiles a statement far enough to learn its column count. Also
    /// validates the SQL the query compiler produced.
    pub fn statement_columns(&self, sql: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let stmt = conn.prepare(sql)?;
        Ok(stmt.column_count())
    }

    /// Whether a compiled statement knows a named parameter.
    pub fn statement_has_parameter(&self, sql: &str, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let stmt = conn.prepare(sql)?;
        Ok(stmt.parameter_index(name)?.is_some())
    }

    /// Executes a compiled statement and returns up to `limit` rows starting
    /// at `offset`. Parameters are bound by name; names the statement does not
    /// use are skipped (the caller validates them up front).
    pub fn run_statement(
        &self,
        sql: &str,
        bindings: &[(String, SqlParam)],
        limit: Option<u64>,
        offset: u64,
    ) -> Result<Vec<Vec<SqlValue>>> {
        let paged_sql = match (limit, offset) {
            (None, 0) => sql.to_string(),
            (None, off) => format!("{sql} LIMIT -1 OFFSET {off}"),
            (Some(n), off) => format!("{sql} LIMIT {n} OFFSET {off}"),
        };

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&paged_sql)?;
        for (name, value) in bindings {
            if let Some(index) = stmt.parameter_index(name)? {
                stmt.raw_bind_parameter(index, value)?;
            }
        }

        let n_cols = stmt.column_count();
        let mut rows = stmt.raw_query();
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cols = Vec::with_capacity(n_cols);
            for i in 0..n_cols {
                cols.push(SqlValue::from_ref(row.get_ref(i)?));
            }
            result.push(cols);
        }
        Ok(result)
    }

    /// The engine's query plan for a compiled statement.
    pub fn explain_statement(&self, sql: &str) -> Result<Vec<PlanRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {sql}"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<Vec<PlanRow>>>()?;
        Ok(rows)
    }

    /// Fetches the FTS row for a document id, for matched-text lookup.
    pub fn fts_row(&self, table: &str, docid: u64) -> Result<Option<Vec<SqlValue>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT * FROM \"{table}\" WHERE docid = ?1"))?;
        let n_cols = stmt.column_count();
        let mut rows = stmt.query(params![docid as i64])?;
        match rows.next()? {
            Some(row) => {
                let mut cols = Vec::with_capacity(n_cols);
                for i in 0..n_cols {
                    cols.push(SqlValue::from_ref(row.get_ref(i)?));
                }
                Ok(Some(cols))
            }
            None => Ok(None),
        }
    }

    /// Escape hatch for auxiliary schema (FTS index tables and the like).
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if let Err(err) = conn.execute_batch(sql) {
            drop(conn);
            self.report(LOG_ERROR, &err.to_string());
            return Err(err.into());
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, EngineFile) {
        let dir = tempfile::TempDir::new().unwrap();
        let file = EngineFile::open(&dir.path().join("test.roost"), false).unwrap();
        file.open_keystore("docs", None).unwrap();
        (dir, file)
    }

    #[test]
    fn test_set_get_round_trip() {
        let (_dir, file) = open_temp();
        let seq = file
            .set_record(
                "docs",
                "docs",
                b"a",
                b"1-ab",
                b"body",
                DocumentFlags::NONE,
                None,
                true,
            )
            .unwrap();
        assert_eq!(seq, 1);

        let rec = file
            .get_record("docs", b"a", ContentOption::WithBody)
            .unwrap()
            .unwrap();
        assert_eq!(rec.version, b"1-ab");
        assert_eq!(rec.value, b"body");
        assert_eq!(rec.sequence, 1);

        let meta = file
            .get_record("docs", b"a", ContentOption::MetaOnly)
            .unwrap()
            .unwrap();
        assert!(meta.value.is_empty());
        assert_eq!(meta.sequence, 1);
    }

    #[test]
    fn test_mvcc_preconditions() {
        let (_dir, file) = open_temp();
        let seq1 = file
            .set_record("docs", "docs", b"a", b"", b"v1", DocumentFlags::NONE, Some(0), true)
            .unwrap();
        assert_eq!(seq1, 1);

        // Expect-not-exists against an existing record.
        let conflict = file
            .set_record("docs", "docs", b"a", b"", b"v2", DocumentFlags::NONE, Some(0), true)
            .unwrap();
        assert_eq!(conflict, 0);

        // Wrong expected sequence.
        let conflict = file
            .set_record("docs", "docs", b"a", b"", b"v2", DocumentFlags::NONE, Some(9), true)
            .unwrap();
        assert_eq!(conflict, 0);

        // Matching precondition applies and bumps the sequence.
        let seq2 = file
            .set_record("docs", "docs", b"a", b"", b"v2", DocumentFlags::NONE, Some(seq1), true)
            .unwrap();
        assert_eq!(seq2, 2);

        // No sequence was consumed by the conflicting attempts.
        assert_eq!(file.last_sequence("docs").unwrap(), 2);
    }

    #[test]
    fn test_del_with_precondition() {
        let (_dir, file) = open_temp();
        let seq = file
            .set_record("docs", "docs", b"a", b"", b"v", DocumentFlags::NONE, None, true)
            .unwrap();
        assert!(!file.del_record("docs", b"a", Some(seq + 5)).unwrap());
        assert!(file.del_record("docs", b"a", Some(seq)).unwrap());
        assert!(file
            .get_record("docs", b"a", ContentOption::MetaOnly)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_shared_sequence_generator() {
        let (_dir, file) = open_temp();
        file.open_keystore("del_docs", Some("docs")).unwrap();

        let s1 = file
            .set_record("docs", "docs", b"a", b"", b"", DocumentFlags::NONE, None, true)
            .unwrap();
        let s2 = file
            .set_record("del_docs", "docs", b"b", b"", b"", DocumentFlags::DELETED, None, true)
            .unwrap();
        let s3 = file
            .set_record("docs", "docs", b"c", b"", b"", DocumentFlags::NONE, None, true)
            .unwrap();
        assert_eq!((s1, s2, s3), (1, 2, 3));
        assert_eq!(file.last_sequence("docs").unwrap(), 3);
    }

    #[test]
    fn test_enumeration_orders() {
        let (_dir, file) = open_temp();
        for key in [b"c".as_slice(), b"a", b"b"] {
            file.set_record("docs", "docs", key, b"", b"", DocumentFlags::NONE, None, true)
                .unwrap();
        }

        let by_key = file
            .read_records("docs", false, 0, EnumeratorOptions::default())
            .unwrap();
        let keys: Vec<&[u8]> = by_key.iter().map(|r| r.key.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b", b"c"]);

        let by_seq = file
            .read_records("docs", true, 1, EnumeratorOptions::default())
            .unwrap();
        let seqs: Vec<u64> = by_seq.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn test_expiration_aggregation() {
        let (_dir, file) = open_temp();
        for key in [b"a".as_slice(), b"b"] {
            file.set_record("docs", "docs", key, b"", b"", DocumentFlags::NONE, None, true)
                .unwrap();
        }
        assert_eq!(file.next_expiration("docs").unwrap(), 0);
        assert!(file.set_expiration("docs", b"a", 500).unwrap());
        assert!(file.set_expiration("docs", b"b", 300).unwrap());
        assert_eq!(file.next_expiration("docs").unwrap(), 300);
    }

    #[test]
    fn test_encrypted_values_at_rest() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("enc.roost");
        crate::crypto::register_encryption_key(&path, [7u8; 32]);

        let file = EngineFile::open(&path, false).unwrap();
        file.open_keystore("docs", None).unwrap();
        file.set_record("docs", "docs", b"a", b"", b"plain body", DocumentFlags::NONE, None, true)
            .unwrap();

        // Round-trips through the cryptor.
        let rec = file
            .get_record("docs", b"a", ContentOption::WithBody)
            .unwrap()
            .unwrap();
        assert_eq!(rec.value, b"plain body");

        // Raw bytes on disk are not the plaintext.
        let conn = file.conn.lock().unwrap();
        let raw: Vec<u8> = conn
            .query_row("SELECT value FROM kv_docs WHERE key = x'61'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_ne!(raw, b"plain body");
        drop(conn);

        crate::crypto::unregister_encryption_key(&path);
    }

    #[test]
    fn test_copy_to_file_with_rekey() {
        let dir = tempfile::TempDir::new().unwrap();
        let src_path = dir.path().join("src.roost");
        let dst_path = dir.path().join("dst.roost");

        let src = EngineFile::open(&src_path, false).unwrap();
        src.open_keystore("docs", None).unwrap();
        src.set_record("docs", "docs", b"a", b"1-x", b"hello", DocumentFlags::NONE, None, true)
            .unwrap();

        let key = [9u8; 32];
        src.copy_to_file(&dst_path, Some(key)).unwrap();

        crate::crypto::register_encryption_key(&dst_path, key);
        let dst = EngineFile::open(&dst_path, false).unwrap();
        let rec = dst
            .get_record("docs", b"a", ContentOption::WithBody)
            .unwrap()
            .unwrap();
        assert_eq!(rec.value, b"hello");
        assert_eq!(rec.sequence, 1);
        assert_eq!(dst.last_sequence("docs").unwrap(), 1);
        crate::crypto::unregister_encryption_key(&dst_path);
    }

    #[test]
    fn test_statement_helpers() {
        let (_dir, file) = open_temp();
        file.set_record("docs", "docs", b"a", b"", b"", DocumentFlags::NONE, None, true)
            .unwrap();

        let sql = "SELECT key, sequence FROM kv_docs WHERE sequence >= $_min ORDER BY key";
        assert_eq!(file.statement_columns(sql).unwrap(), 2);
        assert!(file.statement_has_parameter(sql, "$_min").unwrap());
        assert!(!file.statement_has_parameter(sql, "$_max").unwrap());

        let rows = file
            .run_statement(sql, &[("$_min".to_string(), SqlParam::Int(1))], Some(10), 0)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], SqlValue::Integer(1));

        let plan = file.explain_statement(sql).unwrap();
        assert!(!plan.is_empty());
    }
}
