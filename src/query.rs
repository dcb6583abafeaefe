//! # Compiled Queries and Paged Enumeration
//!
//! A [`Query`] wraps one compiled statement produced by a
//! [`SelectorCompiler`] from a structured selector. Execution happens through
//! a [`QueryEnumerator`], which records result rows into successive
//! [`QueryPage`]s: immutable binary documents of up to [`PAGE_SIZE`] rows,
//! each row an inner array of column values followed by a missing-column
//! bitmap.
//!
//! ## Snapshot Discipline
//!
//! An enumerator is created under a read snapshot and captures the keystore's
//! `last_sequence` at that moment. A non-one-shot enumerator drains every row
//! into a single page while still inside the snapshot. A one-shot enumerator
//! pages lazily instead, and registers as a pre-transaction observer on the
//! file: any writer about to take the gate forces it to drain first, so its
//! pages always reflect the captured sequence even with a writer arriving
//! right behind it.
//!
//! The lazy cursor re-executes the compiled statement with an advancing row
//! offset per page. That is sound precisely because of the observer contract:
//! no write can land between two page fetches of a live one-shot enumerator.
//! Compiled statements therefore must not carry their own LIMIT clause.
//!
//! ## Refresh
//!
//! `refresh` re-runs the query against the stored sequence snapshot. When the
//! engine reports no sequence movement the factory short-circuits; when rows
//! come back, byte-identity of the recorded pages decides whether anything
//! actually changed.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::both::BothKeyStore;
use crate::codec::{Doc, Encoder, SharedKeys, Value};
use crate::database::{Database, ReadOnlyTransaction};
use crate::engine::{EngineFile, SqlParam, SqlValue};
use crate::error::{Error, Result};
use crate::keystore::{KeyStore, KvStore};
use crate::registry::{FileState, PreTransactionObserver};

/// Number of rows recorded into one page.
pub const PAGE_SIZE: u64 = 50;

// Implicit leading columns in a full-text query result.
const FTS_ROWID_COL: usize = 0;
const FTS_OFFSETS_COL: usize = 1;

// =============================================================================
// Compiler Contract
// =============================================================================

/// Everything the selector compiler reports about a compiled selector.
#[derive(Debug, Clone)]
pub struct CompiledSelect {
    /// The statement text. Must not carry a LIMIT clause; the enumerator
    /// appends its own paging window.
    pub sql: String,
    /// Names of the bindable parameters (without the `$_` binding prefix).
    pub parameters: BTreeSet<String>,
    /// Full-text index tables the statement reads.
    pub fts_tables: Vec<String>,
    /// Result column titles.
    pub column_titles: Vec<String>,
    /// Index of the first user-visible column; earlier columns are plumbing
    /// (FTS rowid and offsets).
    pub first_custom_column: usize,
    /// Whether the statement touches record expiration times.
    pub uses_expiration: bool,
}

/// Translates a structured selector into a [`CompiledSelect`] against a
/// keystore. The translation itself is an external concern; queries consume
/// only its outputs.
pub trait SelectorCompiler {
    fn compile(&self, selector: &[u8], store: &KvStore) -> Result<CompiledSelect>;
}

// =============================================================================
// Query Options
// =============================================================================

/// Per-execution options, snapshotted by each enumerator.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Parameter bindings: either a binary document map or brace-wrapped JSON
    /// text.
    pub param_bindings: Option<Vec<u8>>,
    /// One-shot enumerators page lazily and drain when a writer arrives; they
    /// cannot seek backward or refresh.
    pub one_shot: bool,
}

/// One matched full-text term within the current row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullTextTerm {
    /// The FTS row (docid) the match came from.
    pub data_source: u64,
    /// Index of the matched key (column) in the FTS table.
    pub key_index: u32,
    /// Index of the matched term within the query.
    pub term_index: u32,
    /// Byte offset of the match in the indexed text.
    pub start: u32,
    /// Byte length of the match.
    pub length: u32,
}

// =============================================================================
// Query
// =============================================================================

struct QueryInner {
    engine: Arc<EngineFile>,
    file: Arc<FileState>,
    store: Arc<BothKeyStore>,
    doc_keys: Arc<SharedKeys>,
    selector: Vec<u8>,
    sql: String,
    parameters: BTreeSet<String>,
    fts_tables: Vec<String>,
    column_titles: Vec<String>,
    first_custom: usize,
    n_cols: usize,
}

/// A compiled query; cheap to clone, factory for enumerators.
#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query").finish()
    }
}

impl Query {
    /// Compiles a selector against the database's document store.
    pub fn new(db: &Database, selector: &[u8], compiler: &dyn SelectorCompiler) -> Result<Query> {
        let engine = db.engine()?;
        let store = db.default_keystore()?;

        info!("compiling query: {}", String::from_utf8_lossy(selector));
        let compiled = compiler.compile(selector, store.live_store())?;

        // Parameters prefixed `opt_` are optional; strip them so unbound ones
        // don't warn.
        let parameters: BTreeSet<String> = compiled
            .parameters
            .iter()
            .filter(|p| !p.starts_with("opt_"))
            .cloned()
            .collect();

        for fts_table in &compiled.fts_tables {
            if !engine.table_exists(fts_table)? {
                return Err(Error::NoSuchIndex(
                    "'match' test requires a full-text index".into(),
                ));
            }
        }

        if compiled.uses_expiration {
            engine.create_expiration_index(store.live_store().name())?;
        }

        // Compiling the statement validates the SQL and yields the column
        // count.
        let n_cols = engine.statement_columns(&compiled.sql)?;
        info!("compiled as {}", compiled.sql);

        Ok(Query {
            inner: Arc::new(QueryInner {
                engine,
                file: Arc::clone(db.file()),
                store,
                doc_keys: db.document_keys(),
                selector: selector.to_vec(),
                sql: compiled.sql,
                parameters,
                fts_tables: compiled.fts_tables,
                column_titles: compiled.column_titles,
                first_custom: compiled.first_custom_column,
                n_cols,
            }),
        })
    }

    /// Number of user-visible result columns.
    pub fn column_count(&self) -> usize {
        self.inner.n_cols - self.inner.first_custom
    }

    pub fn column_titles(&self) -> &[String] {
        &self.inner.column_titles
    }

    /// The document store's current high-water sequence.
    pub fn last_sequence(&self) -> Result<u64> {
        self.inner.store.last_sequence()
    }

    /// Looks up the original text a full-text term matched against.
    ///
    /// Returns empty (with a warning) when the FTS table has no row for the
    /// term's docid.
    pub fn matched_text(&self, term: &FullTextTerm) -> Result<Vec<u8>> {
        let table = self
            .inner
            .fts_tables
            .first()
            .ok_or_else(|| Error::NoSuchIndex("query has no full-text tables".into()))?;

        match self.inner.engine.fts_row(table, term.data_source)? {
            Some(columns) => Ok(match columns.get(term.key_index as usize) {
                Some(SqlValue::Text(text)) => text.clone(),
                Some(SqlValue::Blob(blob)) => blob.clone(),
                _ => Vec::new(),
            }),
            None => {
                warn!(
                    "FTS index {table} has no row for docid {}",
                    term.data_source
                );
                Ok(Vec::new())
            }
        }
    }

    /// The statement text, the engine's query plan, and the original selector.
    pub fn explain(&self) -> Result<String> {
        let mut out = String::new();
        out.push_str(&self.inner.sql);
        out.push_str("\n\n");
        for (a, b, c, detail) in self.inner.engine.explain_statement(&self.inner.sql)? {
            out.push_str(&format!("{a}|{b}|{c}| {detail}\n"));
        }
        out.push('\n');
        out.push_str(&String::from_utf8_lossy(&self.inner.selector));
        out.push('\n');
        Ok(out)
    }

    /// Creates an enumerator for this query.
    pub fn create_enumerator(&self, options: &QueryOptions) -> Result<QueryEnumerator> {
        self.create_enumerator_since(options, 0)?
            .ok_or_else(|| Error::InvalidParameter("enumerator factory returned nothing".into()))
    }

    /// Creates an enumerator, unless the store is still at `last_seq` (the
    /// caller's results are already up to date). Runs under a read snapshot so
    /// the sequence check and the query observe the same committed state.
    pub(crate) fn create_enumerator_since(
        &self,
        options: &QueryOptions,
        last_seq: u64,
    ) -> Result<Option<QueryEnumerator>> {
        let snapshot = ReadOnlyTransaction::for_engine(Arc::clone(&self.inner.engine))?;
        let current_seq = self.inner.store.last_sequence()?;
        if last_seq > 0 && last_seq == current_seq {
            return Ok(None);
        }
        let enumerator = QueryEnumerator::new(self.clone(), options.clone(), current_seq)?;
        drop(snapshot);
        Ok(Some(enumerator))
    }
}

// =============================================================================
// Query Pages
// =============================================================================

/// A recorded window of result rows: a binary document holding, per row, a
/// columns array and a missing-column bitmap.
pub struct QueryPage {
    doc: Doc,
    first_row: u64,
    n_rows: u64,
    /// Current row within the page; a fresh page is positioned on its first
    /// row.
    row: u64,
    first_custom: usize,
}

impl QueryPage {
    fn new(doc: Doc, first_row: u64, first_custom: usize) -> QueryPage {
        let n_rows = doc.root().as_array().map(|a| a.len() as u64 / 2).unwrap_or(0);
        QueryPage {
            doc,
            first_row,
            n_rows,
            row: 0,
            first_custom,
        }
    }

    /// Absolute index of this page's first row.
    pub fn first_row(&self) -> u64 {
        self.first_row
    }

    pub fn row_count(&self) -> u64 {
        self.n_rows
    }

    /// Page byte-identity implies result equality.
    pub fn has_equal_contents(&self, other: &QueryPage) -> bool {
        self.doc.data() == other.doc.data()
    }

    /// Positions on an absolute row index; false when outside this page.
    fn seek_abs(&mut self, row_index: u64) -> bool {
        if row_index < self.first_row || row_index - self.first_row >= self.n_rows {
            return false;
        }
        self.row = row_index - self.first_row;
        true
    }

    /// Advances to the following row; false past the end.
    fn next(&mut self) -> bool {
        self.row += 1;
        self.row < self.n_rows
    }

    fn entry(&self, offset: u64) -> &Value {
        &self.doc.root().as_array().expect("page root is an array")[(self.row * 2 + offset) as usize]
    }

    /// User-visible column values of the current row.
    pub fn columns(&self) -> &[Value] {
        &self.entry(0).as_array().expect("row is an array")[self.first_custom..]
    }

    /// All column values of the current row, including FTS plumbing columns.
    pub fn all_columns(&self) -> &[Value] {
        self.entry(0).as_array().expect("row is an array")
    }

    /// Bitmap of SQL-NULL columns: bit `i` set iff column `i` (i < 64) was
    /// NULL.
    pub fn missing_columns(&self) -> u64 {
        self.entry(1).as_u64().unwrap_or(0)
    }

    /// Parses the FTS offsets column of the current row.
    ///
    /// The offsets value is a whitespace-separated stream of integers, four
    /// per term; the FTS rowid column supplies the data source.
    pub fn full_text_terms(&self) -> Vec<FullTextTerm> {
        let all = self.all_columns();
        let data_source = all
            .get(FTS_ROWID_COL)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let offsets = all
            .get(FTS_OFFSETS_COL)
            .and_then(Value::as_string)
            .unwrap_or_default();

        let mut numbers = offsets
            .split_whitespace()
            .filter_map(|token| token.parse::<u32>().ok());
        let mut terms = Vec::new();
        while let (Some(key_index), Some(term_index), Some(start), Some(length)) = (
            numbers.next(),
            numbers.next(),
            numbers.next(),
            numbers.next(),
        ) {
            terms.push(FullTextTerm {
                data_source,
                key_index,
                term_index,
                start,
                length,
            });
        }
        terms
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// The stateful half of an enumerator shared with the pre-transaction
/// observer: the paging cursor over the compiled statement plus the page a
/// forced drain produces.
struct QueryCursor {
    engine: Arc<EngineFile>,
    file: Arc<FileState>,
    sql: String,
    bindings: Vec<(String, SqlParam)>,
    n_cols: usize,
    first_custom: usize,
    doc_keys: Arc<SharedKeys>,
    result_keys: Arc<SharedKeys>,
    /// Rows pulled from the statement so far; doubles as the next offset.
    rows_fetched: u64,
    /// Whether the statement may still produce rows.
    open: bool,
    /// Page pre-recorded by a fast-forward, awaiting promotion.
    next_page: Option<QueryPage>,
    observing: bool,
    observer_id: u64,
}

impl QueryCursor {
    /// Records up to `max` rows (all remaining when `None`) into a page.
    /// `None` result means the statement is exhausted.
    fn record_rows(&mut self, max: Option<u64>) -> Result<Option<QueryPage>> {
        if !self.open {
            return Ok(None);
        }
        let rows = self
            .engine
            .run_statement(&self.sql, &self.bindings, max, self.rows_fetched)?;
        let fetched = rows.len() as u64;
        if max.map_or(true, |m| fetched < m) {
            self.open = false;
            self.end_observing();
        }
        if fetched == 0 {
            return Ok(None);
        }

        let first_row = self.rows_fetched;
        self.rows_fetched += fetched;

        let mut enc = Encoder::new();
        enc.set_shared_keys(Arc::clone(&self.result_keys));
        enc.begin_array_hint(rows.len() * 2);
        for row in &rows {
            self.encode_row(&mut enc, row)?;
        }
        enc.end_array()?;
        let doc = enc.finish_doc()?;
        Ok(Some(QueryPage::new(doc, first_row, self.first_custom)))
    }

    fn encode_row(&self, enc: &mut Encoder, row: &[SqlValue]) -> Result<()> {
        let mut missing: u64 = 0;
        enc.begin_array_hint(self.n_cols);
        for (i, column) in row.iter().enumerate() {
            if !self.encode_column(enc, i, column)? && i < 64 {
                missing |= 1 << i;
            }
        }
        enc.end_array()?;
        enc.write_uint(missing);
        Ok(())
    }

    /// Encodes one column value; false means the column is missing (SQL NULL).
    fn encode_column(&self, enc: &mut Encoder, i: usize, column: &SqlValue) -> Result<bool> {
        match column {
            SqlValue::Null => {
                enc.write_null();
                return Ok(false);
            }
            SqlValue::Integer(int) => enc.write_int(*int),
            SqlValue::Float(float) => enc.write_double(*float),
            SqlValue::Blob(blob) if i >= self.first_custom => {
                // Custom-column blobs are stored binary documents encoded with
                // the database's document keys; re-encode them under the
                // result keys.
                let value = Value::from_data(blob, Some(&self.doc_keys))
                    .map_err(|_| Error::CorruptRevisionData)?;
                enc.write_value(&value);
            }
            SqlValue::Blob(blob) => enc.write_string(blob),
            SqlValue::Text(text) => enc.write_string(text),
        }
        Ok(true)
    }

    /// Steps past rows without recording them. Returns how many were skipped.
    fn skip_rows(&mut self, n: u64) -> Result<u64> {
        if !self.open || n == 0 {
            return Ok(0);
        }
        let rows = self
            .engine
            .run_statement(&self.sql, &self.bindings, Some(n), self.rows_fetched)?;
        let fetched = rows.len() as u64;
        if fetched < n {
            self.open = false;
            self.end_observing();
        }
        self.rows_fetched += fetched;
        Ok(fetched)
    }

    /// Drains every remaining row into `next_page`.
    fn fast_forward(&mut self) -> Result<()> {
        if self.open {
            debug_assert!(self.next_page.is_none());
            self.next_page = self.record_rows(None)?;
        }
        Ok(())
    }

    fn end_observing(&mut self) {
        if self.observing {
            self.observing = false;
            self.file.remove_pre_transaction_observer(self.observer_id);
        }
    }

    fn release(&mut self) {
        self.open = false;
        self.end_observing();
    }
}

impl PreTransactionObserver for QueryCursor {
    fn pre_transaction(&mut self) {
        self.end_observing();
        if let Err(err) = self.fast_forward() {
            warn!("one-shot query failed to drain before transaction: {err}");
            self.open = false;
        }
    }
}

// =============================================================================
// Query Enumerator
// =============================================================================

/// Executes a compiled statement and walks its recorded pages.
pub struct QueryEnumerator {
    query: Query,
    options: QueryOptions,
    last_sequence: u64,
    cursor: Arc<Mutex<QueryCursor>>,
    cur: Option<QueryPage>,
    old: Option<QueryPage>,
    cur_row: i64,
}

impl std::fmt::Debug for QueryEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEnumerator").finish()
    }
}

impl QueryEnumerator {
    fn new(query: Query, options: QueryOptions, last_sequence: u64) -> Result<QueryEnumerator> {
        let inner = &query.inner;

        // Bind parameters with type coercion, tracking which required names
        // remain unbound.
        let mut unbound = inner.parameters.clone();
        let mut bindings = Vec::new();
        if let Some(raw) = &options.param_bindings {
            let root = parse_bindings(raw)?;
            let entries = root
                .as_map()
                .ok_or_else(|| {
                    Error::InvalidParameter("query parameter bindings must be a map".into())
                })?
                .to_vec();
            for (key, value) in entries {
                unbound.remove(&key);
                let sql_key = format!("$_{key}");
                let param = match &value {
                    Value::Null => continue, // bindable but left as MISSING
                    Value::Bool(b) => SqlParam::Int(*b as i64),
                    Value::Int(i) => SqlParam::Int(*i),
                    Value::UInt(u) => SqlParam::Double(*u as f64),
                    Value::Double(d) => SqlParam::Double(*d),
                    Value::String(s) => SqlParam::Text(String::from_utf8_lossy(s).into_owned()),
                    other => {
                        // Everything else travels as an encoded binary blob.
                        let mut enc = Encoder::new();
                        enc.write_value(other);
                        SqlParam::Blob(enc.finish()?)
                    }
                };
                if !inner.engine.statement_has_parameter(&inner.sql, &sql_key)? {
                    return Err(Error::InvalidQueryParam(key));
                }
                bindings.push((sql_key, param));
            }
        }
        if !unbound.is_empty() {
            let names: Vec<String> = unbound.iter().map(|p| format!(" ${p}")).collect();
            warn!(
                "some query parameters were left unbound and will have value MISSING:{}",
                names.concat()
            );
        }

        // The recording encoder gets its own shared keys, because results may
        // carry keys the document table has never seen.
        let cursor = Arc::new(Mutex::new(QueryCursor {
            engine: Arc::clone(&inner.engine),
            file: Arc::clone(&inner.file),
            sql: inner.sql.clone(),
            bindings,
            n_cols: inner.n_cols,
            first_custom: inner.first_custom,
            doc_keys: Arc::clone(&inner.doc_keys),
            result_keys: SharedKeys::new(),
            rows_fetched: 0,
            open: true,
            next_page: None,
            observing: false,
            observer_id: 0,
        }));

        if options.one_shot {
            // Observe transactions starting, so the rest of the result rows
            // are read before the database changes underneath.
            let as_observer: Arc<Mutex<dyn PreTransactionObserver>> = cursor.clone();
            let observer_id = inner
                .file
                .add_pre_transaction_observer(Arc::downgrade(&as_observer));
            let mut guard = cursor.lock().unwrap();
            guard.observer_id = observer_id;
            guard.observing = true;
        } else {
            cursor.lock().unwrap().fast_forward()?;
        }

        Ok(QueryEnumerator {
            query,
            options,
            last_sequence,
            cursor,
            cur: None,
            old: None,
            cur_row: -1,
        })
    }

    /// The sequence snapshot this enumerator's results are consistent with.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Index of the current row, -1 before the first `next`.
    pub fn current_row(&self) -> i64 {
        self.cur_row
    }

    /// Advances to the next row; false at end of results.
    pub fn next(&mut self) -> Result<bool> {
        let advanced = match self.cur.as_mut() {
            Some(page) => page.next(),
            None => false,
        };
        if !advanced {
            let promoted = self.cursor.lock().unwrap().next_page.take();
            if let Some(page) = promoted {
                self.cur = Some(page);
            } else {
                if !self.options.one_shot {
                    // Keep the drained page around for refresh comparison.
                    if let Some(page) = self.cur.take() {
                        self.old = Some(page);
                    }
                }
                self.cur = self.cursor.lock().unwrap().record_rows(Some(PAGE_SIZE))?;
            }
        }
        if self.cur.is_some() {
            self.cur_row += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Random access to an absolute row index.
    ///
    /// Seeking to the current row is a no-op. Backward seeks across page
    /// boundaries are only legal onto the row just before the current page's
    /// first row; deeper backward seeks fail. Seeking past the end fails with
    /// [`Error::InvalidParameter`].
    pub fn seek(&mut self, row_index: i64) -> Result<()> {
        if row_index == self.cur_row {
            return Ok(());
        }
        if row_index >= 0 {
            if let Some(page) = self.cur.as_mut() {
                if page.seek_abs(row_index as u64) {
                    self.cur_row = row_index;
                    return Ok(());
                }
            }
        }

        if row_index < self.cur_row {
            // Seeking back: only to the start of the current page.
            let to_page_start = self
                .cur
                .as_ref()
                .is_some_and(|page| row_index + 1 == page.first_row() as i64);
            if !to_page_start {
                return Err(Error::UnsupportedOperation(
                    "one-shot query enumerator cannot seek back".into(),
                ));
            }
            let mut page = self.cur.take().expect("current page checked above");
            page.seek_abs(page.first_row());
            self.cursor.lock().unwrap().next_page = Some(page);
        } else {
            // Seeking forward past the current page.
            let row_index = row_index as u64;
            let mut cursor = self.cursor.lock().unwrap();
            if let Some(next) = cursor.next_page.as_mut() {
                // A pre-recorded page holds everything remaining, so it either
                // has the row or the row doesn't exist.
                if !next.seek_abs(row_index) {
                    return Err(Error::InvalidParameter(
                        "seeking past end of query results".into(),
                    ));
                }
                let page = cursor.next_page.take();
                drop(cursor);
                self.cur = page;
            } else {
                self.cur = None;
                while cursor.rows_fetched < row_index {
                    let wanted = row_index - cursor.rows_fetched;
                    if cursor.skip_rows(wanted)? < wanted {
                        return Err(Error::InvalidParameter(
                            "seeking past end of query results".into(),
                        ));
                    }
                }
                let page = cursor.record_rows(Some(PAGE_SIZE))?;
                drop(cursor);
                match page {
                    Some(page) => self.cur = Some(page),
                    None => {
                        return Err(Error::InvalidParameter(
                            "seeking past end of query results".into(),
                        ))
                    }
                }
            }
        }
        self.cur_row = row_index;
        Ok(())
    }

    /// Total number of result rows. Forces a full drain.
    pub fn row_count(&mut self) -> Result<i64> {
        let mut cursor = self.cursor.lock().unwrap();
        cursor.fast_forward()?;
        Ok(cursor.rows_fetched as i64)
    }

    /// User-visible column values of the current row.
    pub fn columns(&self) -> &[Value] {
        self.current_page().columns()
    }

    /// The current row's missing-column bitmap.
    pub fn missing_columns(&self) -> u64 {
        self.current_page().missing_columns()
    }

    pub fn has_full_text(&self) -> bool {
        !self.query.inner.fts_tables.is_empty()
    }

    /// Matched full-text terms of the current row.
    pub fn full_text_terms(&self) -> Vec<FullTextTerm> {
        self.current_page().full_text_terms()
    }

    fn current_page(&self) -> &QueryPage {
        self.cur
            .as_ref()
            .expect("enumerator is not positioned on a row")
    }

    /// Re-executes the query with the same options against the stored
    /// sequence snapshot.
    ///
    /// Returns a new enumerator when the recorded results differ byte-wise;
    /// `None` (bumping the stored snapshot) when nothing changed.
    pub fn refresh(&mut self) -> Result<Option<QueryEnumerator>> {
        if self.options.one_shot {
            return Err(Error::UnsupportedOperation(
                "one-shot query enumerator cannot refresh".into(),
            ));
        }
        match self
            .query
            .create_enumerator_since(&self.options, self.last_sequence)?
        {
            Some(new_enum) => {
                if !self.has_equal_contents(&new_enum) {
                    return Ok(Some(new_enum));
                }
                self.last_sequence = new_enum.last_sequence;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn has_equal_contents(&self, other: &QueryEnumerator) -> bool {
        let my_cursor = self.cursor.lock().unwrap();
        let their_cursor = other.cursor.lock().unwrap();
        let mine = self
            .cur
            .as_ref()
            .or(my_cursor.next_page.as_ref())
            .or(self.old.as_ref());
        let theirs = other.cur.as_ref().or(their_cursor.next_page.as_ref());
        match (mine, theirs) {
            (Some(a), Some(b)) => a.has_equal_contents(b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Drop for QueryEnumerator {
    fn drop(&mut self) {
        self.cursor.lock().unwrap().release();
    }
}

fn parse_bindings(raw: &[u8]) -> Result<Value> {
    if raw.first() == Some(&b'{') && raw.last() == Some(&b'}') {
        let json: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| Error::InvalidParameter(format!("invalid JSON parameter bindings: {e}")))?;
        Ok(Value::from_json(&json))
    } else {
        Value::from_data(raw, None)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, Transaction};
    use crate::keystore::DocumentFlags;

    /// A fixture compiler: the selector bytes are taken as the statement text
    /// verbatim, with the rest of the contract's outputs preconfigured.
    struct FixtureCompiler {
        parameters: BTreeSet<String>,
        fts_tables: Vec<String>,
        first_custom: usize,
        uses_expiration: bool,
    }

    impl Default for FixtureCompiler {
        fn default() -> Self {
            FixtureCompiler {
                parameters: BTreeSet::new(),
                fts_tables: Vec::new(),
                first_custom: 0,
                uses_expiration: false,
            }
        }
    }

    impl SelectorCompiler for FixtureCompiler {
        fn compile(&self, selector: &[u8], _store: &KvStore) -> Result<CompiledSelect> {
            Ok(CompiledSelect {
                sql: String::from_utf8_lossy(selector).into_owned(),
                parameters: self.parameters.clone(),
                fts_tables: self.fts_tables.clone(),
                column_titles: vec!["key".into(), "sequence".into()],
                first_custom_column: self.first_custom,
                uses_expiration: self.uses_expiration,
            })
        }
    }

    fn open_with_docs(count: usize) -> (tempfile::TempDir, Database) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("db.roost"), DatabaseConfig::default()).unwrap();
        let store = db.default_keystore().unwrap();
        let mut txn = Transaction::new(&db).unwrap();
        for i in 0..count {
            let key = format!("doc-{i:04}");
            store
                .set(
                    &mut txn,
                    key.as_bytes(),
                    b"1-aa",
                    b"",
                    DocumentFlags::NONE,
                    None,
                    true,
                )
                .unwrap();
        }
        txn.commit().unwrap();
        (dir, db)
    }

    fn add_doc(db: &Database, key: &str) {
        let store = db.default_keystore().unwrap();
        let mut txn = Transaction::new(db).unwrap();
        store
            .set(&mut txn, key.as_bytes(), b"1-aa", b"", DocumentFlags::NONE, None, true)
            .unwrap();
        txn.commit().unwrap();
    }

    const ALL_DOCS: &[u8] = b"SELECT CAST(key AS TEXT) AS id, sequence FROM kv_docs ORDER BY key";

    #[test]
    fn test_pages_cover_all_rows() {
        let (_dir, db) = open_with_docs(120);
        let query = Query::new(&db, ALL_DOCS, &FixtureCompiler::default()).unwrap();
        assert_eq!(query.column_count(), 2);

        let mut e = query.create_enumerator(&QueryOptions::default()).unwrap();
        let mut n = 0;
        while e.next().unwrap() {
            let key = e.columns()[0].as_string().unwrap();
            assert_eq!(key, format!("doc-{n:04}"));
            n += 1;
        }
        assert_eq!(n, 120);
        assert_eq!(e.row_count().unwrap(), 120);
    }

    #[test]
    fn test_one_shot_pages_lazily() {
        let (_dir, db) = open_with_docs(120);
        let query = Query::new(&db, ALL_DOCS, &FixtureCompiler::default()).unwrap();

        let options = QueryOptions {
            one_shot: true,
            ..QueryOptions::default()
        };
        let mut e = query.create_enumerator(&options).unwrap();
        for _ in 0..60 {
            assert!(e.next().unwrap());
        }
        // 60 rows consumed means two 50-row pages were recorded.
        assert_eq!(e.cursor.lock().unwrap().rows_fetched, 100);
        while e.next().unwrap() {}
        assert_eq!(e.current_row(), 119);
    }

    #[test]
    fn test_writer_drains_live_one_shot_enumerator() {
        let (_dir, db) = open_with_docs(120);
        let query = Query::new(&db, ALL_DOCS, &FixtureCompiler::default()).unwrap();

        let options = QueryOptions {
            one_shot: true,
            ..QueryOptions::default()
        };
        let mut e = query.create_enumerator(&options).unwrap();
        assert!(e.next().unwrap());

        // A writer taking the gate forces the enumerator to drain first.
        add_doc(&db, "zzz-late");
        {
            let cursor = e.cursor.lock().unwrap();
            assert!(!cursor.open, "statement must be fully drained");
            assert!(!cursor.observing);
            assert_eq!(cursor.rows_fetched, 120);
        }

        // The results reflect the pre-write snapshot: 120 rows, no "zzz-late".
        let mut n = 1;
        while e.next().unwrap() {
            assert_ne!(e.columns()[0].as_string().unwrap(), "zzz-late");
            n += 1;
        }
        assert_eq!(n, 120);
    }

    #[test]
    fn test_seek_semantics() {
        let (_dir, db) = open_with_docs(120);
        let query = Query::new(&db, ALL_DOCS, &FixtureCompiler::default()).unwrap();
        let mut e = query.create_enumerator(&QueryOptions::default()).unwrap();

        assert!(e.next().unwrap());
        assert_eq!(e.current_row(), 0);

        // No-op seek.
        e.seek(0).unwrap();
        assert_eq!(e.columns()[0].as_string().unwrap(), "doc-0000");

        // Forward within results.
        e.seek(100).unwrap();
        assert_eq!(e.columns()[0].as_string().unwrap(), "doc-0100");

        // Past the end.
        assert!(matches!(e.seek(120), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_one_shot_seek_back_fails() {
        let (_dir, db) = open_with_docs(120);
        let query = Query::new(&db, ALL_DOCS, &FixtureCompiler::default()).unwrap();
        let options = QueryOptions {
            one_shot: true,
            ..QueryOptions::default()
        };
        let mut e = query.create_enumerator(&options).unwrap();
        for _ in 0..75 {
            assert!(e.next().unwrap());
        }
        // Row 74 sits in the second page (rows 50..100); row 10 is gone.
        assert!(matches!(
            e.seek(10),
            Err(Error::UnsupportedOperation(_))
        ));
        // Seeking onto the row before the current page's start is the one
        // legal backward move.
        e.seek(49).unwrap();
        assert!(e.next().unwrap());
        assert_eq!(e.current_row(), 50);
    }

    #[test]
    fn test_refresh_null_without_changes_then_new_after_write() {
        let (_dir, db) = open_with_docs(120);
        let query = Query::new(&db, ALL_DOCS, &FixtureCompiler::default()).unwrap();
        let mut e = query.create_enumerator(&QueryOptions::default()).unwrap();
        let first_seq = e.last_sequence();
        while e.next().unwrap() {}

        // No intervening write: refresh keeps the current results.
        assert!(e.refresh().unwrap().is_none());
        assert_eq!(e.last_sequence(), first_seq);

        // One matching write: refresh yields a byte-different enumerator.
        add_doc(&db, "doc-9999");
        let refreshed = e.refresh().unwrap().expect("results changed");
        assert!(refreshed.last_sequence() > first_seq);
        let mut n = 0;
        let mut refreshed = refreshed;
        while refreshed.next().unwrap() {
            n += 1;
        }
        assert_eq!(n, 121);
    }

    #[test]
    fn test_refresh_after_irrelevant_change_bumps_snapshot() {
        let (_dir, db) = open_with_docs(10);
        let query = Query::new(
            &db,
            b"SELECT CAST(key AS TEXT) AS id FROM kv_docs WHERE CAST(key AS TEXT) < 'doc-9' ORDER BY key",
            &FixtureCompiler::default(),
        )
        .unwrap();
        let mut e = query.create_enumerator(&QueryOptions::default()).unwrap();
        let first_seq = e.last_sequence();

        // The write moves the sequence but doesn't match the query: refresh
        // returns nothing and advances the stored snapshot.
        add_doc(&db, "zzz-no-match");
        assert!(e.refresh().unwrap().is_none());
        assert!(e.last_sequence() > first_seq);
    }

    #[test]
    fn test_one_shot_refresh_fails() {
        let (_dir, db) = open_with_docs(3);
        let query = Query::new(&db, ALL_DOCS, &FixtureCompiler::default()).unwrap();
        let options = QueryOptions {
            one_shot: true,
            ..QueryOptions::default()
        };
        let mut e = query.create_enumerator(&options).unwrap();
        assert!(matches!(e.refresh(), Err(Error::UnsupportedOperation(_))));
    }

    #[test]
    fn test_parameter_binding_and_coercion() {
        let (_dir, db) = open_with_docs(20);
        let compiler = FixtureCompiler {
            parameters: ["min".to_string()].into_iter().collect(),
            ..FixtureCompiler::default()
        };
        let query = Query::new(
            &db,
            b"SELECT CAST(key AS TEXT) AS id, sequence FROM kv_docs WHERE sequence > $_min ORDER BY key",
            &compiler,
        )
        .unwrap();

        let options = QueryOptions {
            param_bindings: Some(br#"{"min": 15}"#.to_vec()),
            ..QueryOptions::default()
        };
        let mut e = query.create_enumerator(&options).unwrap();
        assert_eq!(e.row_count().unwrap(), 5);
    }

    #[test]
    fn test_unknown_parameter_fails() {
        let (_dir, db) = open_with_docs(3);
        let query = Query::new(&db, ALL_DOCS, &FixtureCompiler::default()).unwrap();
        let options = QueryOptions {
            param_bindings: Some(br#"{"flavor": 1}"#.to_vec()),
            ..QueryOptions::default()
        };
        let err = query.create_enumerator(&options).unwrap_err();
        match err {
            Error::InvalidQueryParam(name) => assert_eq!(name, "flavor"),
            other => panic!("expected InvalidQueryParam, got {other:?}"),
        }
    }

    #[test]
    fn test_bindings_root_must_be_map() {
        let (_dir, db) = open_with_docs(3);
        let query = Query::new(&db, ALL_DOCS, &FixtureCompiler::default()).unwrap();
        let options = QueryOptions {
            param_bindings: Some(b"[1, 2, 3]".to_vec()),
            ..QueryOptions::default()
        };
        assert!(query.create_enumerator(&options).is_err());
    }

    #[test]
    fn test_missing_column_bitmap() {
        let (_dir, db) = open_with_docs(1);
        let query = Query::new(
            &db,
            b"SELECT CAST(key AS TEXT), NULL, sequence, NULL FROM kv_docs",
            &FixtureCompiler::default(),
        )
        .unwrap();
        let mut e = query.create_enumerator(&QueryOptions::default()).unwrap();
        assert!(e.next().unwrap());
        // Bits 1 and 3 are NULL columns.
        assert_eq!(e.missing_columns(), 0b1010);
        assert_eq!(e.columns()[1], Value::Null);
    }

    #[test]
    fn test_custom_blob_columns_decode_as_documents() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("db.roost"), DatabaseConfig::default()).unwrap();
        let store = db.default_keystore().unwrap();

        // Store a document body encoded with the database's document keys.
        let mut enc = Encoder::new();
        enc.set_shared_keys(db.document_keys());
        enc.begin_map();
        enc.write_key("city");
        enc.write_string(b"inverness");
        enc.end_map().unwrap();
        let body = enc.finish().unwrap();

        let mut txn = Transaction::new(&db).unwrap();
        store
            .set(&mut txn, b"doc-1", b"1-aa", &body, DocumentFlags::NONE, None, true)
            .unwrap();
        txn.commit().unwrap();

        let query = Query::new(
            &db,
            b"SELECT value FROM kv_docs",
            &FixtureCompiler::default(),
        )
        .unwrap();
        let mut e = query.create_enumerator(&QueryOptions::default()).unwrap();
        assert!(e.next().unwrap());
        let city = e.columns()[0].get("city").unwrap().as_string().unwrap();
        assert_eq!(city, "inverness");
    }

    #[test]
    fn test_corrupt_custom_blob_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("db.roost"), DatabaseConfig::default()).unwrap();
        let store = db.default_keystore().unwrap();
        let mut txn = Transaction::new(&db).unwrap();
        store
            .set(&mut txn, b"doc-1", b"1-aa", &[0xFF, 0xFE], DocumentFlags::NONE, None, true)
            .unwrap();
        txn.commit().unwrap();

        let query = Query::new(
            &db,
            b"SELECT value FROM kv_docs",
            &FixtureCompiler::default(),
        )
        .unwrap();
        // A non-one-shot enumerator drains at creation, so the corrupt blob
        // surfaces right there.
        let err = query.create_enumerator(&QueryOptions::default()).unwrap_err();
        assert!(matches!(err, Error::CorruptRevisionData));
    }

    #[test]
    fn test_missing_fts_table_fails_compile() {
        let (_dir, db) = open_with_docs(1);
        let compiler = FixtureCompiler {
            fts_tables: vec!["kv_docs::by_text".into()],
            ..FixtureCompiler::default()
        };
        let err = Query::new(&db, ALL_DOCS, &compiler).unwrap_err();
        assert!(matches!(err, Error::NoSuchIndex(_)));
    }

    #[test]
    fn test_matched_text_and_terms() {
        let (_dir, db) = open_with_docs(1);
        // The matched-text lookup only needs a table with a docid column.
        db.engine()
            .unwrap()
            .execute_raw(
                "CREATE TABLE fts_docs (docid INTEGER PRIMARY KEY, content TEXT);
                 INSERT INTO fts_docs VALUES (42, 'the quick brown fox');",
            )
            .unwrap();

        let compiler = FixtureCompiler {
            fts_tables: vec!["fts_docs".into()],
            first_custom: 2,
            ..FixtureCompiler::default()
        };
        let query = Query::new(
            &db,
            b"SELECT 42 AS rowid, '1 0 4 5 1 1 10 5 ' AS offsets, CAST(key AS TEXT) FROM kv_docs",
            &compiler,
        )
        .unwrap();
        let mut e = query.create_enumerator(&QueryOptions::default()).unwrap();
        assert!(e.next().unwrap());
        assert!(e.has_full_text());

        // Trailing whitespace in the offsets stream is harmless.
        let terms = e.full_text_terms();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].data_source, 42);
        assert_eq!(terms[0].key_index, 1);
        assert_eq!(terms[0].start, 4);
        assert_eq!(terms[1].term_index, 1);

        // key_index 1 names the content column of the FTS table.
        let text = query.matched_text(&terms[0]).unwrap();
        assert_eq!(text, b"the quick brown fox");

        // Unknown docid logs and returns empty.
        let missing = FullTextTerm {
            data_source: 999,
            key_index: 1,
            term_index: 0,
            start: 0,
            length: 0,
        };
        assert!(query.matched_text(&missing).unwrap().is_empty());
    }

    #[test]
    fn test_matched_text_without_fts_fails() {
        let (_dir, db) = open_with_docs(1);
        let query = Query::new(&db, ALL_DOCS, &FixtureCompiler::default()).unwrap();
        let term = FullTextTerm {
            data_source: 1,
            key_index: 0,
            term_index: 0,
            start: 0,
            length: 0,
        };
        assert!(matches!(query.matched_text(&term), Err(Error::NoSuchIndex(_))));
    }

    #[test]
    fn test_explain_contains_plan_and_selector() {
        let (_dir, db) = open_with_docs(1);
        let query = Query::new(&db, ALL_DOCS, &FixtureCompiler::default()).unwrap();
        let explanation = query.explain().unwrap();
        assert!(explanation.starts_with("SELECT CAST(key AS TEXT)"));
        assert!(explanation.contains('|'));
        assert!(explanation.trim_end().ends_with("ORDER BY key"));
    }

    #[test]
    fn test_enumerator_factory_skips_unchanged_snapshot() {
        let (_dir, db) = open_with_docs(5);
        let query = Query::new(&db, ALL_DOCS, &FixtureCompiler::default()).unwrap();
        let current = query.last_sequence().unwrap();
        assert!(query
            .create_enumerator_since(&QueryOptions::default(), current)
            .unwrap()
            .is_none());
        assert!(query
            .create_enumerator_since(&QueryOptions::default(), 0)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_expiration_index_created_on_demand() {
        let (_dir, db) = open_with_docs(1);
        let compiler = FixtureCompiler {
            uses_expiration: true,
            ..FixtureCompiler::default()
        };
        Query::new(
            &db,
            b"SELECT CAST(key AS TEXT) FROM kv_docs WHERE expiration > 0",
            &compiler,
        )
        .unwrap();
        assert!(db.engine().unwrap().table_exists("kv_docs").unwrap());
    }
}
