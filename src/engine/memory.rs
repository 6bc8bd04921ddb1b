//! In-memory reference engine.
//!
//! A complete implementation of both engine contracts, backed by a shared
//! table map. Sessions buffer their writes and only apply them to shared
//! storage on commit; rollback discards the buffer. Used by the test suites
//! and doc examples, and as the model for what a real driver adapter has to
//! provide.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::Value;

use crate::core::{DbScopeError, Result, TransactionError, TransactionOp};
use crate::session::SessionOptions;

use super::{
    AsyncEngine, AsyncSessionBackend, EngineOpener, EngineOptions, SyncEngine, SyncSessionBackend,
};

lazy_static! {
    /// Storages shared by URL, so `memory://app` opened twice sees one database.
    static ref SHARED_STORAGES: Mutex<HashMap<String, Arc<MemoryStorage>>> =
        Mutex::new(HashMap::new());
}

/// Committed table data shared by every session of one engine.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: RwLock<HashMap<String, Vec<Value>>>,
}

/// Operation counters, used by tests to assert exactly-once lifecycle calls.
#[derive(Debug, Default)]
pub struct MemoryStats {
    sessions_opened: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    closes: AtomicUsize,
    schema_calls: AtomicUsize,
}

impl MemoryStats {
    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn schema_calls(&self) -> usize {
        self.schema_calls.load(Ordering::SeqCst)
    }
}

/// In-memory engine implementing both the blocking and suspending contracts.
///
/// # Examples
///
/// ```
/// use dbscope::engine::memory::MemoryEngine;
/// use dbscope::engine::SyncEngine;
/// use dbscope::SessionOptions;
/// use serde_json::json;
///
/// let engine = MemoryEngine::with_tables(&["users"]);
/// engine.ensure_schema().unwrap();
///
/// let mut session = engine.open_session(&SessionOptions::default()).unwrap();
/// session.save("users", json!({"id": 1, "name": "Alice"})).unwrap();
/// session.commit().unwrap();
/// session.close().unwrap();
///
/// assert_eq!(engine.stats().commits(), 1);
/// ```
#[derive(Debug)]
pub struct MemoryEngine {
    storage: Arc<MemoryStorage>,
    declared_tables: Vec<String>,
    stats: Arc<MemoryStats>,
}

impl MemoryEngine {
    /// Engine with its own isolated storage. Preferred in tests so suites
    /// don't interfere with each other.
    pub fn new() -> Self {
        Self::with_storage(Arc::new(MemoryStorage::default()), Vec::new())
    }

    /// Isolated engine that pre-declares tables for `ensure_schema`.
    pub fn with_tables(tables: &[&str]) -> Self {
        Self::with_storage(
            Arc::new(MemoryStorage::default()),
            tables.iter().map(|t| (*t).to_string()).collect(),
        )
    }

    /// Engine bound to the storage registered under `name`; engines opened
    /// with the same name share one database.
    pub fn shared(name: &str) -> Self {
        let mut registry = SHARED_STORAGES
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let storage = registry
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStorage::default()));
        Self::with_storage(Arc::clone(storage), Vec::new())
    }

    fn with_storage(storage: Arc<MemoryStorage>, declared_tables: Vec<String>) -> Self {
        Self {
            storage,
            declared_tables,
            stats: Arc::new(MemoryStats::default()),
        }
    }

    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    /// Committed rows of `table`, ignoring any open session's buffer.
    pub fn committed_rows(&self, table: &str) -> Vec<Value> {
        self.storage
            .tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn open_memory_session(&self) -> MemorySession {
        self.stats.sessions_opened.fetch_add(1, Ordering::SeqCst);
        MemorySession {
            storage: Arc::clone(&self.storage),
            stats: Arc::clone(&self.stats),
            pending: Vec::new(),
            closed: false,
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngine for MemoryEngine {
    fn open_session(
        &self,
        _options: &SessionOptions,
    ) -> std::result::Result<Box<dyn SyncSessionBackend>, TransactionError> {
        Ok(Box::new(self.open_memory_session()))
    }

    fn ensure_schema(&self) -> std::result::Result<(), TransactionError> {
        self.stats.schema_calls.fetch_add(1, Ordering::SeqCst);
        let mut tables = self
            .storage
            .tables
            .write()
            .map_err(|e| TransactionError::new(TransactionOp::Execute, e.to_string()))?;
        for table in &self.declared_tables {
            tables.entry(table.clone()).or_default();
        }
        Ok(())
    }
}

#[async_trait]
impl AsyncEngine for MemoryEngine {
    async fn open_session(
        &self,
        _options: &SessionOptions,
    ) -> std::result::Result<Box<dyn AsyncSessionBackend>, TransactionError> {
        Ok(Box::new(MemoryAsyncSession(self.open_memory_session())))
    }

    async fn ensure_schema(&self) -> std::result::Result<(), TransactionError> {
        SyncEngine::ensure_schema(self)
    }
}

/// Buffered write, applied to shared storage on commit.
#[derive(Debug, Clone)]
enum Change {
    Save { table: String, row: Value },
    Delete { table: String, criteria: Value },
}

struct MemorySession {
    storage: Arc<MemoryStorage>,
    stats: Arc<MemoryStats>,
    pending: Vec<Change>,
    closed: bool,
}

impl MemorySession {
    fn check_open(&self, op: TransactionOp) -> std::result::Result<(), TransactionError> {
        if self.closed {
            Err(TransactionError::new(op, "session is closed"))
        } else {
            Ok(())
        }
    }

    /// Rows of `table` as this session sees them: committed data with the
    /// pending buffer replayed on top.
    fn effective_rows(&self, table: &str) -> std::result::Result<Vec<Value>, TransactionError> {
        let tables = self
            .storage
            .tables
            .read()
            .map_err(|e| TransactionError::new(TransactionOp::Execute, e.to_string()))?;
        let mut rows = tables.get(table).cloned().unwrap_or_default();
        drop(tables);

        for change in &self.pending {
            match change {
                Change::Save { table: t, row } if t == table => upsert(&mut rows, row.clone()),
                Change::Delete { table: t, criteria } if t == table => {
                    rows.retain(|row| !matches(row, criteria));
                }
                _ => {}
            }
        }
        Ok(rows)
    }
}

impl SyncSessionBackend for MemorySession {
    fn commit(&mut self) -> std::result::Result<(), TransactionError> {
        self.check_open(TransactionOp::Commit)?;
        let mut tables = self
            .storage
            .tables
            .write()
            .map_err(|e| TransactionError::new(TransactionOp::Commit, e.to_string()))?;
        for change in self.pending.drain(..) {
            match change {
                Change::Save { table, row } => upsert(tables.entry(table).or_default(), row),
                Change::Delete { table, criteria } => {
                    tables
                        .entry(table)
                        .or_default()
                        .retain(|row| !matches(row, &criteria));
                }
            }
        }
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> std::result::Result<(), TransactionError> {
        self.check_open(TransactionOp::Rollback)?;
        self.pending.clear();
        self.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> std::result::Result<(), TransactionError> {
        self.check_open(TransactionOp::Close)?;
        self.pending.clear();
        self.closed = true;
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn save(&mut self, table: &str, row: Value) -> std::result::Result<(), TransactionError> {
        self.check_open(TransactionOp::Execute)?;
        if !row.is_object() {
            return Err(TransactionError::new(
                TransactionOp::Execute,
                "rows must be JSON objects",
            ));
        }
        self.pending.push(Change::Save {
            table: table.to_string(),
            row,
        });
        Ok(())
    }

    fn delete(
        &mut self,
        table: &str,
        criteria: &Value,
    ) -> std::result::Result<usize, TransactionError> {
        self.check_open(TransactionOp::Execute)?;
        check_criteria(criteria)?;
        let removed = self
            .effective_rows(table)?
            .iter()
            .filter(|row| matches(row, criteria))
            .count();
        self.pending.push(Change::Delete {
            table: table.to_string(),
            criteria: criteria.clone(),
        });
        Ok(removed)
    }

    fn find(
        &mut self,
        table: &str,
        criteria: &Value,
    ) -> std::result::Result<Vec<Value>, TransactionError> {
        self.check_open(TransactionOp::Execute)?;
        check_criteria(criteria)?;
        Ok(self
            .effective_rows(table)?
            .into_iter()
            .filter(|row| matches(row, criteria))
            .collect())
    }
}

/// Suspending wrapper over [`MemorySession`]. No operation actually awaits;
/// it exists so the async contract has a complete reference implementation.
struct MemoryAsyncSession(MemorySession);

#[async_trait]
impl AsyncSessionBackend for MemoryAsyncSession {
    async fn commit(&mut self) -> std::result::Result<(), TransactionError> {
        self.0.commit()
    }

    async fn rollback(&mut self) -> std::result::Result<(), TransactionError> {
        self.0.rollback()
    }

    async fn close(&mut self) -> std::result::Result<(), TransactionError> {
        self.0.close()
    }

    async fn save(&mut self, table: &str, row: Value) -> std::result::Result<(), TransactionError> {
        self.0.save(table, row)
    }

    async fn delete(
        &mut self,
        table: &str,
        criteria: &Value,
    ) -> std::result::Result<usize, TransactionError> {
        self.0.delete(table, criteria)
    }

    async fn find(
        &mut self,
        table: &str,
        criteria: &Value,
    ) -> std::result::Result<Vec<Value>, TransactionError> {
        self.0.find(table, criteria)
    }

    fn blocking(&mut self) -> &mut dyn SyncSessionBackend {
        &mut self.0
    }
}

/// Opener for `memory://<name>` URLs. Same name, same storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryEngineOpener;

impl MemoryEngineOpener {
    fn storage_name(url: &str) -> Result<&str> {
        url.strip_prefix("memory://").ok_or_else(|| {
            DbScopeError::Configuration(format!("memory engine URLs must start with 'memory://', got '{url}'"))
        })
    }
}

impl EngineOpener for MemoryEngineOpener {
    fn open(&self, url: &str, _options: &EngineOptions) -> Result<Arc<dyn SyncEngine>> {
        let name = Self::storage_name(url)?;
        Ok(Arc::new(MemoryEngine::shared(name)))
    }

    fn open_async(&self, url: &str, _options: &EngineOptions) -> Result<Arc<dyn AsyncEngine>> {
        let name = Self::storage_name(url)?;
        Ok(Arc::new(MemoryEngine::shared(name)))
    }

    fn supports_async(&self) -> bool {
        true
    }
}

fn check_criteria(criteria: &Value) -> std::result::Result<(), TransactionError> {
    if criteria.is_object() {
        Ok(())
    } else {
        Err(TransactionError::new(
            TransactionOp::Execute,
            "criteria must be a JSON object of field equalities",
        ))
    }
}

/// All criteria fields must equal the row's fields. Empty criteria match all.
fn matches(row: &Value, criteria: &Value) -> bool {
    match (row.as_object(), criteria.as_object()) {
        (Some(row), Some(criteria)) => criteria.iter().all(|(k, v)| row.get(k) == Some(v)),
        _ => false,
    }
}

/// Replace the row with the same `id`, or append.
fn upsert(rows: &mut Vec<Value>, row: Value) {
    if let Some(id) = row.get("id") {
        if let Some(existing) = rows.iter_mut().find(|r| r.get("id") == Some(id)) {
            *existing = row;
            return;
        }
    }
    rows.push(row);
}
