//! Engine collaborator contracts.
//!
//! `dbscope` does not implement SQL semantics itself. The traits in this
//! module are the narrow surface it needs from a database driver: open an
//! engine for a URL, open unit-of-work sessions against it, and drive
//! commit/rollback/close on those sessions. Blocking and suspending engines
//! are separate traits; a suspending session must additionally expose a
//! blocking view for code that cannot await.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::core::{DbScopeError, Result, TransactionError};
use crate::session::SessionOptions;

/// Options forwarded verbatim to the engine at creation time.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Log every statement the engine executes.
    pub echo: bool,
    /// Driver-specific settings.
    pub extra: HashMap<String, Value>,
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

/// A blocking unit-of-work session owned by exactly one scope.
pub trait SyncSessionBackend: Send {
    fn commit(&mut self) -> std::result::Result<(), TransactionError>;
    fn rollback(&mut self) -> std::result::Result<(), TransactionError>;
    fn close(&mut self) -> std::result::Result<(), TransactionError>;

    /// Persist a row into `table`, replacing any committed row with the
    /// same `id` field.
    fn save(&mut self, table: &str, row: Value) -> std::result::Result<(), TransactionError>;

    /// Delete rows matching `criteria` (field-equality map), returning how
    /// many were removed.
    fn delete(&mut self, table: &str, criteria: &Value)
    -> std::result::Result<usize, TransactionError>;

    /// Fetch rows matching `criteria`. An empty map matches every row.
    fn find(&mut self, table: &str, criteria: &Value)
    -> std::result::Result<Vec<Value>, TransactionError>;
}

/// A suspending unit-of-work session.
///
/// Mirrors [`SyncSessionBackend`] with suspension points at every operation,
/// and exposes a nested blocking view for call sites that cannot await.
#[async_trait]
pub trait AsyncSessionBackend: Send {
    async fn commit(&mut self) -> std::result::Result<(), TransactionError>;
    async fn rollback(&mut self) -> std::result::Result<(), TransactionError>;
    async fn close(&mut self) -> std::result::Result<(), TransactionError>;

    async fn save(&mut self, table: &str, row: Value)
    -> std::result::Result<(), TransactionError>;

    async fn delete(
        &mut self,
        table: &str,
        criteria: &Value,
    ) -> std::result::Result<usize, TransactionError>;

    async fn find(
        &mut self,
        table: &str,
        criteria: &Value,
    ) -> std::result::Result<Vec<Value>, TransactionError>;

    /// Blocking view over the same underlying session.
    fn blocking(&mut self) -> &mut dyn SyncSessionBackend;
}

/// A blocking engine: owns the physical connections, hands out sessions.
pub trait SyncEngine: Send + Sync {
    fn open_session(
        &self,
        options: &SessionOptions,
    ) -> std::result::Result<Box<dyn SyncSessionBackend>, TransactionError>;

    /// Create all known relation schemas. Idempotent.
    fn ensure_schema(&self) -> std::result::Result<(), TransactionError>;
}

/// A suspending engine.
#[async_trait]
pub trait AsyncEngine: Send + Sync {
    async fn open_session(
        &self,
        options: &SessionOptions,
    ) -> std::result::Result<Box<dyn AsyncSessionBackend>, TransactionError>;

    async fn ensure_schema(&self) -> std::result::Result<(), TransactionError>;
}

/// Builds engines from database URLs.
///
/// This is the driver registry seam: a `SessionFactory` configured with a
/// URL needs an opener to turn that URL into an engine. Openers without
/// suspending support keep the default `open_async`, which fails fast at
/// configuration time.
pub trait EngineOpener: Send + Sync {
    fn open(&self, url: &str, options: &EngineOptions) -> Result<Arc<dyn SyncEngine>>;

    fn open_async(&self, url: &str, options: &EngineOptions) -> Result<Arc<dyn AsyncEngine>> {
        let _ = options;
        Err(DbScopeError::Configuration(format!(
            "this engine opener has no async support (url: {url})"
        )))
    }

    /// Whether `open_async` can succeed. Checked when a factory is built
    /// with `async_enabled`.
    fn supports_async(&self) -> bool {
        false
    }
}
