//! Session handles and their ambient lifecycle.
//!
//! A [`SessionHandle`] is one unit of work bound to one engine, owned by
//! exactly one [`scope::ScopedSession`]. Handles are cheap to clone (the
//! clones share the underlying backend) so the same session can sit in the
//! ambient store, in the scope that opened it, and in user code at once.

pub mod ambient;
pub mod factory;
pub mod scope;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::core::{DbScopeError, Result};
use crate::engine::{AsyncSessionBackend, SyncSessionBackend};

/// Session construction settings, merged from factory defaults and per-scope
/// overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Invalidate loaded objects after commit. Off by default, matching the
    /// factory's request-scoped usage pattern.
    pub expire_on_commit: bool,
    pub autoflush: bool,
    /// Driver-specific settings.
    pub extra: HashMap<String, Value>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            expire_on_commit: false,
            autoflush: true,
            extra: HashMap::new(),
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expire_on_commit(mut self, expire: bool) -> Self {
        self.expire_on_commit = expire;
        self
    }

    pub fn autoflush(mut self, autoflush: bool) -> Self {
        self.autoflush = autoflush;
        self
    }

    pub fn extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// Apply per-scope overrides on top of these defaults.
    pub fn merged(&self, overrides: &SessionOverrides) -> Self {
        let mut extra = self.extra.clone();
        extra.extend(overrides.extra.clone());
        Self {
            expire_on_commit: overrides.expire_on_commit.unwrap_or(self.expire_on_commit),
            autoflush: overrides.autoflush.unwrap_or(self.autoflush),
            extra,
        }
    }
}

/// Per-scope session option overrides. Unset fields keep the factory default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOverrides {
    pub expire_on_commit: Option<bool>,
    pub autoflush: Option<bool>,
    pub extra: HashMap<String, Value>,
}

impl SessionOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expire_on_commit(mut self, expire: bool) -> Self {
        self.expire_on_commit = Some(expire);
        self
    }

    pub fn autoflush(mut self, autoflush: bool) -> Self {
        self.autoflush = Some(autoflush);
        self
    }

    pub fn extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

/// Whether a session's operations suspend or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Blocking,
    Suspending,
}

pub(crate) enum BackendSession {
    Blocking(Box<dyn SyncSessionBackend>),
    Suspending(Box<dyn AsyncSessionBackend>),
}

struct SessionInner {
    id: Uuid,
    factory_id: Uuid,
    mode: SessionMode,
    options: SessionOptions,
    /// Taken out for the duration of each operation so suspending calls
    /// never hold the lock across an await. One handle, one scope, one
    /// logical owner: operations never actually contend.
    backend: Mutex<Option<BackendSession>>,
    force_rollback: AtomicBool,
    closed: AtomicBool,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            tracing::warn!(
                session = %self.id,
                "session dropped without close; its scope never ran exit (was the request cancelled?)"
            );
        }
    }
}

/// One unit-of-work session, opened and closed by exactly one scope.
///
/// All operations exist in a suspending form (`commit`, `rollback`, ...) and
/// a blocking form (`commit_blocking`, ...). On a [`SessionMode::Blocking`]
/// session the suspending forms complete without yielding; on a
/// [`SessionMode::Suspending`] session the blocking forms go through the
/// backend's nested blocking view.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    pub(crate) fn new(
        factory_id: Uuid,
        mode: SessionMode,
        options: SessionOptions,
        backend: BackendSession,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                factory_id,
                mode,
                options,
                backend: Mutex::new(Some(backend)),
                force_rollback: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn factory_id(&self) -> Uuid {
        self.inner.factory_id
    }

    pub fn mode(&self) -> SessionMode {
        self.inner.mode
    }

    /// The options this session was constructed with, overrides applied.
    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Demand a rollback at scope exit without raising a fault.
    pub fn set_force_rollback(&self, force: bool) {
        self.inner.force_rollback.store(force, Ordering::SeqCst);
    }

    pub fn force_rollback(&self) -> bool {
        self.inner.force_rollback.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn take_backend(&self) -> Result<BackendSession> {
        if self.is_closed() {
            return Err(DbScopeError::SessionClosed);
        }
        let mut slot = self.inner.backend.lock()?;
        slot.take().ok_or(DbScopeError::SessionClosed)
    }

    fn put_backend(&self, backend: BackendSession) -> Result<()> {
        let mut slot = self.inner.backend.lock()?;
        *slot = Some(backend);
        Ok(())
    }

    fn with_backend_blocking<T>(
        &self,
        f: impl FnOnce(&mut dyn SyncSessionBackend) -> Result<T>,
    ) -> Result<T> {
        let mut backend = self.take_backend()?;
        let out = match &mut backend {
            BackendSession::Blocking(session) => f(session.as_mut()),
            BackendSession::Suspending(session) => f(session.blocking()),
        };
        self.put_backend(backend)?;
        out
    }

    pub async fn commit(&self) -> Result<()> {
        let mut backend = self.take_backend()?;
        let out = match &mut backend {
            BackendSession::Blocking(session) => session.commit().map_err(Into::into),
            BackendSession::Suspending(session) => session.commit().await.map_err(Into::into),
        };
        self.put_backend(backend)?;
        out
    }

    pub fn commit_blocking(&self) -> Result<()> {
        self.with_backend_blocking(|s| s.commit().map_err(Into::into))
    }

    pub async fn rollback(&self) -> Result<()> {
        let mut backend = self.take_backend()?;
        let out = match &mut backend {
            BackendSession::Blocking(session) => session.rollback().map_err(Into::into),
            BackendSession::Suspending(session) => session.rollback().await.map_err(Into::into),
        };
        self.put_backend(backend)?;
        out
    }

    pub fn rollback_blocking(&self) -> Result<()> {
        self.with_backend_blocking(|s| s.rollback().map_err(Into::into))
    }

    /// Close the session, releasing its backend. Errors if already closed.
    pub async fn close(&self) -> Result<()> {
        let mut backend = self.take_backend()?;
        self.inner.closed.store(true, Ordering::SeqCst);
        match &mut backend {
            BackendSession::Blocking(session) => session.close().map_err(Into::into),
            BackendSession::Suspending(session) => session.close().await.map_err(Into::into),
        }
    }

    pub fn close_blocking(&self) -> Result<()> {
        let mut backend = self.take_backend()?;
        self.inner.closed.store(true, Ordering::SeqCst);
        match &mut backend {
            BackendSession::Blocking(session) => session.close().map_err(Into::into),
            BackendSession::Suspending(session) => session.blocking().close().map_err(Into::into),
        }
    }

    /// Mark closed without touching the backend. Used when the scope is
    /// dropped in a context where the backend cannot be driven.
    pub(crate) fn mark_abandoned(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub async fn save(&self, table: &str, row: Value) -> Result<()> {
        let mut backend = self.take_backend()?;
        let out = match &mut backend {
            BackendSession::Blocking(session) => session.save(table, row).map_err(Into::into),
            BackendSession::Suspending(session) => {
                session.save(table, row).await.map_err(Into::into)
            }
        };
        self.put_backend(backend)?;
        out
    }

    pub fn save_blocking(&self, table: &str, row: Value) -> Result<()> {
        self.with_backend_blocking(|s| s.save(table, row).map_err(Into::into))
    }

    pub async fn delete(&self, table: &str, criteria: &Value) -> Result<usize> {
        let mut backend = self.take_backend()?;
        let out = match &mut backend {
            BackendSession::Blocking(session) => session.delete(table, criteria).map_err(Into::into),
            BackendSession::Suspending(session) => {
                session.delete(table, criteria).await.map_err(Into::into)
            }
        };
        self.put_backend(backend)?;
        out
    }

    pub fn delete_blocking(&self, table: &str, criteria: &Value) -> Result<usize> {
        self.with_backend_blocking(|s| s.delete(table, criteria).map_err(Into::into))
    }

    pub async fn find(&self, table: &str, criteria: &Value) -> Result<Vec<Value>> {
        let mut backend = self.take_backend()?;
        let out = match &mut backend {
            BackendSession::Blocking(session) => session.find(table, criteria).map_err(Into::into),
            BackendSession::Suspending(session) => {
                session.find(table, criteria).await.map_err(Into::into)
            }
        };
        self.put_backend(backend)?;
        out
    }

    pub fn find_blocking(&self, table: &str, criteria: &Value) -> Result<Vec<Value>> {
        self.with_backend_blocking(|s| s.find(table, criteria).map_err(Into::into))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("factory_id", &self.inner.factory_id)
            .field("mode", &self.inner.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}
