// ============================================================================
// dbscope Library
// ============================================================================
//
// Request-scoped database sessions with ambient lookup. One session per
// request per database, reachable from anywhere in the call graph, with
// deterministic commit/rollback/close on every exit path.

pub mod core;
pub mod engine;
pub mod middleware;
pub mod model;
pub mod session;
pub mod web;

// Re-export main types for convenience
pub use crate::core::{DbScopeError, Result, TransactionError, TransactionOp};
pub use engine::{EngineOpener, EngineOptions};
pub use middleware::{DbSessionLayer, DbSessionLayerBuilder, DbSessionMiddleware};
pub use model::ActiveModel;
pub use session::ambient::in_context;
pub use session::factory::{FactoryBuilder, SessionFactory, default_factory};
pub use session::scope::{ScopeOutcome, ScopedSession};
pub use session::{SessionHandle, SessionMode, SessionOptions, SessionOverrides};

use session::ambient;

// ============================================================================
// High-level accessor
// ============================================================================

/// Ambient accessor for one database.
///
/// This is the value application code holds on to: cheap to clone, safe to
/// keep in router state or a global. [`Db::session`] resolves the *current*
/// request's session at call time; [`Db::scope`] opens a manual session
/// scope outside of a request.
///
/// # Examples
///
/// ```
/// use dbscope::{Db, DbScopeError, SessionFactory};
/// use dbscope::engine::memory::MemoryEngine;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let factory = SessionFactory::builder()
///     .custom_engine(Arc::new(MemoryEngine::new()))
///     .build()
///     .unwrap();
/// let db = Db::new(factory);
///
/// // Outside any scope there is no session to find.
/// assert!(matches!(db.session(), Err(DbScopeError::MissingSession)));
///
/// db.scope()
///     .commit_on_exit(true)
///     .run_blocking(|_session| {
///         // Anywhere inside the scope, the session is ambient.
///         db.session()?.save_blocking("users", json!({"id": 1}))
///     })
///     .unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct Db {
    factory: SessionFactory,
}

impl Db {
    pub fn new(factory: SessionFactory) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &SessionFactory {
        &self.factory
    }

    /// The current ambient session for this database.
    ///
    /// Fails with [`DbScopeError::SessionNotInitialised`] when the factory
    /// was never configured, and with [`DbScopeError::MissingSession`] when
    /// no scope is open in the current execution context.
    pub fn session(&self) -> Result<SessionHandle> {
        ambient::current(&self.factory)
    }

    /// A fresh session scope over this database.
    pub fn scope(&self) -> ScopedSession {
        ScopedSession::new(self.factory.clone())
    }

    /// A fresh scope with per-scope session option overrides.
    pub fn scope_with(&self, overrides: SessionOverrides) -> ScopedSession {
        ScopedSession::new(self.factory.clone()).overrides(overrides)
    }
}

/// The [`Db`] over the process-wide default factory, as configured by a
/// URL-based [`DbSessionLayer`].
pub fn default_db() -> Db {
    Db::new(default_factory().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;
    use serde_json::json;
    use std::sync::Arc;

    fn test_db() -> (Db, Arc<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new());
        let factory = SessionFactory::builder()
            .custom_engine(Arc::clone(&engine) as Arc<dyn engine::SyncEngine>)
            .build()
            .unwrap();
        (Db::new(factory), engine)
    }

    #[test]
    fn test_session_outside_scope_is_missing() {
        let (db, _engine) = test_db();
        assert!(matches!(db.session(), Err(DbScopeError::MissingSession)));
    }

    #[test]
    fn test_session_resolves_inside_scope() {
        let (db, _engine) = test_db();
        let inner_db = db.clone();

        db.scope()
            .run_blocking(move |session| {
                assert_eq!(inner_db.session()?.id(), session.id());
                Ok::<_, DbScopeError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_scope_with_overrides_applies_and_reverts() {
        let (db, _engine) = test_db();
        let inner_db = db.clone();

        db.scope()
            .run_blocking(move |outer| {
                assert!(!outer.options().expire_on_commit);

                inner_db
                    .scope_with(SessionOverrides::new().expire_on_commit(true))
                    .run_blocking(|inner| {
                        assert!(inner.options().expire_on_commit);
                        assert!(inner_db.session()?.options().expire_on_commit);
                        Ok::<_, DbScopeError>(())
                    })?;

                // The outer session is current again, with its own options.
                assert!(!inner_db.session()?.options().expire_on_commit);
                assert_eq!(inner_db.session()?.id(), outer.id());
                Ok::<_, DbScopeError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_commit_on_exit_persists_writes() {
        let (db, engine) = test_db();

        db.scope()
            .commit_on_exit(true)
            .run_blocking(|session| session.save_blocking("users", json!({"id": 1})))
            .unwrap();

        assert_eq!(engine.committed_rows("users").len(), 1);
        assert_eq!(engine.stats().commits(), 1);
    }
}
