//! The acquire/release contract binding one session to one unit of work.
//!
//! A [`ScopedSession`] moves through `Unopened → Open → Closed`, exactly
//! once. Entry opens a fresh session and publishes it to the ambient store;
//! exit decides commit vs rollback vs plain close, closes the session
//! unconditionally, and restores the ambient store in every case, including
//! when commit or rollback itself fails.
//!
//! The closure runners [`ScopedSession::run`] and
//! [`ScopedSession::run_blocking`] are the supported way to use a scope:
//! they guarantee the exit logic runs on both the return and the fault path.
//! Dropping an open scope (a cancelled request) restores the ambient store;
//! a blocking session is rolled back and closed right there, a suspending
//! one cannot be driven from `Drop` and is abandoned with a warning.

use std::future::Future;

use crate::core::{DbScopeError, Result};
use crate::session::ambient::{self, AmbientToken};
use crate::session::factory::SessionFactory;
use crate::session::{SessionHandle, SessionMode, SessionOverrides};

/// How the protected block ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOutcome {
    /// The block returned normally.
    Success,
    /// The block raised a fault; the session rolls back and the caller
    /// re-raises the fault after cleanup.
    Fault,
}

enum ScopeState {
    Unopened,
    Open {
        handle: SessionHandle,
        token: AmbientToken,
    },
    Closed,
}

enum ExitAction {
    Commit,
    Rollback,
    JustClose,
}

/// One acquire/release cycle. Not reusable across two entries.
pub struct ScopedSession {
    factory: SessionFactory,
    overrides: SessionOverrides,
    commit_on_exit: bool,
    state: ScopeState,
}

impl ScopedSession {
    /// A scope over `factory`, inheriting its `commit_on_exit` default.
    pub fn new(factory: SessionFactory) -> Self {
        let commit_on_exit = factory.commit_on_exit_default();
        Self {
            factory,
            overrides: SessionOverrides::default(),
            commit_on_exit,
            state: ScopeState::Unopened,
        }
    }

    /// Per-scope session option overrides, merged over the factory defaults
    /// for the lifetime of this scope only.
    pub fn overrides(mut self, overrides: SessionOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn commit_on_exit(mut self, commit: bool) -> Self {
        self.commit_on_exit = commit;
        self
    }

    /// The session handle while the scope is open.
    pub fn handle(&self) -> Option<&SessionHandle> {
        match &self.state {
            ScopeState::Open { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// Open the session and publish it to the ambient store.
    ///
    /// Requires an ambient task context (the middleware provides one per
    /// request; [`ambient::in_context`] provides one anywhere else).
    ///
    /// # Panics
    ///
    /// Panics when called on a scope that has already been entered.
    pub async fn enter(&mut self) -> Result<SessionHandle> {
        self.check_unopened("enter");
        if !self.factory.configured() {
            return Err(DbScopeError::SessionNotInitialised);
        }
        if !ambient::task_active() {
            return Err(DbScopeError::NoAmbientContext);
        }
        let handle = self.factory.open_suspending(&self.overrides).await?;
        let token = ambient::publish(handle.clone());
        tracing::debug!(session = %handle.id(), "session scope opened");
        self.state = ScopeState::Open {
            handle: handle.clone(),
            token,
        };
        Ok(handle)
    }

    /// Blocking variant of [`enter`](Self::enter). Publishes into the task
    /// realm when called under an ambient task context (blocking code inside
    /// an async handler), into the thread realm otherwise.
    pub fn enter_blocking(&mut self) -> Result<SessionHandle> {
        self.check_unopened("enter_blocking");
        if !self.factory.configured() {
            return Err(DbScopeError::SessionNotInitialised);
        }
        let handle = self.factory.open_blocking(&self.overrides)?;
        let token = ambient::publish(handle.clone());
        tracing::debug!(session = %handle.id(), "session scope opened (blocking)");
        self.state = ScopeState::Open {
            handle: handle.clone(),
            token,
        };
        Ok(handle)
    }

    /// Release the session.
    ///
    /// Decision order: a fault rolls back; else a set `force_rollback` flag
    /// rolls back; else `commit_on_exit` commits; else the session is just
    /// closed. The session is closed and the ambient store restored on every
    /// path. On the fault path, secondary commit/rollback/close failures are
    /// logged and suppressed so the original fault propagates unmasked.
    ///
    /// # Panics
    ///
    /// Panics when the scope was never entered or has already exited; both
    /// signal a lifecycle bug elsewhere.
    pub async fn exit(&mut self, outcome: ScopeOutcome) -> Result<()> {
        let (handle, token) = self.take_open("exit");
        let primary = match Self::decide(outcome, &handle, self.commit_on_exit) {
            ExitAction::Rollback => handle.rollback().await,
            ExitAction::Commit => handle.commit().await,
            ExitAction::JustClose => Ok(()),
        };
        let closed = handle.close().await;
        ambient::restore(token);
        tracing::debug!(session = %handle.id(), outcome = ?outcome, "session scope closed");
        Self::settle(outcome, primary, closed)
    }

    /// Blocking variant of [`exit`](Self::exit).
    pub fn exit_blocking(&mut self, outcome: ScopeOutcome) -> Result<()> {
        let (handle, token) = self.take_open("exit_blocking");
        let primary = match Self::decide(outcome, &handle, self.commit_on_exit) {
            ExitAction::Rollback => handle.rollback_blocking(),
            ExitAction::Commit => handle.commit_blocking(),
            ExitAction::JustClose => Ok(()),
        };
        let closed = handle.close_blocking();
        ambient::restore(token);
        tracing::debug!(session = %handle.id(), outcome = ?outcome, "session scope closed");
        Self::settle(outcome, primary, closed)
    }

    /// Run `f` inside this scope, guaranteeing the exit logic on both the
    /// return and the fault path. Establishes an ambient task context when
    /// none is active.
    ///
    /// # Examples
    ///
    /// ```
    /// use dbscope::{Db, SessionFactory};
    /// use dbscope::engine::memory::MemoryEngine;
    /// use serde_json::json;
    /// use std::sync::Arc;
    ///
    /// # tokio_test::block_on(async {
    /// let factory = SessionFactory::builder()
    ///     .custom_engine(Arc::new(MemoryEngine::new()))
    ///     .build()
    ///     .unwrap();
    /// let db = Db::new(factory);
    ///
    /// db.scope()
    ///     .commit_on_exit(true)
    ///     .run(|session| async move {
    ///         session.save("users", json!({"id": 1, "name": "Alice"})).await
    ///     })
    ///     .await
    ///     .unwrap();
    /// # });
    /// ```
    pub async fn run<T, E, F, Fut>(mut self, f: F) -> std::result::Result<T, E>
    where
        E: From<DbScopeError>,
        F: FnOnce(SessionHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        ambient::in_context(async move {
            let handle = self.enter().await?;
            match f(handle).await {
                Ok(value) => {
                    self.exit(ScopeOutcome::Success).await?;
                    Ok(value)
                }
                Err(fault) => {
                    self.exit(ScopeOutcome::Fault).await?;
                    Err(fault)
                }
            }
        })
        .await
    }

    /// Blocking variant of [`run`](Self::run).
    pub fn run_blocking<T, E, F>(mut self, f: F) -> std::result::Result<T, E>
    where
        E: From<DbScopeError>,
        F: FnOnce(SessionHandle) -> std::result::Result<T, E>,
    {
        let handle = self.enter_blocking()?;
        match f(handle) {
            Ok(value) => {
                self.exit_blocking(ScopeOutcome::Success)?;
                Ok(value)
            }
            Err(fault) => {
                self.exit_blocking(ScopeOutcome::Fault)?;
                Err(fault)
            }
        }
    }

    fn decide(outcome: ScopeOutcome, handle: &SessionHandle, commit_on_exit: bool) -> ExitAction {
        if outcome == ScopeOutcome::Fault {
            ExitAction::Rollback
        } else if handle.force_rollback() {
            ExitAction::Rollback
        } else if commit_on_exit {
            ExitAction::Commit
        } else {
            ExitAction::JustClose
        }
    }

    /// Fold the release results. The block's own fault always wins: on the
    /// fault path cleanup failures are logged, never returned. On the
    /// success path the first cleanup failure surfaces.
    fn settle(outcome: ScopeOutcome, primary: Result<()>, closed: Result<()>) -> Result<()> {
        match outcome {
            ScopeOutcome::Fault => {
                if let Err(err) = primary {
                    tracing::warn!(error = %err, "rollback failed during fault cleanup; suppressed so the original fault propagates");
                }
                if let Err(err) = closed {
                    tracing::warn!(error = %err, "close failed during fault cleanup; suppressed so the original fault propagates");
                }
                Ok(())
            }
            ScopeOutcome::Success => match (primary, closed) {
                (Ok(()), closed) => closed,
                (Err(err), Ok(())) => Err(err),
                (Err(err), Err(close_err)) => {
                    tracing::warn!(error = %close_err, "close failed after a failed commit/rollback; reporting the first failure");
                    Err(err)
                }
            },
        }
    }

    fn check_unopened(&self, op: &str) {
        match self.state {
            ScopeState::Unopened => {}
            ScopeState::Open { .. } => {
                panic!("ScopedSession::{op}: scope is already open; scopes are not reusable")
            }
            ScopeState::Closed => {
                panic!("ScopedSession::{op}: scope has already exited; scopes are not reusable")
            }
        }
    }

    fn take_open(&mut self, op: &str) -> (SessionHandle, AmbientToken) {
        match std::mem::replace(&mut self.state, ScopeState::Closed) {
            ScopeState::Open { handle, token } => (handle, token),
            ScopeState::Unopened => {
                panic!("ScopedSession::{op} called before enter (lifecycle bug)")
            }
            ScopeState::Closed => panic!(
                "ScopedSession::{op} called on an already-closed scope (lifecycle bug elsewhere)"
            ),
        }
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        if let ScopeState::Open { handle, token } =
            std::mem::replace(&mut self.state, ScopeState::Closed)
        {
            match handle.mode() {
                SessionMode::Blocking => {
                    if let Err(err) = handle.rollback_blocking() {
                        tracing::warn!(session = %handle.id(), error = %err, "rollback failed while dropping an open scope");
                    }
                    if let Err(err) = handle.close_blocking() {
                        tracing::warn!(session = %handle.id(), error = %err, "close failed while dropping an open scope");
                    }
                    tracing::warn!(
                        session = %handle.id(),
                        "session scope dropped while open (cancelled request?); the session was rolled back and closed"
                    );
                }
                // A suspending backend cannot be driven from Drop.
                SessionMode::Suspending => {
                    handle.mark_abandoned();
                    tracing::warn!(
                        session = %handle.id(),
                        "session scope dropped while open (cancelled request?); the session was abandoned without commit or rollback"
                    );
                }
            }
            ambient::restore_on_drop(token);
        }
    }
}
