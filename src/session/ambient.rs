//! Ambient session storage.
//!
//! Maps the current logical execution context to a stack of live sessions.
//! Two realms back the store: a tokio task-local table for cooperative tasks
//! (established per request by the middleware, or by [`in_context`]) and a
//! plain thread-local table for blocking threads. Writes in one context are
//! invisible to concurrent siblings; isolation is structural, no locking.
//!
//! Publishing returns an [`AmbientToken`] that must be handed back to
//! `restore`, and tokens must come back in strict LIFO order. Out-of-order
//! restores are lifecycle bugs and fail loudly.

use std::cell::RefCell;
use std::future::Future;

use uuid::Uuid;

use crate::core::{DbScopeError, Result};
use crate::session::SessionHandle;
use crate::session::factory::SessionFactory;

tokio::task_local! {
    static TASK_SESSIONS: RefCell<SessionTable>;
}

thread_local! {
    static THREAD_SESSIONS: RefCell<SessionTable> = RefCell::new(SessionTable::default());
}

#[derive(Default)]
struct SessionTable {
    /// Publish stack: `(factory id, handle)` in publish order. Lookup scans
    /// from the top so an inner scope shadows an outer one for the same
    /// factory until it restores.
    entries: Vec<(Uuid, SessionHandle)>,
}

impl SessionTable {
    fn current(&self, factory_id: Uuid) -> Option<SessionHandle> {
        self.entries
            .iter()
            .rev()
            .find(|(id, _)| *id == factory_id)
            .map(|(_, handle)| handle.clone())
    }
}

/// Which realm a token was published into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Realm {
    Task,
    Thread,
}

/// Capability returned by a publish; required to restore the prior session.
#[derive(Debug)]
#[must_use = "an ambient token must be restored, or the published session leaks into the context"]
pub struct AmbientToken {
    realm: Realm,
    factory_id: Uuid,
    depth: usize,
}

/// Run `fut` inside a fresh ambient task context.
///
/// Suspending session scopes publish into task-local storage, which only
/// exists inside such a context. The middleware establishes one per request;
/// use this directly for background work or tests. If a context is already
/// active the future runs in it unchanged (no nesting).
pub async fn in_context<F: Future>(fut: F) -> F::Output {
    if task_active() {
        fut.await
    } else {
        TASK_SESSIONS
            .scope(RefCell::new(SessionTable::default()), fut)
            .await
    }
}

pub(crate) fn task_active() -> bool {
    TASK_SESSIONS.try_with(|_| ()).is_ok()
}

/// Publish `handle` as the current session for its factory, into the task
/// realm when one is active, the thread realm otherwise.
pub(crate) fn publish(handle: SessionHandle) -> AmbientToken {
    let factory_id = handle.factory_id();
    let push = |cell: &RefCell<SessionTable>| {
        let mut table = cell.borrow_mut();
        let depth = table.entries.len();
        table.entries.push((factory_id, handle));
        depth
    };

    if task_active() {
        let depth = TASK_SESSIONS.with(push);
        AmbientToken {
            realm: Realm::Task,
            factory_id,
            depth,
        }
    } else {
        let depth = THREAD_SESSIONS.with(push);
        AmbientToken {
            realm: Realm::Thread,
            factory_id,
            depth,
        }
    }
}

/// Pop the publish recorded by `token`.
///
/// Panics when `token` is not the most recent publish in its context: that
/// means scopes exited out of order, which is a lifecycle bug elsewhere.
pub(crate) fn restore(token: AmbientToken) {
    match token.realm {
        Realm::Task => {
            let restored = TASK_SESSIONS.try_with(|cell| pop_checked(cell, &token)).is_ok();
            assert!(
                restored,
                "ambient token published in a task context was restored outside of one"
            );
        }
        Realm::Thread => THREAD_SESSIONS.with(|cell| pop_checked(cell, &token)),
    }
}

/// Best-effort restore for drop paths, where a loud failure would abort the
/// process during unwinding. Logs instead of asserting.
pub(crate) fn restore_on_drop(token: AmbientToken) {
    let pop = |cell: &RefCell<SessionTable>| {
        let mut table = cell.borrow_mut();
        match table.entries.last() {
            Some((factory_id, _))
                if table.entries.len() == token.depth + 1 && *factory_id == token.factory_id =>
            {
                table.entries.pop();
            }
            Some(_) => tracing::warn!(
                factory = %token.factory_id,
                "ambient session not restored on drop: publish order is inconsistent"
            ),
            // Table already unwound past this publish.
            None => {}
        }
    };

    match token.realm {
        // A missing task table means the whole context is being torn down,
        // which restores every publish at once.
        Realm::Task => {
            let _ = TASK_SESSIONS.try_with(pop);
        }
        Realm::Thread => THREAD_SESSIONS.with(pop),
    }
}

fn pop_checked(cell: &RefCell<SessionTable>, token: &AmbientToken) {
    let mut table = cell.borrow_mut();
    assert_eq!(
        table.entries.len(),
        token.depth + 1,
        "ambient session publish/restore out of order: restore must be strictly LIFO"
    );
    match table.entries.pop() {
        Some((factory_id, _)) => assert_eq!(
            factory_id, token.factory_id,
            "ambient session publish/restore out of order: token belongs to another factory"
        ),
        None => unreachable!("stack depth checked above"),
    }
}

/// Look up the current ambient session for `factory`.
///
/// Distinguishes the two misuse cases callers need to tell apart:
/// [`DbScopeError::SessionNotInitialised`] when the factory was never
/// configured, and [`DbScopeError::MissingSession`] when it was but no scope
/// is open in this context.
pub fn current(factory: &SessionFactory) -> Result<SessionHandle> {
    if !factory.configured() {
        return Err(DbScopeError::SessionNotInitialised);
    }
    let factory_id = factory.id();

    if let Ok(found) = TASK_SESSIONS.try_with(|cell| cell.borrow().current(factory_id)) {
        if let Some(handle) = found {
            return Ok(handle);
        }
        // Inside a task context but published from blocking code on this
        // thread: fall through to the thread realm.
    }
    THREAD_SESSIONS
        .with(|cell| cell.borrow().current(factory_id))
        .ok_or(DbScopeError::MissingSession)
}
