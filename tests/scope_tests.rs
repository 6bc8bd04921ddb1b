//! Scope lifecycle over a suspending engine, and cross-task isolation.

use std::sync::Arc;

use serde_json::json;

use dbscope::engine::memory::MemoryEngine;
use dbscope::engine::{AsyncEngine, SyncEngine};
use dbscope::{Db, DbScopeError, SessionFactory, SessionMode, in_context};

fn suspending_db() -> (Db, Arc<MemoryEngine>) {
    let engine = Arc::new(MemoryEngine::with_tables(&["users"]));
    let factory = SessionFactory::builder()
        .custom_engine(Arc::clone(&engine) as Arc<dyn SyncEngine>)
        .custom_async_engine(Arc::clone(&engine) as Arc<dyn AsyncEngine>)
        .build()
        .unwrap();
    (Db::new(factory), engine)
}

#[tokio::test]
async fn test_suspending_scope_commits_on_success() {
    let (db, engine) = suspending_db();

    db.scope()
        .commit_on_exit(true)
        .run(|session| async move {
            assert_eq!(session.mode(), SessionMode::Suspending);
            session.save("users", json!({"id": 1, "name": "Alice"})).await
        })
        .await
        .unwrap();

    assert_eq!(engine.stats().commits(), 1);
    assert_eq!(engine.stats().closes(), 1);
    assert_eq!(engine.committed_rows("users").len(), 1);
}

#[tokio::test]
async fn test_suspending_scope_rolls_back_on_fault() {
    let (db, engine) = suspending_db();

    let result: Result<(), DbScopeError> = db
        .scope()
        .commit_on_exit(true)
        .run(|session| async move {
            session.save("users", json!({"id": 1})).await?;
            Err(DbScopeError::Configuration("boom".into()))
        })
        .await;

    assert!(matches!(result, Err(DbScopeError::Configuration(_))));
    assert_eq!(engine.stats().rollbacks(), 1);
    assert_eq!(engine.stats().commits(), 0);
    assert!(engine.committed_rows("users").is_empty());
}

#[tokio::test]
async fn test_uncommitted_writes_stay_private_to_their_session() {
    let (db, engine) = suspending_db();

    db.scope()
        .run(|session| async move {
            session.save("users", json!({"id": 1})).await?;
            // Visible through this session's own view before commit.
            let rows = session.find("users", &json!({})).await?;
            assert_eq!(rows.len(), 1);
            Ok::<_, DbScopeError>(())
        })
        .await
        .unwrap();

    // No commit happened, so nothing became durable.
    assert!(engine.committed_rows("users").is_empty());
}

#[tokio::test]
async fn test_concurrent_tasks_get_independent_sessions() {
    let (db, engine) = suspending_db();

    let left_db = db.clone();
    let right_db = db.clone();

    let left = in_context(async move {
        left_db
            .scope()
            .run(|session| {
                let db = left_db.clone();
                async move {
                    assert_eq!(db.session()?.id(), session.id());
                    tokio::task::yield_now().await;
                    assert_eq!(db.session()?.id(), session.id());
                    Ok::<_, DbScopeError>(session.id())
                }
            })
            .await
    });
    let right = in_context(async move {
        right_db
            .scope()
            .run(|session| {
                let db = right_db.clone();
                async move {
                    tokio::task::yield_now().await;
                    assert_eq!(db.session()?.id(), session.id());
                    Ok::<_, DbScopeError>(session.id())
                }
            })
            .await
    });

    let (left, right) = tokio::join!(tokio::spawn(left), tokio::spawn(right));
    let left = left.unwrap().unwrap();
    let right = right.unwrap().unwrap();

    assert_ne!(left, right);
    assert_eq!(engine.stats().sessions_opened(), 2);
    assert_eq!(engine.stats().closes(), 2);
}

#[tokio::test]
async fn test_force_rollback_discards_writes_in_suspending_scope() {
    let (db, engine) = suspending_db();

    db.scope()
        .commit_on_exit(true)
        .run(|session| async move {
            session.save("users", json!({"id": 1})).await?;
            session.set_force_rollback(true);
            Ok::<_, DbScopeError>(())
        })
        .await
        .unwrap();

    assert_eq!(engine.stats().rollbacks(), 1);
    assert_eq!(engine.stats().commits(), 0);
    assert!(engine.committed_rows("users").is_empty());
}

#[test]
fn test_blocking_scopes_on_separate_threads_are_isolated() {
    let (db, engine) = suspending_db();

    let threads: Vec<_> = (0..2)
        .map(|_| {
            let db = db.clone();
            std::thread::spawn(move || {
                db.scope()
                    .run_blocking(|session| {
                        let ambient = db.session()?;
                        assert_eq!(ambient.id(), session.id());
                        Ok::<_, DbScopeError>(session.id())
                    })
                    .unwrap()
            })
        })
        .collect();

    let ids: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert_ne!(ids[0], ids[1]);
    assert_eq!(engine.stats().closes(), 2);
}
