//! End-to-end middleware behavior over an axum router.

use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

use dbscope::engine::memory::MemoryEngine;
use dbscope::engine::SyncEngine;
use dbscope::{Db, DbScopeError, DbSessionLayer, SessionFactory};

fn test_db() -> (Db, Arc<MemoryEngine>) {
    let engine = Arc::new(MemoryEngine::with_tables(&["users"]));
    let factory = SessionFactory::builder()
        .custom_engine(Arc::clone(&engine) as Arc<dyn SyncEngine>)
        .build()
        .unwrap();
    (Db::new(factory), engine)
}

fn request() -> Request<Body> {
    Request::builder().uri("/").body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_handler_sees_ambient_session() {
    let (db, _engine) = test_db();
    let layer = DbSessionLayer::new(db.clone()).unwrap();

    let handler_db = db.clone();
    let app = Router::new()
        .route(
            "/",
            get(move || async move {
                handler_db.session().unwrap();
                StatusCode::OK
            }),
        )
        .layer(layer);

    let response = app.oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_session_missing_outside_request() {
    let (db, _engine) = test_db();
    let _layer = DbSessionLayer::new(db.clone()).unwrap();

    assert!(matches!(db.session(), Err(DbScopeError::MissingSession)));
}

#[tokio::test]
async fn test_session_not_initialised_without_configuration() {
    let db = Db::new(SessionFactory::unconfigured());
    assert!(matches!(
        db.session(),
        Err(DbScopeError::SessionNotInitialised)
    ));
}

#[tokio::test]
async fn test_commit_on_exit_commits_request_writes() {
    let (db, engine) = test_db();
    let layer = DbSessionLayer::builder()
        .db(db.clone())
        .commit_on_exit(true)
        .build()
        .unwrap();

    let handler_db = db.clone();
    let app = Router::new()
        .route(
            "/",
            get(move || async move {
                handler_db
                    .session()
                    .unwrap()
                    .save("users", serde_json::json!({"id": 1}))
                    .await
                    .unwrap();
                StatusCode::OK
            }),
        )
        .layer(layer);

    let response = app.oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(engine.stats().commits(), 1);
    assert_eq!(engine.stats().rollbacks(), 0);
    assert_eq!(engine.committed_rows("users").len(), 1);
}

#[tokio::test]
async fn test_without_commit_on_exit_writes_are_discarded() {
    let (db, engine) = test_db();
    let layer = DbSessionLayer::new(db.clone()).unwrap();

    let handler_db = db.clone();
    let app = Router::new()
        .route(
            "/",
            get(move || async move {
                handler_db
                    .session()
                    .unwrap()
                    .save("users", serde_json::json!({"id": 1}))
                    .await
                    .unwrap();
                StatusCode::OK
            }),
        )
        .layer(layer);

    app.oneshot(request()).await.unwrap();
    assert_eq!(engine.stats().commits(), 0);
    assert!(engine.committed_rows("users").is_empty());
    assert_eq!(engine.stats().closes(), 1);
}

async fn status_rollback_case(
    client_error: bool,
    server_error: bool,
    status: StatusCode,
) -> usize {
    let (db, engine) = test_db();
    let layer = DbSessionLayer::builder()
        .db(db.clone())
        .rollback_on_client_error(client_error)
        .rollback_on_server_error(server_error)
        .build()
        .unwrap();

    let app = Router::new()
        .route("/", get(move || async move { status }))
        .layer(layer);

    app.oneshot(request()).await.unwrap();
    engine.stats().rollbacks()
}

#[tokio::test]
async fn test_rollback_on_http_error_statuses() {
    // (client flag, server flag, status, rollback expected)
    let cases = [
        (true, false, StatusCode::BAD_REQUEST, 1),
        (false, false, StatusCode::BAD_REQUEST, 0),
        (true, false, StatusCode::NOT_FOUND, 1),
        (false, false, StatusCode::NOT_FOUND, 0),
        (true, false, StatusCode::INTERNAL_SERVER_ERROR, 0),
        (false, true, StatusCode::BAD_GATEWAY, 1),
        (false, true, StatusCode::INTERNAL_SERVER_ERROR, 1),
        (false, true, StatusCode::UNPROCESSABLE_ENTITY, 0),
    ];

    for (client_error, server_error, status, expected) in cases {
        let rollbacks = status_rollback_case(client_error, server_error, status).await;
        assert_eq!(
            rollbacks, expected,
            "client_error={client_error} server_error={server_error} status={status}"
        );
    }
}

#[tokio::test]
async fn test_multi_db_requests_open_one_scope_per_database() {
    let (users_db, users_engine) = test_db();
    let (posts_db, posts_engine) = test_db();

    let layer = DbSessionLayer::builder()
        .db(users_db.clone())
        .db(posts_db.clone())
        .commit_on_exit(true)
        .build()
        .unwrap();

    let handler_users = users_db.clone();
    let handler_posts = posts_db.clone();
    let app = Router::new()
        .route(
            "/",
            get(move || async move {
                // Each database has its own ambient session.
                let users_session = handler_users.session().unwrap();
                let posts_session = handler_posts.session().unwrap();
                assert_ne!(users_session.id(), posts_session.id());
                StatusCode::OK
            }),
        )
        .layer(layer);

    app.oneshot(request()).await.unwrap();
    assert_eq!(users_engine.stats().sessions_opened(), 1);
    assert_eq!(posts_engine.stats().sessions_opened(), 1);
    assert_eq!(users_engine.stats().commits(), 1);
    assert_eq!(posts_engine.stats().commits(), 1);
    assert_eq!(users_engine.stats().closes(), 1);
    assert_eq!(posts_engine.stats().closes(), 1);
}

#[tokio::test]
async fn test_overlapping_requests_are_isolated() {
    let (db, engine) = test_db();
    let layer = DbSessionLayer::new(db.clone()).unwrap();

    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let seen: Arc<Mutex<Vec<Uuid>>> = Arc::new(Mutex::new(Vec::new()));

    let handler_db = db.clone();
    let handler_barrier = Arc::clone(&barrier);
    let handler_seen = Arc::clone(&seen);
    let app = Router::new()
        .route(
            "/",
            get(move || {
                let db = handler_db.clone();
                let barrier = Arc::clone(&handler_barrier);
                let seen = Arc::clone(&handler_seen);
                async move {
                    let before = db.session().unwrap().id();
                    // Hold both requests open at the same time.
                    barrier.wait().await;
                    let after = db.session().unwrap().id();
                    assert_eq!(before, after);
                    seen.lock().unwrap().push(after);
                    StatusCode::OK
                }
            }),
        )
        .layer(layer);

    let left = app.clone().oneshot(request());
    let right = app.clone().oneshot(request());
    let (left, right) = tokio::join!(left, right);
    assert_eq!(left.unwrap().status(), StatusCode::OK);
    assert_eq!(right.unwrap().status(), StatusCode::OK);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_ne!(seen[0], seen[1], "overlapping requests shared a session");
    assert_eq!(engine.stats().sessions_opened(), 2);
    assert_eq!(engine.stats().closes(), 2);
}

#[tokio::test]
async fn test_schema_is_ensured_at_construction() {
    let (db, engine) = test_db();
    assert_eq!(engine.stats().schema_calls(), 0);

    let _layer = DbSessionLayer::new(db).unwrap();
    assert_eq!(engine.stats().schema_calls(), 1);
}

#[tokio::test]
async fn test_db_error_response_triggers_server_error_rollback() {
    let (db, engine) = test_db();
    let layer = DbSessionLayer::builder()
        .db(db.clone())
        .commit_on_exit(true)
        .rollback_on_server_error(true)
        .build()
        .unwrap();

    let app = Router::new()
        .route(
            "/",
            get(move || async move {
                // A handler fault surfaces as a 5xx response, which must
                // discard the request's writes instead of committing them.
                DbScopeError::Transaction(dbscope::TransactionError::new(
                    dbscope::TransactionOp::Execute,
                    "constraint violated",
                ))
            }),
        )
        .layer(layer);

    let response = app.oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(engine.stats().rollbacks(), 1);
    assert_eq!(engine.stats().commits(), 0);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["code"], "transaction_error");
}
