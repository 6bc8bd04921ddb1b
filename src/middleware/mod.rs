//! Request-boundary session management.
//!
//! [`DbSessionLayer`] is a tower layer that opens one session scope per
//! registered database for every inbound request, invokes the downstream
//! service exactly once inside a fresh ambient task context, and closes
//! every scope afterwards, honoring each scope's fault / force-rollback /
//! commit decision. Works with any `http`-flavored tower stack, axum
//! included.
//!
//! With several databases registered, scopes open in registration order and
//! close in reverse registration order.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{Request, Response, StatusCode};
use tower::{Layer, Service};

use crate::core::{DbScopeError, Result};
use crate::engine::{AsyncEngine, EngineOpener, EngineOptions, SyncEngine};
use crate::session::ambient;
use crate::session::factory::{SessionFactory, default_factory};
use crate::session::scope::{ScopeOutcome, ScopedSession};
use crate::session::SessionOptions;
use crate::Db;

#[derive(Debug)]
struct LayerConfig {
    dbs: Vec<Db>,
    commit_on_exit: Option<bool>,
    rollback_on_client_error: bool,
    rollback_on_server_error: bool,
    /// Suspending engines can't be schema-ensured in the blocking
    /// constructor; done once, on the first request.
    async_schema: tokio::sync::OnceCell<()>,
}

impl LayerConfig {
    async fn ensure_async_schema(&self) -> Result<()> {
        self.async_schema
            .get_or_try_init(|| async {
                for db in &self.dbs {
                    db.factory().ensure_schema_async().await?;
                }
                Ok::<(), DbScopeError>(())
            })
            .await?;
        Ok(())
    }
}

/// Tower layer installing request-scoped database sessions.
///
/// # Examples
///
/// ```
/// use dbscope::{Db, DbSessionLayer, SessionFactory};
/// use dbscope::engine::memory::MemoryEngine;
/// use std::sync::Arc;
///
/// let factory = SessionFactory::builder()
///     .custom_engine(Arc::new(MemoryEngine::new()))
///     .build()
///     .unwrap();
/// let db = Db::new(factory);
///
/// let layer = DbSessionLayer::builder()
///     .db(db)
///     .commit_on_exit(true)
///     .rollback_on_server_error(true)
///     .build()
///     .unwrap();
/// # let _ = layer;
/// ```
#[derive(Clone, Debug)]
pub struct DbSessionLayer {
    config: Arc<LayerConfig>,
}

impl DbSessionLayer {
    /// Layer over a single, already-configured database.
    pub fn new(db: Db) -> Result<Self> {
        Self::builder().db(db).build()
    }

    pub fn builder() -> DbSessionLayerBuilder {
        DbSessionLayerBuilder::default()
    }

    /// The databases this layer manages, in registration order.
    pub fn dbs(&self) -> &[Db] {
        &self.config.dbs
    }
}

impl<S> Layer<S> for DbSessionLayer {
    type Service = DbSessionMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DbSessionMiddleware {
            inner,
            config: Arc::clone(&self.config),
        }
    }
}

/// Builder for [`DbSessionLayer`].
///
/// Register databases either explicitly with [`db`](Self::db) (repeatable,
/// multi-database setups open scopes in registration order), or implicitly
/// with [`db_url`](Self::db_url) + [`opener`](Self::opener), which configures
/// and reuses the process-wide default factory.
#[derive(Default)]
pub struct DbSessionLayerBuilder {
    dbs: Vec<Db>,
    db_url: Option<String>,
    opener: Option<Arc<dyn EngineOpener>>,
    custom_engine: Option<Arc<dyn SyncEngine>>,
    custom_async_engine: Option<Arc<dyn AsyncEngine>>,
    engine_options: EngineOptions,
    session_options: SessionOptions,
    async_enabled: bool,
    commit_on_exit: Option<bool>,
    rollback_on_client_error: bool,
    rollback_on_server_error: bool,
}

impl DbSessionLayerBuilder {
    /// Register an explicit database. Repeatable.
    pub fn db(mut self, db: Db) -> Self {
        self.dbs.push(db);
        self
    }

    /// Configure the process-wide default factory from a URL. Ignored when
    /// the default factory is already configured.
    pub fn db_url(mut self, url: &str) -> Self {
        self.db_url = Some(url.to_string());
        self
    }

    pub fn opener(mut self, opener: Arc<dyn EngineOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn custom_engine(mut self, engine: Arc<dyn SyncEngine>) -> Self {
        self.custom_engine = Some(engine);
        self
    }

    pub fn custom_async_engine(mut self, engine: Arc<dyn AsyncEngine>) -> Self {
        self.custom_async_engine = Some(engine);
        self.async_enabled = true;
        self
    }

    pub fn engine_options(mut self, options: EngineOptions) -> Self {
        self.engine_options = options;
        self
    }

    pub fn session_options(mut self, options: SessionOptions) -> Self {
        self.session_options = options;
        self
    }

    pub fn async_enabled(mut self, enabled: bool) -> Self {
        self.async_enabled = enabled;
        self
    }

    /// Commit every scope at request exit. Overrides each factory's own
    /// default for scopes this layer opens.
    pub fn commit_on_exit(mut self, commit: bool) -> Self {
        self.commit_on_exit = Some(commit);
        self
    }

    /// Roll back when the response status is in [400, 500).
    pub fn rollback_on_client_error(mut self, rollback: bool) -> Self {
        self.rollback_on_client_error = rollback;
        self
    }

    /// Roll back when the response status is in [500, 600).
    pub fn rollback_on_server_error(mut self, rollback: bool) -> Self {
        self.rollback_on_server_error = rollback;
        self
    }

    /// Validate, ensure schemas, and build the layer.
    ///
    /// Schema creation for every registered factory happens here, at
    /// construction, not lazily on the first request.
    pub fn build(self) -> Result<DbSessionLayer> {
        if !self.dbs.is_empty()
            && (self.db_url.is_some()
                || self.custom_engine.is_some()
                || self.custom_async_engine.is_some())
        {
            return Err(DbScopeError::Configuration(
                "pass either explicit databases or a db_url/custom_engine, not both".into(),
            ));
        }
        let dbs = if !self.dbs.is_empty() {
            self.dbs
        } else if self.custom_engine.is_some() {
            let mut builder = SessionFactory::builder()
                .session_defaults(self.session_options)
                .async_enabled(self.async_enabled);
            if let Some(engine) = self.custom_engine {
                builder = builder.custom_engine(engine);
            }
            if let Some(engine) = self.custom_async_engine {
                builder = builder.custom_async_engine(engine);
            }
            vec![Db::new(builder.build()?)]
        } else if let Some(url) = self.db_url {
            let factory = default_factory();
            if !factory.configured() {
                let mut builder = SessionFactory::builder()
                    .url(&url)
                    .engine_options(self.engine_options)
                    .session_defaults(self.session_options)
                    .async_enabled(self.async_enabled);
                if let Some(opener) = self.opener {
                    builder = builder.opener(opener);
                }
                factory.configure(builder.into_config()?)?;
            }
            vec![Db::new(factory.clone())]
        } else {
            return Err(DbScopeError::Configuration(
                "You need to pass a db_url or a custom_engine parameter.".into(),
            ));
        };

        for db in &dbs {
            db.factory().ensure_schema()?;
        }

        Ok(DbSessionLayer {
            config: Arc::new(LayerConfig {
                dbs,
                commit_on_exit: self.commit_on_exit,
                rollback_on_client_error: self.rollback_on_client_error,
                rollback_on_server_error: self.rollback_on_server_error,
                async_schema: tokio::sync::OnceCell::new(),
            }),
        })
    }
}

/// The per-request service produced by [`DbSessionLayer`].
#[derive(Clone)]
pub struct DbSessionMiddleware<S> {
    inner: S,
    config: Arc<LayerConfig>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for DbSessionMiddleware<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // Take the service that was driven to readiness; leave the clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = Arc::clone(&self.config);

        Box::pin(ambient::in_context(async move {
            if let Err(err) = config.ensure_async_schema().await {
                tracing::error!(error = %err, "async schema creation failed");
                return Ok(internal_error_response());
            }

            let mut scopes: Vec<ScopedSession> = Vec::with_capacity(config.dbs.len());
            for db in &config.dbs {
                let mut scope = db.scope();
                if let Some(commit) = config.commit_on_exit {
                    scope = scope.commit_on_exit(commit);
                }
                match scope.enter().await {
                    Ok(_handle) => scopes.push(scope),
                    Err(err) => {
                        tracing::error!(error = %err, "failed to open request session");
                        if let Err(err) = close_scopes(&mut scopes, ScopeOutcome::Fault).await {
                            tracing::error!(error = %err, "session cleanup failed after open failure");
                        }
                        return Ok(internal_error_response());
                    }
                }
            }

            match inner.call(request).await {
                Ok(response) => {
                    let status = response.status();
                    if rollback_for_status(&config, status) {
                        for scope in &scopes {
                            if let Some(handle) = scope.handle() {
                                handle.set_force_rollback(true);
                            }
                        }
                    }
                    match close_scopes(&mut scopes, ScopeOutcome::Success).await {
                        Ok(()) => Ok(response),
                        // The handler produced a success, but its writes
                        // could not be settled; don't pretend otherwise.
                        Err(err) => {
                            tracing::error!(error = %err, "session release failed");
                            Ok(internal_error_response())
                        }
                    }
                }
                Err(fault) => {
                    if let Err(err) = close_scopes(&mut scopes, ScopeOutcome::Fault).await {
                        tracing::error!(error = %err, "session cleanup failed during fault handling");
                    }
                    Err(fault)
                }
            }
        }))
    }
}

fn rollback_for_status(config: &LayerConfig, status: StatusCode) -> bool {
    (config.rollback_on_client_error && status.is_client_error())
        || (config.rollback_on_server_error && status.is_server_error())
}

/// Close scopes in reverse open order, keeping the first failure.
async fn close_scopes(scopes: &mut Vec<ScopedSession>, outcome: ScopeOutcome) -> Result<()> {
    let mut first_err = None;
    while let Some(mut scope) = scopes.pop() {
        if let Err(err) = scope.exit(outcome).await {
            tracing::warn!(error = %err, "session scope exit failed");
            if first_err.is_none() {
                first_err = Some(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn internal_error_response<B: Default>() -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;

    #[test]
    fn test_builder_requires_a_database() {
        let err = DbSessionLayer::builder().build().unwrap_err();
        assert!(err.to_string().contains("db_url or a custom_engine"));
    }

    #[test]
    fn test_builder_rejects_explicit_db_combined_with_url_or_engine() {
        let factory = SessionFactory::builder()
            .custom_engine(Arc::new(MemoryEngine::new()))
            .build()
            .unwrap();

        let result = DbSessionLayer::builder()
            .db(Db::new(factory.clone()))
            .db_url("memory://conflict")
            .build();
        assert!(matches!(result, Err(DbScopeError::Configuration(_))));

        let result = DbSessionLayer::builder()
            .db(Db::new(factory))
            .custom_engine(Arc::new(MemoryEngine::new()))
            .build();
        assert!(matches!(result, Err(DbScopeError::Configuration(_))));
    }

    #[test]
    fn test_layer_is_cloneable_and_debuggable() {
        let factory = SessionFactory::builder()
            .custom_engine(Arc::new(MemoryEngine::new()))
            .build()
            .unwrap();
        let layer = DbSessionLayer::new(Db::new(factory)).unwrap();

        let rendered = format!("{:?}", layer.clone());
        assert!(rendered.contains("DbSessionLayer"));
    }

    #[test]
    fn test_build_ensures_schema_eagerly() {
        let engine = Arc::new(MemoryEngine::with_tables(&["users"]));
        let factory = SessionFactory::builder()
            .custom_engine(Arc::clone(&engine) as Arc<dyn SyncEngine>)
            .build()
            .unwrap();

        let _layer = DbSessionLayer::new(Db::new(factory)).unwrap();
        assert_eq!(engine.stats().schema_calls(), 1);
    }

    #[test]
    fn test_status_classification() {
        let config = LayerConfig {
            dbs: Vec::new(),
            commit_on_exit: None,
            rollback_on_client_error: true,
            rollback_on_server_error: false,
            async_schema: tokio::sync::OnceCell::new(),
        };
        assert!(rollback_for_status(&config, StatusCode::NOT_FOUND));
        assert!(rollback_for_status(&config, StatusCode::BAD_REQUEST));
        assert!(!rollback_for_status(&config, StatusCode::BAD_GATEWAY));
        assert!(!rollback_for_status(&config, StatusCode::OK));

        let config = LayerConfig {
            dbs: Vec::new(),
            commit_on_exit: None,
            rollback_on_client_error: false,
            rollback_on_server_error: true,
            async_schema: tokio::sync::OnceCell::new(),
        };
        assert!(!rollback_for_status(&config, StatusCode::UNPROCESSABLE_ENTITY));
        assert!(rollback_for_status(&config, StatusCode::INTERNAL_SERVER_ERROR));
        assert!(rollback_for_status(&config, StatusCode::BAD_GATEWAY));
    }
}
