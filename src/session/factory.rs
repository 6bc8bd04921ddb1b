//! Session construction and engine ownership.
//!
//! A [`SessionFactory`] holds the engine configuration for one database and
//! constructs fresh session handles on demand. Engines are created lazily,
//! exactly once, on first use; the configuration is immutable after that
//! first successful initialisation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lazy_static::lazy_static;
use uuid::Uuid;

use crate::core::{DbScopeError, Result};
use crate::engine::{AsyncEngine, EngineOpener, EngineOptions, SyncEngine};
use crate::session::{BackendSession, SessionHandle, SessionMode, SessionOptions, SessionOverrides};

lazy_static! {
    /// Process-wide default factory, configured by the first URL-based
    /// middleware construction and reused by every later one.
    static ref DEFAULT_FACTORY: SessionFactory = SessionFactory::unconfigured();
}

/// The process-wide default factory.
pub fn default_factory() -> &'static SessionFactory {
    &DEFAULT_FACTORY
}

/// Validated factory configuration. Built through [`FactoryBuilder`].
#[derive(Clone)]
pub struct FactoryConfig {
    url: Option<String>,
    async_url: Option<String>,
    opener: Option<Arc<dyn EngineOpener>>,
    custom_engine: Option<Arc<dyn SyncEngine>>,
    custom_async_engine: Option<Arc<dyn AsyncEngine>>,
    engine_options: EngineOptions,
    async_engine_options: Option<EngineOptions>,
    session_defaults: SessionOptions,
    commit_on_exit: bool,
    async_enabled: bool,
}

struct FactoryInner {
    id: Uuid,
    config: RwLock<Option<FactoryConfig>>,
    initiated: AtomicBool,
    sync_engine: Mutex<Option<Arc<dyn SyncEngine>>>,
    async_engine: Mutex<Option<Arc<dyn AsyncEngine>>>,
}

/// Constructs sessions for one database.
///
/// Clones share the same underlying factory; equality is by identity.
///
/// # Examples
///
/// ```
/// use dbscope::SessionFactory;
/// use dbscope::engine::memory::MemoryEngine;
/// use std::sync::Arc;
///
/// let factory = SessionFactory::builder()
///     .custom_engine(Arc::new(MemoryEngine::new()))
///     .commit_on_exit(true)
///     .build()
///     .unwrap();
///
/// assert!(factory.configured());
/// ```
#[derive(Clone)]
pub struct SessionFactory {
    inner: Arc<FactoryInner>,
}

impl SessionFactory {
    /// A factory with no configuration yet. Ambient access through it fails
    /// with [`DbScopeError::SessionNotInitialised`] until it is configured.
    pub fn unconfigured() -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                id: Uuid::new_v4(),
                config: RwLock::new(None),
                initiated: AtomicBool::new(false),
                sync_engine: Mutex::new(None),
                async_engine: Mutex::new(None),
            }),
        }
    }

    pub fn builder() -> FactoryBuilder {
        FactoryBuilder::default()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn configured(&self) -> bool {
        self.inner
            .config
            .read()
            .map(|config| config.is_some())
            .unwrap_or(false)
    }

    /// Whether the engines have been built.
    pub fn initiated(&self) -> bool {
        self.inner.initiated.load(Ordering::Acquire)
    }

    /// Install a configuration. Fails once the factory has initialised its
    /// engines; before that, reconfiguring is allowed.
    pub fn configure(&self, config: FactoryConfig) -> Result<()> {
        if self.initiated() {
            return Err(DbScopeError::Configuration(
                "factory is already initialised and can no longer be reconfigured".into(),
            ));
        }
        let mut slot = self.inner.config.write()?;
        *slot = Some(config);
        Ok(())
    }

    pub fn commit_on_exit_default(&self) -> bool {
        self.with_config(|config| config.commit_on_exit).unwrap_or(false)
    }

    pub fn async_enabled(&self) -> bool {
        self.with_config(|config| config.async_enabled).unwrap_or(false)
    }

    pub fn session_defaults(&self) -> SessionOptions {
        self.with_config(|config| config.session_defaults.clone())
            .unwrap_or_default()
    }

    fn with_config<T>(&self, f: impl FnOnce(&FactoryConfig) -> T) -> Option<T> {
        self.inner
            .config
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(f))
    }

    /// Build and memoize the engines. Idempotent; fails with
    /// [`DbScopeError::SessionNotInitialised`] when no configuration exists.
    pub fn init(&self) -> Result<()> {
        if self.initiated() {
            return Ok(());
        }

        let config_guard = self.inner.config.read()?;
        let config = config_guard
            .as_ref()
            .ok_or(DbScopeError::SessionNotInitialised)?;

        let mut sync_slot = self.inner.sync_engine.lock()?;
        let mut async_slot = self.inner.async_engine.lock()?;
        // Lost the race against another initialiser.
        if self.initiated() {
            return Ok(());
        }

        let sync_engine: Arc<dyn SyncEngine> = match (&config.custom_engine, &config.url) {
            (Some(engine), _) => Arc::clone(engine),
            (None, Some(url)) => {
                let opener = config.opener.as_ref().ok_or_else(|| {
                    DbScopeError::Configuration(
                        "an engine opener is required when configuring from a url".into(),
                    )
                })?;
                opener.open(url, &config.engine_options)?
            }
            (None, None) => {
                return Err(DbScopeError::Configuration(
                    "You need to pass a db_url or a custom_engine parameter.".into(),
                ));
            }
        };

        if config.async_enabled {
            let async_engine: Arc<dyn AsyncEngine> = match &config.custom_async_engine {
                Some(engine) => Arc::clone(engine),
                None => {
                    let url = config
                        .async_url
                        .as_ref()
                        .or(config.url.as_ref())
                        .ok_or_else(|| {
                            DbScopeError::Configuration(
                                "You need to pass an async_url or an async_custom_engine parameter.".into(),
                            )
                        })?;
                    let opener = config.opener.as_ref().ok_or_else(|| {
                        DbScopeError::Configuration(
                            "an engine opener is required when configuring from a url".into(),
                        )
                    })?;
                    let options = config
                        .async_engine_options
                        .as_ref()
                        .unwrap_or(&config.engine_options);
                    opener.open_async(url, options)?
                }
            };
            *async_slot = Some(async_engine);
        }

        *sync_slot = Some(sync_engine);
        self.inner.initiated.store(true, Ordering::Release);
        tracing::debug!(factory = %self.id(), "session factory initialised");
        Ok(())
    }

    fn sync_engine(&self) -> Result<Arc<dyn SyncEngine>> {
        self.init()?;
        let guard = self.inner.sync_engine.lock()?;
        guard.clone().ok_or(DbScopeError::SessionNotInitialised)
    }

    fn async_engine(&self) -> Result<Arc<dyn AsyncEngine>> {
        self.init()?;
        let guard = self.inner.async_engine.lock()?;
        guard.clone().ok_or_else(|| {
            DbScopeError::Configuration(
                "async sessions require a factory built with async_enabled".into(),
            )
        })
    }

    /// Open a fresh blocking session. Never reuses a previous handle.
    pub fn open_blocking(&self, overrides: &SessionOverrides) -> Result<SessionHandle> {
        let engine = self.sync_engine()?;
        let options = self.session_defaults().merged(overrides);
        let backend = engine.open_session(&options)?;
        Ok(SessionHandle::new(
            self.id(),
            SessionMode::Blocking,
            options,
            BackendSession::Blocking(backend),
        ))
    }

    /// Open a fresh session for a suspending context. Factories without
    /// async support hand out a blocking session, whose operations then
    /// complete without yielding.
    pub async fn open_suspending(&self, overrides: &SessionOverrides) -> Result<SessionHandle> {
        if !self.async_enabled() {
            return self.open_blocking(overrides);
        }
        let engine = self.async_engine()?;
        let options = self.session_defaults().merged(overrides);
        let backend = engine.open_session(&options).await?;
        Ok(SessionHandle::new(
            self.id(),
            SessionMode::Suspending,
            options,
            BackendSession::Suspending(backend),
        ))
    }

    /// Create all known relation schemas on the blocking engine. Idempotent.
    pub fn ensure_schema(&self) -> Result<()> {
        self.sync_engine()?.ensure_schema().map_err(Into::into)
    }

    /// Create schemas on the suspending engine as well. Idempotent; a no-op
    /// for factories without async support (the blocking path covers them).
    pub async fn ensure_schema_async(&self) -> Result<()> {
        if !self.async_enabled() {
            return Ok(());
        }
        self.async_engine()?.ensure_schema().await.map_err(Into::into)
    }
}

impl PartialEq for SessionFactory {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for SessionFactory {}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("id", &self.inner.id)
            .field("configured", &self.configured())
            .field("initiated", &self.initiated())
            .finish()
    }
}

/// Builder for [`SessionFactory`] configurations.
#[derive(Default)]
pub struct FactoryBuilder {
    url: Option<String>,
    async_url: Option<String>,
    opener: Option<Arc<dyn EngineOpener>>,
    custom_engine: Option<Arc<dyn SyncEngine>>,
    custom_async_engine: Option<Arc<dyn AsyncEngine>>,
    engine_options: EngineOptions,
    async_engine_options: Option<EngineOptions>,
    session_defaults: SessionOptions,
    commit_on_exit: bool,
    async_enabled: bool,
}

impl FactoryBuilder {
    pub fn url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    /// Separate URL for the suspending engine; falls back to `url`.
    pub fn async_url(mut self, url: &str) -> Self {
        self.async_url = Some(url.to_string());
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

    /// Supplying a suspending engine implies `async_enabled`.
    pub fn custom_async_engine(mut self, engine: Arc<dyn AsyncEngine>) -> Self {
        self.custom_async_engine = Some(engine);
        self.async_enabled = true;
        self
    }

    pub fn engine_options(mut self, options: EngineOptions) -> Self {
        self.engine_options = options;
        self
    }

    pub fn async_engine_options(mut self, options: EngineOptions) -> Self {
        self.async_engine_options = Some(options);
        self
    }

    pub fn session_defaults(mut self, options: SessionOptions) -> Self {
        self.session_defaults = options;
        self
    }

    /// Commit at scope exit by default (scopes can still override).
    pub fn commit_on_exit(mut self, commit: bool) -> Self {
        self.commit_on_exit = commit;
        self
    }

    pub fn async_enabled(mut self, enabled: bool) -> Self {
        self.async_enabled = enabled;
        self
    }

    /// Validate the configuration. Fails fast rather than at first use.
    pub fn into_config(self) -> Result<FactoryConfig> {
        match (&self.url, &self.custom_engine) {
            (None, None) => {
                return Err(DbScopeError::Configuration(
                    "You need to pass a db_url or a custom_engine parameter.".into(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(DbScopeError::Configuration(
                    "pass either a db_url or a custom_engine, not both".into(),
                ));
            }
            _ => {}
        }
        if self.url.is_some() && self.opener.is_none() {
            return Err(DbScopeError::Configuration(
                "an engine opener is required when configuring from a url".into(),
            ));
        }
        if self.async_enabled && self.custom_async_engine.is_none() {
            let opener_can = self
                .opener
                .as_ref()
                .map(|opener| opener.supports_async())
                .unwrap_or(false);
            let has_url = self.async_url.is_some() || self.url.is_some();
            if !(opener_can && has_url) {
                return Err(DbScopeError::Configuration(
                    "async_enabled requires an async-capable engine: pass an async_custom_engine, \
                     or a url with an opener that supports async"
                        .into(),
                ));
            }
        }

        Ok(FactoryConfig {
            url: self.url,
            async_url: self.async_url,
            opener: self.opener,
            custom_engine: self.custom_engine,
            custom_async_engine: self.custom_async_engine,
            engine_options: self.engine_options,
            async_engine_options: self.async_engine_options,
            session_defaults: self.session_defaults,
            commit_on_exit: self.commit_on_exit,
            async_enabled: self.async_enabled,
        })
    }

    pub fn build(self) -> Result<SessionFactory> {
        let config = self.into_config()?;
        let factory = SessionFactory::unconfigured();
        factory.configure(config)?;
        Ok(factory)
    }
}
