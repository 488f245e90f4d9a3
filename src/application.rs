//! Application bootstrap for the holding pen
//!
//! Creates an [`Application`] with the configured store, collaborators and
//! built-in programs registered on the engine.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::callbacks::CallbackHandler;
use crate::config::Config;
use crate::db::{self, PgRecordIndex, PgWorkflowStore};
use crate::engine::{Engine, Environment, InMemoryCollaborators};
use crate::external::{
    LegacyUploader, RecordingTicketing, RecordingUploader, RequiredFieldsValidator, Ticketing,
};
use crate::workflows::register_builtin;

/// The holding pen application instance
pub struct Application {
    pub config: Config,
    /// Absent in in-memory mode.
    pub pool: Option<PgPool>,
    pub engine: Arc<Engine>,
    pub callbacks: CallbackHandler,
}

impl Application {
    /// Create a new Application instance (pure instantiation, no I/O)
    pub fn new(config: Config, pool: Option<PgPool>, env: Environment) -> Self {
        let mut engine = Engine::new(env);
        register_builtin(&mut engine);
        let engine = Arc::new(engine);

        Self {
            config,
            pool,
            callbacks: CallbackHandler::new(engine.clone()),
            engine,
        }
    }

    /// Get the database pool
    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Options for initializing the holding pen
#[derive(Clone)]
pub struct InitOptions {
    /// Database URL (overrides config file and env vars)
    pub database_url: Option<String>,

    /// Config file path (overrides default search)
    pub config_path: Option<String>,

    /// Whether to run migrations after connecting
    pub auto_migrate: bool,

    /// Keep everything in process memory instead of Postgres
    pub in_memory: bool,

    /// Ticketing client. Defaults to one that only records operations.
    pub ticketing: Option<Arc<dyn Ticketing>>,

    /// Legacy upload client. Defaults to one that only records uploads.
    pub uploader: Option<Arc<dyn LegacyUploader>>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            database_url: None,
            config_path: None,
            auto_migrate: true,
            in_memory: false,
            ticketing: None,
            uploader: None,
        }
    }
}

/// Builder for constructing InitOptions
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    /// Create a new builder with default options
    pub fn new() -> Self {
        Self {
            options: InitOptions::default(),
        }
    }

    /// Set the database URL
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.options.database_url = Some(url.into());
        self
    }

    /// Set the config file path
    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    /// Set whether to automatically run migrations
    pub fn auto_migrate(mut self, auto: bool) -> Self {
        self.options.auto_migrate = auto;
        self
    }

    pub fn in_memory(mut self, in_memory: bool) -> Self {
        self.options.in_memory = in_memory;
        self
    }

    pub fn ticketing(mut self, ticketing: Arc<dyn Ticketing>) -> Self {
        self.options.ticketing = Some(ticketing);
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn LegacyUploader>) -> Self {
        self.options.uploader = Some(uploader);
        self
    }

    /// Initialize the holding pen with the configured options
    pub async fn init(self) -> Result<Application> {
        initialize(self.options).await
    }
}

impl Default for InitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize the holding pen and return an Application instance
pub async fn initialize(options: InitOptions) -> Result<Application> {
    // Bootstrap: Load config
    let config = Config::builder()
        .database_url(options.database_url)
        .config_path(options.config_path.map(PathBuf::from))
        .build()
        .context("Failed to load configuration")?;

    if options.in_memory {
        let collaborators = InMemoryCollaborators::new();
        let mut env = collaborators.environment(config.clone());
        if let Some(ticketing) = options.ticketing {
            env.ticketing = ticketing;
        }
        if let Some(uploader) = options.uploader {
            env.uploader = uploader;
        }
        info!("holding pen initialized in memory");
        return Ok(Application::new(config, None, env));
    }

    // Create pool
    let pool = db::create_pool(&config.database).await?;
    if options.auto_migrate {
        db::migrate(&pool).await?;
    }

    // Instantiate
    let store = Arc::new(PgWorkflowStore::new(pool.clone()));
    let env = Environment {
        config: Arc::new(config.clone()),
        store: store.clone(),
        workflow_index: store,
        records: Arc::new(PgRecordIndex::new(pool.clone())),
        ticketing: options
            .ticketing
            .unwrap_or_else(|| Arc::new(RecordingTicketing::new())),
        uploader: options
            .uploader
            .unwrap_or_else(|| Arc::new(RecordingUploader::new())),
        validator: Arc::new(RequiredFieldsValidator::new(
            config.workflow.required_fields.clone(),
        )),
    };

    info!(migrated = options.auto_migrate, "holding pen initialized");
    Ok(Application::new(config, Some(pool), env))
}
