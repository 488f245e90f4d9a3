//! Layered configuration for the holding pen
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML file,
//! then `HOLDINGPEN_*` environment variables (`__` separates nested keys, e.g.
//! `HOLDINGPEN_DATABASE__URL`). A `.env` file is loaded before the environment
//! is read.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "HOLDINGPEN";
const CONFIG_PATH_ENV: &str = "HOLDINGPEN_CONFIG_PATH";
const DEFAULT_CONFIG_FILE: &str = "holdingpen";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub ticketing: TicketingConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/* ===================== Sections ===================== */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Dotted paths into the record whose values identify it unambiguously.
    #[serde(default = "default_exact_fields")]
    pub exact_fields: Vec<String>,

    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,

    #[serde(default = "default_fuzzy_limit")]
    pub fuzzy_limit: usize,

    /// Budget for one call to the record or holding-pen index.
    #[serde(default = "default_external_timeout_ms")]
    pub index_timeout_ms: u64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            exact_fields: default_exact_fields(),
            fuzzy_threshold: default_fuzzy_threshold(),
            fuzzy_limit: default_fuzzy_limit(),
            index_timeout_ms: default_external_timeout_ms(),
        }
    }
}

impl MatchingConfig {
    pub fn index_timeout(&self) -> Duration {
        Duration::from_millis(self.index_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketingConfig {
    #[serde(default = "default_curation_queue")]
    pub curation_queue: String,

    #[serde(default = "default_submission_queue")]
    pub submission_queue: String,

    #[serde(default = "default_external_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for TicketingConfig {
    fn default() -> Self {
        Self {
            curation_queue: default_curation_queue(),
            submission_queue: default_submission_queue(),
            timeout_ms: default_external_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl TicketingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `insert` or `replace` on the legacy side.
    #[serde(default = "default_upload_mode")]
    pub mode: String,

    /// When set, the workflow halts until the legacy system acknowledges the upload.
    #[serde(default)]
    pub callback_url: Option<String>,

    #[serde(default = "default_external_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: default_upload_mode(),
            callback_url: None,
            timeout_ms: default_external_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl UploadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// arXiv categories that make a record core.
    #[serde(default = "default_core_categories")]
    pub core_categories: Vec<String>,

    #[serde(default)]
    pub auto_approve: bool,

    #[serde(default = "default_task_history_limit")]
    pub task_history_limit: usize,

    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            core_categories: default_core_categories(),
            auto_approve: false,
            task_history_limit: default_task_history_limit(),
            required_fields: default_required_fields(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_max_lifetime_secs() -> u64 {
    1800
}

fn default_exact_fields() -> Vec<String> {
    vec!["arxiv_eprints.value".to_string(), "dois.value".to_string()]
}

fn default_fuzzy_threshold() -> f64 {
    0.6
}

fn default_fuzzy_limit() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_curation_queue() -> String {
    "HEP_curation".to_string()
}

fn default_submission_queue() -> String {
    "HEP_add_user".to_string()
}

fn default_external_timeout_ms() -> u64 {
    10_000
}

fn default_upload_mode() -> String {
    "insert".to_string()
}

fn default_core_categories() -> Vec<String> {
    ["hep-ex", "hep-lat", "hep-ph", "hep-th"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_task_history_limit() -> usize {
    50
}

fn default_required_fields() -> Vec<String> {
    vec!["titles".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

/* ===================== Loading ===================== */

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load with default search: `HOLDINGPEN_CONFIG_PATH`, then `holdingpen.toml`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder().build()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::Invalid(format!(
                "database.min_connections ({}) exceeds database.max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }
        if !(0.0..=1.0).contains(&self.matching.fuzzy_threshold) {
            return Err(ConfigError::Invalid(format!(
                "matching.fuzzy_threshold must be within [0, 1], got {}",
                self.matching.fuzzy_threshold
            )));
        }
        if self.matching.exact_fields.is_empty() {
            return Err(ConfigError::Invalid(
                "matching.exact_fields must name at least one field".to_string(),
            ));
        }
        for retry in [&self.ticketing.retry, &self.upload.retry] {
            if retry.max_attempts == 0 {
                return Err(ConfigError::Invalid(
                    "retry.max_attempts must be at least 1".to_string(),
                ));
            }
            if retry.multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "retry.multiplier must be >= 1.0, got {}",
                    retry.multiplier
                )));
            }
        }
        Ok(())
    }

    /// The database URL, required by anything touching Postgres.
    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database.url.as_deref().ok_or_else(|| {
            ConfigError::Invalid(
                "database.url is not set (use --database-url or HOLDINGPEN_DATABASE__URL)"
                    .to_string(),
            )
        })
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    database_url: Option<String>,
    config_path: Option<PathBuf>,
    skip_env: bool,
}

impl ConfigBuilder {
    pub fn database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Ignore `.env` and process environment. Used by tests.
    pub fn skip_env(mut self, skip: bool) -> Self {
        self.skip_env = skip;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        if !self.skip_env {
            let _ = dotenvy::dotenv();
        }

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        match self.config_path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                let env_path = if self.skip_env {
                    None
                } else {
                    std::env::var(CONFIG_PATH_ENV).ok()
                };
                match env_path {
                    Some(path) => {
                        builder = builder.add_source(config::File::with_name(&path).required(true));
                    }
                    None => {
                        builder = builder
                            .add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false));
                    }
                }
            }
        }

        if !self.skip_env {
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let mut config: Config = builder.build()?.try_deserialize()?;

        if let Some(url) = self.database_url {
            config.database.url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }
}
