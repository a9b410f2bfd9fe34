//! Configuration file support for llmapp
//!
//! Supports both YAML and TOML configuration files. Connection secrets are
//! usually supplied through the environment instead (see [`Config::apply_env`]).
//!
//! # Example YAML configuration:
//! ```yaml
//! server:
//!   bind: "0.0.0.0"
//!   port: 8501
//!
//! database:
//!   schema: llm
//!   inference_function: run_llm_inference_task
//!
//! tracking:
//!   uri: "http://mlflow:5000"
//!
//! registry:
//!   model_name: tanzuhuggingface-dev
//!   model_stage: Staging
//!   fallback_model_name: tanzuhuggingface/dev
//!
//! logging:
//!   level: info
//!   format: json
//! ```

use llmapp_core::security::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DB_URI: &str = "DATA_E2E_LLMAPP_TRAINING_DB_URI";
pub const ENV_DB_SCHEMA: &str = "DATA_E2E_LLMAPP_TRAINING_DB_SCHEMA";
pub const ENV_HUB_TOKEN: &str = "DATA_E2E_HUGGINGFACE_TOKEN";
pub const ENV_TRACKING_URI: &str = "MLFLOW_TRACKING_URI";
pub const ENV_CATALOG_TOKEN: &str = "DATAHUB_GMS_TOKEN";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub tracking: TrackingConfig,
    pub registry: RegistryConfig,
    pub hub: HubConfig,
    pub catalog: CatalogConfig,
    pub ui: UiConfig,
    pub dedup: DedupConfig,
    pub logging: LoggingConfig,
    pub http: HttpConfig,
}

/// UI server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind: String,

    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8501,
        }
    }
}

/// Database holding the inference function
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URI (PostgreSQL / Greenplum)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<SecretString>,

    /// Schema the inference function lives in
    pub schema: String,

    pub inference_function: String,

    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            uri: None,
            schema: "public".to_string(),
            inference_function: llmapp_core::request::DEFAULT_INFERENCE_FUNCTION.to_string(),
            max_connections: 5,
        }
    }
}

/// MLflow tracking server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Tracking server URI; prompt tracking and model selection are disabled
    /// without it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Experiment receiving prompt tracking runs
    pub experiment: String,

    /// Experiment receiving publish, promotion and metadata runs
    pub workflow_experiment: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            uri: None,
            experiment: llmapp_core::request::DEFAULT_TRACKING_EXPERIMENT.to_string(),
            workflow_experiment: "Default".to_string(),
        }
    }
}

/// Champion model lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub model_name: String,
    pub model_stage: String,
    pub model_alias: String,
    pub fallback_model_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            model_name: "tanzuhuggingface-dev".to_string(),
            model_stage: "Staging".to_string(),
            model_alias: "champion".to_string(),
            fallback_model_name: "tanzuhuggingface/dev".to_string(),
        }
    }
}

/// Model hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub endpoint: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<SecretString>,

    /// Maximum safetensors shard size (e.g. 2GB, 500MB, 1GiB)
    pub max_shard_size: String,

    /// Local directory for model snapshots
    pub workdir: PathBuf,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint: llmapp_core::hub::DEFAULT_ENDPOINT.to_string(),
            token: None,
            max_shard_size: llmapp_core::shard::DEFAULT_MAX_SHARD_SIZE.to_string(),
            workdir: PathBuf::from("./models"),
        }
    }
}

/// Metadata catalog
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CatalogConfig {
    /// Bearer token for the GMS server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<SecretString>,
}

/// Requests issued by the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// Model used for file summaries and the default-model answer
    pub summary_model: String,

    pub upload_experiment: String,

    pub question_experiment: String,

    /// Restrict upload summaries to top-k retrieved documents
    pub upload_topk: bool,

    pub question_topk: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            summary_model: "tanzuhuggingface/dev".to_string(),
            upload_experiment: "testinference123".to_string(),
            question_experiment: "llm_summary".to_string(),
            upload_topk: false,
            question_topk: true,
        }
    }
}

/// Repeated-request short circuit for the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,

    /// Maximum remembered requests
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 256,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Outbound HTTP clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a file (YAML or TOML, auto-detected by extension)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Self::from_yaml(&content).or_else(|_| Self::from_toml(&content)),
        }
    }

    /// File configuration (or defaults) with environment overrides applied.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Override values from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Override values from `lookup`. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(uri) = get(ENV_DB_URI) {
            self.database.uri = Some(SecretString::new(uri));
        }
        if let Some(schema) = get(ENV_DB_SCHEMA) {
            self.database.schema = schema;
        }
        if let Some(token) = get(ENV_HUB_TOKEN) {
            self.hub.token = Some(SecretString::new(token));
        }
        if let Some(uri) = get(ENV_TRACKING_URI) {
            self.tracking.uri = Some(uri);
        }
        if let Some(token) = get(ENV_CATALOG_TOKEN) {
            self.catalog.token = Some(SecretString::new(token));
        }
    }

    /// Merge another config into this one (other values take precedence if set)
    pub fn merge(&mut self, other: Config) {
        let server = ServerConfig::default();
        if other.server.bind != server.bind {
            self.server.bind = other.server.bind;
        }
        if other.server.port != server.port {
            self.server.port = other.server.port;
        }

        let database = DatabaseConfig::default();
        if other.database.uri.is_some() {
            self.database.uri = other.database.uri;
        }
        if other.database.schema != database.schema {
            self.database.schema = other.database.schema;
        }
        if other.database.inference_function != database.inference_function {
            self.database.inference_function = other.database.inference_function;
        }
        if other.database.max_connections != database.max_connections {
            self.database.max_connections = other.database.max_connections;
        }

        let tracking = TrackingConfig::default();
        if other.tracking.uri.is_some() {
            self.tracking.uri = other.tracking.uri;
        }
        if other.tracking.experiment != tracking.experiment {
            self.tracking.experiment = other.tracking.experiment;
        }
        if other.tracking.workflow_experiment != tracking.workflow_experiment {
            self.tracking.workflow_experiment = other.tracking.workflow_experiment;
        }

        let registry = RegistryConfig::default();
        if other.registry.model_name != registry.model_name {
            self.registry.model_name = other.registry.model_name;
        }
        if other.registry.model_stage != registry.model_stage {
            self.registry.model_stage = other.registry.model_stage;
        }
        if other.registry.model_alias != registry.model_alias {
            self.registry.model_alias = other.registry.model_alias;
        }
        if other.registry.fallback_model_name != registry.fallback_model_name {
            self.registry.fallback_model_name = other.registry.fallback_model_name;
        }

        let hub = HubConfig::default();
        if other.hub.endpoint != hub.endpoint {
            self.hub.endpoint = other.hub.endpoint;
        }
        if other.hub.token.is_some() {
            self.hub.token = other.hub.token;
        }
        if other.hub.max_shard_size != hub.max_shard_size {
            self.hub.max_shard_size = other.hub.max_shard_size;
        }
        if other.hub.workdir != hub.workdir {
            self.hub.workdir = other.hub.workdir;
        }

        if other.catalog.token.is_some() {
            self.catalog.token = other.catalog.token;
        }

        // UI and dedup sections are small enough to replace wholesale
        let ui = UiConfig::default();
        if other.ui.summary_model != ui.summary_model
            || other.ui.upload_experiment != ui.upload_experiment
            || other.ui.question_experiment != ui.question_experiment
            || other.ui.upload_topk != ui.upload_topk
            || other.ui.question_topk != ui.question_topk
        {
            self.ui = other.ui;
        }
        let dedup = DedupConfig::default();
        if other.dedup.enabled != dedup.enabled || other.dedup.capacity != dedup.capacity {
            self.dedup = other.dedup;
        }

        let logging = LoggingConfig::default();
        if other.logging.level != logging.level {
            self.logging.level = other.logging.level;
        }
        if other.logging.format != logging.format {
            self.logging.format = other.logging.format;
        }

        if other.http.connect_timeout_secs != HttpConfig::default().connect_timeout_secs {
            self.http.connect_timeout_secs = other.http.connect_timeout_secs;
        }
    }

    /// Create an example configuration
    pub fn example() -> Self {
        Self {
            server: ServerConfig {
                bind: "0.0.0.0".to_string(),
                port: 8501,
            },
            database: DatabaseConfig {
                schema: "llm".to_string(),
                ..Default::default()
            },
            tracking: TrackingConfig {
                uri: Some("http://mlflow:5000".to_string()),
                ..Default::default()
            },
            registry: RegistryConfig::default(),
            hub: HubConfig {
                workdir: PathBuf::from("/app/models"),
                ..Default::default()
            },
            catalog: CatalogConfig::default(),
            ui: UiConfig::default(),
            dedup: DedupConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "json".to_string(),
            },
            http: HttpConfig::default(),
        }
    }

    /// Generate example YAML configuration
    pub fn example_yaml() -> String {
        serde_yaml::to_string(&Self::example()).unwrap_or_default()
    }

    /// Generate example TOML configuration
    pub fn example_toml() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
