//! Configuration management.
//!
//! skiff configuration comes from three layers, later layers winning:
//! - Built-in defaults
//! - Config file (`~/.config/skiff/config.toml`, or `SKIFF_CONFIG`)
//! - Environment variables (`JWKS_ENDPOINT`, `GEN3_NAMESPACE`, `SKIFF_*`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// skiff configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Identity and policy-engine configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Orchestrator (Kubernetes) configuration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Engine tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Run registry storage
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_port() -> u16 {
    80
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Identity and authorization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// JWKS endpoint for token verification (deployment collaborator)
    #[serde(default)]
    pub jwks_endpoint: Option<String>,

    /// Base URL of the external policy engine
    #[serde(default = "default_authz_url")]
    pub authz_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwks_endpoint: None,
            authz_url: default_authz_url(),
        }
    }
}

fn default_authz_url() -> String {
    "http://arborist-service".to_string()
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Run jobs as local child processes instead of cluster jobs
    #[serde(default)]
    pub local: bool,

    /// Target namespace for jobs and pods
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Image used for CommandLineTool containers without a DockerRequirement
    #[serde(default = "default_task_image")]
    pub task_image: String,

    /// Image used for ExpressionTool containers
    #[serde(default = "default_expression_image")]
    pub expression_image: String,

    /// Image the engine job runs (must carry the skiff binary)
    #[serde(default = "default_engine_image")]
    pub engine_image: String,

    /// Per-API-call timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub api_timeout_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            local: false,
            namespace: default_namespace(),
            task_image: default_task_image(),
            expression_image: default_expression_image(),
            engine_image: default_engine_image(),
            api_timeout_seconds: default_api_timeout(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_task_image() -> String {
    "ubuntu:22.04".to_string()
}

fn default_expression_image() -> String {
    "node:20-slim".to_string()
}

fn default_engine_image() -> String {
    "skiff:latest".to_string()
}

fn default_api_timeout() -> u64 {
    20
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Orchestrator status poll period in milliseconds
    #[serde(default = "default_status_poll_millis")]
    pub status_poll_millis: u64,

    /// Resource usage sampling period in seconds
    #[serde(default = "default_sampling_period")]
    pub sampling_period_seconds: u64,

    /// Per-task wall-clock limit in seconds
    #[serde(default = "default_task_timeout")]
    pub task_timeout_seconds: u64,

    /// Period of the completed-job reaper in seconds
    #[serde(default = "default_reaper_period")]
    pub reaper_period_seconds: u64,

    /// Deletion grace period handed to the orchestrator in seconds
    #[serde(default = "default_reaper_grace")]
    pub reaper_grace_seconds: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            status_poll_millis: default_status_poll_millis(),
            sampling_period_seconds: default_sampling_period(),
            task_timeout_seconds: default_task_timeout(),
            reaper_period_seconds: default_reaper_period(),
            reaper_grace_seconds: default_reaper_grace(),
        }
    }
}

impl EngineConfig {
    pub fn status_poll_period(&self) -> Duration {
        Duration::from_millis(self.status_poll_millis.max(1))
    }

    pub fn sampling_period(&self) -> Duration {
        Duration::from_secs(self.sampling_period_seconds.max(1))
    }
}

fn default_status_poll_millis() -> u64 {
    2_000
}

fn default_sampling_period() -> u64 {
    30
}

fn default_task_timeout() -> u64 {
    86_400 // 24 hours
}

fn default_reaper_period() -> u64 {
    30
}

fn default_reaper_grace() -> i64 {
    120
}

/// Run registry storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the per-run layout (`/<userId>/<runId>/...`). In-cluster this
    /// is the mount point the object-store sidecar presents.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let path = std::env::var("SKIFF_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"));
        if let Ok(from_file) = Self::load_from_path(&path) {
            config = from_file;
        }

        config.apply_env_overrides();
        config
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("SKIFF_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(endpoint) = std::env::var("JWKS_ENDPOINT") {
            self.auth.jwks_endpoint = Some(endpoint);
        }
        if let Ok(url) = std::env::var("SKIFF_AUTHZ_URL") {
            self.auth.authz_url = url;
        }
        if let Ok(namespace) = std::env::var("GEN3_NAMESPACE") {
            self.orchestrator.namespace = namespace;
        }
        if let Ok(image) = std::env::var("SKIFF_TASK_IMAGE") {
            self.orchestrator.task_image = image;
        }
        if let Ok(image) = std::env::var("SKIFF_ENGINE_IMAGE") {
            self.orchestrator.engine_image = image;
        }
        if let Ok(dir) = std::env::var("SKIFF_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("skiff")
    }

    /// Resolve the run registry root.
    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("skiff")
        })
    }
}
