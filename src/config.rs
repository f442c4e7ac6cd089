use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TetherError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: "stub-model".into(),
            api_key: None,
            base_url: None,
            temperature: None,
            stream: false,
        }
    }
}

fn default_provider() -> String {
    "stub".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            system_prompt: None,
            working_directory: None,
            command_timeout_secs: default_command_timeout(),
        }
    }
}

fn default_max_iterations() -> usize {
    30
}

fn default_command_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_path")]
    pub file_path: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            file_path: default_storage_path(),
            database_url: None,
        }
    }
}

fn default_storage_path() -> String {
    "conversation.jsonl".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|err| TetherError::Config(format!("failed to parse configuration: {err}")))
    }

    /// Loads `path` when it exists (defaults otherwise) and applies `TETHER_*` overrides.
    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = if path.as_ref().exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(provider) = env::var("TETHER_PROVIDER") {
            self.model.provider = provider;
        }
        if let Ok(model) = env::var("TETHER_MODEL") {
            self.model.model = model;
        }
        if let Ok(key) = env::var("TETHER_API_KEY").or_else(|_| env::var("OPENAI_API_KEY")) {
            self.model.api_key = Some(key);
        }
        if let Ok(url) = env::var("TETHER_BASE_URL").or_else(|_| env::var("OPENAI_BASE_URL")) {
            self.model.base_url = Some(url);
        }
        if let Ok(stream) = env::var("TETHER_STREAMING") {
            self.model.stream = parse_env("TETHER_STREAMING", &stream)?;
        }
        if let Ok(max) = env::var("TETHER_MAX_ITERATIONS") {
            let parsed: usize = parse_env("TETHER_MAX_ITERATIONS", &max)?;
            self.agent.max_iterations = parsed.max(1);
        }
        if let Ok(filter) = env::var("TETHER_LOG") {
            self.logging.filter = filter;
        }
        if let Ok(backend) = env::var("TETHER_STORAGE_BACKEND") {
            self.storage.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "file" => StorageBackend::File,
                "sqlite" => StorageBackend::Sqlite,
                other => {
                    return Err(TetherError::Config(format!(
                        "unknown storage backend `{other}`"
                    )))
                }
            };
        }
        if let Ok(path) = env::var("TETHER_STORAGE_PATH") {
            self.storage.file_path = path;
        }
        if let Ok(url) = env::var("TETHER_DATABASE_URL") {
            self.storage.database_url = Some(url);
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| TetherError::Config(format!("invalid value `{raw}` for {name}")))
}
