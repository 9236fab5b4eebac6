//! Runtime configuration: model nicknames, bus defaults, agent directory
//!
//! Configuration is stored in `~/.config/niffler/config.toml` (or the path in
//! `NIFFLER_CONFIG`). A missing file falls back to built-in defaults; a
//! malformed file is a startup error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NifflerError, Result};

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default model, bus URL, and timing knobs
    pub defaults: Defaults,
    /// Model nickname -> endpoint configuration
    pub models: HashMap<String, ModelConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let mut models = HashMap::new();
        models.insert(
            "gpt4o".to_string(),
            ModelConfig {
                model: "gpt-4o".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
                max_tokens: 8192,
                temperature: 0.7,
                input_cost_per_mtok: Some(2.5),
                output_cost_per_mtok: Some(10.0),
                reasoning_cost_per_mtok: None,
            },
        );
        models.insert(
            "gpt4o-mini".to_string(),
            ModelConfig {
                model: "gpt-4o-mini".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
                max_tokens: 8192,
                temperature: 0.7,
                input_cost_per_mtok: Some(0.15),
                output_cost_per_mtok: Some(0.6),
                reasoning_cost_per_mtok: None,
            },
        );

        Self {
            defaults: Defaults::default(),
            models,
        }
    }
}

/// Default selections and timing knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Default model nickname
    pub model: String,
    /// NATS server URL
    pub nats_url: String,
    /// Presence TTL in seconds (heartbeat cadence is TTL/3)
    pub presence_ttl_secs: u64,
    /// Directory holding agent definition markdown files
    pub agent_dir: Option<PathBuf>,
    /// Default agent the master routes bare input to
    pub default_agent: Option<String>,
    /// Per-tool-call timeout for agentic turns, in seconds
    pub tool_timeout_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            model: "gpt4o".to_string(),
            nats_url: "nats://127.0.0.1:4222".to_string(),
            presence_ttl_secs: 30,
            agent_dir: None,
            default_agent: None,
            tool_timeout_secs: 300,
        }
    }
}

/// One model endpoint, addressed by nickname
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Wire-level model identifier sent to the provider
    pub model: String,
    /// Chat-completions base URL (without the /chat/completions suffix)
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// USD per million input tokens
    pub input_cost_per_mtok: Option<f64>,
    /// USD per million output tokens
    pub output_cost_per_mtok: Option<f64>,
    /// USD per million reasoning tokens
    pub reasoning_cost_per_mtok: Option<f64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_tokens: 8192,
            temperature: 0.7,
            input_cost_per_mtok: None,
            output_cost_per_mtok: None,
            reasoning_cost_per_mtok: None,
        }
    }
}

impl ModelConfig {
    /// Resolve the API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

impl Config {
    /// Load config from a file path, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| NifflerError::Config(format!("Failed to read config.toml: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| NifflerError::Config(format!("Failed to parse config.toml: {}", e)))?;

        if config.models.is_empty() {
            return Err(NifflerError::Config(
                "No models configured - add at least one [models.<nickname>] table".to_string(),
            ));
        }

        Ok(config)
    }

    /// Load from `NIFFLER_CONFIG` or the platform config dir
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_path())
    }

    /// Resolve the config file path
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("NIFFLER_CONFIG") {
            return PathBuf::from(path);
        }
        directories::ProjectDirs::from("ai", "niffler", "niffler")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("niffler.toml"))
    }

    /// Platform data dir (database, history, logs)
    pub fn data_dir() -> PathBuf {
        directories::ProjectDirs::from("ai", "niffler", "niffler")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".niffler"))
    }

    /// Look up a model by nickname
    pub fn model(&self, nickname: &str) -> Result<&ModelConfig> {
        self.models
            .get(nickname)
            .ok_or_else(|| NifflerError::UnknownModel(nickname.to_string()))
    }

    /// Nickname of the default model
    pub fn default_model(&self) -> &str {
        &self.defaults.model
    }

    /// Write a starter config for `niffler init`
    pub fn write_starter(path: &Path) -> Result<()> {
        if path.exists() {
            return Err(NifflerError::Config(format!(
                "Refusing to overwrite existing config at {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let starter = toml::to_string_pretty(&Config::default())
            .map_err(|e| NifflerError::Config(e.to_string()))?;
        std::fs::write(path, starter)?;
        Ok(())
    }
}
