use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant skilled at using tools to gather and explain information.";

const DEFAULT_MODELS: &[&str] = &[
    "meta-llama-3.1-8b-instruct-abliterated",
    "starling-lm-7b-beta",
    "nexusraven-v2-13b",
];

const DEFAULT_QUERIES: &[&str] = &[
    "What are the main principles of quantum computing?",
    "Explain the concept of neural networks in AI.",
    "What is the relationship between entropy and information theory?",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// System prompt opening every conversation
    pub system_prompt: String,

    /// Models to fan out across
    pub models: Vec<String>,

    /// Queries sent to every model
    pub queries: Vec<String>,

    #[serde(default)]
    pub completion: CompletionConfig,

    #[serde(default)]
    pub lookup: LookupConfig,
}

/// Connection settings for the OpenAI-compatible completion service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    pub base_url: String,

    pub api_key: String,

    /// Sampling temperature for the first (tool-offering) phase
    pub temperature: Option<f32>,

    /// Per-request timeout; unset means wait indefinitely
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    pub endpoint: String,

    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            models: DEFAULT_MODELS.iter().map(|s| s.to_string()).collect(),
            queries: DEFAULT_QUERIES.iter().map(|s| s.to_string()).collect(),
            completion: CompletionConfig::default(),
            lookup: LookupConfig::default(),
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: fq_providers::DEFAULT_BASE_URL.to_string(),
            api_key: "not-needed".to_string(),
            temperature: Some(0.7),
            request_timeout_secs: None,
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            endpoint: fq_tools::DEFAULT_ENDPOINT.to_string(),
            user_agent: fq_tools::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl CompletionConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

/// Command-line values that take precedence over every config layer
#[derive(Debug, Default)]
pub struct Overrides {
    pub models: Vec<String>,
    pub queries: Vec<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Config {
    /// Load defaults, then the TOML file, then `FQ_` environment variables.
    ///
    /// An explicit `path` must exist; the default location is skipped when absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                Some(p.to_path_buf())
            }
            None => Self::config_path().ok().filter(|p| p.exists()),
        };

        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = &file {
            figment = figment.merge(Toml::file(file));
        }
        figment = figment.merge(Env::prefixed("FQ_").split("__"));

        let config: Config = figment
            .extract()
            .context("Failed to load configuration")?;
        tracing::debug!(file = ?file, models = config.models.len(), queries = config.queries.len(), "Loaded config");
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("fq").join("config.toml"))
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if !overrides.models.is_empty() {
            self.models = overrides.models;
        }
        if !overrides.queries.is_empty() {
            self.queries = overrides.queries;
        }
        if let Some(base_url) = overrides.base_url {
            self.completion.base_url = base_url;
        }
        if let Some(api_key) = overrides.api_key {
            self.completion.api_key = api_key;
        }
        self
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
