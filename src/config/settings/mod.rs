#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::embeddings::EncoderSettings;
use crate::index::Metric;

pub const CONFIG_FILE_NAME: &str = "config.toml";
const APP_DIR_NAME: &str = "kb-rag";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub knowledge_base: KnowledgeBaseConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KnowledgeBaseConfig {
    pub path: PathBuf,
    pub index_path: PathBuf,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/knowledge_base.txt"),
            index_path: PathBuf::from("vector_store/kb.index"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub batch_size: u32,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            batch_size: 16,
            timeout_seconds: 120,
            retry_attempts: 3,
        }
    }
}

/// Model identifiers as known to the Ollama server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelsConfig {
    pub context_encoder: String,
    pub question_encoder: String,
    pub causal: String,
    pub seq2seq: String,
    /// Prepended to every paragraph before encoding
    pub context_prefix: String,
    /// Prepended to every question before encoding
    pub question_prefix: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            context_encoder: "nomic-embed-text:latest".to_string(),
            question_encoder: "nomic-embed-text:latest".to_string(),
            causal: "llama3.2:1b".to_string(),
            seq2seq: "phi3:mini".to_string(),
            context_prefix: "search_document: ".to_string(),
            question_prefix: "search_query: ".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub metric: Metric,
    pub top_k: usize,
    pub max_context_tokens: usize,
    pub max_question_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            metric: Metric::InnerProduct,
            top_k: 3,
            max_context_tokens: 256,
            max_question_tokens: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_input_tokens: usize,
    pub max_new_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_input_tokens: 512,
            max_new_tokens: 50,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid {0} model name: {1} (cannot be empty)")]
    InvalidModel(&'static str, String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid timeout: {0} (must be between 1 and 3600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid retry attempts: {0} (must be between 1 and 10)")]
    InvalidRetryAttempts(u32),
    #[error("Invalid top_k: {0} (must be between 1 and 50)")]
    InvalidTopK(usize),
    #[error("Invalid {0}: {1} (must be between {2} and {3})")]
    InvalidTokenLimit(&'static str, usize, usize, usize),
    #[error("Invalid {0}: path cannot be empty")]
    EmptyPath(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Platform config directory for the application, e.g. `~/.config/kb-rag`
    #[inline]
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR_NAME))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Get the base directory for the application
    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.knowledge_base.validate()?;
        self.ollama.validate()?;
        self.models.validate()?;
        self.retrieval.validate()?;
        self.generation.validate()?;
        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join(CONFIG_FILE_NAME)
    }

    /// Knowledge base file; relative paths resolve against the config directory
    #[inline]
    pub fn knowledge_base_path(&self) -> PathBuf {
        self.resolve(&self.knowledge_base.path)
    }

    /// Persisted index file; relative paths resolve against the config directory
    #[inline]
    pub fn index_path(&self) -> PathBuf {
        self.resolve(&self.knowledge_base.index_path)
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.ollama.ollama_url()
    }

    /// How the configured context encoder shapes paragraphs before embedding
    #[inline]
    pub fn context_encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            model: self.models.context_encoder.clone(),
            prefix: self.models.context_prefix.clone(),
            max_tokens: self.retrieval.max_context_tokens,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.get_base_dir().join(path)
        }
    }
}

impl KnowledgeBaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath("knowledge base path"));
        }
        if self.index_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath("index path"));
        }
        Ok(())
    }
}

impl OllamaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        self.ollama_url()?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(1..=3600).contains(&self.timeout_seconds) {
            return Err(ConfigError::InvalidTimeout(self.timeout_seconds));
        }

        if !(1..=10).contains(&self.retry_attempts) {
            return Err(ConfigError::InvalidRetryAttempts(self.retry_attempts));
        }

        Ok(())
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    pub fn set_protocol(&mut self, protocol: String) -> Result<(), ConfigError> {
        if protocol != "http" && protocol != "https" {
            return Err(ConfigError::InvalidProtocol(protocol));
        }
        self.protocol = protocol;
        Ok(())
    }

    pub fn set_host(&mut self, host: String) -> Result<(), ConfigError> {
        let temp_config = OllamaConfig {
            host: host.clone(),
            ..self.clone()
        };
        temp_config.validate()?;
        self.host = host;
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        self.port = port;
        Ok(())
    }

    pub fn set_batch_size(&mut self, batch_size: u32) -> Result<(), ConfigError> {
        if batch_size == 0 || batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(batch_size));
        }
        self.batch_size = batch_size;
        Ok(())
    }
}

impl ModelsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let roles = [
            ("context encoder", &self.context_encoder),
            ("question encoder", &self.question_encoder),
            ("causal", &self.causal),
            ("seq2seq", &self.seq2seq),
        ];

        for (role, model) in roles {
            if model.trim().is_empty() {
                return Err(ConfigError::InvalidModel(role, model.clone()));
            }
        }

        Ok(())
    }

    pub fn set_model(&mut self, role: ModelRole, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(role.label(), model));
        }
        match role {
            ModelRole::ContextEncoder => self.context_encoder = model,
            ModelRole::QuestionEncoder => self.question_encoder = model,
            ModelRole::Causal => self.causal = model,
            ModelRole::Seq2Seq => self.seq2seq = model,
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    ContextEncoder,
    QuestionEncoder,
    Causal,
    Seq2Seq,
}

impl ModelRole {
    pub const ALL: [ModelRole; 4] = [
        Self::ContextEncoder,
        Self::QuestionEncoder,
        Self::Causal,
        Self::Seq2Seq,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::ContextEncoder => "context encoder",
            Self::QuestionEncoder => "question encoder",
            Self::Causal => "causal",
            Self::Seq2Seq => "seq2seq",
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=50).contains(&self.top_k) {
            return Err(ConfigError::InvalidTopK(self.top_k));
        }
        check_token_limit("max_context_tokens", self.max_context_tokens, 8, 8192)?;
        check_token_limit("max_question_tokens", self.max_question_tokens, 8, 8192)?;
        Ok(())
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_token_limit("max_input_tokens", self.max_input_tokens, 16, 32768)?;
        check_token_limit("max_new_tokens", self.max_new_tokens as usize, 1, 4096)?;
        Ok(())
    }
}

fn check_token_limit(
    name: &'static str,
    value: usize,
    min: usize,
    max: usize,
) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidTokenLimit(name, value, min, max))
    }
}
