//! Deployment configuration
//!
//! One flat struct read once at process start. Component-level tuning
//! (thresholds, budgets, ceilings) lives in the per-component config structs;
//! this covers the things that differ between deployments.

use anyhow::Result;
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the relational SQLite database.
    pub database_path: PathBuf,
    /// Path of the bundled vector index database.
    pub vector_index_path: PathBuf,
    /// Base URL of the OpenAI-compatible model gateway.
    pub gateway_url: String,
    /// Bearer token for the gateway, if it requires one.
    pub gateway_api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    /// Timeout for every provider call, in seconds. Short on purpose: a slow
    /// provider degrades one layer, it must not stall the request.
    pub request_timeout_seconds: u64,
    /// Vector namespace holding per-chunk vectors.
    pub chunk_namespace: String,
    /// Vector namespace holding per-conversation digest vectors.
    pub conversation_namespace: String,
    /// Whether the read path chunks new messages inline.
    pub auto_chunking: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/memory.db"),
            vector_index_path: PathBuf::from("data/vectors.db"),
            gateway_url: "http://127.0.0.1:8081".to_string(),
            gateway_api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimension: 1536,
            request_timeout_seconds: 15,
            chunk_namespace: "chunks".to_string(),
            conversation_namespace: "conversations".to_string(),
            auto_chunking: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();
        let config = Self {
            database_path: env::var("MEMORY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            vector_index_path: env::var("VECTOR_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.vector_index_path),
            gateway_url: env::var("MODEL_GATEWAY_URL").unwrap_or(defaults.gateway_url),
            gateway_api_key: env::var("MODEL_GATEWAY_API_KEY").ok(),
            chat_model: env::var("CHAT_MODEL").unwrap_or(defaults.chat_model),
            embedding_model: env::var("EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            embedding_dimension: env::var("EMBEDDING_DIMENSION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.embedding_dimension),
            request_timeout_seconds: env::var("REQUEST_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.request_timeout_seconds),
            chunk_namespace: env::var("CHUNK_NAMESPACE").unwrap_or(defaults.chunk_namespace),
            conversation_namespace: env::var("CONVERSATION_NAMESPACE")
                .unwrap_or(defaults.conversation_namespace),
            auto_chunking: env::var("AUTO_CHUNKING")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(defaults.auto_chunking),
        };

        config.validate()?;
        info!(
            "Configuration loaded: gateway={}, embedding dim={}, auto chunking={}",
            config.gateway_url, config.embedding_dimension, config.auto_chunking
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway_url.is_empty() {
            return Err(anyhow::anyhow!("MODEL_GATEWAY_URL must not be empty"));
        }
        if !self.gateway_url.starts_with("http://") && !self.gateway_url.starts_with("https://") {
            return Err(anyhow::anyhow!(
                "MODEL_GATEWAY_URL must be an http(s) URL, got: {}",
                self.gateway_url
            ));
        }
        if self.embedding_dimension == 0 {
            return Err(anyhow::anyhow!("EMBEDDING_DIMENSION must be positive"));
        }
        if self.request_timeout_seconds == 0 || self.request_timeout_seconds > 120 {
            return Err(anyhow::anyhow!(
                "REQUEST_TIMEOUT_SECONDS must be between 1 and 120, got {}",
                self.request_timeout_seconds
            ));
        }
        if self.chunk_namespace == self.conversation_namespace {
            return Err(anyhow::anyhow!(
                "Chunk and conversation namespaces must differ (both are {})",
                self.chunk_namespace
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper function to create a test Config with default values
    fn create_test_config() -> Config {
        Config::default()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(create_test_config().validate().is_ok());
    }

    #[test]
    fn test_namespaces_must_differ() {
        let mut config = create_test_config();
        config.conversation_namespace = config.chunk_namespace.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gateway_url_must_be_http() {
        let mut config = create_test_config();
        config.gateway_url = "ftp://somewhere".to_string();
        assert!(config.validate().is_err());

        config.gateway_url = String::new();
        assert!(config.validate().is_err());

        config.gateway_url = "https://gateway.internal:9000".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_bounds() {
        let mut config = create_test_config();
        config.request_timeout_seconds = 0;
        assert!(config.validate().is_err());

        config.request_timeout_seconds = 600;
        assert!(config.validate().is_err());

        config.request_timeout_seconds = 30;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_embedding_dimension_positive() {
        let mut config = create_test_config();
        config.embedding_dimension = 0;
        assert!(config.validate().is_err());
    }
}
