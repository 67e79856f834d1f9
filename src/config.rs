//! Command-line and environment configuration.

use crate::chat::ChatSettings;
use crate::llm::Provider;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    Openai,
    Ollama,
}

/// Roomy - guidebook backend with an AI concierge
#[derive(Parser, Debug, Clone)]
#[command(name = "roomy")]
#[command(about = "Lodging guidebook backend with an AI concierge")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "ROOMY_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Directory holding roomy.db
    #[arg(long, env = "ROOMY_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "ROOMY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Chat completion backend
    #[arg(long, env = "ROOMY_PROVIDER", value_enum, default_value_t = ProviderKind::Openai)]
    pub provider: ProviderKind,

    /// API key for the OpenAI-compatible endpoints
    #[arg(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    pub openai_api_key: String,

    /// Base URL for OpenAI-compatible endpoints
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Ollama host, used when the provider is ollama
    #[arg(long, env = "OLLAMA_HOST", default_value = "http://localhost:11434")]
    pub ollama_host: String,

    /// Chat completion model
    #[arg(long, env = "ROOMY_CHAT_MODEL", default_value = "gpt-4o-mini")]
    pub chat_model: String,

    /// Embedding model
    #[arg(long, env = "ROOMY_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    pub embedding_model: String,

    /// Embedding vector size; must match what the model returns
    #[arg(long, env = "ROOMY_EMBEDDING_DIMENSIONS", default_value_t = 1536)]
    pub embedding_dimensions: usize,

    /// Seconds before a provider request times out
    #[arg(long, env = "ROOMY_PROVIDER_TIMEOUT_SECS", default_value_t = 60)]
    pub provider_timeout_secs: u64,

    /// Context chunks passed to the model
    #[arg(long, env = "ROOMY_TOP_K", default_value_t = 5)]
    pub top_k: usize,

    /// Nearest neighbours fetched before hybrid ranking
    #[arg(long, env = "ROOMY_CANDIDATE_POOL", default_value_t = 20)]
    pub candidate_pool: usize,

    /// Minimum vector similarity for a chunk to be used
    #[arg(long, env = "ROOMY_MIN_SIMILARITY", default_value_t = 0.3)]
    pub min_similarity: f32,

    /// Earlier turns replayed into each prompt
    #[arg(long, env = "ROOMY_HISTORY_TURNS", default_value_t = 10)]
    pub history_turns: usize,

    /// JSON file of `{"term": ["synonym", ...]}` replacing the built-in dictionary
    #[arg(long, env = "ROOMY_SYNONYMS")]
    pub synonyms: Option<PathBuf>,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.top_k == 0 {
            return Err("ROOMY_TOP_K must be at least 1".to_string());
        }
        if self.candidate_pool < self.top_k {
            return Err("ROOMY_CANDIDATE_POOL must be at least ROOMY_TOP_K".to_string());
        }
        if !(-1.0..=1.0).contains(&self.min_similarity) {
            return Err("ROOMY_MIN_SIMILARITY must be within [-1, 1]".to_string());
        }
        if self.embedding_dimensions == 0 {
            return Err("ROOMY_EMBEDDING_DIMENSIONS must be positive".to_string());
        }
        if self.provider == ProviderKind::Openai && self.openai_api_key.is_empty() {
            return Err("OPENAI_API_KEY is required for the openai provider".to_string());
        }
        Ok(())
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn completion_provider(&self) -> Provider {
        match self.provider {
            ProviderKind::Openai => {
                Provider::openai(self.openai_api_key.clone(), self.openai_base_url.clone())
            }
            ProviderKind::Ollama => Provider::ollama(self.ollama_host.clone()),
        }
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            top_k: self.top_k,
            candidate_pool: self.candidate_pool,
            min_similarity: self.min_similarity,
            history_turns: self.history_turns,
            model: self.chat_model.clone(),
        }
    }
}
