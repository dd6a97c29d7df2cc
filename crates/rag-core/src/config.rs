use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

fn bool_true() -> bool {
    true
}

/// Top-level config (ragforge.toml + env var overrides). Mirrors the
/// environment variables in `[EXTERNAL INTERFACES / Configuration]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rag: RagDefaults,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub stores: StoresConfig,
    pub completion: CompletionConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            cache: CacheConfig::default(),
            rag: RagDefaults::default(),
            retrieval: RetrievalConfig::default(),
            stores: StoresConfig::default(),
            completion: CompletionConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    #[serde(default)]
    pub use_gpu: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: default_embedding_dimension(),
            use_gpu: "auto".to_string(),
            batch_size: default_batch_size(),
            base_url: default_embedding_base_url(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: default_cache_max_size(),
            ttl_seconds: default_cache_ttl(),
        }
    }
}

/// Per-request defaults, overridable via wire-protocol `query` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagDefaults {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,
}

impl Default for RagDefaults {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,
    #[serde(default = "bool_true")]
    pub query_expansion_enabled: bool,
    #[serde(default = "bool_true")]
    pub temporal_weighting_enabled: bool,
    #[serde(default = "bool_true")]
    pub mmr_enabled: bool,
    #[serde(default = "default_decay_days")]
    pub decay_days: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mmr_lambda: default_mmr_lambda(),
            query_expansion_enabled: true,
            temporal_weighting_enabled: true,
            mmr_enabled: true,
            decay_days: default_decay_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresConfig {
    /// Base URL of the vector+full-text index (preferred backend).
    pub vector_base_url: String,
    pub vector_api_key: Option<String>,
    /// Base URL of the graph index (fallback, and authority for relations).
    pub graph_base_url: String,
    pub graph_api_key: Option<String>,
    /// Local state shared by no external store: ledger, memories,
    /// conversations, tool definitions.
    #[serde(default = "default_db_path")]
    pub local_db_path: String,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            vector_base_url: "http://localhost:9200".to_string(),
            vector_api_key: None,
            graph_base_url: "http://localhost:8529".to_string(),
            graph_api_key: None,
            local_db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    pub api_key: String,
    #[serde(default = "default_completion_base_url")]
    pub base_url: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default = "default_rerank_base_url")]
    pub rerank_base_url: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_completion_base_url(),
            model: default_completion_model(),
            rerank_base_url: default_rerank_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

fn default_embedding_dimension() -> usize {
    1536
}
fn default_batch_size() -> usize {
    32
}
fn default_embedding_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_cache_max_size() -> usize {
    1000
}
fn default_cache_ttl() -> u64 {
    1800
}
fn default_top_k() -> usize {
    10
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    600
}
fn default_max_context_tokens() -> u32 {
    1500
}
fn default_mmr_lambda() -> f32 {
    0.5
}
fn default_decay_days() -> i64 {
    30
}
fn default_completion_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_completion_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_rerank_base_url() -> String {
    "http://localhost:8081".to_string()
}
fn default_port() -> u16 {
    7820
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.ragforge/ragforge.db")
}

impl RagConfig {
    /// Load config from a TOML file, then apply the flat environment
    /// variables from `[EXTERNAL INTERFACES / Configuration]` on top.
    ///
    /// The env vars don't share a common nesting prefix (`RAG_TOP_K` vs.
    /// `MMR_LAMBDA` vs. `EMBEDDING_DIMENSION`), so rather than fight
    /// Figment's prefix-splitting into matching this irregular shape, we
    /// extract the file first and overlay named env vars explicitly —
    /// the override set is small and fixed.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let mut config: RagConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RAGFORGE_").split("_"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_usize("EMBEDDING_DIMENSION") {
            self.embedding.dimension = v;
        }
        if let Ok(v) = std::env::var("USE_GPU") {
            self.embedding.use_gpu = v;
        }
        if let Some(v) = env_usize("EMBEDDING_BATCH_SIZE") {
            self.embedding.batch_size = v;
        }
        if let Some(v) = env_bool("CACHE_ENABLED") {
            self.cache.enabled = v;
        }
        if let Some(v) = env_usize("CACHE_MAX_SIZE") {
            self.cache.max_size = v;
        }
        if let Some(v) = env_u64("CACHE_TTL_SECONDS") {
            self.cache.ttl_seconds = v;
        }
        if let Some(v) = env_usize("RAG_TOP_K") {
            self.rag.top_k = v;
        }
        if let Some(v) = env_f32("RAG_TEMPERATURE") {
            self.rag.temperature = v;
        }
        if let Some(v) = env_u32("RAG_MAX_TOKENS") {
            self.rag.max_tokens = v;
        }
        if let Some(v) = env_u32("RAG_MAX_CONTEXT_TOKENS") {
            self.rag.max_context_tokens = v;
        }
        if let Some(v) = env_f32("MMR_LAMBDA") {
            self.retrieval.mmr_lambda = v;
        }
        if let Some(v) = env_bool("QUERY_EXPANSION_ENABLED") {
            self.retrieval.query_expansion_enabled = v;
        }
        if let Some(v) = env_bool("TEMPORAL_WEIGHTING_ENABLED") {
            self.retrieval.temporal_weighting_enabled = v;
        }
        if let Some(v) = env_bool("MMR_ENABLED") {
            self.retrieval.mmr_enabled = v;
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|v| match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    })
}

fn default_config_path() -> String {
    std::env::var("RAGFORGE_CONFIG").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.ragforge/ragforge.toml")
    })
}
