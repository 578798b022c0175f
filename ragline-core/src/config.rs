//! Configuration system for Ragline.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> explicit file -> environment. Configuration is loaded
//! from the user config directory (`ragline/config.toml`) and/or
//! `.ragline/config.toml` in the workspace directory.

use crate::cache::EvictionPolicy;
use crate::error::ConfigError;
use crate::monitor::{AlertLevel, AlertRule, Comparison};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the query-serving pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RaglineConfig {
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
    pub cache: CacheConfig,
    pub pools: PoolsConfig,
    pub retry: RetryConfig,
    pub ingest: IngestConfig,
    pub monitor: MonitorConfig,
    pub embedder: EmbedderConfig,
    pub vector_store: VectorStoreConfig,
    pub llm: LlmConfig,
}

/// How documents are split before embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size_tokens: usize,
    pub chunk_overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size_tokens: 400,
            chunk_overlap_tokens: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Minimum cosine similarity (0.0–1.0) for a chunk to be used.
    pub similarity_threshold: f32,
    /// Token budget shared by retrieval and context assembly.
    pub max_context_tokens: usize,
    /// Pick `max_chunks` from the question shape instead of `default_max_chunks`.
    pub adaptive_max_chunks: bool,
    pub default_max_chunks: usize,
    /// Bullet sentences kept per secondary chunk in the assembled context.
    pub max_salient_sentences: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.3,
            max_context_tokens: 2000,
            adaptive_max_chunks: true,
            default_max_chunks: 3,
            max_salient_sentences: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_tokens: usize,
    pub system_prompt: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 512,
            system_prompt: "You answer questions using only the provided context. \
                Cite sources as [Source N]. If the context does not contain the answer, say so."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Estimated memory ceiling for each cache, in bytes.
    pub memory_ceiling_bytes: usize,
    pub eviction_policy: EvictionPolicy,
    pub answer_ttl_secs: u64,
    pub retrieval_ttl_secs: u64,
    pub embedding_ttl_secs: u64,
    /// Join in-flight computations for the same key.
    pub coalescing: bool,
    pub janitor_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_bytes: 64 * 1024 * 1024,
            eviction_policy: EvictionPolicy::Lru,
            answer_ttl_secs: 300,
            retrieval_ttl_secs: 1800,
            embedding_ttl_secs: 86_400,
            coalescing: true,
            janitor_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn answer_ttl(&self) -> Duration {
        Duration::from_secs(self.answer_ttl_secs)
    }

    pub fn retrieval_ttl(&self) -> Duration {
        Duration::from_secs(self.retrieval_ttl_secs)
    }

    pub fn embedding_ttl(&self) -> Duration {
        Duration::from_secs(self.embedding_ttl_secs)
    }
}

/// Per-upstream connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub acquire_timeout_ms: u64,
    /// Consecutive operation failures before a connection is marked unhealthy.
    pub failure_threshold: u32,
    /// Failed probes before an unhealthy connection is replaced.
    pub max_failed_probes: u32,
    /// Consecutive failed probes before the pool's circuit opens.
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_secs: u64,
    pub breaker_max_recovery_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 4,
            idle_timeout_secs: 300,
            health_check_interval_secs: 30,
            acquire_timeout_ms: 5_000,
            failure_threshold: 3,
            max_failed_probes: 3,
            breaker_failure_threshold: 5,
            breaker_recovery_secs: 30,
            breaker_max_recovery_secs: 600,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self, name: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_connections == 0 {
            errors.push(format!("pools.{name}.max_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            errors.push(format!(
                "pools.{name}.min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            ));
        }
        if self.health_check_interval_secs == 0 {
            errors.push(format!(
                "pools.{name}.health_check_interval_secs must be non-zero"
            ));
        }
        if self.acquire_timeout_ms == 0 {
            errors.push(format!("pools.{name}.acquire_timeout_ms must be non-zero"));
        }
        if self.failure_threshold == 0 || self.breaker_failure_threshold == 0 {
            errors.push(format!("pools.{name} failure thresholds must be non-zero"));
        }
        if self.breaker_max_recovery_secs < self.breaker_recovery_secs {
            errors.push(format!(
                "pools.{name}.breaker_max_recovery_secs is below breaker_recovery_secs"
            ));
        }
        errors
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub embedder: PoolConfig,
    pub vector_store: PoolConfig,
    pub llm: PoolConfig,
}

/// Retry behaviour for transient upstream failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Documents ingested concurrently.
    pub max_concurrency: usize,
    /// Documents per batch group.
    pub group_size: usize,
    /// File extensions picked up when ingesting a directory.
    pub extensions: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            group_size: 10,
            extensions: vec!["md".into(), "txt".into(), "rst".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub retention_secs: u64,
    pub max_samples: usize,
    pub evaluation_interval_secs: u64,
    pub alert_history_limit: usize,
    pub alerts: Vec<AlertRuleConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            max_samples: 10_000,
            evaluation_interval_secs: 15,
            alert_history_limit: 500,
            alerts: default_alert_rules(),
        }
    }
}

/// Declarative form of an [`AlertRule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    pub name: String,
    pub metric: String,
    pub threshold: f64,
    #[serde(default)]
    pub comparison: Comparison,
    #[serde(default)]
    pub level: AlertLevel,
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_cooldown_secs() -> u64 {
    300
}

impl AlertRuleConfig {
    pub fn to_rule(&self) -> AlertRule {
        AlertRule::new(&self.name, &self.metric, self.threshold)
            .with_comparison(self.comparison)
            .with_level(self.level)
            .with_duration(Duration::from_secs(self.duration_secs))
            .with_cooldown(Duration::from_secs(self.cooldown_secs))
    }
}

fn default_alert_rules() -> Vec<AlertRuleConfig> {
    let mut rules = vec![AlertRuleConfig {
        name: "answer_latency_p95".into(),
        metric: "answer.latency_ms".into(),
        threshold: 5_000.0,
        comparison: Comparison::Above,
        level: AlertLevel::Warning,
        duration_secs: 60,
        cooldown_secs: 300,
    }];
    for service in ["embedder", "vector_store", "llm"] {
        rules.push(AlertRuleConfig {
            name: format!("{service}_circuit_open"),
            metric: format!("pool.{service}.circuit_open"),
            threshold: 0.5,
            comparison: Comparison::Above,
            level: AlertLevel::Critical,
            duration_secs: 0,
            cooldown_secs: 300,
        });
        rules.push(AlertRuleConfig {
            name: format!("{service}_unhealthy_connections"),
            metric: format!("pool.{service}.unhealthy"),
            threshold: 0.5,
            comparison: Comparison::Above,
            level: AlertLevel::Warning,
            duration_secs: 120,
            cooldown_secs: 600,
        });
    }
    rules
}

/// Embedding provider, chosen once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum EmbedderConfig {
    /// Offline hashed bag-of-words embeddings.
    Hash {
        #[serde(default = "default_hash_dimensions")]
        dimensions: usize,
    },
    /// Any OpenAI-compatible `/embeddings` endpoint.
    #[serde(rename = "openai")]
    OpenAi {
        base_url: String,
        model: String,
        api_key_env: String,
        dimensions: usize,
    },
    Ollama {
        base_url: String,
        model: String,
        dimensions: usize,
    },
}

fn default_hash_dimensions() -> usize {
    256
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self::Hash {
            dimensions: default_hash_dimensions(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum VectorStoreConfig {
    Memory,
    Sqlite { path: PathBuf },
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from(".ragline").join("vectors.db"),
        }
    }
}

/// Language model provider, chosen once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum LlmConfig {
    #[serde(rename = "openai")]
    OpenAi {
        base_url: String,
        model: String,
        api_key_env: String,
    },
    Ollama { base_url: String, model: String },
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self::Ollama {
            base_url: "http://localhost:11434".into(),
            model: "llama3.2".into(),
        }
    }
}

impl RaglineConfig {
    /// Validate the configuration and return a list of problems.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.chunking.chunk_size_tokens == 0 {
            errors.push("chunking.chunk_size_tokens must be non-zero".to_string());
        }
        if self.chunking.chunk_overlap_tokens >= self.chunking.chunk_size_tokens {
            errors.push(format!(
                "chunking.chunk_overlap_tokens ({}) must be smaller than chunk_size_tokens ({})",
                self.chunking.chunk_overlap_tokens, self.chunking.chunk_size_tokens
            ));
        }

        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            errors.push(format!(
                "retrieval.similarity_threshold ({}) must be within 0.0-1.0",
                self.retrieval.similarity_threshold
            ));
        }
        if self.retrieval.max_context_tokens == 0 {
            errors.push("retrieval.max_context_tokens must be non-zero".to_string());
        }
        if self.retrieval.default_max_chunks == 0 {
            errors.push("retrieval.default_max_chunks must be non-zero".to_string());
        }

        if self.cache.memory_ceiling_bytes == 0 {
            errors.push("cache.memory_ceiling_bytes must be non-zero".to_string());
        }
        if self.cache.answer_ttl_secs == 0
            || self.cache.retrieval_ttl_secs == 0
            || self.cache.embedding_ttl_secs == 0
        {
            errors.push("cache TTLs must be non-zero".to_string());
        }

        errors.extend(self.pools.embedder.validate("embedder"));
        errors.extend(self.pools.vector_store.validate("vector_store"));
        errors.extend(self.pools.llm.validate("llm"));

        if self.retry.backoff_multiplier < 1.0 {
            errors.push("retry.backoff_multiplier must be at least 1.0".to_string());
        }
        if self.ingest.max_concurrency == 0 || self.ingest.group_size == 0 {
            errors.push("ingest.max_concurrency and ingest.group_size must be non-zero".into());
        }
        if self.monitor.max_samples == 0 {
            errors.push("monitor.max_samples must be non-zero".to_string());
        }

        errors
    }
}

/// Path of the user-level config file, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "ragline", "ragline")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`RAGLINE_CACHE__ANSWER_TTL_SECS`, ...)
/// 2. Explicit config file
/// 3. Workspace-local config (`.ragline/config.toml`)
/// 4. User config
/// 5. Built-in defaults
///
/// The merged result is validated before it is returned.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<RaglineConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(RaglineConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".ragline").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("RAGLINE_").split("__"));

    let config: RaglineConfig = figment.extract().map_err(Box::new)?;
    let problems = config.validate();
    if !problems.is_empty() {
        return Err(ConfigError::invalid(problems.join("; ")));
    }
    Ok(config)
}
