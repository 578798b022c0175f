//! Upstream service interfaces and their implementations.
//!
//! The embedder, vector store and language model are opaque collaborators.
//! Each is modelled as a trait sharing the [`Upstream`] supertrait so the
//! [`ConnectionPool`](crate::pool::ConnectionPool) can probe any of them.
//! Concrete providers are selected once at startup from the closed provider
//! enums in [`config`](crate::config) via the `*_factory` functions below.

pub mod embedder;
pub mod http;
pub mod llm;
pub mod mock;
pub mod vector_store;

use crate::config::{EmbedderConfig, LlmConfig, VectorStoreConfig};
use crate::error::{ConfigError, Result};
use crate::pool::ConnectionFactory;
use crate::types::{ChatMessage, ChunkMetadata};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use embedder::{HashEmbedder, OllamaEmbedder, OpenAiEmbedder};
pub use llm::{OllamaChat, OpenAiChat};
pub use vector_store::{InMemoryVectorStore, SqliteVectorStore};

/// Common surface of every upstream service.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Short service name used in logs and metric names.
    fn name(&self) -> &str;

    /// Cheap liveness probe used by the pool's health checker.
    async fn health_check(&self) -> bool;
}

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Upstream {
    async fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Dimensionality of produced vectors.
    fn dimensions(&self) -> usize;
}

/// A vector plus the chunk it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
    pub text: String,
}

/// One nearest-neighbour hit. `distance` is cosine distance (`1 − cosine`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub distance: f32,
    pub metadata: ChunkMetadata,
    pub text: String,
}

/// Nearest-neighbour index over chunk embeddings.
#[async_trait]
pub trait VectorStore: Upstream {
    /// Insert or replace records by id.
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;

    /// The `top_k` closest records, nearest first.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>>;

    /// Number of stored records.
    async fn count(&self) -> Result<usize>;

    /// Remove every record belonging to `doc_id`; returns how many were removed.
    async fn delete_document(&self, doc_id: &str) -> Result<usize>;
}

/// A chat-completion language model.
#[async_trait]
pub trait ChatModel: Upstream {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: usize,
    ) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Build the connection factory for the configured embedder.
pub fn embedder_factory(
    config: &EmbedderConfig,
) -> std::result::Result<ConnectionFactory<dyn Embedder>, ConfigError> {
    match config {
        EmbedderConfig::Hash { dimensions } => {
            let dimensions = *dimensions;
            Ok(Arc::new(move || {
                Ok(Arc::new(HashEmbedder::new(dimensions)) as Arc<dyn Embedder>)
            }))
        }
        EmbedderConfig::OpenAi {
            base_url,
            model,
            api_key_env,
            dimensions,
        } => {
            let api_key = resolve_api_key(api_key_env)?;
            let (base_url, model, dimensions) = (base_url.clone(), model.clone(), *dimensions);
            Ok(Arc::new(move || {
                Ok(Arc::new(OpenAiEmbedder::new(
                    base_url.clone(),
                    model.clone(),
                    api_key.clone(),
                    dimensions,
                )) as Arc<dyn Embedder>)
            }))
        }
        EmbedderConfig::Ollama {
            base_url,
            model,
            dimensions,
        } => {
            let (base_url, model, dimensions) = (base_url.clone(), model.clone(), *dimensions);
            Ok(Arc::new(move || {
                Ok(
                    Arc::new(OllamaEmbedder::new(base_url.clone(), model.clone(), dimensions))
                        as Arc<dyn Embedder>,
                )
            }))
        }
    }
}

/// Build the connection factory for the configured vector store.
///
/// The in-memory store is shared by every pooled connection; the SQLite store
/// opens one database connection per pooled connection.
pub fn vector_store_factory(
    config: &VectorStoreConfig,
) -> std::result::Result<ConnectionFactory<dyn VectorStore>, ConfigError> {
    match config {
        VectorStoreConfig::Memory => {
            let shared: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
            Ok(Arc::new(move || Ok(shared.clone())))
        }
        VectorStoreConfig::Sqlite { path } => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ConfigError::invalid(format!(
                        "cannot create vector store directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
            let path = path.clone();
            Ok(Arc::new(move || {
                Ok(Arc::new(SqliteVectorStore::open(&path)?) as Arc<dyn VectorStore>)
            }))
        }
    }
}

/// Build the connection factory for the configured language model.
pub fn llm_factory(
    config: &LlmConfig,
) -> std::result::Result<ConnectionFactory<dyn ChatModel>, ConfigError> {
    match config {
        LlmConfig::OpenAi {
            base_url,
            model,
            api_key_env,
        } => {
            let api_key = resolve_api_key(api_key_env)?;
            let (base_url, model) = (base_url.clone(), model.clone());
            Ok(Arc::new(move || {
                Ok(
                    Arc::new(OpenAiChat::new(base_url.clone(), model.clone(), api_key.clone()))
                        as Arc<dyn ChatModel>,
                )
            }))
        }
        LlmConfig::Ollama { base_url, model } => {
            let (base_url, model) = (base_url.clone(), model.clone());
            Ok(Arc::new(move || {
                Ok(Arc::new(OllamaChat::new(base_url.clone(), model.clone())) as Arc<dyn ChatModel>)
            }))
        }
    }
}

fn resolve_api_key(var: &str) -> std::result::Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::EnvVarMissing {
        var: var.to_string(),
    })
}
