//! Embedding providers.
//!
//! [`HashEmbedder`] needs no network and is the default, so a fresh install can
//! ingest and answer offline. The HTTP providers speak the OpenAI `/embeddings`
//! and Ollama `/api/embed` protocols.

use super::http::{build_client, parse_vector, post_json, probe};
use super::{Embedder, Upstream};
use crate::error::{RagError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;

/// Hashed bag-of-words embedder.
///
/// Each distinct lower-cased term is hashed into one of `dimensions` buckets
/// weighted by its frequency, and the vector is L2-normalized. Texts sharing
/// vocabulary therefore score a positive cosine similarity.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Pure embedding function, also used directly by tests and benches.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            *tf.entry(word).or_insert(0) += 1;
        }

        for (term, count) in &tf {
            let idx = djb2(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn djb2(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl Upstream for HashEmbedder {
    fn name(&self) -> &str {
        "hash-embedder"
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Embedder for any OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    pub fn new(base_url: String, model: String, api_key: String, dimensions: usize) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
            dimensions,
        }
    }
}

#[async_trait]
impl Upstream for OpenAiEmbedder {
    fn name(&self) -> &str {
        "openai-embedder"
    }

    async fn health_check(&self) -> bool {
        probe(
            &self.client,
            &format!("{}/models", self.base_url),
            Some(&self.api_key),
        )
        .await
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({ "model": self.model, "input": text });
        let response = post_json(
            &self.client,
            self.name(),
            &format!("{}/embeddings", self.base_url),
            Some(&self.api_key),
            &body,
        )
        .await?;
        let vector = parse_vector(self.name(), &response["data"][0]["embedding"])?;
        check_dimensions(self.name(), self.dimensions, vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Embedder backed by a local Ollama server.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl OllamaEmbedder {
    pub fn new(base_url: String, model: String, dimensions: usize) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimensions,
        }
    }
}

#[async_trait]
impl Upstream for OllamaEmbedder {
    fn name(&self) -> &str {
        "ollama-embedder"
    }

    async fn health_check(&self) -> bool {
        probe(&self.client, &format!("{}/api/tags", self.base_url), None).await
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({ "model": self.model, "input": text });
        let response = post_json(
            &self.client,
            self.name(),
            &format!("{}/api/embed", self.base_url),
            None,
            &body,
        )
        .await?;
        let vector = parse_vector(self.name(), &response["embeddings"][0])?;
        check_dimensions(self.name(), self.dimensions, vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

fn check_dimensions(service: &str, expected: usize, vector: Vec<f32>) -> Result<Vec<f32>> {
    if vector.len() != expected {
        return Err(RagError::invalid_response(
            service,
            format!(
                "Expected {expected}-dimensional embedding, got {}",
                vector.len()
            ),
        ));
    }
    Ok(vector)
}
