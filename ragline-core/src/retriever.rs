//! Semantic retrieval of chunks for a query.
//!
//! The query is embedded through the embedder pool (memoized in the
//! embedding cache), the vector store is asked for `3 × max_chunks`
//! neighbours, and the hits are filtered by similarity threshold and packed
//! into the token budget. Whole retrievals are memoized in the retrieval
//! cache keyed by the normalized query and the parameters.

use crate::cache::{QueryCache, cache_key, normalize_query};
use crate::config::{CacheConfig, RetrievalConfig};
use crate::error::{RagError, Result};
use crate::monitor::PerformanceMonitor;
use crate::pool::ConnectionPool;
use crate::services::{Embedder, VectorMatch, VectorStore};
use crate::tokens::estimate_tokens;
use crate::types::RetrievalCandidate;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Words that mark a question as a comparison needing broader context.
/// Whole words that mark a comparison question, with their common inflections.
const COMPARISON_KEYWORDS: &[&str] = &[
    "compare",
    "compares",
    "compared",
    "comparing",
    "comparison",
    "comparisons",
    "difference",
    "differences",
    "differ",
    "differs",
    "differing",
    "versus",
    "vs",
    "contrast",
    "contrasts",
    "contrasting",
];

/// Candidates requested from the vector store per accepted chunk.
const OVERFETCH_FACTOR: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalParams {
    pub max_chunks: usize,
    pub similarity_threshold: f32,
    pub token_budget: usize,
}

impl RetrievalParams {
    pub fn new(max_chunks: usize, similarity_threshold: f32, token_budget: usize) -> Self {
        Self {
            max_chunks,
            similarity_threshold,
            token_budget,
        }
    }

    /// Parameters for `query` under `config`, applying adaptive chunk counts
    /// when enabled.
    pub fn for_query(config: &RetrievalConfig, query: &str) -> Self {
        let max_chunks = if config.adaptive_max_chunks {
            adaptive_max_chunks(query)
        } else {
            config.default_max_chunks
        };
        Self::new(max_chunks, config.similarity_threshold, config.max_context_tokens)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chunks == 0 {
            return Err(RagError::malformed("max_chunks must be at least 1"));
        }
        if self.token_budget == 0 {
            return Err(RagError::malformed("token_budget must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(RagError::malformed(format!(
                "similarity_threshold {} is outside 0.0..=1.0",
                self.similarity_threshold
            )));
        }
        Ok(())
    }
}

fn is_comparison_word(word: &str) -> bool {
    COMPARISON_KEYWORDS.contains(&word)
}

/// Chunk count suited to the shape of `query`: comparisons get 5, short
/// questions 2, everything else 3.
pub fn adaptive_max_chunks(query: &str) -> usize {
    let words: Vec<String> = query
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();
    if words.iter().any(|w| is_comparison_word(w)) {
        5
    } else if words.len() < 10 {
        2
    } else {
        3
    }
}

/// Turn raw nearest-neighbour hits into ranked candidates: similarity is
/// `1 − distance` clamped to `0..=1`, hits under the threshold are dropped,
/// and acceptance stops at `max_chunks` or when the next candidate would
/// overflow the token budget.
pub fn select_candidates(matches: Vec<VectorMatch>, params: &RetrievalParams) -> Vec<RetrievalCandidate> {
    let mut scored: Vec<RetrievalCandidate> = matches
        .into_iter()
        .map(|m| RetrievalCandidate {
            estimated_tokens: estimate_tokens(&m.text),
            similarity_score: (1.0 - m.distance).clamp(0.0, 1.0),
            chunk_id: m.id,
            text: m.text,
            metadata: m.metadata,
        })
        .filter(|c| c.similarity_score >= params.similarity_threshold)
        .collect();
    scored.sort_by(|a, b| {
        b.similarity_score
            .total_cmp(&a.similarity_score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    let mut used = 0;
    let mut selected = Vec::new();
    for candidate in scored {
        if selected.len() >= params.max_chunks || used + candidate.estimated_tokens > params.token_budget {
            break;
        }
        used += candidate.estimated_tokens;
        selected.push(candidate);
    }
    selected
}

pub struct Retriever {
    embedder: ConnectionPool<dyn Embedder>,
    store: ConnectionPool<dyn VectorStore>,
    embeddings: Arc<QueryCache<Vec<f32>>>,
    retrievals: Arc<QueryCache<Vec<RetrievalCandidate>>>,
    cache: CacheConfig,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl Retriever {
    pub fn new(
        embedder: ConnectionPool<dyn Embedder>,
        store: ConnectionPool<dyn VectorStore>,
        embeddings: Arc<QueryCache<Vec<f32>>>,
        retrievals: Arc<QueryCache<Vec<RetrievalCandidate>>>,
        cache: CacheConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            embeddings,
            retrievals,
            cache,
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Ranked candidates for `query`, best first.
    pub async fn retrieve(&self, query: &str, params: &RetrievalParams) -> Result<Vec<RetrievalCandidate>> {
        params.validate()?;
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return Err(RagError::malformed("query is empty"));
        }

        let key = cache_key(
            "retrieval",
            &[
                &normalized,
                &params.max_chunks.to_string(),
                &format!("{:.4}", params.similarity_threshold),
                &params.token_budget.to_string(),
            ],
        );
        // Normalization only shapes the cache key; the embedder sees the
        // question as asked.
        self.retrievals
            .get_or_compute(&key, self.cache.retrieval_ttl(), self.cache.coalescing, || {
                self.search(query.trim(), params)
            })
            .await
    }

    async fn search(&self, query: &str, params: &RetrievalParams) -> Result<Vec<RetrievalCandidate>> {
        let started = Instant::now();
        let corpus = self.corpus_size().await?;
        if corpus == 0 {
            debug!("Corpus is empty; skipping retrieval");
            return Ok(Vec::new());
        }

        let vector = self.embed(query).await?;
        let top_k = (params.max_chunks * OVERFETCH_FACTOR).min(corpus);
        let vector = &vector;
        let matches = self
            .store
            .execute(move |store| async move { store.query(vector, top_k).await })
            .await?;
        let fetched = matches.len();
        let selected = select_candidates(matches, params);

        debug!(
            fetched,
            selected = selected.len(),
            top_score = selected.first().map(|c| c.similarity_score),
            "Retrieved candidates"
        );
        if let Some(monitor) = &self.monitor {
            monitor.record_duration("retrieval.latency_ms", started.elapsed());
            monitor.observe("retrieval.candidates", selected.len() as f64);
        }
        Ok(selected)
    }

    /// Embedding of `text`, memoized in the embedding cache.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = cache_key("embedding", &[text]);
        self.embeddings
            .get_or_compute(&key, self.cache.embedding_ttl(), self.cache.coalescing, || async {
                self.embedder
                    .execute(move |embedder| async move { embedder.encode(text).await })
                    .await
            })
            .await
    }

    /// Number of chunks in the vector store.
    pub async fn corpus_size(&self) -> Result<usize> {
        self.store
            .execute(|store| async move { store.count().await })
            .await
    }
}
