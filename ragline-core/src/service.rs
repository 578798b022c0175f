//! The query-serving facade.
//!
//! [`RagService`] wires the chunker, retriever, context assembler, caches,
//! connection pools and monitor together. It owns no globals: every
//! collaborator is passed in through [`RagService::new`], and background
//! loops are started with [`spawn_background`](RagService::spawn_background)
//! and stopped by [`shutdown`](RagService::shutdown).

use crate::cache::{CacheOutcome, CacheStats, QueryCache, cache_key, normalize_query};
use crate::chunker::Chunker;
use crate::config::RaglineConfig;
use crate::context::{ContextAssembler, NO_RELEVANT_INFORMATION};
use crate::error::{ConfigError, RagError, Result};
use crate::lock;
use crate::monitor::{MonitorSnapshot, PerformanceMonitor};
use crate::pool::{ConnectionFactory, ConnectionPool, PoolSettings, PoolStatus};
use crate::retriever::{RetrievalParams, Retriever};
use crate::services::{
    ChatModel, Embedder, VectorRecord, VectorStore, embedder_factory, llm_factory,
    vector_store_factory,
};
use crate::tokens::estimate_tokens;
use crate::types::{
    Answer, BatchIngestReport, ChatMessage, DocumentInput, IngestReport, RetrievalCandidate,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Answer text returned when an upstream stays unreachable after retries.
pub const KNOWLEDGE_BASE_UNREACHABLE: &str =
    "The knowledge base is currently unreachable. Please try again shortly.";

/// Connection factories for the three upstream services.
pub struct ServiceFactories {
    pub embedder: ConnectionFactory<dyn Embedder>,
    pub vector_store: ConnectionFactory<dyn VectorStore>,
    pub llm: ConnectionFactory<dyn ChatModel>,
}

impl ServiceFactories {
    /// Resolve the configured providers.
    pub fn from_config(config: &RaglineConfig) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            embedder: embedder_factory(&config.embedder)?,
            vector_store: vector_store_factory(&config.vector_store)?,
            llm: llm_factory(&config.llm)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatuses {
    pub answer: CacheStats,
    pub retrieval: CacheStats,
    pub embedding: CacheStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub pools: Vec<PoolStatus>,
    pub caches: CacheStatuses,
    /// `None` when the vector store could not be reached.
    pub corpus_size: Option<usize>,
    pub monitor: MonitorSnapshot,
}

/// Per-document write locks, so a replace (delete + upsert) of one `doc_id`
/// never interleaves with another write to the same document.
#[derive(Default)]
struct DocumentLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DocumentLocks {
    async fn acquire(&self, doc_id: &str) -> DocumentGuard<'_> {
        let slot = lock(&self.locks).entry(doc_id.to_string()).or_default().clone();
        let guard = slot.clone().lock_owned().await;
        DocumentGuard {
            locks: self,
            doc_id: doc_id.to_string(),
            slot,
            guard: Some(guard),
        }
    }
}

struct DocumentGuard<'a> {
    locks: &'a DocumentLocks,
    doc_id: String,
    slot: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DocumentGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock(&self.locks.locks);
        // Only the table and this guard still reference the slot: no waiters.
        if Arc::strong_count(&self.slot) == 2 {
            locks.remove(&self.doc_id);
        }
    }
}

pub struct RagService {
    config: RaglineConfig,
    chunker: Chunker,
    assembler: ContextAssembler,
    retriever: Retriever,
    embedder: ConnectionPool<dyn Embedder>,
    store: ConnectionPool<dyn VectorStore>,
    llm: ConnectionPool<dyn ChatModel>,
    answers: Arc<QueryCache<Answer>>,
    retrievals: Arc<QueryCache<Vec<RetrievalCandidate>>>,
    embeddings: Arc<QueryCache<Vec<f32>>>,
    monitor: Arc<PerformanceMonitor>,
    documents: DocumentLocks,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RagService {
    pub fn new(
        config: RaglineConfig,
        factories: ServiceFactories,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        let pools = &config.pools;
        let embedder = ConnectionPool::new(
            "embedder",
            PoolSettings::from(&pools.embedder),
            config.retry.clone(),
            factories.embedder,
        )
        .with_monitor(monitor.clone());
        let store = ConnectionPool::new(
            "vector_store",
            PoolSettings::from(&pools.vector_store),
            config.retry.clone(),
            factories.vector_store,
        )
        .with_monitor(monitor.clone());
        let llm = ConnectionPool::new(
            "llm",
            PoolSettings::from(&pools.llm),
            config.retry.clone(),
            factories.llm,
        )
        .with_monitor(monitor.clone());

        let cache = &config.cache;
        let answers = Arc::new(
            QueryCache::new("answer", cache.memory_ceiling_bytes, cache.eviction_policy)
                .with_monitor(monitor.clone()),
        );
        let retrievals = Arc::new(
            QueryCache::new("retrieval", cache.memory_ceiling_bytes, cache.eviction_policy)
                .with_monitor(monitor.clone()),
        );
        let embeddings = Arc::new(
            QueryCache::new("embedding", cache.memory_ceiling_bytes, cache.eviction_policy)
                .with_monitor(monitor.clone()),
        );

        let retriever = Retriever::new(
            embedder.clone(),
            store.clone(),
            embeddings.clone(),
            retrievals.clone(),
            cache.clone(),
        )
        .with_monitor(monitor.clone());

        Self {
            chunker: Chunker::new(
                config.chunking.chunk_size_tokens,
                config.chunking.chunk_overlap_tokens,
            ),
            assembler: ContextAssembler::new(
                config.retrieval.max_context_tokens,
                config.retrieval.max_salient_sentences,
            ),
            retriever,
            embedder,
            store,
            llm,
            answers,
            retrievals,
            embeddings,
            monitor,
            documents: DocumentLocks::default(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Validate `config`, resolve its providers and build a service with a
    /// monitor carrying the configured alert rules.
    pub fn from_config(config: RaglineConfig) -> std::result::Result<Self, ConfigError> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(ConfigError::invalid(problems.join("; ")));
        }
        let factories = ServiceFactories::from_config(&config)?;
        let monitor = Arc::new(PerformanceMonitor::from_config(&config.monitor));
        Ok(Self::new(config, factories, monitor))
    }

    pub fn config(&self) -> &RaglineConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Answer `question` from the ingested documents.
    ///
    /// Identical questions (after normalization) share one cached answer, and
    /// concurrent identical questions share one computation. If an upstream
    /// stays unreachable the result is a degraded answer, never cached.
    pub async fn answer(&self, question: &str) -> Result<Answer> {
        let started = Instant::now();
        let normalized = normalize_query(question);
        if normalized.is_empty() {
            return Err(RagError::malformed("question is empty"));
        }
        let params = RetrievalParams::for_query(&self.config.retrieval, question);
        params.validate()?;
        self.monitor.increment("answer.requests");

        let key = cache_key("answer", &[&normalized]);
        let cache = &self.config.cache;
        let result = self
            .answers
            .get_or_compute_traced(&key, cache.answer_ttl(), cache.coalescing, || {
                self.generate(question, &params)
            })
            .await;

        let answer = match result {
            Ok((mut answer, outcome)) => {
                answer.cache_hit = outcome.is_hit();
                if outcome == CacheOutcome::Computed {
                    debug!(
                        tokens_used = answer.tokens_used,
                        sources = answer.cited_chunks.len(),
                        "Answer computed"
                    );
                }
                answer
            }
            Err(e) => match e.root_cause() {
                RagError::UpstreamUnavailable { service, message } => {
                    warn!(service = %service, error = %message, "Answering degraded; upstream unreachable");
                    self.monitor.increment("answer.degraded");
                    Answer {
                        answer_text: KNOWLEDGE_BASE_UNREACHABLE.to_string(),
                        cited_chunks: Vec::new(),
                        tokens_used: 0,
                        cache_hit: false,
                        degraded: true,
                    }
                }
                _ => {
                    self.monitor.increment("answer.errors");
                    return Err(e);
                }
            },
        };
        self.monitor
            .record_duration("answer.latency_ms", started.elapsed());
        Ok(answer)
    }

    /// [`answer`](Self::answer) bounded by `deadline`. On expiry the request is
    /// dropped, releasing its pooled connections and any coalesced waiters.
    pub async fn answer_with_deadline(&self, question: &str, deadline: Duration) -> Result<Answer> {
        tokio::time::timeout(deadline, self.answer(question))
            .await
            .map_err(|_| {
                self.monitor.increment("answer.deadline_exceeded");
                RagError::DeadlineExceeded {
                    timeout_ms: deadline.as_millis() as u64,
                }
            })?
    }

    async fn generate(&self, question: &str, params: &RetrievalParams) -> Result<Answer> {
        let candidates = self.retriever.retrieve(question, params).await?;
        let context = self.assembler.assemble(question, &candidates);
        if context.is_empty() {
            debug!("No relevant context; skipping generation");
            return Ok(Answer {
                answer_text: NO_RELEVANT_INFORMATION.to_string(),
                cited_chunks: Vec::new(),
                tokens_used: 0,
                cache_hit: false,
                degraded: false,
            });
        }

        let generation = &self.config.generation;
        let messages = vec![
            ChatMessage::system(generation.system_prompt.clone()),
            ChatMessage::user(format!(
                "Context:\n{}\n\nQuestion: {}",
                context.text,
                question.trim()
            )),
        ];
        let (temperature, max_tokens) = (generation.temperature, generation.max_tokens);
        let messages = &messages;
        let reply = self
            .llm
            .execute(move |llm| async move { llm.chat(messages, temperature, max_tokens).await })
            .await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(RagError::invalid_response("llm", "empty completion"));
        }

        let prompt_tokens: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        let tokens_used = prompt_tokens + estimate_tokens(reply);
        self.monitor.observe("answer.tokens_used", tokens_used as f64);
        Ok(Answer {
            answer_text: reply.to_string(),
            cited_chunks: context.sources,
            tokens_used,
            cache_hit: false,
            degraded: false,
        })
    }

    /// Chunk, embed and store one document, replacing any earlier version
    /// with the same `doc_id`.
    pub async fn ingest(&self, doc: DocumentInput) -> Result<IngestReport> {
        if doc.doc_id.trim().is_empty() {
            return Err(RagError::malformed("doc_id is empty"));
        }
        if doc.text.trim().is_empty() {
            return Err(RagError::malformed(format!("document '{}' has no text", doc.doc_id)));
        }
        let started = Instant::now();
        let chunks = self.chunker.chunk_document(&doc);

        let embeddings = futures::future::try_join_all(chunks.iter().map(|chunk| {
            let text = chunk.text.as_str();
            self.embedder
                .execute(move |embedder| async move { embedder.encode(text).await })
        }))
        .await?;

        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, vector)| VectorRecord {
                id: chunk.id,
                vector,
                metadata: chunk.metadata,
                text: chunk.text,
            })
            .collect();
        let estimated_tokens = records.iter().map(|r| estimate_tokens(&r.text)).sum();
        let chunk_count = records.len();

        let doc_id = doc.doc_id.as_str();
        let _writing = self.documents.acquire(doc_id).await;
        let replaced = self
            .store
            .execute(move |store| async move { store.delete_document(doc_id).await })
            .await?;
        let records = &records;
        self.store
            .execute(move |store| async move { store.upsert(records.clone()).await })
            .await?;
        self.invalidate_query_caches();

        info!(
            doc_id = %doc.doc_id,
            chunks = chunk_count,
            replaced,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ingested document"
        );
        self.monitor.increment("ingest.documents");
        self.monitor.observe("ingest.chunks", chunk_count as f64);
        Ok(IngestReport {
            doc_id: doc.doc_id,
            chunks: chunk_count,
            estimated_tokens,
        })
    }

    /// Ingest many documents in fixed-size groups with bounded concurrency.
    /// Failures are collected per document instead of aborting the batch.
    pub async fn ingest_batch(&self, docs: Vec<DocumentInput>) -> BatchIngestReport {
        let ingest = &self.config.ingest;
        let semaphore = Arc::new(Semaphore::new(ingest.max_concurrency.max(1)));
        let mut report = BatchIngestReport::default();

        for group in docs.chunks(ingest.group_size.max(1)) {
            let results = futures::future::join_all(group.iter().map(|doc| {
                let semaphore = semaphore.clone();
                async move {
                    let result = match semaphore.acquire().await {
                        Ok(_permit) => self.ingest(doc.clone()).await,
                        Err(_) => Err(RagError::Cancelled),
                    };
                    (doc.doc_id.clone(), result)
                }
            }))
            .await;

            for (doc_id, result) in results {
                match result {
                    Ok(r) => report.ingested.push(r),
                    Err(e) => {
                        warn!(doc_id = %doc_id, error = %e, "Failed to ingest document");
                        report.failed.push((doc_id, e.to_string()));
                    }
                }
            }
        }
        info!(
            ingested = report.ingested.len(),
            failed = report.failed.len(),
            chunks = report.total_chunks(),
            "Batch ingestion finished"
        );
        report
    }

    /// Remove every chunk of `doc_id`. Returns the number of chunks removed.
    pub async fn delete_document(&self, doc_id: &str) -> Result<usize> {
        if doc_id.trim().is_empty() {
            return Err(RagError::malformed("doc_id is empty"));
        }
        let _writing = self.documents.acquire(doc_id).await;
        let removed = self
            .store
            .execute(move |store| async move { store.delete_document(doc_id).await })
            .await?;
        self.invalidate_query_caches();
        info!(doc_id, removed, "Deleted document");
        Ok(removed)
    }

    /// Retrieval and answer results depend on the corpus; embeddings do not.
    fn invalidate_query_caches(&self) {
        self.retrievals.clear();
        self.answers.clear();
    }

    pub async fn status(&self) -> ServiceStatus {
        let corpus_size = match self.retriever.corpus_size().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "Could not read corpus size");
                None
            }
        };
        ServiceStatus {
            pools: vec![self.embedder.status(), self.store.status(), self.llm.status()],
            caches: CacheStatuses {
                answer: self.answers.stats(),
                retrieval: self.retrievals.stats(),
                embedding: self.embeddings.stats(),
            },
            corpus_size,
            monitor: self.monitor.snapshot(),
        }
    }

    /// Start pool health checkers, cache janitors and the alert loop.
    pub fn spawn_background(&self) {
        let token = &self.shutdown;
        let janitor_interval = Duration::from_secs(self.config.cache.janitor_interval_secs);
        let alert_interval = Duration::from_secs(self.config.monitor.evaluation_interval_secs);
        let handles = vec![
            self.embedder.spawn_health_checker(token.child_token()),
            self.store.spawn_health_checker(token.child_token()),
            self.llm.spawn_health_checker(token.child_token()),
            self.answers
                .clone()
                .spawn_janitor(janitor_interval, token.child_token()),
            self.retrievals
                .clone()
                .spawn_janitor(janitor_interval, token.child_token()),
            self.embeddings
                .clone()
                .spawn_janitor(janitor_interval, token.child_token()),
            self.monitor
                .clone()
                .spawn_alert_loop(alert_interval, token.child_token()),
        ];
        lock(&self.tasks).extend(handles);
        info!("Background tasks started");
    }

    /// Stop background tasks and close the pools.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.embedder.close();
        self.store.close();
        self.llm.close();
        info!("Service shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::mock::{MockChatModel, MockEmbedder, MockVectorStore};

    struct Harness {
        service: RagService,
        embedder: Arc<MockEmbedder>,
        store: Arc<MockVectorStore>,
        llm: Arc<MockChatModel>,
    }

    fn harness(config: RaglineConfig) -> Harness {
        let embedder = Arc::new(MockEmbedder::new(128));
        let store = Arc::new(MockVectorStore::new());
        let llm = Arc::new(MockChatModel::new("Pools bound connections [Source 1]."));
        let factories = ServiceFactories {
            embedder: embedder.factory(),
            vector_store: store.factory(),
            llm: llm.factory(),
        };
        let service = RagService::new(config, factories, Arc::new(PerformanceMonitor::default()));
        Harness {
            service,
            embedder,
            store,
            llm,
        }
    }

    fn fast_config() -> RaglineConfig {
        let mut config = RaglineConfig::default();
        config.retry.max_retries = 1;
        config.retry.initial_backoff_ms = 1;
        config.retry.jitter = false;
        config
    }

    const POOL_DOC: &str = "The connection pool bounds active connections to each upstream service. \
        Unhealthy connections are probed by a background health checker.";

    #[tokio::test]
    async fn test_answer_cites_sources_and_caches() {
        let h = harness(fast_config());
        h.service
            .ingest(DocumentInput::new("pool", POOL_DOC))
            .await
            .unwrap();

        let answer = h.service.answer("How does the connection pool bound connections?").await.unwrap();
        assert_eq!(answer.answer_text, "Pools bound connections [Source 1].");
        assert_eq!(answer.cited_chunks[0].doc_id, "pool");
        assert!(answer.tokens_used > 0);
        assert!(!answer.cache_hit && !answer.degraded);

        let messages = h.llm.last_messages();
        assert!(messages[1].content.contains("[Source 1] pool (pool)"));

        let again = h.service.answer("how does the connection pool bound connections?").await.unwrap();
        assert!(again.cache_hit);
        assert_eq!(h.llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_corpus_answers_without_llm() {
        let h = harness(fast_config());
        let answer = h.service.answer("What is anything?").await.unwrap();
        assert_eq!(answer.answer_text, NO_RELEVANT_INFORMATION);
        assert_eq!(h.llm.calls(), 0);
        assert_eq!(h.embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_and_is_not_cached() {
        let h = harness(fast_config());
        h.store.faults.set_failing(true);
        let answer = h.service.answer("Is anything there?").await.unwrap();
        assert!(answer.degraded);
        assert_eq!(answer.answer_text, KNOWLEDGE_BASE_UNREACHABLE);

        h.store.faults.set_failing(false);
        let answer = h.service.answer("Is anything there?").await.unwrap();
        assert!(!answer.degraded);
        assert!(!answer.cache_hit);
    }

    #[tokio::test]
    async fn test_malformed_question_rejected() {
        let h = harness(fast_config());
        let err = h.service.answer("   ").await.unwrap_err();
        assert!(matches!(err, RagError::MalformedInput { .. }));
    }

    #[tokio::test]
    async fn test_reingest_replaces_and_delete_cascades() {
        let h = harness(fast_config());
        let long = vec!["Paragraph about pools and caches."; 120].join("\n\n");
        let first = h.service.ingest(DocumentInput::new("doc", long)).await.unwrap();
        assert!(first.chunks > 1);

        let second = h.service.ingest(DocumentInput::new("doc", POOL_DOC)).await.unwrap();
        assert_eq!(second.chunks, 1);
        assert_eq!(h.service.retriever().corpus_size().await.unwrap(), 1);

        assert_eq!(h.service.delete_document("doc").await.unwrap(), 1);
        assert_eq!(h.service.retriever().corpus_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ingest_invalidates_cached_answers() {
        let h = harness(fast_config());
        let before = h.service.answer("How are unhealthy connections probed?").await.unwrap();
        assert_eq!(before.answer_text, NO_RELEVANT_INFORMATION);

        h.service.ingest(DocumentInput::new("pool", POOL_DOC)).await.unwrap();
        let after = h.service.answer("How are unhealthy connections probed?").await.unwrap();
        assert_ne!(after.answer_text, NO_RELEVANT_INFORMATION);
        assert!(!after.cache_hit);
    }

    #[tokio::test]
    async fn test_batch_collects_failures() {
        let h = harness(fast_config());
        let docs = vec![
            DocumentInput::new("a", POOL_DOC),
            DocumentInput::new("empty", "   "),
            DocumentInput::new("b", "Caches store answers for five minutes."),
        ];
        let report = h.service.ingest_batch(docs).await;
        assert_eq!(report.ingested.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "empty");
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let embedder = Arc::new(MockEmbedder::new(64));
        let store = Arc::new(MockVectorStore::new());
        let llm = Arc::new(MockChatModel::new("late").with_delay(Duration::from_secs(5)));
        let service = RagService::new(
            fast_config(),
            ServiceFactories {
                embedder: embedder.factory(),
                vector_store: store.factory(),
                llm: llm.factory(),
            },
            Arc::new(PerformanceMonitor::default()),
        );
        service.ingest(DocumentInput::new("pool", POOL_DOC)).await.unwrap();
        let err = service
            .answer_with_deadline("How are unhealthy connections probed?", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DeadlineExceeded { timeout_ms: 50 }));
        assert_eq!(service.llm.status().active, 0);
    }

    #[tokio::test]
    async fn test_status_and_shutdown() {
        let h = harness(fast_config());
        h.service.ingest(DocumentInput::new("pool", POOL_DOC)).await.unwrap();
        h.service.spawn_background();
        let status = h.service.status().await;
        assert_eq!(status.pools.len(), 3);
        assert_eq!(status.corpus_size, Some(1));
        assert!(serde_json::to_string(&status).is_ok());
        h.service.shutdown().await;
    }
}
