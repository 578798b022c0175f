//! In-process upstream doubles for tests, benchmarks and offline demos.
//!
//! Every mock is shared behind an `Arc`; its [`factory`](MockEmbedder::factory)
//! hands the same instance to every pooled connection so call counters see
//! all traffic.

use super::{
    ChatModel, Embedder, HashEmbedder, InMemoryVectorStore, Upstream, VectorMatch, VectorRecord,
    VectorStore,
};
use crate::error::{RagError, Result};
use crate::pool::ConnectionFactory;
use crate::types::ChatMessage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Failure injection shared by all mocks.
#[derive(Debug, Default)]
pub struct Faults {
    fail_all: AtomicBool,
    fail_next: AtomicUsize,
    unhealthy: AtomicBool,
}

impl Faults {
    /// Fail every call until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Fail exactly the next `n` calls.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    fn check(&self, service: &str) -> Result<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(RagError::upstream(service, "injected failure"));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(RagError::upstream(service, "injected transient failure"));
        }
        Ok(())
    }

    fn healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }
}

/// Embedder using [`HashEmbedder`] vectors with call counting and delays.
pub struct MockEmbedder {
    inner: HashEmbedder,
    calls: AtomicUsize,
    texts: Mutex<Vec<String>>,
    connections: AtomicUsize,
    delay: Duration,
    pub faults: Faults,
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            inner: HashEmbedder::new(dimensions),
            calls: AtomicUsize::new(0),
            texts: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            delay: Duration::ZERO,
            faults: Faults::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `encode` calls, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every text passed to `encode`, in call order.
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Number of times the pool asked the factory for a connection.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn factory(self: &Arc<Self>) -> ConnectionFactory<dyn Embedder> {
        let this = self.clone();
        Arc::new(move || {
            this.connections.fetch_add(1, Ordering::SeqCst);
            Ok(this.clone() as Arc<dyn Embedder>)
        })
    }
}

#[async_trait]
impl Upstream for MockEmbedder {
    fn name(&self) -> &str {
        "mock-embedder"
    }

    async fn health_check(&self) -> bool {
        self.faults.healthy()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut texts) = self.texts.lock() {
            texts.push(text.to_string());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.faults.check(self.name())?;
        Ok(self.inner.embed(text))
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}

/// In-memory vector store with query counting and failure injection.
#[derive(Default)]
pub struct MockVectorStore {
    inner: InMemoryVectorStore,
    queries: AtomicUsize,
    write_delay: Duration,
    pub faults: Faults,
}

impl MockVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside every `upsert` and `delete_document`.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    async fn pause_write(&self) {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
    }

    pub fn factory(self: &Arc<Self>) -> ConnectionFactory<dyn VectorStore> {
        let this = self.clone();
        Arc::new(move || Ok(this.clone() as Arc<dyn VectorStore>))
    }
}

#[async_trait]
impl Upstream for MockVectorStore {
    fn name(&self) -> &str {
        "mock-store"
    }

    async fn health_check(&self) -> bool {
        self.faults.healthy()
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        self.faults.check(self.name())?;
        self.pause_write().await;
        self.inner.upsert(records).await
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.faults.check(self.name())?;
        self.inner.query(vector, top_k).await
    }

    async fn count(&self) -> Result<usize> {
        self.faults.check(self.name())?;
        self.inner.count().await
    }

    async fn delete_document(&self, doc_id: &str) -> Result<usize> {
        self.faults.check(self.name())?;
        self.pause_write().await;
        self.inner.delete_document(doc_id).await
    }
}

/// Chat model returning a canned reply.
pub struct MockChatModel {
    reply: Mutex<String>,
    calls: AtomicUsize,
    last_messages: Mutex<Vec<ChatMessage>>,
    delay: Duration,
    pub faults: Faults,
}

impl MockChatModel {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: Mutex::new(reply.into()),
            calls: AtomicUsize::new(0),
            last_messages: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            faults: Faults::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_reply(&self, reply: impl Into<String>) {
        if let Ok(mut guard) = self.reply.lock() {
            *guard = reply.into();
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages of the most recent `chat` call.
    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.last_messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn factory(self: &Arc<Self>) -> ConnectionFactory<dyn ChatModel> {
        let this = self.clone();
        Arc::new(move || Ok(this.clone() as Arc<dyn ChatModel>))
    }
}

#[async_trait]
impl Upstream for MockChatModel {
    fn name(&self) -> &str {
        "mock-llm"
    }

    async fn health_check(&self) -> bool {
        self.faults.healthy()
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
        _max_tokens: usize,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_messages.lock() {
            *last = messages.to_vec();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.faults.check(self.name())?;
        Ok(self
            .reply
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fail_next_is_consumed() {
        let embedder = MockEmbedder::new(8);
        embedder.faults.fail_next(2);
        assert!(embedder.encode("a").await.is_err());
        assert!(embedder.encode("a").await.is_err());
        assert!(embedder.encode("a").await.is_ok());
        assert_eq!(embedder.calls(), 3);
    }

    #[tokio::test]
    async fn test_factory_shares_instance() {
        let llm = Arc::new(MockChatModel::new("hello"));
        let factory = llm.factory();
        let conn = factory().unwrap();
        assert_eq!(conn.chat(&[], 0.0, 10).await.unwrap(), "hello");
        assert_eq!(llm.calls(), 1);
    }
}
