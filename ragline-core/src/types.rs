//! Fundamental data types shared across the pipeline.

use serde::{Deserialize, Serialize};

/// Metadata stored alongside every chunk in the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub title: String,
    pub source: String,
    pub doc_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub content_preview: String,
}

/// A retrievable span of a document together with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

impl DocumentChunk {
    /// Stable chunk identifier derived from the owning document.
    pub fn chunk_id(doc_id: &str, chunk_index: usize) -> String {
        format!("{doc_id}_chunk_{chunk_index}")
    }
}

/// A chunk returned by retrieval, scored against one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub chunk_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// Cosine similarity in `0.0..=1.0`.
    pub similarity_score: f32,
    pub estimated_tokens: usize,
}

/// A raw document handed to ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInput {
    pub doc_id: String,
    pub title: String,
    pub source: String,
    pub text: String,
}

impl DocumentInput {
    pub fn new(doc_id: impl Into<String>, text: impl Into<String>) -> Self {
        let doc_id = doc_id.into();
        Self {
            title: doc_id.clone(),
            source: doc_id.clone(),
            doc_id,
            text: text.into(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// Role of a chat message sent to the language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A chunk cited by an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub doc_id: String,
    pub title: String,
    pub source: String,
    pub similarity_score: f32,
}

impl From<&RetrievalCandidate> for Citation {
    fn from(candidate: &RetrievalCandidate) -> Self {
        Self {
            chunk_id: candidate.chunk_id.clone(),
            doc_id: candidate.metadata.doc_id.clone(),
            title: candidate.metadata.title.clone(),
            source: candidate.metadata.source.clone(),
            similarity_score: candidate.similarity_score,
        }
    }
}

/// The result of answering one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer_text: String,
    pub cited_chunks: Vec<Citation>,
    pub tokens_used: usize,
    /// Served from the answer cache or by joining an in-flight computation.
    pub cache_hit: bool,
    /// The knowledge base could not be reached; `answer_text` explains why.
    pub degraded: bool,
}

/// Summary of one ingested document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub chunks: usize,
    pub estimated_tokens: usize,
}

/// Outcome of a bulk ingestion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchIngestReport {
    pub ingested: Vec<IngestReport>,
    /// `(doc_id, error message)` for every document that failed.
    pub failed: Vec<(String, String)>,
}

impl BatchIngestReport {
    pub fn total_chunks(&self) -> usize {
        self.ingested.iter().map(|r| r.chunks).sum()
    }
}
