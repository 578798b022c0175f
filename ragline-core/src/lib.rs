//! # Ragline Core
//!
//! Query-serving core for Ragline: retrieval-augmented question answering
//! over private documents. Provides document chunking, semantic retrieval,
//! context assembly, and the performance layer around them (TTL query cache
//! with request coalescing, health-checked connection pools, and a
//! performance monitor with threshold alerts).

pub mod cache;
pub mod chunker;
pub mod config;
pub mod context;
pub mod error;
pub mod monitor;
pub mod pool;
pub mod retriever;
pub mod service;
pub mod services;
pub mod tokens;
pub mod types;

// Re-export commonly used types at the crate root.
pub use cache::{CacheOutcome, CacheStats, EvictionPolicy, QueryCache};
pub use chunker::{Chunker, chunk};
pub use config::{RaglineConfig, load_config};
pub use context::{AssembledContext, ContextAssembler, NO_RELEVANT_INFORMATION};
pub use error::{ConfigError, RagError, Result};
pub use monitor::{Alert, AlertLevel, AlertRule, MetricKind, PerformanceMonitor};
pub use pool::{ConnectionPool, PoolHealth, PoolSettings, PoolStatus, PooledHandle};
pub use retriever::{RetrievalParams, Retriever, adaptive_max_chunks};
pub use service::{RagService, ServiceFactories, ServiceStatus};
pub use types::{
    Answer, BatchIngestReport, ChunkMetadata, Citation, DocumentChunk, DocumentInput,
    IngestReport, RetrievalCandidate,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
