//! Vector store implementations.
//!
//! Both stores do an exact scan with cosine distance. That is plenty for a
//! private document set and keeps the nearest-neighbour semantics obvious.

use super::{Upstream, VectorMatch, VectorRecord, VectorStore, cosine_similarity};
use crate::error::{RagError, Result};
use crate::types::ChunkMetadata;
use async_trait::async_trait;
use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::debug;

fn rank(mut scored: Vec<VectorMatch>, top_k: usize) -> Vec<VectorMatch> {
    scored.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    scored.truncate(top_k);
    scored
}

/// Volatile store kept entirely in memory.
#[derive(Default)]
pub struct InMemoryVectorStore {
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> RagError {
    RagError::storage("vector store lock poisoned")
}

#[async_trait]
impl Upstream for InMemoryVectorStore {
    fn name(&self) -> &str {
        "memory-store"
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        let mut map = self.records.write().map_err(poisoned)?;
        for record in records {
            map.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>> {
        let map = self.records.read().map_err(poisoned)?;
        let scored = map
            .values()
            .map(|r| VectorMatch {
                id: r.id.clone(),
                distance: 1.0 - cosine_similarity(vector, &r.vector),
                metadata: r.metadata.clone(),
                text: r.text.clone(),
            })
            .collect();
        Ok(rank(scored, top_k))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.read().map_err(poisoned)?.len())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<usize> {
        let mut map = self.records.write().map_err(poisoned)?;
        let before = map.len();
        map.retain(|_, r| r.metadata.doc_id != doc_id);
        Ok(before - map.len())
    }
}

/// Persistent store backed by one SQLite database file.
///
/// Each instance owns one connection; the pool opens several against the
/// same file, so the database runs in WAL mode with a busy timeout.
pub struct SqliteVectorStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteVectorStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunks (
                id          TEXT PRIMARY KEY,
                doc_id      TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text        TEXT NOT NULL,
                metadata    TEXT NOT NULL,
                embedding   BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_doc_id ON chunks(doc_id);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(poisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| RagError::storage(format!("blocking task failed: {e}")))?
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[async_trait]
impl Upstream for SqliteVectorStore {
    fn name(&self) -> &str {
        "sqlite-store"
    }

    async fn health_check(&self) -> bool {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        let count = records.len();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO chunks (id, doc_id, chunk_index, text, metadata, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for record in &records {
                    let metadata = serde_json::to_string(&record.metadata)
                        .map_err(|e| RagError::storage(format!("metadata encode: {e}")))?;
                    stmt.execute(params![
                        record.id,
                        record.metadata.doc_id,
                        record.metadata.chunk_index as i64,
                        record.text,
                        metadata,
                        encode_vector(&record.vector),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        debug!(records = count, "Upserted vectors");
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>> {
        let query = vector.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT id, text, metadata, embedding FROM chunks")?;
            let mut rows = stmt.query([])?;
            let mut scored = Vec::new();
            while let Some(row) = rows.next()? {
                let metadata: String = row.get(2)?;
                let metadata: ChunkMetadata = serde_json::from_str(&metadata)
                    .map_err(|e| RagError::storage(format!("metadata decode: {e}")))?;
                let embedding: Vec<u8> = row.get(3)?;
                scored.push(VectorMatch {
                    id: row.get(0)?,
                    distance: 1.0 - cosine_similarity(&query, &decode_vector(&embedding)),
                    metadata,
                    text: row.get(1)?,
                });
            }
            Ok(rank(scored, top_k))
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    async fn delete_document(&self, doc_id: &str) -> Result<usize> {
        let doc_id = doc_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute("DELETE FROM chunks WHERE doc_id = ?1", params![doc_id])?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(doc_id: &str, index: usize, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: format!("{doc_id}_chunk_{index}"),
            vector,
            metadata: ChunkMetadata {
                title: doc_id.into(),
                source: format!("{doc_id}.md"),
                doc_id: doc_id.into(),
                chunk_index: index,
                total_chunks: 2,
                content_preview: "preview".into(),
            },
            text: format!("text of {doc_id} {index}"),
        }
    }

    async fn exercise(store: &dyn VectorStore) {
        assert_eq!(store.count().await.unwrap(), 0);
        store
            .upsert(vec![
                record("a", 0, vec![1.0, 0.0]),
                record("a", 1, vec![0.7, 0.7]),
                record("b", 0, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 3);

        let hits = store.query(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a_chunk_0");
        assert!(hits[0].distance.abs() < 1e-5);
        assert_eq!(hits[1].id, "a_chunk_1");
        assert_eq!(hits[0].metadata.source, "a.md");

        // Upsert replaces by id.
        store
            .upsert(vec![record("b", 0, vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 3);

        assert_eq!(store.delete_document("a").await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.delete_document("missing").await.unwrap(), 0);
        assert!(store.health_check().await);
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        exercise(&InMemoryVectorStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteVectorStore::open(&dir.path().join("vectors.db")).unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.db");
        {
            let store = SqliteVectorStore::open(&path).unwrap();
            store
                .upsert(vec![record("doc", 0, vec![0.25, -1.5, 3.0])])
                .await
                .unwrap();
        }
        let reopened = SqliteVectorStore::open(&path).unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
        let hits = reopened.query(&[0.25, -1.5, 3.0], 5).await.unwrap();
        assert_eq!(hits[0].text, "text of doc 0");
        assert!(hits[0].distance.abs() < 1e-5);
    }

    #[test]
    fn test_vector_blob_encoding() {
        let v = vec![0.5f32, -1.25, 3.0e-7];
        assert_eq!(decode_vector(&encode_vector(&v)), v);
    }
}
