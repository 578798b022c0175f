//! Eviction policy and memory accounting.

use crate::types::{Answer, ChunkMetadata, RetrievalCandidate};
use serde::{Deserialize, Serialize};
use std::mem::size_of;

/// Fixed per-entry bookkeeping cost added to every value's weight.
pub const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Which entry to drop when the cache is over its memory ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently accessed first.
    #[default]
    Lru,
    /// Least frequently accessed first; ties go to the least recently accessed.
    Lfu,
}

/// LFU victim among `oldest_first`, which yields `(key, access_count)` from
/// least to most recently used. Ties go to the older entry.
pub fn least_frequent<'a, I>(oldest_first: I) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, u64)>,
{
    oldest_first
        .into_iter()
        .min_by_key(|(_, count)| *count)
        .map(|(key, _)| key)
}

/// Estimated heap + inline size of a cached value, in bytes.
pub trait CacheWeight {
    fn weight(&self) -> usize;
}

impl CacheWeight for String {
    fn weight(&self) -> usize {
        size_of::<String>() + self.len()
    }
}

impl CacheWeight for Vec<f32> {
    fn weight(&self) -> usize {
        size_of::<Vec<f32>>() + self.len() * size_of::<f32>()
    }
}

impl CacheWeight for ChunkMetadata {
    fn weight(&self) -> usize {
        size_of::<ChunkMetadata>()
            + self.title.len()
            + self.source.len()
            + self.doc_id.len()
            + self.content_preview.len()
    }
}

impl CacheWeight for RetrievalCandidate {
    fn weight(&self) -> usize {
        size_of::<RetrievalCandidate>()
            + self.chunk_id.len()
            + self.text.len()
            + self.metadata.weight()
    }
}

impl CacheWeight for Vec<RetrievalCandidate> {
    fn weight(&self) -> usize {
        size_of::<Vec<RetrievalCandidate>>() + self.iter().map(|c| c.weight()).sum::<usize>()
    }
}

impl CacheWeight for Answer {
    fn weight(&self) -> usize {
        size_of::<Answer>()
            + self.answer_text.len()
            + self
                .cited_chunks
                .iter()
                .map(|c| {
                    size_of_val(c) + c.chunk_id.len() + c.doc_id.len() + c.title.len() + c.source.len()
                })
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lfu_picks_least_used_then_oldest() {
        let oldest_first = vec![("b", 3), ("c", 1), ("a", 1)];
        assert_eq!(least_frequent(oldest_first), Some("c"));
    }

    #[test]
    fn test_empty_has_no_victim() {
        assert_eq!(least_frequent(Vec::new()), None);
    }

    #[test]
    fn test_weights_grow_with_content() {
        let small = String::from("a");
        let large = "a".repeat(1000);
        assert!(large.weight() > small.weight() + 900);
        assert_eq!(vec![0.0f32; 10].weight(), size_of::<Vec<f32>>() + 40);
    }
}
