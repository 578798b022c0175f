//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use ragline_core::cache::{QueryCache, cache_key, normalize_query};
use ragline_core::chunker::chunk;
use ragline_core::retriever::select_candidates;
use ragline_core::services::VectorMatch;
use ragline_core::tokens::{estimate_tokens, tokens_for_words, words_for_tokens};
use ragline_core::types::ChunkMetadata;
use ragline_core::{EvictionPolicy, RetrievalParams};
use std::time::Duration;

fn word_text(words: usize, paragraph_every: usize) -> String {
    let mut out = String::new();
    for i in 0..words {
        if i > 0 {
            if paragraph_every > 0 && i % paragraph_every == 0 {
                out.push_str(".\n\n");
            } else {
                out.push(' ');
            }
        }
        out.push_str(&format!("w{i}"));
    }
    out
}

fn vector_match(i: usize, distance: f32, words: usize) -> VectorMatch {
    VectorMatch {
        id: format!("doc_chunk_{i}"),
        distance,
        metadata: ChunkMetadata {
            title: "doc".into(),
            source: "doc".into(),
            doc_id: "doc".into(),
            chunk_index: i,
            total_chunks: 1,
            content_preview: String::new(),
        },
        text: vec!["x"; words].join(" "),
    }
}

// --- Chunking properties ---

proptest! {
    #[test]
    fn chunking_always_yields_at_least_one_chunk(text in ".{0,600}") {
        prop_assert!(!chunk(&text, 50, 10).is_empty());
    }

    #[test]
    fn chunk_bodies_fit_the_budget(
        words in 1usize..1500,
        paragraph_every in 0usize..200,
        size in 40usize..500,
    ) {
        let text = word_text(words, paragraph_every);
        for c in chunk(&text, size, 0) {
            prop_assert!(estimate_tokens(&c) <= size, "chunk of {} tokens > {}", estimate_tokens(&c), size);
        }
    }

    #[test]
    fn chunking_without_overlap_preserves_every_word(
        words in 1usize..1500,
        paragraph_every in 0usize..200,
        size in 40usize..500,
    ) {
        let text = word_text(words, paragraph_every);
        let original: Vec<&str> = text.split_whitespace().collect();
        let chunks = chunk(&text, size, 0);
        let rejoined: Vec<&str> = chunks.iter().flat_map(|c| c.split_whitespace()).collect();
        prop_assert_eq!(rejoined, original);
    }

    #[test]
    fn overlap_prefixes_the_previous_tail(
        words in 200usize..1500,
        size in 40usize..300,
        overlap in 1usize..30,
    ) {
        let text = word_text(words, 0);
        let chunks = chunk(&text, size, overlap);
        for pair in chunks.windows(2) {
            let prev: Vec<&str> = pair[0].split_whitespace().collect();
            let next: Vec<&str> = pair[1].split_whitespace().collect();
            let take = overlap.min(prev.len());
            prop_assert_eq!(&next[..take], &prev[prev.len() - take..]);
        }
    }
}

// --- Token estimate properties ---

proptest! {
    #[test]
    fn words_for_tokens_is_the_tightest_fit(tokens in 0usize..100_000) {
        let words = words_for_tokens(tokens);
        prop_assert!(tokens_for_words(words) <= tokens);
        prop_assert!(tokens_for_words(words + 1) > tokens);
    }
}

// --- Candidate selection properties ---

proptest! {
    #[test]
    fn selection_respects_threshold_budget_and_order(
        hits in prop::collection::vec((0.0f32..2.0, 1usize..200), 0..30),
        max_chunks in 1usize..10,
        threshold in 0.0f32..1.0,
        budget in 1usize..2000,
    ) {
        let matches: Vec<VectorMatch> = hits
            .iter()
            .enumerate()
            .map(|(i, (distance, words))| vector_match(i, *distance, *words))
            .collect();
        let params = RetrievalParams::new(max_chunks, threshold, budget);
        let selected = select_candidates(matches, &params);

        prop_assert!(selected.len() <= max_chunks);
        let used: usize = selected.iter().map(|c| c.estimated_tokens).sum();
        prop_assert!(used <= budget);
        for c in &selected {
            prop_assert!(c.similarity_score >= threshold);
            prop_assert!((0.0..=1.0).contains(&c.similarity_score));
        }
        for pair in selected.windows(2) {
            prop_assert!(pair[0].similarity_score >= pair[1].similarity_score);
        }
    }
}

// --- Cache properties ---

proptest! {
    #[test]
    fn cache_memory_never_exceeds_ceiling(
        ops in prop::collection::vec((0u8..40, 0usize..600), 1..120),
        ceiling in 256usize..8192,
        lfu in any::<bool>(),
    ) {
        let policy = if lfu { EvictionPolicy::Lfu } else { EvictionPolicy::Lru };
        let cache: QueryCache<String> = QueryCache::new("prop", ceiling, policy);
        for (key, len) in ops {
            let key = format!("k{key}");
            if len % 7 == 0 {
                let _ = cache.get(&key);
            } else {
                cache.insert(&key, "v".repeat(len), Duration::from_secs(60));
            }
            prop_assert!(cache.memory_usage() <= ceiling);
        }
        prop_assert_eq!(cache.stats().entries, cache.len());
    }

    #[test]
    fn normalize_query_is_idempotent(query in "\\PC{0,80}") {
        let once = normalize_query(&query);
        prop_assert_eq!(normalize_query(&once), once.clone());
        prop_assert!(!once.starts_with(' ') && !once.ends_with(' '));
        prop_assert!(!once.contains("  "));
    }

    #[test]
    fn whitespace_variants_share_a_cache_key(words in prop::collection::vec("[a-z]{1,8}", 1..10)) {
        let tight = words.join(" ");
        let loose = format!("  {}\t", words.join(" \n  "));
        prop_assert_eq!(
            cache_key("answer", &[&normalize_query(&tight)]),
            cache_key("answer", &[&normalize_query(&loose)])
        );
    }
}
