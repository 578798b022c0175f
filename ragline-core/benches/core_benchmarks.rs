use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ragline_core::cache::{cache_key, normalize_query};
use ragline_core::chunker::Chunker;
use ragline_core::monitor::PerformanceMonitor;
use ragline_core::retriever::select_candidates;
use ragline_core::services::{HashEmbedder, VectorMatch, cosine_similarity};
use ragline_core::types::{ChunkMetadata, RetrievalCandidate};
use ragline_core::{ContextAssembler, EvictionPolicy, QueryCache, RetrievalParams};
use std::time::Duration;

fn sample_document(paragraphs: usize) -> String {
    (0..paragraphs)
        .map(|p| {
            format!(
                "Paragraph {p} explains how the connection pool keeps healthy connections ready. \
                 Unhealthy connections are probed in the background and replaced after repeated failures. \
                 Cached answers expire once their time to live has elapsed."
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn metadata(doc_id: &str, index: usize) -> ChunkMetadata {
    ChunkMetadata {
        title: doc_id.to_string(),
        source: format!("{doc_id}.md"),
        doc_id: doc_id.to_string(),
        chunk_index: index,
        total_chunks: 8,
        content_preview: String::new(),
    }
}

fn bench_chunker(c: &mut Criterion) {
    let chunker = Chunker::new(400, 50);
    let small = sample_document(5);
    let large = sample_document(200);

    c.bench_function("chunk_small_document", |b| {
        b.iter(|| chunker.chunk(black_box(&small)))
    });

    c.bench_function("chunk_large_document", |b| {
        b.iter(|| chunker.chunk(black_box(&large)))
    });

    let run_on = "word ".repeat(10_000);
    c.bench_function("chunk_run_on_text", |b| {
        b.iter(|| chunker.chunk(black_box(&run_on)))
    });
}

fn bench_embedding(c: &mut Criterion) {
    let embedder = HashEmbedder::new(384);
    let text = sample_document(1);

    c.bench_function("hash_embed_paragraph", |b| {
        b.iter(|| embedder.embed(black_box(&text)))
    });

    let a = embedder.embed("How are unhealthy connections replaced?");
    let other = embedder.embed(&text);
    c.bench_function("cosine_similarity_384", |b| {
        b.iter(|| cosine_similarity(black_box(&a), black_box(&other)))
    });
}

fn bench_cache_keys(c: &mut Criterion) {
    c.bench_function("normalize_query", |b| {
        b.iter(|| normalize_query(black_box("  How DOES the\tpool   replace unhealthy connections? ")))
    });

    c.bench_function("cache_key_retrieval", |b| {
        b.iter(|| {
            cache_key(
                black_box("retrieval"),
                black_box(&["how does the pool replace unhealthy connections?", "3", "0.3000", "2000"]),
            )
        })
    });
}

fn bench_retrieval(c: &mut Criterion) {
    let text = sample_document(1);
    let matches: Vec<VectorMatch> = (0..30)
        .map(|i| VectorMatch {
            id: format!("doc{}_chunk_{i}", i % 5),
            distance: (i as f32) / 40.0,
            metadata: metadata(&format!("doc{}", i % 5), i),
            text: text.clone(),
        })
        .collect();
    let params = RetrievalParams::new(5, 0.3, 2000);

    c.bench_function("select_candidates_30", |b| {
        b.iter(|| select_candidates(black_box(matches.clone()), black_box(&params)))
    });

    let candidates: Vec<RetrievalCandidate> = select_candidates(matches.clone(), &params);
    let assembler = ContextAssembler::new(2000, 1);
    c.bench_function("context_assemble", |b| {
        b.iter(|| assembler.assemble(black_box("How are unhealthy connections replaced?"), black_box(&candidates)))
    });
}

fn bench_query_cache(c: &mut Criterion) {
    let cache: QueryCache<String> = QueryCache::new("bench", 1024 * 1024, EvictionPolicy::Lru);
    let ttl = Duration::from_secs(300);
    for i in 0..1000 {
        cache.insert(&format!("answer:{i}"), format!("cached answer {i}"), ttl);
    }

    c.bench_function("cache_get_hit", |b| {
        b.iter(|| cache.get(black_box("answer:500")))
    });

    c.bench_function("cache_get_miss", |b| {
        b.iter(|| cache.get(black_box("answer:missing")))
    });

    let mut i = 0u64;
    c.bench_function("cache_insert", |b| {
        b.iter(|| {
            i += 1;
            cache.insert(&format!("fresh:{}", i % 2000), black_box(String::from("value")), ttl);
        })
    });

    let small: QueryCache<String> = QueryCache::new("bench-evict", 16 * 1024, EvictionPolicy::Lfu);
    let mut j = 0u64;
    c.bench_function("cache_insert_with_eviction", |b| {
        b.iter(|| {
            j += 1;
            small.insert(&format!("k{j}"), black_box("x".repeat(256)), ttl);
        })
    });
}

fn bench_monitor(c: &mut Criterion) {
    let monitor = PerformanceMonitor::default();
    for i in 0..1000 {
        monitor.observe("answer.latency_ms", i as f64);
    }

    c.bench_function("monitor_observe", |b| {
        b.iter(|| monitor.observe(black_box("retrieval.latency_ms"), black_box(12.5)))
    });

    c.bench_function("monitor_histogram_summary", |b| {
        b.iter(|| monitor.histogram(black_box("answer.latency_ms")))
    });
}

criterion_group!(
    benches,
    bench_chunker,
    bench_embedding,
    bench_cache_keys,
    bench_retrieval,
    bench_query_cache,
    bench_monitor,
);
criterion_main!(benches);
