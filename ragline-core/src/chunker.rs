//! Paragraph-boundary document chunking with word overlap.
//!
//! Paragraphs (blank-line separated) are packed into chunks while the token
//! estimate stays within `chunk_size_tokens`. A paragraph that is too large on
//! its own is re-packed sentence by sentence, and a sentence that is still too
//! large is cut into word windows. Finally every chunk after the first is
//! prefixed with the last `overlap_tokens` words of its predecessor.

use crate::tokens::{estimate_tokens, tokens_for_words, words_for_tokens};
use crate::types::{ChunkMetadata, DocumentChunk, DocumentInput};
use regex::Regex;
use std::sync::LazyLock;

/// Texts shorter than this are never split.
pub const MIN_CHUNKABLE_CHARS: usize = 100;

/// Length of `ChunkMetadata::content_preview`, in characters.
pub const PREVIEW_CHARS: usize = 200;

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t\r]*\n").expect("paragraph regex is valid"));

/// Splits documents into overlapping chunks.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size_tokens: usize,
    overlap_tokens: usize,
}

impl Chunker {
    pub fn new(chunk_size_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            chunk_size_tokens,
            overlap_tokens,
        }
    }

    pub fn chunk_size_tokens(&self) -> usize {
        self.chunk_size_tokens
    }

    pub fn overlap_tokens(&self) -> usize {
        self.overlap_tokens
    }

    /// Split `text` into ordered chunk texts. Always returns at least one chunk.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        chunk(text, self.chunk_size_tokens, self.overlap_tokens)
    }

    /// Chunk a document into [`DocumentChunk`]s with contiguous indexes.
    ///
    /// Embeddings are left empty; ingestion fills them in.
    pub fn chunk_document(&self, doc: &DocumentInput) -> Vec<DocumentChunk> {
        let texts = self.chunk(&doc.text);
        let total_chunks = texts.len();
        texts
            .into_iter()
            .enumerate()
            .map(|(chunk_index, text)| DocumentChunk {
                id: DocumentChunk::chunk_id(&doc.doc_id, chunk_index),
                metadata: ChunkMetadata {
                    title: doc.title.clone(),
                    source: doc.source.clone(),
                    doc_id: doc.doc_id.clone(),
                    chunk_index,
                    total_chunks,
                    content_preview: preview(&text),
                },
                text,
                embedding: Vec::new(),
            })
            .collect()
    }
}

/// Split `text` into chunks of at most `chunk_size_tokens` (before overlap).
pub fn chunk(text: &str, chunk_size_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.chars().count() < MIN_CHUNKABLE_CHARS {
        return vec![trimmed.to_string()];
    }

    let limit = chunk_size_tokens.max(1);
    let mut chunks = Vec::new();
    let mut buffer = Accumulator::new(limit, "\n\n");

    for paragraph in split_paragraphs(trimmed) {
        if estimate_tokens(paragraph) > limit {
            buffer.flush_into(&mut chunks);
            chunks.extend(split_oversized_paragraph(paragraph, limit));
        } else {
            buffer.push(paragraph, &mut chunks);
        }
    }
    buffer.flush_into(&mut chunks);

    if chunks.is_empty() {
        chunks.push(trimmed.to_string());
    }
    apply_overlap(chunks, overlap_tokens)
}

/// Packs text pieces into chunks while their combined estimate fits the limit.
struct Accumulator<'a> {
    parts: Vec<&'a str>,
    words: usize,
    limit: usize,
    separator: &'static str,
}

impl<'a> Accumulator<'a> {
    fn new(limit: usize, separator: &'static str) -> Self {
        Self {
            parts: Vec::new(),
            words: 0,
            limit,
            separator,
        }
    }

    fn push(&mut self, piece: &'a str, out: &mut Vec<String>) {
        let words = piece.split_whitespace().count();
        if !self.parts.is_empty() && tokens_for_words(self.words + words) > self.limit {
            self.flush_into(out);
        }
        self.parts.push(piece);
        self.words += words;
    }

    fn flush_into(&mut self, out: &mut Vec<String>) {
        if !self.parts.is_empty() {
            out.push(self.parts.join(self.separator));
            self.parts.clear();
            self.words = 0;
        }
    }
}

fn split_paragraphs(text: &str) -> Vec<&str> {
    PARAGRAPH_BREAK
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Split after `.`, `!` or `?` when followed by whitespace.
pub(crate) fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?')
            && let Some(&(next_idx, next)) = chars.peek()
            && next.is_whitespace()
        {
            let sentence = text[start..idx + c.len_utf8()].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = next_idx;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn split_oversized_paragraph(paragraph: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buffer = Accumulator::new(limit, " ");

    for sentence in split_sentences(paragraph) {
        if estimate_tokens(sentence) > limit {
            buffer.flush_into(&mut chunks);
            chunks.extend(split_words(sentence, limit));
        } else {
            buffer.push(sentence, &mut chunks);
        }
    }
    buffer.flush_into(&mut chunks);
    chunks
}

/// Last resort for run-on sentences: fixed word windows.
fn split_words(text: &str, limit: usize) -> Vec<String> {
    let window = words_for_tokens(limit).max(1);
    let words: Vec<&str> = text.split_whitespace().collect();
    words.chunks(window).map(|w| w.join(" ")).collect()
}

fn apply_overlap(chunks: Vec<String>, overlap_words: usize) -> Vec<String> {
    if overlap_words == 0 || chunks.len() < 2 {
        return chunks;
    }

    let mut result = Vec::with_capacity(chunks.len());
    result.push(chunks[0].clone());
    for pair in chunks.windows(2) {
        let previous: Vec<&str> = pair[0].split_whitespace().collect();
        let take = overlap_words.min(previous.len());
        let tail = previous[previous.len() - take..].join(" ");
        result.push(format!("{tail} {}", pair[1]));
    }
    result
}

fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize, tag: &str) -> String {
        (0..n)
            .map(|i| format!("{tag}{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunks = chunk("  A short note about caching.  ", 400, 50);
        assert_eq!(chunks, vec!["A short note about caching.".to_string()]);
    }

    #[test]
    fn test_empty_text_still_yields_one_chunk() {
        assert_eq!(chunk("", 400, 50), vec![String::new()]);
        assert_eq!(chunk("\n\n\n", 10, 2), vec![String::new()]);
    }

    #[test]
    fn test_paragraphs_packed_within_budget() {
        // Three 100-word paragraphs = 130 tokens each; 300 tokens fits two.
        let text = [words(100, "a"), words(100, "b"), words(100, "c")].join("\n\n");
        let chunks = chunk(&text, 300, 0);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("a0"));
        assert!(chunks[0].contains("\n\nb0"));
        assert!(chunks[1].starts_with("c0"));
        for c in &chunks {
            assert!(estimate_tokens(c) <= 300);
        }
    }

    #[test]
    fn test_oversized_paragraph_is_split_by_sentence() {
        let sentences: Vec<String> = (0..10).map(|i| format!("{}.", words(20, &format!("s{i}w")))).collect();
        let paragraph = sentences.join(" ");
        // 200 words = 260 tokens; limit 60 tokens = 46 words → two sentences per chunk.
        let chunks = chunk(&paragraph, 60, 0);
        assert_eq!(chunks.len(), 5);
        assert!(chunks[0].starts_with("s0w0"));
        assert!(chunks[0].ends_with("s1w19."));
        for c in &chunks {
            assert!(estimate_tokens(c) <= 60);
        }
    }

    #[test]
    fn test_run_on_sentence_falls_back_to_word_windows() {
        let text = words(500, "w");
        let chunks = chunk(&text, 100, 0);
        assert!(chunks.len() >= 6);
        for c in &chunks {
            assert!(estimate_tokens(c) <= 100);
        }
        let rejoined: Vec<&str> = chunks.iter().flat_map(|c| c.split_whitespace()).collect();
        assert_eq!(rejoined.len(), 500);
    }

    #[test]
    fn test_overlap_prefixes_previous_tail() {
        let text = [words(100, "a"), words(100, "b"), words(100, "c")].join("\n\n");
        let chunks = chunk(&text, 140, 5);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[1].starts_with("a95 a96 a97 a98 a99 b0"));
        assert!(chunks[2].starts_with("b95 b96 b97 b98 b99 c0"));
    }

    #[test]
    fn test_overlap_larger_than_previous_chunk_takes_everything() {
        let text = format!("{}\n\n{}", words(3, "x"), words(120, "y"));
        let chunks = chunk(&text, 10, 50);
        assert!(chunks[1].starts_with("x0 x1 x2 y0"));
    }

    #[test]
    fn test_thousand_word_document_scenario() {
        // Ten 100-word paragraphs, 400-token chunks (three paragraphs each)
        let text = (0..10)
            .map(|p| words(100, &format!("p{p}w")))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunker = Chunker::new(400, 50);
        let chunks = chunker.chunk(&text);

        assert_eq!(chunks.len(), 4);
        for pair in chunks.windows(2) {
            let prev: Vec<&str> = pair[0].split_whitespace().collect();
            let next: Vec<&str> = pair[1].split_whitespace().collect();
            assert_eq!(&next[..50], &prev[prev.len() - 50..]);
        }
        // Budget applies to the chunk body, before the overlap prefix.
        for c in chunks.iter().skip(1) {
            let body: Vec<&str> = c.split_whitespace().skip(50).collect();
            assert!(tokens_for_words(body.len()) <= 400);
        }
    }

    #[test]
    fn test_chunk_document_metadata() {
        let text = [words(100, "a"), words(100, "b")].join("\n\n");
        let doc = DocumentInput::new("handbook", text)
            .with_title("Employee Handbook")
            .with_source("docs/handbook.md");
        let chunks = Chunker::new(140, 10).chunk_document(&doc);

        assert_eq!(chunks.len(), 2);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.id, format!("handbook_chunk_{i}"));
            assert_eq!(c.metadata.chunk_index, i);
            assert_eq!(c.metadata.total_chunks, 2);
            assert_eq!(c.metadata.doc_id, "handbook");
            assert_eq!(c.metadata.title, "Employee Handbook");
            assert!(c.embedding.is_empty());
            assert!(c.metadata.content_preview.ends_with("..."));
            assert_eq!(c.metadata.content_preview.chars().count(), PREVIEW_CHARS + 3);
        }
    }

    #[test]
    fn test_split_sentences() {
        let s = split_sentences("First one. Second?  Third!\nFourth without end");
        assert_eq!(s, vec!["First one.", "Second?", "Third!", "Fourth without end"]);
        assert_eq!(split_sentences("v1.2 is out. Yes"), vec!["v1.2 is out.", "Yes"]);
    }

    #[test]
    fn test_deterministic() {
        let text = (0..7).map(|p| words(80, &format!("d{p}"))).collect::<Vec<_>>().join("\n\n");
        assert_eq!(chunk(&text, 200, 20), chunk(&text, 200, 20));
    }
}
