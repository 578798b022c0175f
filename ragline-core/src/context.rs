//! Packing retrieved chunks into a bounded prompt context.
//!
//! Candidates are grouped by document. Each group becomes one
//! `[Source N]` section: its best chunk verbatim, the remaining chunks reduced
//! to their most query-relevant sentences as `- ` bullets. Sections are
//! ordered by their best score and added while they fit the token budget.

use crate::chunker::split_sentences;
use crate::tokens::{tokens_for_words, words_for_tokens};
use crate::types::{Citation, RetrievalCandidate};
use serde::Serialize;
use std::collections::HashSet;

/// Context text used when nothing relevant was retrieved.
pub const NO_RELEVANT_INFORMATION: &str = "No relevant information found.";

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "has",
    "have", "how", "i", "in", "is", "it", "its", "of", "on", "or", "that", "the", "their", "there",
    "this", "to", "was", "were", "what", "when", "where", "which", "who", "why", "will", "with",
    "you", "your",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssembledContext {
    pub text: String,
    /// Chunks that made it into `text`, in section order.
    pub sources: Vec<Citation>,
    pub estimated_tokens: usize,
}

impl AssembledContext {
    fn no_relevant_information() -> Self {
        Self {
            text: NO_RELEVANT_INFORMATION.to_string(),
            sources: Vec::new(),
            estimated_tokens: 0,
        }
    }

    /// True when no source made it into the context.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler {
    token_budget: usize,
    max_salient_sentences: usize,
}

impl ContextAssembler {
    pub fn new(token_budget: usize, max_salient_sentences: usize) -> Self {
        Self {
            token_budget,
            max_salient_sentences: max_salient_sentences.max(1),
        }
    }

    pub fn assemble(&self, query: &str, candidates: &[RetrievalCandidate]) -> AssembledContext {
        if candidates.is_empty() {
            return AssembledContext::no_relevant_information();
        }
        let terms = query_terms(query);
        let word_budget = words_for_tokens(self.token_budget);

        let mut sections: Vec<String> = Vec::new();
        let mut sources = Vec::new();
        let mut used_words = 0;

        for group in group_by_document(candidates) {
            let number = sections.len() + 1;
            let section = self.render_section(number, &group, &terms);
            let words = section.split_whitespace().count();

            if used_words + words <= word_budget {
                used_words += words;
                sections.push(section);
                sources.extend(group.iter().map(|c| Citation::from(*c)));
            } else if sections.is_empty() {
                let truncated = truncate_words(&section, word_budget);
                used_words = truncated.split_whitespace().count();
                if used_words == 0 {
                    break;
                }
                sections.push(truncated);
                sources.push(Citation::from(group[0]));
            } else {
                tracing::debug!(
                    doc_id = %group[0].metadata.doc_id,
                    words,
                    remaining = word_budget - used_words,
                    "Dropping context section over budget"
                );
            }
        }

        if sections.is_empty() {
            return AssembledContext::no_relevant_information();
        }
        AssembledContext {
            text: sections.join("\n\n"),
            sources,
            estimated_tokens: tokens_for_words(used_words),
        }
    }

    fn render_section(&self, number: usize, group: &[&RetrievalCandidate], terms: &HashSet<String>) -> String {
        let primary = group[0];
        let mut section = format!(
            "[Source {number}] {} ({})\n{}",
            primary.metadata.title,
            primary.metadata.source,
            primary.text.trim()
        );
        for candidate in &group[1..] {
            for sentence in salient_sentences(&candidate.text, terms, self.max_salient_sentences) {
                section.push_str("\n- ");
                section.push_str(sentence);
            }
        }
        section
    }
}

/// Candidates grouped by `doc_id`, each group sorted best first, groups
/// ordered by their best score.
fn group_by_document(candidates: &[RetrievalCandidate]) -> Vec<Vec<&RetrievalCandidate>> {
    let mut groups: Vec<Vec<&RetrievalCandidate>> = Vec::new();
    for candidate in candidates {
        match groups
            .iter_mut()
            .find(|g| g[0].metadata.doc_id == candidate.metadata.doc_id)
        {
            Some(group) => group.push(candidate),
            None => groups.push(vec![candidate]),
        }
    }
    for group in &mut groups {
        group.sort_by(|a, b| b.similarity_score.total_cmp(&a.similarity_score));
    }
    groups.sort_by(|a, b| b[0].similarity_score.total_cmp(&a[0].similarity_score));
    groups
}

fn normalize_term(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

/// Lower-cased query words with stop words removed.
fn query_terms(query: &str) -> HashSet<String> {
    query
        .split_whitespace()
        .map(normalize_term)
        .filter(|w| !w.is_empty() && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Up to `limit` sentences of `text` sharing the most terms with the query,
/// in document order. Ties go to the earlier sentence; with no overlap at
/// all, the first sentence is used.
fn salient_sentences<'a>(text: &'a str, terms: &HashSet<String>, limit: usize) -> Vec<&'a str> {
    let sentences = split_sentences(text);
    let mut scored: Vec<(usize, usize)> = sentences
        .iter()
        .enumerate()
        .map(|(i, sentence)| {
            let words: HashSet<String> = sentence.split_whitespace().map(normalize_term).collect();
            (i, terms.iter().filter(|t| words.contains(*t)).count())
        })
        .collect();
    if scored.iter().all(|(_, score)| *score == 0) {
        return sentences.into_iter().take(1).collect();
    }
    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut picked: Vec<usize> = scored
        .into_iter()
        .filter(|(_, score)| *score > 0)
        .take(limit)
        .map(|(i, _)| i)
        .collect();
    picked.sort_unstable();
    picked.into_iter().map(|i| sentences[i]).collect()
}

/// The first `max_words` words of `text`, preserving its line structure.
fn truncate_words(text: &str, max_words: usize) -> String {
    let mut out = String::new();
    let mut words = 0;
    for piece in text.split_inclusive(char::is_whitespace) {
        if !piece.trim().is_empty() {
            if words == max_words {
                break;
            }
            words += 1;
        }
        out.push_str(piece);
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::estimate_tokens;
    use crate::types::ChunkMetadata;
    use pretty_assertions::assert_eq;

    fn candidate(doc_id: &str, index: usize, score: f32, text: &str) -> RetrievalCandidate {
        RetrievalCandidate {
            chunk_id: format!("{doc_id}_chunk_{index}"),
            text: text.to_string(),
            metadata: ChunkMetadata {
                title: doc_id.to_uppercase(),
                source: format!("{doc_id}.md"),
                doc_id: doc_id.to_string(),
                chunk_index: index,
                total_chunks: 3,
                content_preview: String::new(),
            },
            similarity_score: score,
            estimated_tokens: estimate_tokens(text),
        }
    }

    #[test]
    fn test_empty_input_yields_literal() {
        let ctx = ContextAssembler::new(2000, 1).assemble("anything", &[]);
        assert_eq!(ctx.text, NO_RELEVANT_INFORMATION);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_groups_by_document_with_bullets() {
        let candidates = vec![
            candidate("pool", 0, 0.9, "The pool bounds active connections."),
            candidate("cache", 0, 0.8, "The cache stores answers."),
            candidate(
                "pool",
                1,
                0.7,
                "Intro text here. Unhealthy connections are probed by the health checker. Unrelated close.",
            ),
        ];
        let ctx = ContextAssembler::new(2000, 1).assemble("how are unhealthy connections probed", &candidates);
        assert_eq!(
            ctx.text,
            "[Source 1] POOL (pool.md)\nThe pool bounds active connections.\n\
             - Unhealthy connections are probed by the health checker.\n\n\
             [Source 2] CACHE (cache.md)\nThe cache stores answers."
        );
        let ids: Vec<&str> = ctx.sources.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["pool_chunk_0", "pool_chunk_1", "cache_chunk_0"]);
        assert_eq!(ctx.estimated_tokens, estimate_tokens(&ctx.text));
    }

    #[test]
    fn test_salient_sentence_falls_back_to_first() {
        let terms = query_terms("quantum chromodynamics");
        assert_eq!(
            salient_sentences("First one. Second one.", &terms, 1),
            vec!["First one."]
        );
    }

    #[test]
    fn test_salient_ties_prefer_earlier() {
        let terms = query_terms("cache");
        assert_eq!(
            salient_sentences("A cache here. Another cache there.", &terms, 1),
            vec!["A cache here."]
        );
    }

    #[test]
    fn test_overflowing_section_is_dropped() {
        let long = vec!["filler"; 200].join(" ");
        let candidates = vec![
            candidate("a", 0, 0.9, "short first section"),
            candidate("b", 0, 0.8, &long),
            candidate("c", 0, 0.7, "short third section"),
        ];
        let ctx = ContextAssembler::new(60, 1).assemble("section", &candidates);
        assert!(ctx.text.contains("[Source 1] A"));
        assert!(ctx.text.contains("[Source 2] C"));
        assert!(!ctx.text.contains("filler"));
        assert!(ctx.estimated_tokens <= 60);
    }

    #[test]
    fn test_first_section_is_truncated_to_budget() {
        let long = vec!["word"; 500].join(" ");
        let ctx = ContextAssembler::new(100, 1).assemble("word", &[candidate("big", 0, 0.9, &long)]);
        assert!(estimate_tokens(&ctx.text) <= 100);
        assert!(ctx.text.starts_with("[Source 1] BIG (big.md)\nword word"));
        assert_eq!(ctx.sources.len(), 1);
    }
}
