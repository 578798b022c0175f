//! Token estimation.
//!
//! Ragline never runs a real tokenizer. Every budget in the pipeline (chunk
//! size, retrieval budget, context budget, reported `tokens_used`) is computed
//! with the same approximation: `tokens ≈ words × 1.3`, rounded down. Swapping
//! in a real tokenizer would change chunk boundaries and retrieval cut-offs,
//! so it must happen here and nowhere else.

/// Estimated tokens per whitespace-separated word.
pub const TOKENS_PER_WORD: f64 = 1.3;

/// Estimate the token count of a piece of text.
pub fn estimate_tokens(text: &str) -> usize {
    tokens_for_words(text.split_whitespace().count())
}

/// Estimated token count of `words` words.
pub fn tokens_for_words(words: usize) -> usize {
    (words as f64 * TOKENS_PER_WORD) as usize
}

/// The largest word count whose estimate still fits in `tokens`.
pub fn words_for_tokens(tokens: usize) -> usize {
    let mut words = (tokens as f64 / TOKENS_PER_WORD) as usize;
    while tokens_for_words(words + 1) <= tokens {
        words += 1;
    }
    while words > 0 && tokens_for_words(words) > tokens {
        words -= 1;
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one"), 1);
        assert_eq!(estimate_tokens("one two three four five six seven eight nine ten"), 13);
        assert_eq!(estimate_tokens("  spaced \n\n out\twords "), 3);
    }

    #[test]
    fn test_words_for_tokens_is_tight() {
        for tokens in [0, 1, 2, 13, 50, 399, 400, 401, 1000] {
            let words = words_for_tokens(tokens);
            assert!(tokens_for_words(words) <= tokens);
            assert!(tokens_for_words(words + 1) > tokens);
        }
        assert_eq!(words_for_tokens(400), 308);
    }
}
