//! Token Counting Utility
//!
//! Client-side token estimates, used only until the server reports usage.

pub struct TokenEstimator;

impl TokenEstimator {
    /// Word-split heuristic: one token per whitespace-separated word.
    pub fn estimate_text_tokens(text: &str) -> u32 {
        text.split_whitespace().count() as u32
    }
}

/// Incremental form of [`TokenEstimator::estimate_text_tokens`] for text
/// that arrives in fragments. A word split across two fragments counts once.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunningWordCount {
    words: u32,
    in_word: bool,
}

impl RunningWordCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next fragment and returns the estimate for everything so far.
    pub fn push(&mut self, fragment: &str) -> u32 {
        for c in fragment.chars() {
            if c.is_whitespace() {
                self.in_word = false;
            } else if !self.in_word {
                self.in_word = true;
                self.words += 1;
            }
        }
        self.words
    }

    pub fn total(&self) -> u32 {
        self.words
    }
}
