//! Word-level tokenizer
//!
//! Used by lexicon models, which have no subword vocabulary. Tokens are runs
//! of alphanumeric characters or single punctuation characters.

use crate::{Result, TextTokenizer, Token};

/// Splits text on whitespace and punctuation
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenizer;

impl WordTokenizer {
    pub fn new() -> Self {
        Self
    }
}

impl TextTokenizer for WordTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        let mut word_start: Option<usize> = None;

        for (i, c) in text.char_indices() {
            if c.is_alphanumeric() || c == '_' {
                word_start.get_or_insert(i);
                continue;
            }

            if let Some(start) = word_start.take() {
                tokens.push(Token { id: 0, start, end: i });
            }
            if !c.is_whitespace() {
                tokens.push(Token {
                    id: 0,
                    start: i,
                    end: i + c.len_utf8(),
                });
            }
        }

        if let Some(start) = word_start {
            tokens.push(Token {
                id: 0,
                start,
                end: text.len(),
            });
        }

        Ok(tokens)
    }
}
