//! Named Entity Recognition (NER) module
//!
//! Prepares token windows for a token classification model and decodes its
//! per-token label distributions into entity spans:
//! - sentence split, then windows of at most the model's token budget
//! - argmax tag per token, merged into spans by the BIO or IO scheme
//! - overlapping spans resolved by confidence

use tracing::debug;

use iex_core::model_config::OUTSIDE_LABEL;
use iex_core::{Entity, IeError, ModelConfig, Result, TaggingScheme};

use crate::{best_label, NerHandle, TextTokenizer, Token, TokenWindow};

// ============================================================================
// Windows
// ============================================================================

/// A run of tokens classified together
#[derive(Debug, Clone)]
struct Window {
    /// Byte offset of the window in the source text
    offset: usize,
    end: usize,
    /// Offsets relative to `offset`
    tokens: Vec<Token>,
}

impl Window {
    fn as_input<'a>(&'a self, text: &'a str) -> TokenWindow<'a> {
        TokenWindow {
            text: &text[self.offset..self.end],
            tokens: &self.tokens,
        }
    }
}

/// Byte ranges of the sentences in `text`.
///
/// A sentence ends at a newline or at `.`, `!` or `?` followed by
/// whitespace. Blank ranges are dropped.
pub fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '\n' => true,
            '.' | '!' | '?' => chars.peek().is_some_and(|&(_, next)| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let end = i + c.len_utf8();
            spans.push((start, end));
            start = end;
        }
    }
    if start < text.len() {
        spans.push((start, text.len()));
    }

    spans.retain(|&(s, e)| !text[s..e].trim().is_empty());
    spans
}

/// Tokenize `text` and cut it into windows of at most `budget` tokens
fn build_windows(tokenizer: &dyn TextTokenizer, text: &str, budget: usize) -> Result<Vec<Window>> {
    let budget = budget.max(1);
    let mut windows = Vec::new();

    for (s_start, s_end) in sentence_spans(text) {
        let sentence = &text[s_start..s_end];
        let tokens = checked_tokens(tokenizer, sentence)?;

        for chunk in tokens.chunks(budget) {
            let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
                continue;
            };
            let offset = s_start + first.start;
            windows.push(Window {
                offset,
                end: s_start + last.end,
                tokens: chunk
                    .iter()
                    .map(|t| Token {
                        id: t.id,
                        start: s_start + t.start - offset,
                        end: s_start + t.end - offset,
                    })
                    .collect(),
            });
        }
    }

    Ok(windows)
}

/// Tokenize and reject offsets that would slice `text` incorrectly
pub(crate) fn checked_tokens(tokenizer: &dyn TextTokenizer, text: &str) -> Result<Vec<Token>> {
    let tokens = tokenizer.tokenize(text)?;
    let mut previous_start = 0;

    for token in &tokens {
        let in_range = token.start < token.end && token.end <= text.len();
        if !in_range
            || token.start < previous_start
            || !text.is_char_boundary(token.start)
            || !text.is_char_boundary(token.end)
        {
            return Err(IeError::Prediction(format!(
                "tokenizer produced invalid offsets [{}, {}) for text of length {}",
                token.start,
                token.end,
                text.len()
            )));
        }
        previous_start = token.start;
    }

    Ok(tokens)
}

// ============================================================================
// Decoding
// ============================================================================

/// Candidate entity span in source text coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub entity_type: String,
    pub conf: f32,
}

impl Span {
    fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn len(&self) -> usize {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag<'a> {
    Outside,
    Begin(&'a str),
    Inside(&'a str),
}

fn parse_tag(label: &str, scheme: TaggingScheme) -> Tag<'_> {
    if label == OUTSIDE_LABEL {
        return Tag::Outside;
    }
    if let Some(kind) = label.strip_prefix("B-") {
        return Tag::Begin(kind);
    }
    if let Some(kind) = label.strip_prefix("I-") {
        return Tag::Inside(kind);
    }
    match scheme {
        TaggingScheme::Bio => Tag::Begin(label),
        TaggingScheme::Io => Tag::Inside(label),
    }
}

/// Span under construction: token range, type and summed probability
struct OpenSpan<'a> {
    first: usize,
    last: usize,
    kind: &'a str,
    total: f32,
}

/// Merge per-token predictions of one window into spans
fn decode_window(window: &Window, rows: &[Vec<f32>], config: &ModelConfig) -> Result<Vec<Span>> {
    if rows.len() != window.tokens.len() {
        return Err(IeError::Prediction(format!(
            "model returned {} token rows for a window of {} tokens",
            rows.len(),
            window.tokens.len()
        )));
    }

    let scheme = config.tagging_scheme();
    let width = config.label_map.len();
    let mut spans = Vec::new();
    let mut open: Option<OpenSpan<'_>> = None;

    let close = |open: OpenSpan<'_>, spans: &mut Vec<Span>| {
        let count = (open.last - open.first + 1) as f32;
        spans.push(Span {
            start: window.offset + window.tokens[open.first].start,
            end: window.offset + window.tokens[open.last].end,
            entity_type: open.kind.to_string(),
            conf: (open.total / count).clamp(0.0, 1.0),
        });
    };

    for (i, row) in rows.iter().enumerate() {
        let (idx, prob) = best_label(row, width)?;
        let label = config.label_map.label(idx).unwrap_or(OUTSIDE_LABEL);

        match parse_tag(label, scheme) {
            Tag::Outside => {
                if let Some(span) = open.take() {
                    close(span, &mut spans);
                }
            }
            Tag::Inside(kind) if open.as_ref().is_some_and(|s| s.kind == kind) => {
                if let Some(span) = open.as_mut() {
                    span.last = i;
                    span.total += prob;
                }
            }
            Tag::Begin(kind) | Tag::Inside(kind) => {
                if let Some(span) = open.take() {
                    close(span, &mut spans);
                }
                open = Some(OpenSpan {
                    first: i,
                    last: i,
                    kind,
                    total: prob,
                });
            }
        }
    }
    if let Some(span) = open.take() {
        close(span, &mut spans);
    }

    Ok(spans)
}

/// Drop spans overlapping a better one.
///
/// Higher confidence wins; ties go to the earlier start, then the shorter
/// span. The result is ordered by start.
pub fn resolve_overlaps(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_by(|a, b| {
        b.conf
            .total_cmp(&a.conf)
            .then(a.start.cmp(&b.start))
            .then(a.len().cmp(&b.len()))
    });

    let mut kept: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        if !kept.iter().any(|k| k.overlaps(&span)) {
            kept.push(span);
        }
    }

    kept.sort_by_key(|s| (s.start, s.end));
    kept
}

// ============================================================================
// Entity Predictor
// ============================================================================

/// Recognize entities in `text` with a loaded NER model.
///
/// Entities come back ordered by start with ids `e0, e1, ...`. Malformed
/// model output fails the whole call.
pub fn predict_entities(handle: &NerHandle, text: &str) -> Result<Vec<Entity>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let config = &handle.config;
    let windows = build_windows(handle.tokenizer.as_ref(), text, handle.content_budget())?;
    debug!(
        model = %handle.model_name,
        windows = windows.len(),
        batch_size = config.eval_batch_size,
        "Scoring NER windows"
    );

    let mut spans = Vec::new();
    for batch in windows.chunks(config.eval_batch_size.max(1)) {
        let inputs: Vec<TokenWindow<'_>> = batch.iter().map(|w| w.as_input(text)).collect();
        let scores = handle.model.classify_tokens(&inputs)?;

        if scores.len() != batch.len() {
            return Err(IeError::Prediction(format!(
                "model returned {} results for a batch of {} windows",
                scores.len(),
                batch.len()
            )));
        }
        for (window, rows) in batch.iter().zip(&scores) {
            spans.extend(decode_window(window, rows, config)?);
        }
    }

    let entities = resolve_overlaps(spans)
        .into_iter()
        .enumerate()
        .map(|(i, span)| Entity {
            entity_id: format!("e{i}"),
            entity_text: text[span.start..span.end].to_string(),
            entity_type: span.entity_type,
            start: span.start,
            end: span.end,
            conf: span.conf,
        })
        .collect();

    Ok(entities)
}

// ============================================================================
// Tests
// ============================================================================
