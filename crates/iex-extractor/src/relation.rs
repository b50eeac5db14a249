//! Relation Extraction (RE) module
//!
//! Classifies pairs of already recognized entities. Each candidate pair is
//! rendered as a context window with both spans marked inline:
//!
//! `... [E1]Alice[/E1] met [E2]Bob[/E2] in ...`
//!
//! and scored by a sequence classification model over the relation labels.

use tracing::{debug, warn};

use iex_core::{validate_entities, Entity, IeError, Relation, Result};

use crate::ner::checked_tokens;
use crate::{best_label, PairInput, ReHandle, TextTokenizer, Token};

/// Opens the first entity of a pair
pub const E1_START: &str = "[E1]";
/// Closes the first entity of a pair
pub const E1_END: &str = "[/E1]";
/// Opens the second entity of a pair
pub const E2_START: &str = "[E2]";
/// Closes the second entity of a pair
pub const E2_END: &str = "[/E2]";

// ============================================================================
// Pair Encoding
// ============================================================================

/// Renders entity pairs of one text within a token budget
pub struct PairEncoder<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    tokenizer: &'a dyn TextTokenizer,
    /// Tokens a rendered pair may take, markers included
    limit: usize,
    /// Content tokens available once special and marker tokens are paid for
    budget: usize,
}

impl<'a> PairEncoder<'a> {
    pub fn new(handle: &'a ReHandle, text: &'a str) -> Result<Self> {
        let tokenizer = handle.tokenizer.as_ref();
        let limit = handle.content_budget();

        let mut marker_cost = 0;
        for marker in [E1_START, E1_END, E2_START, E2_END] {
            marker_cost += tokenizer.tokenize(marker)?.len();
        }

        Ok(Self {
            text,
            tokens: checked_tokens(tokenizer, text)?,
            tokenizer,
            limit,
            budget: limit.saturating_sub(marker_cost),
        })
    }

    /// Marked context for a pair, or `None` when the two spans and the
    /// tokens between them do not fit the budget.
    ///
    /// Markers glued to entity text may tokenize longer than they do alone,
    /// so the rendered string is measured again. A context that overflows
    /// falls back to the bare pair before the pair is given up.
    pub fn encode(&self, first: &Entity, second: &Entity) -> Result<Option<String>> {
        let lo = first.start.min(second.start);
        let hi = first.end.max(second.end);

        // Tokens touching [lo, hi)
        let cover_start = self.tokens.partition_point(|t| t.end <= lo);
        let cover_end = self.tokens.partition_point(|t| t.start < hi).max(cover_start);
        let required = cover_end - cover_start;
        if required > self.budget {
            return Ok(None);
        }

        let spare = self.budget - required;
        let marked = self.window(cover_start, cover_end, spare, first, second);
        if self.fits(&marked)? {
            return Ok(Some(marked));
        }
        if spare > 0 {
            let bare = self.window(cover_start, cover_end, 0, first, second);
            if self.fits(&bare)? {
                return Ok(Some(bare));
            }
        }
        Ok(None)
    }

    fn fits(&self, marked: &str) -> Result<bool> {
        Ok(self.tokenizer.tokenize(marked)?.len() <= self.limit)
    }

    /// Render the covered tokens plus up to `spare` context tokens
    fn window(
        &self,
        cover_start: usize,
        cover_end: usize,
        spare: usize,
        first: &Entity,
        second: &Entity,
    ) -> String {
        let lo = first.start.min(second.start);
        let hi = first.end.max(second.end);
        let avail_left = cover_start;
        let avail_right = self.tokens.len() - cover_end;
        let mut left = spare / 2;
        let mut right = spare - left;
        if left > avail_left {
            right += left - avail_left;
            left = avail_left;
        }
        if right > avail_right {
            left = (left + right - avail_right).min(avail_left);
            right = avail_right;
        }

        let window = &self.tokens[cover_start - left..cover_end + right];
        let ctx_start = window.first().map_or(lo, |t| t.start.min(lo));
        let ctx_end = window.last().map_or(hi, |t| t.end.max(hi));

        self.render(ctx_start, ctx_end, first, second)
    }

    fn render(&self, ctx_start: usize, ctx_end: usize, first: &Entity, second: &Entity) -> String {
        // (position, closes, marker); at equal positions closing markers come first
        let mut markers = [
            (first.start, false, E1_START),
            (first.end, true, E1_END),
            (second.start, false, E2_START),
            (second.end, true, E2_END),
        ];
        markers.sort_by_key(|&(pos, closes, _)| (pos, !closes));

        let mut out = String::with_capacity(ctx_end - ctx_start + 18);
        let mut cursor = ctx_start;
        for (pos, _, marker) in markers {
            out.push_str(&self.text[cursor..pos]);
            out.push_str(marker);
            cursor = pos;
        }
        out.push_str(&self.text[cursor..ctx_end]);
        out
    }
}

// ============================================================================
// Relation Predictor
// ============================================================================

/// Classify relations between `entities` found in `text`.
///
/// Pairs are taken once each in entity order (`entity_1` precedes
/// `entity_2`), restricted to the configured type pairs. Predictions of the
/// no-relation label are dropped; the rest get ids `r0, r1, ...` in pair
/// order. Any failed batch fails the whole call.
pub fn predict_relations(
    handle: &ReHandle,
    text: &str,
    entities: &[Entity],
) -> Result<Vec<Relation>> {
    if entities.len() < 2 {
        return Ok(Vec::new());
    }
    validate_entities(text, entities)?;

    let config = &handle.config;
    let encoder = PairEncoder::new(handle, text)?;

    let mut pairs: Vec<(&Entity, &Entity)> = Vec::new();
    let mut inputs: Vec<PairInput> = Vec::new();
    for (i, first) in entities.iter().enumerate() {
        for second in &entities[i + 1..] {
            if !config.allows_pair(&first.entity_type, &second.entity_type) {
                continue;
            }
            match encoder.encode(first, second)? {
                Some(marked) => {
                    pairs.push((first, second));
                    inputs.push(PairInput {
                        text: marked,
                        entity_1_type: first.entity_type.clone(),
                        entity_2_type: second.entity_type.clone(),
                    });
                }
                None => warn!(
                    model = %handle.model_name,
                    entity_1 = %first.entity_id,
                    entity_2 = %second.entity_id,
                    token_length = config.token_length,
                    "Pair context exceeds token budget, skipping"
                ),
            }
        }
    }

    if inputs.is_empty() {
        return Ok(Vec::new());
    }
    debug!(
        model = %handle.model_name,
        pairs = inputs.len(),
        batch_size = config.eval_batch_size,
        "Scoring RE pairs"
    );

    let mut distributions = Vec::with_capacity(inputs.len());
    for batch in inputs.chunks(config.eval_batch_size.max(1)) {
        let scores = handle.model.classify_pairs(batch)?;
        if scores.len() != batch.len() {
            return Err(IeError::Prediction(format!(
                "model returned {} results for a batch of {} pairs",
                scores.len(),
                batch.len()
            )));
        }
        distributions.extend(scores);
    }

    let width = config.label_map.len();
    let no_relation = config.no_relation_label();
    let mut relations = Vec::new();

    for ((first, second), row) in pairs.into_iter().zip(&distributions) {
        let (idx, prob) = best_label(row, width)?;
        let label = config
            .label_map
            .label(idx)
            .ok_or_else(|| IeError::Prediction(format!("label index {idx} out of range")))?;
        if label == no_relation {
            continue;
        }

        relations.push(Relation {
            relation_id: format!("r{}", relations.len()),
            entity_1_id: first.entity_id.clone(),
            entity_1_text: first.entity_text.clone(),
            entity_2_id: second.entity_id.clone(),
            entity_2_text: second.entity_text.clone(),
            relation_type: label.to_string(),
            relation_prob: prob,
        });
    }

    Ok(relations)
}

// ============================================================================
// Tests
// ============================================================================
