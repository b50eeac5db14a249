//! Lexicon models
//!
//! Models stored as plain TOML instead of trained weights:
//! - NER: term dictionary plus regex patterns, emitted as tag distributions
//! - RE: keyword rules over the text between the two marked entities
//!
//! Both plug into the same prediction path as trained models.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use iex_core::model_config::OUTSIDE_LABEL;
use iex_core::{IeError, ModelConfig, Result, Stage, TaggingScheme};

use crate::relation::{E1_END, E1_START, E2_END, E2_START};
use crate::tokenizer::WordTokenizer;
use crate::{
    ModelHandle, NerHandle, PairInput, ReHandle, SequenceClassifier, TokenClassifier, TokenWindow,
};

/// Lexicon file of a NER model
pub const LEXICON_FILE: &str = "lexicon.toml";
/// Rule file of a RE model
pub const PATTERNS_FILE: &str = "patterns.toml";

const TERM_CONFIDENCE: f32 = 0.95;
const ALIAS_CONFIDENCE: f32 = 0.9;

/// Probability the sentinel label gets when nothing matches
const SENTINEL_CONFIDENCE: f32 = 1.0;

/// A configured confidence must outweigh the remainder left on the sentinel
/// label, so it has to lie in (0.5, 1.0]
fn check_confidence(conf: f32) -> std::result::Result<f32, String> {
    if conf > 0.5 && conf <= 1.0 {
        Ok(conf)
    } else {
        Err(format!("confidence {conf} must be above 0.5 and at most 1.0"))
    }
}

// ============================================================================
// Lexicon NER
// ============================================================================

/// Dictionary term with its aliases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LexiconTerm {
    pub term: String,
    pub entity_type: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Regex recognizing an entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LexiconPattern {
    pub pattern: String,
    pub entity_type: String,
    pub confidence: f32,
}

/// Contents of `lexicon.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lexicon {
    #[serde(default)]
    pub terms: Vec<LexiconTerm>,
    #[serde(default)]
    pub patterns: Vec<LexiconPattern>,
}

/// Label indices of one entity type
#[derive(Debug, Clone, Copy)]
struct TypeTags {
    begin: usize,
    inside: usize,
}

/// A lexicon hit in window coordinates
#[derive(Debug, Clone)]
struct Match {
    start: usize,
    end: usize,
    tags: TypeTags,
    conf: f32,
}

/// Token classifier backed by a [`Lexicon`]
pub struct LexiconTagger {
    /// Lowercased needle with its tags and confidence
    needles: Vec<(String, TypeTags, f32)>,
    patterns: Vec<(Regex, TypeTags, f32)>,
    outside: usize,
    width: usize,
}

impl LexiconTagger {
    pub fn new(lexicon: Lexicon, config: &ModelConfig) -> Result<Self> {
        let load_err = |reason: String| IeError::model_load(Stage::Ner, &config.model_name, reason);

        let outside = config
            .label_map
            .index(OUTSIDE_LABEL)
            .ok_or_else(|| load_err(format!("label map has no '{OUTSIDE_LABEL}' label")))?;

        let scheme = config.tagging_scheme();
        let tags_for = |entity_type: &str| -> Result<TypeTags> {
            let lookup = |label: String| {
                config
                    .label_map
                    .index(&label)
                    .ok_or_else(|| load_err(format!("label map has no '{label}' label")))
            };
            match scheme {
                TaggingScheme::Bio => Ok(TypeTags {
                    begin: lookup(format!("B-{entity_type}"))?,
                    inside: lookup(format!("I-{entity_type}"))?,
                }),
                TaggingScheme::Io => {
                    let idx = lookup(entity_type.to_string())?;
                    Ok(TypeTags {
                        begin: idx,
                        inside: idx,
                    })
                }
            }
        };

        let mut needles = Vec::new();
        for entry in &lexicon.terms {
            let tags = tags_for(&entry.entity_type)?;
            needles.push((entry.term.to_ascii_lowercase(), tags, TERM_CONFIDENCE));
            for alias in &entry.aliases {
                needles.push((alias.to_ascii_lowercase(), tags, ALIAS_CONFIDENCE));
            }
        }
        needles.retain(|(needle, _, _)| !needle.is_empty());

        let mut patterns = Vec::new();
        for entry in &lexicon.patterns {
            let regex = Regex::new(&entry.pattern)
                .map_err(|e| load_err(format!("invalid pattern {:?}: {e}", entry.pattern)))?;
            let conf = check_confidence(entry.confidence)
                .map_err(|e| load_err(format!("pattern {:?}: {e}", entry.pattern)))?;
            patterns.push((regex, tags_for(&entry.entity_type)?, conf));
        }

        Ok(Self {
            needles,
            patterns,
            outside,
            width: config.label_map.len(),
        })
    }

    fn find_matches(&self, text: &str) -> Vec<Match> {
        let mut matches = Vec::new();

        // ASCII folding keeps byte offsets aligned with `text`
        let folded = text.to_ascii_lowercase();
        for (needle, tags, conf) in &self.needles {
            for (start, _) in folded.match_indices(needle.as_str()) {
                matches.push(Match {
                    start,
                    end: start + needle.len(),
                    tags: *tags,
                    conf: *conf,
                });
            }
        }

        for (regex, tags, conf) in &self.patterns {
            for found in regex.find_iter(text) {
                if found.start() < found.end() {
                    matches.push(Match {
                        start: found.start(),
                        end: found.end(),
                        tags: *tags,
                        conf: *conf,
                    });
                }
            }
        }

        deduplicate(matches)
    }

    fn row(&self, idx: usize, p: f32) -> Vec<f32> {
        sentinel_row(self.width, idx, self.outside, p)
    }
}

/// Keep the best of overlapping matches, scanning by start position
fn deduplicate(mut matches: Vec<Match>) -> Vec<Match> {
    matches.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then(b.conf.total_cmp(&a.conf))
            .then((b.end - b.start).cmp(&(a.end - a.start)))
    });

    let mut result: Vec<Match> = Vec::new();
    for m in matches {
        let overlaps = result.iter().any(|r| m.start < r.end && r.start < m.end);
        if !overlaps {
            result.push(m);
        }
    }
    result
}

/// Distribution putting `p` on `idx` and the remainder on `sentinel`.
///
/// Every other label gets zero, so `idx` stays the unique maximum for any
/// `p` accepted by [`check_confidence`].
fn sentinel_row(width: usize, idx: usize, sentinel: usize, p: f32) -> Vec<f32> {
    let mut row = vec![0.0; width];
    if idx == sentinel {
        row[idx] = SENTINEL_CONFIDENCE;
    } else {
        row[sentinel] = SENTINEL_CONFIDENCE - p;
        row[idx] = p;
    }
    row
}

impl TokenClassifier for LexiconTagger {
    fn classify_tokens(&self, windows: &[TokenWindow<'_>]) -> Result<Vec<Vec<Vec<f32>>>> {
        let mut out = Vec::with_capacity(windows.len());

        for window in windows {
            let matches = self.find_matches(window.text);
            let mut rows = Vec::with_capacity(window.tokens.len());
            let mut last_match: Option<usize> = None;

            for token in window.tokens {
                let hit = matches
                    .iter()
                    .position(|m| m.start <= token.start && token.end <= m.end);

                let row = match hit {
                    Some(i) => {
                        let m = &matches[i];
                        let tag = if last_match == Some(i) {
                            m.tags.inside
                        } else {
                            m.tags.begin
                        };
                        self.row(tag, m.conf)
                    }
                    None => self.row(self.outside, SENTINEL_CONFIDENCE),
                };
                last_match = hit;
                rows.push(row);
            }
            out.push(rows);
        }

        Ok(out)
    }
}

// ============================================================================
// Keyword RE
// ============================================================================

fn default_rule_confidence() -> f32 {
    0.85
}

/// Relation asserted when both types match and a keyword sits between the entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRule {
    pub head_type: String,
    pub tail_type: String,
    pub relation: String,
    /// Any keyword triggers the rule; no keywords always triggers
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_rule_confidence")]
    pub confidence: f32,
}

/// Contents of `patterns.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationRules {
    #[serde(default)]
    pub rules: Vec<RelationRule>,
}

/// Sequence classifier backed by [`RelationRules`]
pub struct KeywordRelationClassifier {
    /// Rule with its label index and lowercased keywords
    rules: Vec<(RelationRule, usize, Vec<String>)>,
    no_relation: usize,
    width: usize,
}

impl KeywordRelationClassifier {
    pub fn new(rules: RelationRules, config: &ModelConfig) -> Result<Self> {
        let load_err = |reason: String| IeError::model_load(Stage::Re, &config.model_name, reason);
        let index = |label: &str| {
            config
                .label_map
                .index(label)
                .ok_or_else(|| load_err(format!("label map has no '{label}' label")))
        };

        let no_relation = index(config.no_relation_label())?;
        let mut compiled = Vec::with_capacity(rules.rules.len());
        for mut rule in rules.rules {
            let idx = index(&rule.relation)?;
            rule.confidence = check_confidence(rule.confidence)
                .map_err(|e| load_err(format!("rule for '{}': {e}", rule.relation)))?;
            let keywords = rule.keywords.iter().map(|k| k.to_lowercase()).collect();
            compiled.push((rule, idx, keywords));
        }

        Ok(Self {
            rules: compiled,
            no_relation,
            width: config.label_map.len(),
        })
    }

    fn classify(&self, input: &PairInput) -> Vec<f32> {
        let between = text_between_markers(&input.text).to_lowercase();

        let best = self
            .rules
            .iter()
            .filter(|(rule, _, _)| {
                (rule.head_type == input.entity_1_type && rule.tail_type == input.entity_2_type)
                    || (rule.head_type == input.entity_2_type
                        && rule.tail_type == input.entity_1_type)
            })
            .filter(|(_, _, keywords)| {
                keywords.is_empty() || keywords.iter().any(|k| between.contains(k.as_str()))
            })
            .fold(None::<(usize, f32)>, |best, (rule, idx, _)| match best {
                Some((_, conf)) if conf >= rule.confidence => best,
                _ => Some((*idx, rule.confidence)),
            });

        match best {
            Some((idx, conf)) => sentinel_row(self.width, idx, self.no_relation, conf),
            None => sentinel_row(
                self.width,
                self.no_relation,
                self.no_relation,
                SENTINEL_CONFIDENCE,
            ),
        }
    }
}

/// Text between the closing marker of the earlier entity and the opening
/// marker of the later one; empty when the spans touch or nest
fn text_between_markers(marked: &str) -> &str {
    let between = |close: &str, open: &str| {
        let from = marked.find(close)? + close.len();
        let to = marked.find(open)?;
        marked.get(from..to)
    };
    between(E1_END, E2_START)
        .or_else(|| between(E2_END, E1_START))
        .unwrap_or("")
}

impl SequenceClassifier for KeywordRelationClassifier {
    fn classify_pairs(&self, inputs: &[PairInput]) -> Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|input| self.classify(input)).collect())
    }
}

// ============================================================================
// Loading
// ============================================================================

fn read_toml<T: serde::de::DeserializeOwned>(
    path: &Path,
    stage: Stage,
    config: &ModelConfig,
) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        IeError::model_load(stage, &config.model_name, format!("{}: {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        IeError::model_load(stage, &config.model_name, format!("{}: {e}", path.display()))
    })
}

/// Load a lexicon NER model from its weight directory
pub fn load_ner(weight_dir: &Path, config: &ModelConfig) -> Result<NerHandle> {
    let lexicon: Lexicon = read_toml(&weight_dir.join(LEXICON_FILE), Stage::Ner, config)?;
    debug!(
        model = %config.model_name,
        terms = lexicon.terms.len(),
        patterns = lexicon.patterns.len(),
        "Loaded NER lexicon"
    );
    let tagger = LexiconTagger::new(lexicon, config)?;
    Ok(ModelHandle::new(
        config.clone(),
        Box::new(tagger),
        Box::new(WordTokenizer::new()),
    ))
}

/// Load a keyword RE model from its weight directory
pub fn load_re(weight_dir: &Path, config: &ModelConfig) -> Result<ReHandle> {
    let rules: RelationRules = read_toml(&weight_dir.join(PATTERNS_FILE), Stage::Re, config)?;
    debug!(model = %config.model_name, rules = rules.rules.len(), "Loaded RE rules");
    let classifier = KeywordRelationClassifier::new(rules, config)?;
    Ok(ModelHandle::new(
        config.clone(),
        Box::new(classifier),
        Box::new(WordTokenizer::new()),
    ))
}

// ============================================================================
// Tests
// ============================================================================
