//! Per-model configuration
//!
//! Every model directory in the registry carries a `config.toml` describing
//! its label vocabulary and inference limits. The file is parsed into an
//! explicit [`ModelConfig`]; missing fields fail at load time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, IeError, Result, Stage};

/// Tag for tokens outside any entity
pub const OUTSIDE_LABEL: &str = "O";

/// Sentinel relation label used when a model does not name one
pub const DEFAULT_NO_RELATION_LABEL: &str = "no_relation";

// ============================================================================
// Label Map
// ============================================================================

/// Bidirectional mapping between labels and model output indices.
///
/// Indices are always contiguous from zero, so a model output row of width
/// `len()` covers every label exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, usize>", into = "BTreeMap<String, usize>")]
pub struct LabelMap {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl LabelMap {
    /// Build a label map where each label's index is its position
    pub fn new<I, S>(labels: I) -> std::result::Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            if index.insert(label.clone(), i).is_some() {
                return Err(format!("duplicate label: {label}"));
            }
        }
        Ok(Self { labels, index })
    }

    /// Label at an output index
    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// Output index of a label
    pub fn index(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    /// Labels in index order
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl TryFrom<BTreeMap<String, usize>> for LabelMap {
    type Error = String;

    fn try_from(map: BTreeMap<String, usize>) -> std::result::Result<Self, Self::Error> {
        let mut slots: Vec<Option<String>> = vec![None; map.len()];
        for (label, idx) in map {
            let slot = slots.get_mut(idx).ok_or_else(|| {
                format!("label {label} has index {idx}, indices must be contiguous from 0")
            })?;
            if let Some(existing) = slot {
                return Err(format!("labels {existing} and {label} share index {idx}"));
            }
            *slot = Some(label);
        }
        // Every slot is filled: map.len() distinct indices all below map.len()
        Self::new(slots.into_iter().flatten())
    }
}

impl From<LabelMap> for BTreeMap<String, usize> {
    fn from(map: LabelMap) -> Self {
        map.index.into_iter().collect()
    }
}

// ============================================================================
// Model Config
// ============================================================================

/// Token tagging convention used by a NER model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaggingScheme {
    /// `B-X` opens a span, `I-X` continues it
    #[serde(rename = "BIO")]
    Bio,
    /// Every token of a span carries the bare type `X`
    #[serde(rename = "IO")]
    Io,
}

/// How the registry loader builds a model from its artifacts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    /// ONNX graph plus a HuggingFace `tokenizer.json`
    #[default]
    Onnx,
    /// Dictionary/regex tagger (NER) or keyword rules (RE)
    Lexicon,
}

/// Pair of entity types a relation model may be asked about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityTypePair(pub String, pub String);

impl EntityTypePair {
    pub fn new(first: impl Into<String>, second: impl Into<String>) -> Self {
        Self(first.into(), second.into())
    }

    /// Whether the pair matches the two types in either orientation
    pub fn matches(&self, a: &str, b: &str) -> bool {
        (self.0 == a && self.1 == b) || (self.0 == b && self.1 == a)
    }
}

/// Configuration of one NER or RE model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Registry key; a change triggers a model swap
    pub model_name: String,

    /// Entity types (NER) or relation types (RE) the model can produce
    pub categories: Vec<String>,

    /// Model output index for every tag or relation label
    pub label_map: LabelMap,

    /// Maximum sequence length in tokens, special tokens included
    pub token_length: usize,

    /// Number of sequences scored per inference call
    pub eval_batch_size: usize,

    /// Entity type pairs the RE model is asked about; all pairs when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub possible_rel: Option<Vec<EntityTypePair>>,

    /// Tagging scheme of a NER model; inferred from the labels when absent
    #[serde(rename = "BIO_mode", default, skip_serializing_if = "Option::is_none")]
    pub bio_mode: Option<TaggingScheme>,

    /// RE label meaning "no relation"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_relation_label: Option<String>,

    #[serde(default)]
    pub format: ModelFormat,
}

impl ModelConfig {
    /// Parse a config from TOML text
    pub fn from_toml_str(content: &str, path: &Path) -> std::result::Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load a config from a TOML file
    pub fn from_file(path: &Path) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Tagging scheme, inferring BIO when any label carries a `B-` prefix
    pub fn tagging_scheme(&self) -> TaggingScheme {
        self.bio_mode.unwrap_or_else(|| {
            if self.label_map.labels().iter().any(|l| l.starts_with("B-")) {
                TaggingScheme::Bio
            } else {
                TaggingScheme::Io
            }
        })
    }

    /// Label whose prediction means the pair is unrelated
    pub fn no_relation_label(&self) -> &str {
        self.no_relation_label
            .as_deref()
            .unwrap_or(DEFAULT_NO_RELATION_LABEL)
    }

    /// Whether a pair of entity types may be sent to the RE model
    pub fn allows_pair(&self, a: &str, b: &str) -> bool {
        match &self.possible_rel {
            None => true,
            Some(pairs) => pairs.iter().any(|p| p.matches(a, b)),
        }
    }

    /// Check the config is usable for a stage before any model is touched
    pub fn validate(&self, stage: Stage) -> Result<()> {
        let invalid = |msg: String| {
            Err(IeError::InvalidInput(format!(
                "{stage} model '{}': {msg}",
                self.model_name
            )))
        };

        if self.model_name.trim().is_empty() {
            return invalid("model_name is empty".to_string());
        }
        if self.token_length == 0 {
            return invalid("token_length must be positive".to_string());
        }
        if self.eval_batch_size == 0 {
            return invalid("eval_batch_size must be positive".to_string());
        }
        if self.label_map.is_empty() {
            return invalid("label_map is empty".to_string());
        }

        let mut seen = HashSet::with_capacity(self.categories.len());
        for category in &self.categories {
            if !seen.insert(category.as_str()) {
                return invalid(format!("duplicate category {category}"));
            }

            let known = match stage {
                Stage::Ner => {
                    self.label_map.contains(category)
                        || self.label_map.contains(&format!("B-{category}"))
                        || self.label_map.contains(&format!("I-{category}"))
                }
                Stage::Re => self.label_map.contains(category),
            };
            if !known {
                return invalid(format!("category {category} is not in the label vocabulary"));
            }
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const NER_TOML: &str = r#"
        model_name = "conll-bio"
        categories = ["PERSON", "LOCATION"]
        token_length = 128
        eval_batch_size = 8
        BIO_mode = "BIO"

        [label_map]
        O = 0
        "B-PERSON" = 1
        "I-PERSON" = 2
        "B-LOCATION" = 3
        "I-LOCATION" = 4
    "#;

    const RE_TOML: &str = r#"
        model_name = "people-re"
        categories = ["met", "lives_in"]
        token_length = 64
        eval_batch_size = 4
        possible_rel = [["PERSON", "PERSON"], ["PERSON", "LOCATION"]]
        format = "lexicon"

        [label_map]
        no_relation = 0
        met = 1
        lives_in = 2
    "#;

    fn parse(content: &str) -> std::result::Result<ModelConfig, ConfigError> {
        ModelConfig::from_toml_str(content, Path::new("config.toml"))
    }

    #[test]
    fn test_parse_ner_config() {
        let config = parse(NER_TOML).unwrap();
        assert_eq!(config.model_name, "conll-bio");
        assert_eq!(config.label_map.len(), 5);
        assert_eq!(config.label_map.index("B-LOCATION"), Some(3));
        assert_eq!(config.label_map.label(2), Some("I-PERSON"));
        assert_eq!(config.tagging_scheme(), TaggingScheme::Bio);
        assert_eq!(config.format, ModelFormat::Onnx);
        assert!(config.validate(Stage::Ner).is_ok());
    }

    #[test]
    fn test_parse_re_config() {
        let config = parse(RE_TOML).unwrap();
        assert_eq!(config.format, ModelFormat::Lexicon);
        assert_eq!(config.no_relation_label(), "no_relation");
        assert!(config.allows_pair("PERSON", "PERSON"));
        assert!(config.allows_pair("LOCATION", "PERSON"));
        assert!(!config.allows_pair("LOCATION", "LOCATION"));
        assert!(config.validate(Stage::Re).is_ok());
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let content = NER_TOML.replace("token_length = 128", "");
        let err = parse(&content).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains("token_length"));
    }

    #[test]
    fn test_label_map_must_be_contiguous() {
        let content = NER_TOML.replace("\"I-LOCATION\" = 4", "\"I-LOCATION\" = 7");
        assert!(parse(&content).is_err());

        let content = NER_TOML.replace("\"I-LOCATION\" = 4", "\"I-LOCATION\" = 3");
        assert!(parse(&content).is_err());
    }

    #[test]
    fn test_tagging_scheme_inferred_from_labels() {
        let mut config = parse(NER_TOML).unwrap();
        config.bio_mode = None;
        assert_eq!(config.tagging_scheme(), TaggingScheme::Bio);

        config.label_map = LabelMap::new(["O", "PERSON", "LOCATION"]).unwrap();
        assert_eq!(config.tagging_scheme(), TaggingScheme::Io);
        assert!(config.validate(Stage::Ner).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_category() {
        let mut config = parse(RE_TOML).unwrap();
        config.categories.push("born_in".to_string());
        let err = config.validate(Stage::Re).unwrap_err();
        assert!(matches!(err, IeError::InvalidInput(_)));
        assert!(err.to_string().contains("born_in"));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = parse(RE_TOML).unwrap();
        config.eval_batch_size = 0;
        assert!(config.validate(Stage::Re).is_err());

        let mut config = parse(RE_TOML).unwrap();
        config.token_length = 0;
        assert!(config.validate(Stage::Re).is_err());
    }

    #[test]
    fn test_label_map_rejects_duplicates() {
        assert!(LabelMap::new(["O", "O"]).is_err());
    }
}
