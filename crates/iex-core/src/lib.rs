//! iex Core - Document model, annotations and shared types
//!
//! This crate defines the data that flows between the two extraction stages:
//! - Documents holding one immutable text and its annotations
//! - Entities (NER output) and Relations (RE output)
//! - Per-model configuration read from the model registry
//! - Common error types

pub mod config;
pub mod model_config;

pub use config::{AppConfig, ConfigError, LogFormat, LoggingConfig};
pub use model_config::{EntityTypePair, LabelMap, ModelConfig, ModelFormat, TaggingScheme};

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for extraction operations
#[derive(Error, Debug)]
pub enum IeError {
    #[error("Failed to load {stage} model '{model_name}': {reason}")]
    ModelLoad {
        stage: Stage,
        model_name: String,
        reason: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Prediction failed: {0}")]
    Prediction(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl IeError {
    /// Build a model load error for a stage/model pair
    pub fn model_load(stage: Stage, model_name: &str, reason: impl std::fmt::Display) -> Self {
        Self::ModelLoad {
            stage,
            model_name: model_name.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IeError>;

// ============================================================================
// Stages
// ============================================================================

/// Extraction stage a model belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "NER")]
    Ner,
    #[serde(rename = "RE")]
    Re,
}

impl Stage {
    /// Directory name used by the model registry
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ner => "NER",
            Self::Re => "RE",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = IeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ner" => Ok(Self::Ner),
            "re" => Ok(Self::Re),
            _ => Err(IeError::InvalidInput(format!("unknown stage: {s}"))),
        }
    }
}

// ============================================================================
// Annotations
// ============================================================================

/// A typed span of the document text, produced by the NER stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub entity_type: String,
    pub entity_text: String,
    /// Byte offset of the first character
    pub start: usize,
    /// Byte offset one past the last character
    pub end: usize,
    pub conf: f32,
}

impl Entity {
    /// Whether the two spans share at least one byte
    pub fn overlaps(&self, other: &Entity) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Span length in bytes
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A typed link between two entities of the same document, produced by the RE stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub relation_id: String,
    pub entity_1_id: String,
    pub entity_1_text: String,
    pub entity_2_id: String,
    pub entity_2_text: String,
    pub relation_type: String,
    pub relation_prob: f32,
}

/// Check that every entity is a consistent span of `text`.
///
/// Offsets must lie on char boundaries with `start < end <= text.len()`,
/// `entity_text` must equal the slice they cover, and ids must be unique.
pub fn validate_entities(text: &str, entities: &[Entity]) -> Result<()> {
    let mut seen = HashSet::with_capacity(entities.len());

    for entity in entities {
        if entity.start >= entity.end || entity.end > text.len() {
            return Err(IeError::InvalidInput(format!(
                "entity {} has span [{}, {}) outside text of length {}",
                entity.entity_id,
                entity.start,
                entity.end,
                text.len()
            )));
        }

        let Some(slice) = text.get(entity.start..entity.end) else {
            return Err(IeError::InvalidInput(format!(
                "entity {} span [{}, {}) is not on a character boundary",
                entity.entity_id, entity.start, entity.end
            )));
        };

        if slice != entity.entity_text {
            return Err(IeError::InvalidInput(format!(
                "entity {} text {:?} does not match text[{}..{}] = {:?}",
                entity.entity_id, entity.entity_text, entity.start, entity.end, slice
            )));
        }

        if !seen.insert(entity.entity_id.as_str()) {
            return Err(IeError::InvalidInput(format!(
                "duplicate entity id: {}",
                entity.entity_id
            )));
        }
    }

    Ok(())
}

// ============================================================================
// Document
// ============================================================================

/// One input text together with the annotations discovered in it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    doc_id: String,
    text: String,
    #[serde(default)]
    entities: Vec<Entity>,
    #[serde(default)]
    relations: Vec<Relation>,
}

impl Document {
    /// Create an unannotated document
    pub fn new(doc_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            text: text.into(),
            entities: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Create an unannotated document with a random id
    pub fn with_random_id(text: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), text)
    }

    /// Parse a document from its JSON form, validating the annotations
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: Document = serde_json::from_str(json)
            .map_err(|e| IeError::InvalidInput(format!("malformed document JSON: {e}")))?;
        validate_entities(&doc.text, &doc.entities)?;
        doc.check_relations(&doc.relations)?;
        Ok(doc)
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Replace the entity annotations.
    ///
    /// Existing relations are cleared since they may point at removed entities.
    pub fn set_entities(&mut self, entities: Vec<Entity>) -> Result<()> {
        validate_entities(&self.text, &entities)?;
        self.entities = entities;
        self.relations.clear();
        Ok(())
    }

    /// Replace the relation annotations; both ends must reference entities of this document
    pub fn set_relations(&mut self, relations: Vec<Relation>) -> Result<()> {
        self.check_relations(&relations)?;
        self.relations = relations;
        Ok(())
    }

    /// Look up an entity by id
    pub fn entity(&self, entity_id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.entity_id == entity_id)
    }

    fn check_relations(&self, relations: &[Relation]) -> Result<()> {
        if !relations.is_empty() && self.entities.is_empty() {
            return Err(IeError::InvalidInput(
                "relations require at least one entity".to_string(),
            ));
        }

        for relation in relations {
            for id in [&relation.entity_1_id, &relation.entity_2_id] {
                if self.entity(id).is_none() {
                    return Err(IeError::InvalidInput(format!(
                        "relation {} references unknown entity {}",
                        relation.relation_id, id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| IeError::InvalidInput(format!("document not serializable: {e}")))
    }
}

// ============================================================================
// Tests
// ============================================================================
