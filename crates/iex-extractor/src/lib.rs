//! iex Extractor - Knowledge extraction pipeline
//!
//! Implements Named Entity Recognition (NER) and Relation Extraction (RE)
//! over pretrained models kept in a per-stage cache:
//! - `ner` / `relation`: turn text into model batches and decode predictions
//! - `cache`: lazy loading and swap-on-change of the active models
//! - `pipeline`: the live backend coordinating both stages
//! - `fixture`: a replay backend serving a stored document
//! - `registry` / `lexicon` / `onnx`: model artifacts on disk

pub use iex_core::{Document, Entity, IeError, ModelConfig, Relation, Result, Stage};

pub mod cache;
pub mod fixture;
pub mod lexicon;
pub mod ner;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod pipeline;
pub mod registry;
pub mod relation;
pub mod tokenizer;

pub use cache::{CacheState, ModelCache};
pub use fixture::FixtureBackend;
pub use pipeline::Pipeline;
pub use registry::{ModelRegistry, RegistryLoader};

// ============================================================================
// Model Contracts
// ============================================================================

/// A token produced by a tokenizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    /// Vocabulary id; 0 for tokenizers without a vocabulary
    pub id: u32,
    /// Byte offset into the tokenized text
    pub start: usize,
    /// Byte offset one past the token
    pub end: usize,
}

/// Splits text into tokens with byte offsets
pub trait TextTokenizer: Send + Sync {
    /// Tokens of `text` in order, without special tokens
    fn tokenize(&self, text: &str) -> Result<Vec<Token>>;

    /// Number of special tokens the model adds around every sequence
    fn special_tokens(&self) -> usize {
        0
    }
}

/// A window of tokens submitted for token classification
#[derive(Debug, Clone, Copy)]
pub struct TokenWindow<'a> {
    pub text: &'a str,
    /// Offsets relative to `text`
    pub tokens: &'a [Token],
}

/// Token classification model (NER)
pub trait TokenClassifier: Send + Sync {
    /// One probability row per token for every window; rows are indexed by the label map
    fn classify_tokens(&self, windows: &[TokenWindow<'_>]) -> Result<Vec<Vec<Vec<f32>>>>;
}

/// An entity pair encoded for relation classification
#[derive(Debug, Clone, PartialEq)]
pub struct PairInput {
    /// Context text with both entity spans marked inline
    pub text: String,
    pub entity_1_type: String,
    pub entity_2_type: String,
}

/// Sequence classification model (RE)
pub trait SequenceClassifier: Send + Sync {
    /// One probability row per input, indexed by the label map
    fn classify_pairs(&self, inputs: &[PairInput]) -> Result<Vec<Vec<f32>>>;
}

/// A loaded model with its tokenizer and the config it was loaded for
pub struct ModelHandle<M: ?Sized> {
    /// Cache key
    pub model_name: String,
    pub model: Box<M>,
    pub tokenizer: Box<dyn TextTokenizer>,
    pub config: ModelConfig,
}

impl<M: ?Sized> ModelHandle<M> {
    pub fn new(config: ModelConfig, model: Box<M>, tokenizer: Box<dyn TextTokenizer>) -> Self {
        Self {
            model_name: config.model_name.clone(),
            model,
            tokenizer,
            config,
        }
    }

    /// Token budget left for content once special tokens are accounted for
    pub fn content_budget(&self) -> usize {
        self.config
            .token_length
            .saturating_sub(self.tokenizer.special_tokens())
    }
}

impl<M: ?Sized> std::fmt::Debug for ModelHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_name", &self.model_name)
            .finish_non_exhaustive()
    }
}

pub type NerHandle = ModelHandle<dyn TokenClassifier>;
pub type ReHandle = ModelHandle<dyn SequenceClassifier>;

/// Builds model handles from their configs
pub trait ModelLoader: Send + Sync {
    fn load_ner(&self, config: &ModelConfig) -> Result<NerHandle>;
    fn load_re(&self, config: &ModelConfig) -> Result<ReHandle>;
}

// ============================================================================
// Backends
// ============================================================================

/// Caller-facing extraction contract shared by every backend
pub trait ExtractionBackend: Send + Sync {
    /// Recognize entities in `text`, ordered by start offset
    fn get_entities(&self, ner_config: &ModelConfig, text: &str) -> Result<Vec<Entity>>;

    /// Classify relations between entities previously found in `text`
    fn get_relations(
        &self,
        re_config: &ModelConfig,
        text: &str,
        entities: &[Entity],
    ) -> Result<Vec<Relation>>;

    /// Release loaded models; never fails
    fn reset(&self);

    /// Run both stages into a fresh document
    fn extract(
        &self,
        ner_config: &ModelConfig,
        re_config: Option<&ModelConfig>,
        text: &str,
    ) -> Result<Document> {
        let mut doc = Document::with_random_id(text);
        let entities = self.get_entities(ner_config, doc.text())?;
        doc.set_entities(entities)?;

        if let Some(re_config) = re_config {
            let relations = self.get_relations(re_config, doc.text(), doc.entities())?;
            doc.set_relations(relations)?;
        }

        Ok(doc)
    }
}

/// Index and probability of the best label in a model output row.
///
/// The row must cover exactly `width` labels with finite values; ties go to
/// the lowest index.
pub(crate) fn best_label(row: &[f32], width: usize) -> Result<(usize, f32)> {
    if width == 0 || row.len() != width {
        return Err(IeError::Prediction(format!(
            "model returned {} scores, expected {width}",
            row.len()
        )));
    }
    if let Some(bad) = row.iter().find(|p| !p.is_finite()) {
        return Err(IeError::Prediction(format!("model returned score {bad}")));
    }

    let mut best = (0, f32::NEG_INFINITY);
    for (idx, &p) in row.iter().enumerate() {
        if p > best.1 {
            best = (idx, p);
        }
    }
    Ok((best.0, best.1.clamp(0.0, 1.0)))
}
