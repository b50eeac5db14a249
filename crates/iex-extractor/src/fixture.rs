//! Fixture backend
//!
//! Replays the annotations of a stored document instead of running models.
//! Used to exercise callers of [`ExtractionBackend`] without model artifacts.

use std::path::Path;

use tracing::debug;

use iex_core::{ConfigError, Document, Entity, IeError, ModelConfig, Relation, Result};

use crate::ExtractionBackend;

/// Backend answering every request from one annotated document
#[derive(Debug, Clone)]
pub struct FixtureBackend {
    document: Document,
}

impl FixtureBackend {
    pub fn new(document: Document) -> Self {
        Self { document }
    }

    /// Load the document from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            IeError::Config(ConfigError::FileReadError {
                path: path.to_path_buf(),
                source: e,
            })
        })?;
        Ok(Self::new(Document::from_json(&json)?))
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    fn check_text(&self, text: &str) -> Result<()> {
        if text != self.document.text() {
            return Err(IeError::InvalidInput(format!(
                "fixture {} holds a different text",
                self.document.doc_id()
            )));
        }
        Ok(())
    }
}

impl ExtractionBackend for FixtureBackend {
    fn get_entities(&self, ner_config: &ModelConfig, text: &str) -> Result<Vec<Entity>> {
        self.check_text(text)?;
        debug!(
            model = %ner_config.model_name,
            doc_id = %self.document.doc_id(),
            "Replaying entities"
        );
        Ok(self.document.entities().to_vec())
    }

    fn get_relations(
        &self,
        re_config: &ModelConfig,
        text: &str,
        entities: &[Entity],
    ) -> Result<Vec<Relation>> {
        self.check_text(text)?;
        if entities.len() < 2 {
            return Ok(Vec::new());
        }
        debug!(
            model = %re_config.model_name,
            doc_id = %self.document.doc_id(),
            "Replaying relations"
        );

        let known = |id: &str| entities.iter().any(|e| e.entity_id == id);
        Ok(self
            .document
            .relations()
            .iter()
            .filter(|r| known(&r.entity_1_id) && known(&r.entity_2_id))
            .cloned()
            .collect())
    }

    fn reset(&self) {}
}
