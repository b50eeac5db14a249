//! Extraction pipeline
//!
//! The live [`ExtractionBackend`]: validates requests, resolves models
//! through the [`ModelCache`] and runs the stage predictors.

use std::sync::Arc;

use tracing::info;

use iex_core::{validate_entities, Entity, ModelConfig, Relation, Result, Stage};

use crate::cache::{CacheState, ModelCache};
use crate::ner::predict_entities;
use crate::relation::predict_relations;
use crate::{ExtractionBackend, ModelLoader};

/// Model-backed extraction over a shared model cache
#[derive(Debug)]
pub struct Pipeline {
    cache: ModelCache,
}

impl Pipeline {
    pub fn new(cache: ModelCache) -> Self {
        Self { cache }
    }

    pub fn with_loader(loader: Arc<dyn ModelLoader>) -> Self {
        Self::new(ModelCache::new(loader))
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    pub fn state(&self) -> CacheState {
        self.cache.state()
    }
}

impl ExtractionBackend for Pipeline {
    fn get_entities(&self, ner_config: &ModelConfig, text: &str) -> Result<Vec<Entity>> {
        info!(model = %ner_config.model_name, chars = text.chars().count(), "Extracting entities");
        ner_config.validate(Stage::Ner)?;

        let handle = self.cache.ensure_ner(ner_config)?;
        let entities = predict_entities(&handle, text)?;

        info!(model = %handle.model_name, entities = entities.len(), "Entity extraction complete");
        Ok(entities)
    }

    fn get_relations(
        &self,
        re_config: &ModelConfig,
        text: &str,
        entities: &[Entity],
    ) -> Result<Vec<Relation>> {
        info!(model = %re_config.model_name, entities = entities.len(), "Extracting relations");
        re_config.validate(Stage::Re)?;
        validate_entities(text, entities)?;

        if entities.len() < 2 {
            return Ok(Vec::new());
        }

        let handle = self.cache.ensure_re(re_config)?;
        let relations = predict_relations(&handle, text, entities)?;

        info!(
            model = %handle.model_name,
            relations = relations.len(),
            "Relation extraction complete"
        );
        Ok(relations)
    }

    fn reset(&self) {
        self.cache.reset();
    }
}
