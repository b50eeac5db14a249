//! Model cache
//!
//! Holds at most one NER and one RE model. A stage is loaded on first use
//! and swapped when a request names a different model; the old model is
//! released only once its replacement has loaded.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use iex_core::{IeError, ModelConfig, Result, Stage};

use crate::{ModelHandle, ModelLoader, NerHandle, ReHandle};

/// Which stages currently hold a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Empty,
    NerLoaded,
    ReLoaded,
    NerReLoaded,
}

type Slot<M> = Mutex<Option<Arc<ModelHandle<M>>>>;

/// Per-stage cache of loaded models
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    ner: Slot<dyn crate::TokenClassifier>,
    re: Slot<dyn crate::SequenceClassifier>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            ner: Mutex::new(None),
            re: Mutex::new(None),
        }
    }

    /// NER model for `config`, loading or swapping as needed
    pub fn ensure_ner(&self, config: &ModelConfig) -> Result<Arc<NerHandle>> {
        ensure(&self.ner, Stage::Ner, config, |c| self.loader.load_ner(c))
    }

    /// RE model for `config`, loading or swapping as needed
    pub fn ensure_re(&self, config: &ModelConfig) -> Result<Arc<ReHandle>> {
        ensure(&self.re, Stage::Re, config, |c| self.loader.load_re(c))
    }

    /// Release both models. Requests already holding a model finish with it.
    pub fn reset(&self) {
        let ner = lock(&self.ner).take();
        let re = lock(&self.re).take();

        if let Some(handle) = ner {
            info!(stage = %Stage::Ner, model = %handle.model_name, "Releasing model");
        }
        if let Some(handle) = re {
            info!(stage = %Stage::Re, model = %handle.model_name, "Releasing model");
        }
    }

    pub fn state(&self) -> CacheState {
        let ner = lock(&self.ner).is_some();
        let re = lock(&self.re).is_some();
        match (ner, re) {
            (false, false) => CacheState::Empty,
            (true, false) => CacheState::NerLoaded,
            (false, true) => CacheState::ReLoaded,
            (true, true) => CacheState::NerReLoaded,
        }
    }

    pub fn ner_model_name(&self) -> Option<String> {
        lock(&self.ner).as_ref().map(|h| h.model_name.clone())
    }

    pub fn re_model_name(&self) -> Option<String> {
        lock(&self.re).as_ref().map(|h| h.model_name.clone())
    }
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("ner", &self.ner_model_name())
            .field("re", &self.re_model_name())
            .finish()
    }
}

/// A panic while loading leaves the slot untouched, so a poisoned lock is still consistent
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ensure<M: ?Sized>(
    slot: &Slot<M>,
    stage: Stage,
    config: &ModelConfig,
    load: impl FnOnce(&ModelConfig) -> Result<ModelHandle<M>>,
) -> Result<Arc<ModelHandle<M>>> {
    // Held across the load so concurrent requests never load twice
    let mut current = lock(slot);

    if let Some(handle) = current.as_ref() {
        if handle.model_name == config.model_name {
            debug!(stage = %stage, model = %config.model_name, "Model cache hit");
            return Ok(Arc::clone(handle));
        }
    }

    info!(stage = %stage, model = %config.model_name, "Loading model");
    let loaded = load(config).map_err(|e| {
        warn!(stage = %stage, model = %config.model_name, error = %e, "Model load failed");
        e
    })?;
    if loaded.model_name != config.model_name {
        return Err(IeError::model_load(
            stage,
            &config.model_name,
            format!("loader returned model '{}'", loaded.model_name),
        ));
    }

    let loaded = Arc::new(loaded);
    if let Some(previous) = current.replace(Arc::clone(&loaded)) {
        info!(stage = %stage, model = %previous.model_name, "Releasing model");
    }
    Ok(loaded)
}

// ============================================================================
// Tests
// ============================================================================
