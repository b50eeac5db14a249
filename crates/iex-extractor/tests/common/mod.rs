//! Test doubles shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use iex_core::{IeError, LabelMap, ModelConfig, ModelFormat, Result, Stage, TaggingScheme};
use iex_extractor::lexicon::{Lexicon, LexiconTagger, LexiconTerm};
use iex_extractor::tokenizer::WordTokenizer;
use iex_extractor::{
    ModelHandle, ModelLoader, NerHandle, PairInput, ReHandle, SequenceClassifier,
};

pub const TEXT: &str = "Alice met Bob in Paris.";

pub fn ner_config(name: &str) -> ModelConfig {
    ModelConfig {
        model_name: name.to_string(),
        categories: vec!["PERSON".to_string(), "LOCATION".to_string()],
        label_map: LabelMap::new(["O", "B-PERSON", "I-PERSON", "B-LOCATION", "I-LOCATION"])
            .unwrap(),
        token_length: 32,
        eval_batch_size: 2,
        possible_rel: None,
        bio_mode: Some(TaggingScheme::Bio),
        no_relation_label: None,
        format: ModelFormat::Lexicon,
    }
}

pub fn re_config(name: &str, eval_batch_size: usize) -> ModelConfig {
    ModelConfig {
        model_name: name.to_string(),
        categories: vec!["met".to_string(), "located_in".to_string()],
        label_map: LabelMap::new(["no_relation", "met", "located_in"]).unwrap(),
        token_length: 64,
        eval_batch_size,
        possible_rel: None,
        bio_mode: None,
        no_relation_label: None,
        format: ModelFormat::Lexicon,
    }
}

pub fn people_lexicon() -> Lexicon {
    let term = |term: &str, entity_type: &str| LexiconTerm {
        term: term.to_string(),
        entity_type: entity_type.to_string(),
        aliases: Vec::new(),
    };
    Lexicon {
        terms: vec![
            term("Alice", "PERSON"),
            term("Bob", "PERSON"),
            term("Paris", "LOCATION"),
        ],
        patterns: Vec::new(),
    }
}

/// Counts live models; decremented when a model is dropped
#[derive(Debug, Default)]
pub struct Counters {
    pub ner_loads: AtomicUsize,
    pub re_loads: AtomicUsize,
    pub releases: AtomicUsize,
    pub re_calls: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Wraps a classifier and records its release
pub struct Tracked<M> {
    inner: M,
    counters: Arc<Counters>,
}

impl<M> Drop for Tracked<M> {
    fn drop(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl<M: iex_extractor::TokenClassifier> iex_extractor::TokenClassifier for Tracked<M> {
    fn classify_tokens(
        &self,
        windows: &[iex_extractor::TokenWindow<'_>],
    ) -> Result<Vec<Vec<Vec<f32>>>> {
        self.inner.classify_tokens(windows)
    }
}

impl<M: SequenceClassifier> SequenceClassifier for Tracked<M> {
    fn classify_pairs(&self, inputs: &[PairInput]) -> Result<Vec<Vec<f32>>> {
        self.counters.re_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.classify_pairs(inputs)
    }
}

/// Scripted RE model: answers by the marked entity texts and logs inputs
#[derive(Clone, Default)]
pub struct ScriptedClassifier {
    /// (entity_1_text, entity_2_text) -> label distribution
    pub answers: HashMap<(String, String), Vec<f32>>,
    pub fallback: Vec<f32>,
    pub seen: Arc<Mutex<Vec<PairInput>>>,
    /// Fail the n-th call (1-based)
    pub fail_on_call: Option<usize>,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedClassifier {
    pub fn met_091() -> Self {
        let mut answers = HashMap::new();
        answers.insert(
            ("Alice".to_string(), "Bob".to_string()),
            vec![0.05, 0.91, 0.04],
        );
        answers.insert(
            ("Bob".to_string(), "Paris".to_string()),
            vec![0.3, 0.1, 0.6],
        );
        Self {
            answers,
            fallback: vec![0.8, 0.1, 0.1],
            ..Default::default()
        }
    }
}

fn marked<'a>(text: &'a str, open: &str, close: &str) -> &'a str {
    let from = text.find(open).map_or(0, |i| i + open.len());
    let to = text.find(close).unwrap_or(text.len());
    text.get(from..to).unwrap_or("")
}

impl SequenceClassifier for ScriptedClassifier {
    fn classify_pairs(&self, inputs: &[PairInput]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(IeError::Prediction("scripted failure".to_string()));
        }
        self.seen.lock().unwrap().extend(inputs.iter().cloned());

        Ok(inputs
            .iter()
            .map(|input| {
                let key = (
                    marked(&input.text, "[E1]", "[/E1]").to_string(),
                    marked(&input.text, "[E2]", "[/E2]").to_string(),
                );
                self.answers
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| self.fallback.clone())
            })
            .collect())
    }
}

/// Loader building lexicon taggers and scripted RE models, counting every load
pub struct CountingLoader {
    pub counters: Arc<Counters>,
    pub re_model: ScriptedClassifier,
    /// Model names whose load fails
    pub broken: Vec<String>,
}

impl CountingLoader {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            re_model: ScriptedClassifier::met_091(),
            broken: Vec::new(),
        }
    }

    fn check(&self, stage: Stage, config: &ModelConfig) -> Result<()> {
        if self.broken.contains(&config.model_name) {
            return Err(IeError::model_load(stage, &config.model_name, "missing weights"));
        }
        Ok(())
    }
}

impl ModelLoader for CountingLoader {
    fn load_ner(&self, config: &ModelConfig) -> Result<NerHandle> {
        self.counters.ner_loads.fetch_add(1, Ordering::SeqCst);
        self.check(Stage::Ner, config)?;
        let tagger = LexiconTagger::new(people_lexicon(), config)?;
        Ok(ModelHandle::new(
            config.clone(),
            Box::new(Tracked {
                inner: tagger,
                counters: Arc::clone(&self.counters),
            }),
            Box::new(WordTokenizer::new()),
        ))
    }

    fn load_re(&self, config: &ModelConfig) -> Result<ReHandle> {
        self.counters.re_loads.fetch_add(1, Ordering::SeqCst);
        self.check(Stage::Re, config)?;
        Ok(ModelHandle::new(
            config.clone(),
            Box::new(Tracked {
                inner: self.re_model.clone(),
                counters: Arc::clone(&self.counters),
            }),
            Box::new(WordTokenizer::new()),
        ))
    }
}
