//! Pipeline integration tests
//!
//! Exercise the orchestrator and model cache through counting test doubles,
//! then the registry loader against models written to a temp directory.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{ner_config, re_config, CountingLoader, Counters, ScriptedClassifier, TEXT};
use iex_core::{EntityTypePair, IeError, Stage};
use iex_extractor::{
    CacheState, ExtractionBackend, ModelCache, ModelRegistry, Pipeline, RegistryLoader,
};

fn pipeline(loader: CountingLoader) -> (Pipeline, Arc<Counters>, ScriptedClassifier) {
    let counters = Arc::clone(&loader.counters);
    let re_model = loader.re_model.clone();
    (
        Pipeline::new(ModelCache::new(Arc::new(loader))),
        counters,
        re_model,
    )
}

// =============================================================================
// Cache Lifecycle
// =============================================================================

#[test]
fn test_same_model_loads_once() {
    let (pipeline, counters, _) = pipeline(CountingLoader::new());

    pipeline.get_entities(&ner_config("people"), TEXT).unwrap();
    pipeline.get_entities(&ner_config("people"), TEXT).unwrap();

    assert_eq!(Counters::get(&counters.ner_loads), 1);
    assert_eq!(Counters::get(&counters.releases), 0);
    assert_eq!(pipeline.state(), CacheState::NerLoaded);
}

#[test]
fn test_model_change_reloads_and_releases_once() {
    let (pipeline, counters, _) = pipeline(CountingLoader::new());

    pipeline.get_entities(&ner_config("people"), TEXT).unwrap();
    pipeline.get_entities(&ner_config("people-v2"), TEXT).unwrap();

    assert_eq!(Counters::get(&counters.ner_loads), 2);
    assert_eq!(Counters::get(&counters.releases), 1);
    assert_eq!(pipeline.cache().ner_model_name().as_deref(), Some("people-v2"));
}

#[test]
fn test_reset_is_idempotent() {
    let (pipeline, counters, _) = pipeline(CountingLoader::new());
    let entities = pipeline.get_entities(&ner_config("people"), TEXT).unwrap();
    pipeline
        .get_relations(&re_config("scripted", 4), TEXT, &entities)
        .unwrap();
    assert_eq!(pipeline.state(), CacheState::NerReLoaded);

    pipeline.reset();
    assert_eq!(pipeline.state(), CacheState::Empty);
    assert_eq!(Counters::get(&counters.releases), 2);

    pipeline.reset();
    assert_eq!(pipeline.state(), CacheState::Empty);
    assert_eq!(Counters::get(&counters.releases), 2);

    // Next request loads again
    pipeline.get_entities(&ner_config("people"), TEXT).unwrap();
    assert_eq!(Counters::get(&counters.ner_loads), 2);
}

#[test]
fn test_failed_load_leaves_cache_unchanged() {
    let mut loader = CountingLoader::new();
    loader.broken.push("broken".to_string());
    let (pipeline, counters, _) = pipeline(loader);

    pipeline.get_entities(&ner_config("people"), TEXT).unwrap();
    let err = pipeline.get_entities(&ner_config("broken"), TEXT).unwrap_err();

    assert!(matches!(err, IeError::ModelLoad { stage: Stage::Ner, .. }));
    assert_eq!(pipeline.cache().ner_model_name().as_deref(), Some("people"));
    assert_eq!(Counters::get(&counters.releases), 0);

    // The previous model still serves requests without a reload
    pipeline.get_entities(&ner_config("people"), TEXT).unwrap();
    assert_eq!(Counters::get(&counters.ner_loads), 2);
}

#[test]
fn test_invalid_config_is_rejected_before_loading() {
    let (pipeline, counters, _) = pipeline(CountingLoader::new());
    let mut config = ner_config("people");
    config.categories.push("ORGANIZATION".to_string());

    let err = pipeline.get_entities(&config, TEXT).unwrap_err();
    assert!(matches!(err, IeError::InvalidInput(_)));
    assert_eq!(Counters::get(&counters.ner_loads), 0);
    assert_eq!(pipeline.state(), CacheState::Empty);
}

// =============================================================================
// End-to-end Scenarios
// =============================================================================

#[test]
fn test_entities_of_alice_met_bob_in_paris() {
    let (pipeline, _, _) = pipeline(CountingLoader::new());
    let entities = pipeline.get_entities(&ner_config("people"), TEXT).unwrap();

    let summary: Vec<(&str, &str, usize, usize)> = entities
        .iter()
        .map(|e| (e.entity_text.as_str(), e.entity_type.as_str(), e.start, e.end))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("Alice", "PERSON", 0, 5),
            ("Bob", "PERSON", 10, 13),
            ("Paris", "LOCATION", 17, 22),
        ]
    );
}

#[test]
fn test_allow_list_scores_only_person_pair() {
    let (pipeline, counters, re_model) = pipeline(CountingLoader::new());
    let entities = pipeline.get_entities(&ner_config("people"), TEXT).unwrap();

    let mut config = re_config("scripted", 4);
    config.possible_rel = Some(vec![EntityTypePair::new("PERSON", "PERSON")]);
    let relations = pipeline.get_relations(&config, TEXT, &entities).unwrap();

    assert_eq!(relations.len(), 1);
    let relation = &relations[0];
    assert_eq!(relation.relation_id, "r0");
    assert_eq!(relation.entity_1_text, "Alice");
    assert_eq!(relation.entity_2_text, "Bob");
    assert_eq!(relation.relation_type, "met");
    assert!((relation.relation_prob - 0.91).abs() < 1e-6);

    let seen = re_model.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen.iter().all(|p| !p.text.contains("[E1]Paris") && !p.text.contains("[E2]Paris")));
    assert_eq!(Counters::get(&counters.re_calls), 1);
}

#[test]
fn test_empty_text_yields_no_entities() {
    let (pipeline, _, _) = pipeline(CountingLoader::new());
    let entities = pipeline.get_entities(&ner_config("people"), "").unwrap();
    assert!(entities.is_empty());
}

#[test]
fn test_relations_need_two_entities() {
    let (pipeline, counters, _) = pipeline(CountingLoader::new());
    let entities = pipeline.get_entities(&ner_config("people"), TEXT).unwrap();

    let none = pipeline
        .get_relations(&re_config("scripted", 4), TEXT, &[])
        .unwrap();
    let one = pipeline
        .get_relations(&re_config("scripted", 4), TEXT, &entities[..1])
        .unwrap();

    assert!(none.is_empty() && one.is_empty());
    assert_eq!(Counters::get(&counters.re_loads), 0);
    assert_eq!(Counters::get(&counters.re_calls), 0);
}

#[test]
fn test_foreign_entities_are_rejected() {
    let (pipeline, counters, _) = pipeline(CountingLoader::new());
    let mut entities = pipeline.get_entities(&ner_config("people"), TEXT).unwrap();
    entities[1].entity_text = "Carol".to_string();

    let err = pipeline
        .get_relations(&re_config("scripted", 4), TEXT, &entities)
        .unwrap_err();
    assert!(matches!(err, IeError::InvalidInput(_)));
    assert_eq!(Counters::get(&counters.re_loads), 0);
}

#[test]
fn test_extract_builds_document() {
    let (pipeline, _, _) = pipeline(CountingLoader::new());
    let doc = pipeline
        .extract(&ner_config("people"), Some(&re_config("scripted", 4)), TEXT)
        .unwrap();

    assert_eq!(doc.text(), TEXT);
    assert_eq!(doc.entities().len(), 3);
    // Alice-Bob "met", Bob-Paris "located_in"; Alice-Paris is no_relation
    let types: Vec<&str> = doc.relations().iter().map(|r| r.relation_type.as_str()).collect();
    assert_eq!(types, vec!["met", "located_in"]);
    for relation in doc.relations() {
        assert!(doc.entity(&relation.entity_1_id).is_some());
        assert!(doc.entity(&relation.entity_2_id).is_some());
    }
}

// =============================================================================
// Batching
// =============================================================================

#[test]
fn test_batch_size_does_not_change_relations() {
    let (pipeline, _, _) = pipeline(CountingLoader::new());
    let entities = pipeline.get_entities(&ner_config("people"), TEXT).unwrap();

    let expected = pipeline
        .get_relations(&re_config("scripted", 1), TEXT, &entities)
        .unwrap();
    assert_eq!(expected.len(), 2);

    for batch_size in [2, 3, 8] {
        // A new name per batch size forces a fresh RE load
        let config = re_config(&format!("scripted-{batch_size}"), batch_size);
        let relations = pipeline.get_relations(&config, TEXT, &entities).unwrap();
        assert_eq!(relations, expected);
    }
}

#[test]
fn test_failing_batch_discards_results() {
    let mut loader = CountingLoader::new();
    loader.re_model.fail_on_call = Some(2);
    let (pipeline, _, re_model) = pipeline(loader);
    let entities = pipeline.get_entities(&ner_config("people"), TEXT).unwrap();

    let err = pipeline
        .get_relations(&re_config("scripted", 1), TEXT, &entities)
        .unwrap_err();
    assert!(matches!(err, IeError::Prediction(_)));
    assert_eq!(re_model.calls.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Registry
// =============================================================================

const NER_CONFIG: &str = r#"
model_name = "people"
categories = ["PERSON", "LOCATION"]
token_length = 32
eval_batch_size = 2
BIO_mode = "BIO"
format = "lexicon"

[label_map]
O = 0
"B-PERSON" = 1
"I-PERSON" = 2
"B-LOCATION" = 3
"I-LOCATION" = 4
"#;

const NER_LEXICON: &str = r#"
[[terms]]
term = "Alice"
entity_type = "PERSON"

[[terms]]
term = "Bob"
entity_type = "PERSON"

[[terms]]
term = "Paris"
entity_type = "LOCATION"
"#;

const RE_CONFIG: &str = r#"
model_name = "meetings"
categories = ["met"]
token_length = 64
eval_batch_size = 4
possible_rel = [["PERSON", "PERSON"]]
format = "lexicon"

[label_map]
no_relation = 0
met = 1
"#;

const RE_PATTERNS: &str = r#"
[[rules]]
head_type = "PERSON"
tail_type = "PERSON"
relation = "met"
keywords = ["met"]
confidence = 0.91
"#;

fn write_model(
    root: &std::path::Path,
    stage: Stage,
    name: &str,
    config: &str,
    file: &str,
    body: &str,
) {
    let dir = root.join(stage.as_str()).join(name);
    std::fs::create_dir_all(dir.join("weight")).unwrap();
    std::fs::create_dir_all(dir.join("tokenizer")).unwrap();
    std::fs::write(dir.join("config.toml"), config).unwrap();
    std::fs::write(dir.join("weight").join(file), body).unwrap();
}

#[test]
fn test_registry_lexicon_models_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    write_model(tmp.path(), Stage::Ner, "people", NER_CONFIG, "lexicon.toml", NER_LEXICON);
    write_model(tmp.path(), Stage::Re, "meetings", RE_CONFIG, "patterns.toml", RE_PATTERNS);

    let registry = ModelRegistry::new(tmp.path());
    let ner = registry.load_config(Stage::Ner, "people").unwrap();
    let re = registry.load_config(Stage::Re, "meetings").unwrap();

    let pipeline = Pipeline::with_loader(Arc::new(RegistryLoader::new(registry)));
    let doc = pipeline.extract(&ner, Some(&re), TEXT).unwrap();

    let texts: Vec<&str> = doc.entities().iter().map(|e| e.entity_text.as_str()).collect();
    assert_eq!(texts, vec!["Alice", "Bob", "Paris"]);

    assert_eq!(doc.relations().len(), 1);
    let relation = &doc.relations()[0];
    assert_eq!(relation.entity_1_text, "Alice");
    assert_eq!(relation.entity_2_text, "Bob");
    assert_eq!(relation.relation_type, "met");
    assert!((relation.relation_prob - 0.91).abs() < 1e-6);
}
