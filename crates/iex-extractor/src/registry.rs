//! Model registry
//!
//! Models live on disk as `<root>/<NER|RE>/<model_name>/` holding
//! `config.toml`, a `weight/` directory and a `tokenizer/` directory.
//! [`RegistryLoader`] builds handles from these directories.

use std::path::PathBuf;

use tracing::{debug, info};

use iex_core::{ConfigError, IeError, ModelConfig, ModelFormat, Result, Stage};

use crate::{lexicon, ModelLoader, NerHandle, ReHandle};

pub const CONFIG_FILE: &str = "config.toml";
pub const WEIGHT_DIR: &str = "weight";
pub const TOKENIZER_DIR: &str = "tokenizer";

/// Directory tree of stored models
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    root: PathBuf,
}

impl ModelRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn model_path(&self, stage: Stage, model_name: &str) -> PathBuf {
        self.root.join(stage.as_str()).join(model_name)
    }

    pub fn weight_dir(&self, stage: Stage, model_name: &str) -> PathBuf {
        self.model_path(stage, model_name).join(WEIGHT_DIR)
    }

    pub fn tokenizer_dir(&self, stage: Stage, model_name: &str) -> PathBuf {
        self.model_path(stage, model_name).join(TOKENIZER_DIR)
    }

    /// Names of the models stored for a stage, sorted
    pub fn list_models(&self, stage: Stage) -> Result<Vec<String>> {
        let dir = self.root.join(stage.as_str());
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&dir).map_err(|e| {
            IeError::Config(ConfigError::FileReadError {
                path: dir.clone(),
                source: e,
            })
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                IeError::Config(ConfigError::FileReadError {
                    path: dir.clone(),
                    source: e,
                })
            })?;
            if entry.path().join(CONFIG_FILE).is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Read and validate the config of a stored model
    pub fn load_config(&self, stage: Stage, model_name: &str) -> Result<ModelConfig> {
        let model_dir = self.model_path(stage, model_name);
        if !model_dir.is_dir() {
            return Err(ConfigError::MissingRequired(format!(
                "{stage} model '{model_name}' under {}",
                self.root.display()
            ))
            .into());
        }

        let path = model_dir.join(CONFIG_FILE);
        let config = ModelConfig::from_file(&path)?;
        if config.model_name != model_name {
            return Err(ConfigError::InvalidValue {
                key: format!("{}: model_name", path.display()),
                value: config.model_name,
            }
            .into());
        }
        config.validate(stage)?;

        debug!(stage = %stage, model = %model_name, format = ?config.format, "Loaded model config");
        Ok(config)
    }
}

/// [`ModelLoader`] reading artifacts from a [`ModelRegistry`]
#[derive(Debug, Clone)]
pub struct RegistryLoader {
    registry: ModelRegistry,
}

impl RegistryLoader {
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    fn check_present(&self, stage: Stage, config: &ModelConfig) -> Result<PathBuf> {
        let weight_dir = self.registry.weight_dir(stage, &config.model_name);
        if !weight_dir.is_dir() {
            return Err(IeError::model_load(
                stage,
                &config.model_name,
                format!("missing weight directory {}", weight_dir.display()),
            ));
        }
        info!(
            stage = %stage,
            model = %config.model_name,
            path = %weight_dir.display(),
            "Reading model artifacts"
        );
        Ok(weight_dir)
    }
}

#[cfg(not(feature = "onnx"))]
fn onnx_unavailable(stage: Stage, config: &ModelConfig) -> IeError {
    IeError::model_load(stage, &config.model_name, "built without onnx support")
}

impl ModelLoader for RegistryLoader {
    fn load_ner(&self, config: &ModelConfig) -> Result<NerHandle> {
        let weight_dir = self.check_present(Stage::Ner, config)?;
        match config.format {
            ModelFormat::Lexicon => lexicon::load_ner(&weight_dir, config),
            #[cfg(feature = "onnx")]
            ModelFormat::Onnx => crate::onnx::load_ner(
                &weight_dir,
                &self.registry.tokenizer_dir(Stage::Ner, &config.model_name),
                config,
            ),
            #[cfg(not(feature = "onnx"))]
            ModelFormat::Onnx => Err(onnx_unavailable(Stage::Ner, config)),
        }
    }

    fn load_re(&self, config: &ModelConfig) -> Result<ReHandle> {
        let weight_dir = self.check_present(Stage::Re, config)?;
        match config.format {
            ModelFormat::Lexicon => lexicon::load_re(&weight_dir, config),
            #[cfg(feature = "onnx")]
            ModelFormat::Onnx => crate::onnx::load_re(
                &weight_dir,
                &self.registry.tokenizer_dir(Stage::Re, &config.model_name),
                config,
            ),
            #[cfg(not(feature = "onnx"))]
            ModelFormat::Onnx => Err(onnx_unavailable(Stage::Re, config)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    const LEXICON_CONFIG: &str = r#"
        model_name = "people"
        categories = ["PERSON"]
        token_length = 32
        eval_batch_size = 4
        format = "lexicon"

        [label_map]
        O = 0
        "B-PERSON" = 1
        "I-PERSON" = 2
    "#;

    fn write_model(root: &Path, stage: Stage, name: &str, config: &str) {
        let dir = root.join(stage.as_str()).join(name);
        std::fs::create_dir_all(dir.join(WEIGHT_DIR)).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), config).unwrap();
    }

    #[test]
    fn test_list_and_load_config() {
        let tmp = tempfile::tempdir().unwrap();
        write_model(tmp.path(), Stage::Ner, "people", LEXICON_CONFIG);
        std::fs::create_dir_all(tmp.path().join("NER").join("not-a-model")).unwrap();

        let registry = ModelRegistry::new(tmp.path());
        assert_eq!(registry.list_models(Stage::Ner).unwrap(), vec!["people"]);
        assert!(registry.list_models(Stage::Re).unwrap().is_empty());

        let config = registry.load_config(Stage::Ner, "people").unwrap();
        assert_eq!(config.format, ModelFormat::Lexicon);
        assert_eq!(config.token_length, 32);
    }

    #[test]
    fn test_name_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_model(tmp.path(), Stage::Ner, "renamed", LEXICON_CONFIG);

        let err = ModelRegistry::new(tmp.path())
            .load_config(Stage::Ner, "renamed")
            .unwrap_err();
        assert!(matches!(err, IeError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_unknown_model() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ModelRegistry::new(tmp.path())
            .load_config(Stage::Re, "absent")
            .unwrap_err();
        assert!(matches!(err, IeError::Config(ConfigError::MissingRequired(_))));
    }

    #[test]
    fn test_missing_lexicon_file_is_load_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_model(tmp.path(), Stage::Ner, "people", LEXICON_CONFIG);
        let registry = ModelRegistry::new(tmp.path());
        let config = registry.load_config(Stage::Ner, "people").unwrap();

        let err = RegistryLoader::new(registry).load_ner(&config).unwrap_err();
        assert!(matches!(err, IeError::ModelLoad { stage: Stage::Ner, .. }));
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn test_onnx_requires_feature() {
        let tmp = tempfile::tempdir().unwrap();
        let onnx_config = LEXICON_CONFIG.replace("format = \"lexicon\"", "format = \"onnx\"");
        write_model(tmp.path(), Stage::Ner, "people", &onnx_config);
        let registry = ModelRegistry::new(tmp.path());
        let config = registry.load_config(Stage::Ner, "people").unwrap();

        let err = RegistryLoader::new(registry).load_ner(&config).unwrap_err();
        assert!(err.to_string().contains("onnx"));
    }
}
