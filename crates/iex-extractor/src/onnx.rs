//! ONNX Runtime models
//!
//! Transformer checkpoints exported to ONNX with a HuggingFace tokenizer:
//! - `weight/model.onnx`: graph taking `input_ids`, `attention_mask` and
//!   optionally `token_type_ids`, returning logits
//! - `tokenizer/tokenizer.json`

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;
use tracing::info;

use iex_core::{IeError, ModelConfig, Result, Stage};

use crate::{
    ModelHandle, NerHandle, PairInput, ReHandle, SequenceClassifier, TextTokenizer, Token,
    TokenClassifier, TokenWindow,
};

pub const MODEL_FILE: &str = "model.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

// ============================================================================
// Tokenizer
// ============================================================================

/// HuggingFace tokenizer with the special tokens it wraps sequences in
pub struct OnnxTokenizer {
    tokenizer: Tokenizer,
    prefix: Vec<u32>,
    suffix: Vec<u32>,
}

impl OnnxTokenizer {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        anyhow::ensure!(path.exists(), "{TOKENIZER_FILE} not found at {path:?}");
        let mut tokenizer =
            Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("load tokenizer: {e}"))?;

        // Windows are sized by the caller
        tokenizer
            .with_truncation(None)
            .map_err(|e| anyhow::anyhow!("disable truncation: {e}"))?;
        tokenizer.with_padding(None);

        // Learn the special tokens from a one-word sequence
        let sample = tokenizer
            .encode("a", true)
            .map_err(|e| anyhow::anyhow!("encode sample: {e}"))?;
        let ids = sample.get_ids();
        let mask = sample.get_special_tokens_mask();
        let first = mask.iter().position(|&m| m == 0).unwrap_or(ids.len());
        let last = mask.iter().rposition(|&m| m == 0).map_or(first, |i| i + 1);

        Ok(Self {
            prefix: ids[..first].to_vec(),
            suffix: ids[last..].to_vec(),
            tokenizer,
        })
    }
}

impl TextTokenizer for OnnxTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<Token>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| IeError::Prediction(format!("tokenize: {e}")))?;

        Ok(encoding
            .get_ids()
            .iter()
            .zip(encoding.get_offsets())
            .filter(|(_, offsets)| offsets.0 < offsets.1)
            .map(|(&id, &(start, end))| Token { id, start, end })
            .collect())
    }

    fn special_tokens(&self) -> usize {
        self.prefix.len() + self.suffix.len()
    }
}

// ============================================================================
// Shared inference
// ============================================================================

/// Session plus whether its graph declares `token_type_ids`
struct OnnxSession {
    session: Mutex<Session>,
    uses_type_ids: bool,
}

impl OnnxSession {
    fn load(weight_dir: &Path) -> anyhow::Result<Self> {
        let model_path = weight_dir.join(MODEL_FILE);
        anyhow::ensure!(model_path.exists(), "{MODEL_FILE} not found in {weight_dir:?}");

        let session = Session::builder()?.commit_from_file(&model_path)?;
        let uses_type_ids = session.inputs().iter().any(|i| i.name() == "token_type_ids");
        Ok(Self {
            session: Mutex::new(session),
            uses_type_ids,
        })
    }

    /// Run padded `[batch, seq]` id rows, returning output shape and data
    fn run(&self, rows: &[Vec<i64>], pad_id: i64) -> anyhow::Result<(Vec<usize>, Vec<f32>)> {
        let batch = rows.len();
        let seq_len = rows.iter().map(Vec::len).max().unwrap_or(0);

        let mut input_ids = vec![pad_id; batch * seq_len];
        let mut attention_mask = vec![0i64; batch * seq_len];
        for (i, row) in rows.iter().enumerate() {
            let offset = i * seq_len;
            input_ids[offset..offset + row.len()].copy_from_slice(row);
            attention_mask[offset..offset + row.len()].fill(1);
        }

        let shape = [batch as i64, seq_len as i64];
        let ids_tensor = Tensor::from_array((shape, input_ids.into_boxed_slice()))?;
        let mask_tensor = Tensor::from_array((shape, attention_mask.into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("session lock poisoned"))?;
        let outputs = if self.uses_type_ids {
            let type_tensor =
                Tensor::from_array((shape, vec![0i64; batch * seq_len].into_boxed_slice()))?;
            session.run(ort::inputs![
                "input_ids" => ids_tensor,
                "attention_mask" => mask_tensor,
                "token_type_ids" => type_tensor,
            ])?
        } else {
            session.run(ort::inputs![
                "input_ids" => ids_tensor,
                "attention_mask" => mask_tensor,
            ])?
        };

        let (dims, data) = outputs[0].try_extract_tensor::<f32>()?;
        let dims: Vec<usize> = dims.iter().map(|&d| d.max(0) as usize).collect();
        Ok((dims, data.to_vec()))
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Inputs longer than `max_len` are rejected, never truncated
fn check_lengths(lengths: impl IntoIterator<Item = usize>, max_len: usize) -> anyhow::Result<()> {
    for (i, len) in lengths.into_iter().enumerate() {
        anyhow::ensure!(
            len <= max_len,
            "input {i} encodes to {len} tokens, model accepts {max_len}"
        );
    }
    Ok(())
}

fn pad_id(tokenizer: &Tokenizer) -> i64 {
    tokenizer
        .get_padding()
        .map(|p| i64::from(p.pad_id))
        .or_else(|| tokenizer.token_to_id("[PAD]").map(i64::from))
        .unwrap_or(0)
}

// ============================================================================
// NER
// ============================================================================

/// Token classification graph with logits `[batch, seq, labels]`
pub struct OnnxTokenClassifier {
    session: OnnxSession,
    prefix: Vec<u32>,
    suffix: Vec<u32>,
    pad_id: i64,
    width: usize,
}

impl OnnxTokenClassifier {
    fn classify(&self, windows: &[TokenWindow<'_>]) -> anyhow::Result<Vec<Vec<Vec<f32>>>> {
        if windows.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<Vec<i64>> = windows
            .iter()
            .map(|w| {
                self.prefix
                    .iter()
                    .chain(w.tokens.iter().map(|t| &t.id))
                    .chain(&self.suffix)
                    .map(|&id| i64::from(id))
                    .collect()
            })
            .collect();
        let (dims, data) = self.session.run(&rows, self.pad_id)?;
        anyhow::ensure!(
            dims.len() == 3 && dims[0] == windows.len() && dims[2] == self.width,
            "unexpected output shape {dims:?}, expected [{}, _, {}]",
            windows.len(),
            self.width
        );

        let seq_len = dims[1];
        let skip = self.prefix.len();
        let mut out = Vec::with_capacity(windows.len());
        for (i, window) in windows.iter().enumerate() {
            anyhow::ensure!(
                skip + window.tokens.len() <= seq_len,
                "output sequence of {seq_len} shorter than window"
            );
            let rows = (0..window.tokens.len())
                .map(|j| {
                    let at = (i * seq_len + skip + j) * self.width;
                    softmax(&data[at..at + self.width])
                })
                .collect();
            out.push(rows);
        }
        Ok(out)
    }
}

impl TokenClassifier for OnnxTokenClassifier {
    fn classify_tokens(&self, windows: &[TokenWindow<'_>]) -> Result<Vec<Vec<Vec<f32>>>> {
        self.classify(windows)
            .map_err(|e| IeError::Prediction(format!("{e:#}")))
    }
}

/// Load an ONNX token classifier and its tokenizer
pub fn load_ner(
    weight_dir: &Path,
    tokenizer_dir: &Path,
    config: &ModelConfig,
) -> Result<NerHandle> {
    let load = || -> anyhow::Result<NerHandle> {
        let session = OnnxSession::load(weight_dir)?;
        let tokenizer = OnnxTokenizer::from_file(&tokenizer_dir.join(TOKENIZER_FILE))?;
        let pad_id = pad_id(&tokenizer.tokenizer);

        info!(
            model = %config.model_name,
            labels = config.label_map.len(),
            "Loaded ONNX token classifier"
        );
        Ok(ModelHandle::new(
            config.clone(),
            Box::new(OnnxTokenClassifier {
                session,
                prefix: tokenizer.prefix.clone(),
                suffix: tokenizer.suffix.clone(),
                pad_id,
                width: config.label_map.len(),
            }),
            Box::new(tokenizer),
        ))
    };
    load().map_err(|e| IeError::model_load(Stage::Ner, &config.model_name, format!("{e:#}")))
}

// ============================================================================
// RE
// ============================================================================

/// Sequence classification graph with logits `[batch, labels]`
pub struct OnnxSequenceClassifier {
    session: OnnxSession,
    tokenizer: Tokenizer,
    pad_id: i64,
    max_len: usize,
    width: usize,
}

impl OnnxSequenceClassifier {
    fn classify(&self, inputs: &[PairInput]) -> anyhow::Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<&str> = inputs.iter().map(|p| p.text.as_str()).collect();
        let encodings = self
            .tokenizer
            .encode_batch(texts, true)
            .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
        check_lengths(encodings.iter().map(|e| e.get_ids().len()), self.max_len)?;
        let rows: Vec<Vec<i64>> = encodings
            .iter()
            .map(|e| e.get_ids().iter().map(|&id| i64::from(id)).collect())
            .collect();

        let (dims, data) = self.session.run(&rows, self.pad_id)?;
        anyhow::ensure!(
            dims == [inputs.len(), self.width],
            "unexpected output shape {dims:?}, expected [{}, {}]",
            inputs.len(),
            self.width
        );

        Ok(data.chunks(self.width).map(softmax).collect())
    }
}

impl SequenceClassifier for OnnxSequenceClassifier {
    fn classify_pairs(&self, inputs: &[PairInput]) -> Result<Vec<Vec<f32>>> {
        self.classify(inputs)
            .map_err(|e| IeError::Prediction(format!("{e:#}")))
    }
}

/// Load an ONNX sequence classifier and its tokenizer
pub fn load_re(weight_dir: &Path, tokenizer_dir: &Path, config: &ModelConfig) -> Result<ReHandle> {
    let load = || -> anyhow::Result<ReHandle> {
        let session = OnnxSession::load(weight_dir)?;
        let path = tokenizer_dir.join(TOKENIZER_FILE);
        let tokenizer = OnnxTokenizer::from_file(&path)?;

        // Truncation stays off so an overlong pair fails instead of losing a marker
        let classifier_tokenizer = tokenizer.tokenizer.clone();
        let pad_id = pad_id(&classifier_tokenizer);

        info!(
            model = %config.model_name,
            labels = config.label_map.len(),
            "Loaded ONNX sequence classifier"
        );
        Ok(ModelHandle::new(
            config.clone(),
            Box::new(OnnxSequenceClassifier {
                session,
                tokenizer: classifier_tokenizer,
                pad_id,
                max_len: config.token_length,
                width: config.label_map.len(),
            }),
            Box::new(tokenizer),
        ))
    };
    load()
        .with_context(|| format!("loading from {}", weight_dir.display()))
        .map_err(|e| IeError::model_load(Stage::Re, &config.model_name, format!("{e:#}")))
}
