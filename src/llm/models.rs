use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Result as CandleResult, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::t5;
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::error::LoadError;

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// An encoder-decoder language model.
///
/// The prompt is encoded once; `decode` is then called once per generated
/// position with the full decoder sequence of every live hypothesis.
pub trait Seq2SeqModel: Send {
    fn device(&self) -> &Device;

    /// First token fed to the decoder.
    fn decoder_start_token_id(&self) -> u32;

    fn eos_token_id(&self) -> u32;

    /// `input_ids` is `[1, seq_len]`; returns `[1, seq_len, hidden]`.
    fn encode(&mut self, input_ids: &Tensor) -> CandleResult<Tensor>;

    /// `decoder_input_ids` is `[batch, len]` and `encoder_output` has a
    /// matching batch dimension. Returns next-token logits `[batch, vocab]`.
    fn decode(&mut self, decoder_input_ids: &Tensor, encoder_output: &Tensor) -> CandleResult<Tensor>;
}

pub struct T5Model {
    inner: t5::T5ForConditionalGeneration,
    device: Device,
    decoder_start_token_id: u32,
    eos_token_id: u32,
}

impl T5Model {
    pub fn new(weight_files: &[PathBuf], mut config: t5::Config, device: &Device) -> CandleResult<Self> {
        // Beams are reordered between steps, which the internal kv cache
        // cannot follow. Every step re-runs the full decoder sequence.
        config.use_cache = false;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weight_files, DType::F32, device)? };
        let inner = t5::T5ForConditionalGeneration::load(vb, &config)?;

        Ok(Self {
            inner,
            device: device.clone(),
            decoder_start_token_id: config
                .decoder_start_token_id
                .unwrap_or(config.pad_token_id) as u32,
            eos_token_id: config.eos_token_id as u32,
        })
    }
}

impl Seq2SeqModel for T5Model {
    fn device(&self) -> &Device {
        &self.device
    }

    fn decoder_start_token_id(&self) -> u32 {
        self.decoder_start_token_id
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn encode(&mut self, input_ids: &Tensor) -> CandleResult<Tensor> {
        self.inner.clear_kv_cache();
        self.inner.encode(input_ids)
    }

    fn decode(&mut self, decoder_input_ids: &Tensor, encoder_output: &Tensor) -> CandleResult<Tensor> {
        self.inner.decode(decoder_input_ids, encoder_output)
    }
}

/// Loads a fine-tuned T5 model and its tokenizer from `dir`.
///
/// The directory must hold `config.json`, `tokenizer.json` and either
/// `model.safetensors` or a sharded `model.safetensors.index.json`.
pub fn load_pretrained(dir: &Path, device: &Device) -> Result<(T5Model, Tokenizer), LoadError> {
    if !dir.is_dir() {
        return Err(LoadError::MissingPath(dir.to_path_buf()));
    }

    let config = read_config(&dir.join(CONFIG_FILE))?;
    let tokenizer = load_tokenizer(&dir.join(TOKENIZER_FILE))?;
    let weights = weight_files(dir)?;

    tracing::debug!("Loading {} weight file(s) on {:?}", weights.len(), device);
    let model = T5Model::new(&weights, config, device)?;

    Ok((model, tokenizer))
}

fn read_config(path: &Path) -> Result<t5::Config, LoadError> {
    let content = read_file(path)?;
    serde_json::from_str(&content).map_err(|source| LoadError::Config {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_tokenizer(path: &Path) -> Result<Tokenizer, LoadError> {
    if !path.is_file() {
        return Err(LoadError::MissingPath(path.to_path_buf()));
    }
    Tokenizer::from_file(path).map_err(|e| LoadError::Tokenizer {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[derive(Deserialize)]
struct WeightIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Resolves the safetensors files holding the model weights.
pub fn weight_files(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let single = dir.join(WEIGHTS_FILE);
    if single.is_file() {
        return Ok(vec![single]);
    }

    let index_path = dir.join(WEIGHTS_INDEX_FILE);
    if !index_path.is_file() {
        return Err(LoadError::NoWeights(dir.to_path_buf()));
    }

    let content = read_file(&index_path)?;
    let index: WeightIndex = serde_json::from_str(&content).map_err(|source| LoadError::Config {
        path: index_path.clone(),
        source,
    })?;

    let shards: BTreeSet<&String> = index.weight_map.values().collect();
    let files: Vec<PathBuf> = shards.into_iter().map(|name| dir.join(name)).collect();

    if let Some(missing) = files.iter().find(|f| !f.is_file()) {
        return Err(LoadError::MissingPath(missing.clone()));
    }
    if files.is_empty() {
        return Err(LoadError::NoWeights(dir.to_path_buf()));
    }

    Ok(files)
}

fn read_file(path: &Path) -> Result<String, LoadError> {
    fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            LoadError::MissingPath(path.to_path_buf())
        } else {
            LoadError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_is_a_load_error() {
        let err = load_pretrained(Path::new("./does/not/exist"), &Device::Cpu).err();
        assert!(matches!(err, Some(LoadError::MissingPath(_))));
    }

    #[test]
    fn malformed_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();

        let err = load_pretrained(dir.path(), &Device::Cpu).err();
        assert!(matches!(err, Some(LoadError::Config { .. })));
    }

    #[test]
    fn single_weights_file_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(WEIGHTS_FILE), b"").unwrap();
        fs::write(dir.path().join(WEIGHTS_INDEX_FILE), "{}").unwrap();

        let files = weight_files(dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join(WEIGHTS_FILE)]);
    }

    #[test]
    fn sharded_weights_are_deduplicated_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let index = r#"{
            "metadata": {"total_size": 10},
            "weight_map": {
                "shared.weight": "model-00002-of-00002.safetensors",
                "encoder.block.0.layer.0.SelfAttention.q.weight": "model-00001-of-00002.safetensors",
                "decoder.block.0.layer.0.SelfAttention.q.weight": "model-00001-of-00002.safetensors"
            }
        }"#;
        fs::write(dir.path().join(WEIGHTS_INDEX_FILE), index).unwrap();
        fs::write(dir.path().join("model-00001-of-00002.safetensors"), b"").unwrap();
        fs::write(dir.path().join("model-00002-of-00002.safetensors"), b"").unwrap();

        let files = weight_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn missing_shard_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let index = r#"{"weight_map": {"shared.weight": "model-00001-of-00001.safetensors"}}"#;
        fs::write(dir.path().join(WEIGHTS_INDEX_FILE), index).unwrap();

        let err = weight_files(dir.path()).err();
        assert!(matches!(err, Some(LoadError::MissingPath(_))));
    }

    #[test]
    fn directory_without_weights_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = weight_files(dir.path()).err();
        assert!(matches!(err, Some(LoadError::NoWeights(_))));
    }

    #[test]
    fn unreadable_tokenizer_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TOKENIZER_FILE);
        fs::write(&path, "garbage").unwrap();

        let err = load_tokenizer(&path).err();
        assert!(matches!(err, Some(LoadError::Tokenizer { .. })));
    }

    const WORDS: [&str; 5] = ["buy", "hold", "wonderful", "companies", "forever"];

    /// Writes a randomly initialised two-layer T5 next to a word-level
    /// tokenizer. `decoder_start_token_id` is left out of the config.
    fn tiny_t5_dir() -> tempfile::TempDir {
        use crate::testing::{vocab_size, word_level_tokenizer};
        use candle_nn::VarMap;

        let dir = tempfile::tempdir().unwrap();
        let config = serde_json::json!({
            "vocab_size": vocab_size(&WORDS),
            "d_model": 16,
            "d_kv": 4,
            "d_ff": 32,
            "num_layers": 2,
            "num_heads": 4,
            "relative_attention_num_buckets": 8,
            "dropout_rate": 0.0,
            "layer_norm_epsilon": 1e-6,
            "initializer_factor": 1.0,
            "feed_forward_proj": "relu",
            "is_encoder_decoder": true,
            "pad_token_id": 0,
            "eos_token_id": 1
        });
        fs::write(dir.path().join(CONFIG_FILE), config.to_string()).unwrap();

        let config: t5::Config = serde_json::from_value(config).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        t5::T5ForConditionalGeneration::load(vb, &config).unwrap();
        varmap.save(dir.path().join(WEIGHTS_FILE)).unwrap();

        word_level_tokenizer(&WORDS)
            .unwrap()
            .save(dir.path().join(TOKENIZER_FILE), false)
            .unwrap();
        dir
    }

    #[test]
    fn pretrained_t5_loads_with_start_token_fallback() {
        let dir = tiny_t5_dir();
        let (model, tokenizer) = load_pretrained(dir.path(), &Device::Cpu).unwrap();

        assert_eq!(model.decoder_start_token_id(), 0);
        assert_eq!(model.eos_token_id(), 1);
        assert_eq!(tokenizer.token_to_id("buy"), Some(3));
    }

    #[test]
    fn pretrained_t5_answers_through_the_store() {
        use crate::api::models::QuestionRequest;
        use crate::api::predict::handle;
        use crate::app_state::ModelStore;

        let dir = tiny_t5_dir();
        let store = ModelStore::new();
        store.load(dir.path()).unwrap();
        assert!(store.is_ready());

        let request: QuestionRequest = serde_json::from_value(serde_json::json!({
            "question": "Should I hold wonderful companies forever?",
            "max_length": 12
        }))
        .unwrap();

        let first = handle(&store, &request, 1024).unwrap();
        let second = handle(&store, &request, 1024).unwrap();
        assert_eq!(first.answer, second.answer);
        assert!(first.answer.split_whitespace().count() <= 11);
        assert!(first
            .answer
            .split_whitespace()
            .all(|word| WORDS.contains(&word)));
    }
}
