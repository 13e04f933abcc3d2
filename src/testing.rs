//! Deterministic stand-ins for the model and tokenizer, used by unit and
//! integration tests.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Result as CandleResult, Tensor};
use serde_json::json;
use tokenizers::Tokenizer;

use crate::llm::models::Seq2SeqModel;

pub const PAD_ID: u32 = 0;
pub const EOS_ID: u32 = 1;
pub const UNK_ID: u32 = 2;

const SPECIAL_TOKENS: [&str; 3] = ["<pad>", "</s>", "<unk>"];

type Scorer = Box<dyn Fn(&[u32]) -> Vec<f32> + Send>;

/// A model whose next-token logits are a pure function of the decoder
/// prefix. `<pad>` is the decoder start token and `</s>` ends a sequence.
pub struct StubModel {
    device: Device,
    vocab_size: usize,
    scorer: Scorer,
    fail_with: Option<String>,
    encoded_len: Arc<AtomicUsize>,
    decode_calls: Arc<AtomicUsize>,
}

impl StubModel {
    pub fn from_fn<F>(vocab_size: usize, scorer: F) -> Self
    where
        F: Fn(&[u32]) -> Vec<f32> + Send + 'static,
    {
        Self {
            device: Device::Cpu,
            vocab_size,
            scorer: Box::new(scorer),
            fail_with: None,
            encoded_len: Arc::new(AtomicUsize::new(0)),
            decode_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Emits `answer` token by token, then the end token.
    pub fn scripted(answer: Vec<u32>, vocab_size: usize) -> Self {
        Self::from_fn(vocab_size, move |prefix| {
            let generated = prefix.len().saturating_sub(1);
            let target = answer.get(generated).copied().unwrap_or(EOS_ID);
            let mut logits = vec![0.0; vocab_size];
            // Keep stray beams from finishing before the scripted one does.
            logits[EOS_ID as usize] = -10.0;
            logits[target as usize] = 10.0;
            logits
        })
    }

    /// Fails every decoding step with `message`.
    pub fn failing(vocab_size: usize, message: &str) -> Self {
        let mut model = Self::from_fn(vocab_size, |_| Vec::new());
        model.fail_with = Some(message.to_string());
        model
    }

    /// Length of the last prompt passed to `encode`.
    pub fn encoded_len(&self) -> Arc<AtomicUsize> {
        self.encoded_len.clone()
    }

    pub fn decode_calls(&self) -> Arc<AtomicUsize> {
        self.decode_calls.clone()
    }
}

impl Seq2SeqModel for StubModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn decoder_start_token_id(&self) -> u32 {
        PAD_ID
    }

    fn eos_token_id(&self) -> u32 {
        EOS_ID
    }

    fn encode(&mut self, input_ids: &Tensor) -> CandleResult<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        self.encoded_len.store(seq_len, Ordering::SeqCst);
        Tensor::zeros((1, seq_len, 1), DType::F32, &self.device)
    }

    fn decode(&mut self, decoder_input_ids: &Tensor, _encoder_output: &Tensor) -> CandleResult<Tensor> {
        self.decode_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(candle_core::Error::Msg(message.clone()));
        }

        let rows = decoder_input_ids.to_vec2::<u32>()?;
        let batch = rows.len();
        let logits: Vec<f32> = rows.iter().flat_map(|prefix| (self.scorer)(prefix.as_slice())).collect();
        Tensor::from_vec(logits, (batch, self.vocab_size), &self.device)
    }
}

/// Whitespace word-level tokenizer over `<pad>`, `</s>`, `<unk>` and `words`,
/// in that id order.
pub fn word_level_tokenizer(words: &[&str]) -> tokenizers::Result<Tokenizer> {
    let vocab: serde_json::Map<String, serde_json::Value> = SPECIAL_TOKENS
        .iter()
        .chain(words.iter())
        .enumerate()
        .map(|(id, token)| (token.to_string(), json!(id)))
        .collect();

    let added_tokens: Vec<serde_json::Value> = SPECIAL_TOKENS
        .iter()
        .enumerate()
        .map(|(id, token)| {
            json!({
                "id": id,
                "content": token,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            })
        })
        .collect();

    let definition = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "<unk>"
        }
    });

    Tokenizer::from_str(&definition.to_string())
}

/// Number of entries in a [`word_level_tokenizer`] vocabulary.
pub fn vocab_size(words: &[&str]) -> usize {
    SPECIAL_TOKENS.len() + words.len()
}

/// Ids of `answer`'s whitespace-separated words in `tokenizer`.
pub fn token_ids(tokenizer: &Tokenizer, answer: &str) -> Vec<u32> {
    answer
        .split_whitespace()
        .map(|word| tokenizer.token_to_id(word).unwrap_or(UNK_ID))
        .collect()
}
