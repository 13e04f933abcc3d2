use std::time::Instant;

use candle_core::Tensor;
use tokenizers::Tokenizer;

use crate::error::InferenceError;
use crate::llm::beam::{beam_search, BeamSearchParams};
use crate::llm::models::Seq2SeqModel;

/// Instruction the model was fine-tuned with.
pub const PROMPT_PREFIX: &str = "Answer this financial question based on Warren Buffett's principles: ";

/// Prompts are truncated to this many tokens before encoding.
pub const MAX_INPUT_TOKENS: usize = 256;

pub fn build_prompt(question: &str) -> String {
    format!("{PROMPT_PREFIX}{question}")
}

/// Answers `question` with beam-search decoding.
///
/// `max_length` bounds the decoder sequence including its start token.
pub fn generate(
    question: &str,
    model: &mut dyn Seq2SeqModel,
    tokenizer: &Tokenizer,
    max_length: usize,
    num_beams: usize,
) -> Result<String, InferenceError> {
    let started = Instant::now();
    let prompt = build_prompt(question);

    let encoding = tokenizer
        .encode(prompt.as_str(), true)
        .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;
    let ids = encoding.get_ids();
    // Tokenizers installed through the model store already truncate; this
    // covers ones that were not.
    let ids = &ids[..ids.len().min(MAX_INPUT_TOKENS)];

    let input = Tensor::new(ids, model.device())?.unsqueeze(0)?;
    let encoder_output = model.encode(&input)?;

    let params = BeamSearchParams::new(num_beams, max_length);
    let output_ids = beam_search(model, &encoder_output, &params)?;

    let answer = tokenizer
        .decode(&output_ids, true)
        .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;

    tracing::debug!(
        "Generated {} tokens from {} prompt tokens in {:?}",
        output_ids.len(),
        ids.len(),
        started.elapsed()
    );

    Ok(answer)
}
