use std::sync::PoisonError;

use crate::api::models::{AnswerResponse, Confidence, QuestionRequest};
use crate::app_state::{ModelHandle, ModelStore};
use crate::error::{InferenceError, PredictError};
use crate::llm::inference;

/// Beam count used for every prediction.
pub const NUM_BEAMS: usize = 4;

/// Answers a question with the model currently in `store`.
///
/// Blocks for the whole generation; call it off the async runtime.
pub fn handle(
    store: &ModelStore,
    request: &QuestionRequest,
    max_length_limit: usize,
) -> Result<AnswerResponse, PredictError> {
    let handle = store.get().inspect_err(|_| {
        tracing::error!("Model not loaded when prediction requested");
    })?;

    let max_length = request.max_length.min(max_length_limit);
    if max_length < request.max_length {
        tracing::warn!(
            "Requested max_length {} clamped to {}",
            request.max_length,
            max_length
        );
    }

    tracing::info!(
        "Generating prediction for question: {}...",
        preview(&request.question, 50)
    );

    let answer = generate_locked(&handle, &request.question, max_length).inspect_err(|e| {
        tracing::error!("Prediction failed: {}", e);
    })?;

    let confidence = Confidence::from_answer(&answer);
    tracing::info!("Prediction generated successfully with {} confidence", confidence);

    Ok(AnswerResponse {
        question: request.question.clone(),
        answer,
        confidence,
    })
}

/// Raw text generation for the inference-endpoint style route.
pub fn generate_text(store: &ModelStore, inputs: &str, max_length: usize) -> Result<String, PredictError> {
    let handle = store.get()?;
    let text = generate_locked(&handle, inputs, max_length).inspect_err(|e| {
        tracing::error!("Generation failed: {}", e);
    })?;
    Ok(text)
}

fn generate_locked(
    handle: &ModelHandle,
    question: &str,
    max_length: usize,
) -> Result<String, InferenceError> {
    // Every generation starts from a fresh encoder pass with an empty kv
    // cache, so a model left behind by a panicking request is still usable.
    let mut model = handle.model.lock().unwrap_or_else(PoisonError::into_inner);
    inference::generate(question, &mut **model, &handle.tokenizer, max_length, NUM_BEAMS)
}

fn preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
