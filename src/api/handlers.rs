use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::models::{
    default_max_length, AnswerResponse, GenerateRequest, GenerateResponse, HealthResponse,
    QuestionRequest, RootResponse,
};
use crate::api::predict::{generate_text, handle};
use crate::app_state::AppState;
use crate::error::ApiError;

pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Warren Buffett Financial Advisor API (Fine-tuned)".to_string(),
        status: "running".to_string(),
    })
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (status, message) = if state.store.is_ready() {
        ("healthy", "Model ready")
    } else {
        ("error", "Model not loaded")
    };
    Json(HealthResponse {
        status: status.to_string(),
        message: message.to_string(),
    })
}

pub async fn predict(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QuestionRequest>,
) -> Result<Json<AnswerResponse>, ApiError> {
    let store = state.store.clone();
    let limit = state.max_length_limit;

    let response = tokio::task::spawn_blocking(move || handle(&store, &payload, limit))
        .await
        .map_err(|e| ApiError::Prediction(e.to_string()))??;

    Ok(Json(response))
}

pub async fn generate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let store = state.store.clone();
    let max_length = default_max_length().min(state.max_length_limit);

    let generated_text =
        tokio::task::spawn_blocking(move || generate_text(&store, &payload.inputs, max_length))
            .await
            .map_err(|e| ApiError::Prediction(e.to_string()))??;

    Ok(Json(GenerateResponse { generated_text }))
}
