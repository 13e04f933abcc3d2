use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::models::ErrorBody;

/// Failure to read a pretrained model directory. Fatal at startup.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model path does not exist: {0}")]
    MissingPath(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed model config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to load tokenizer {path}: {message}")]
    Tokenizer { path: PathBuf, message: String },

    #[error("no safetensors weights found in {0}")]
    NoWeights(PathBuf),

    #[error("failed to load model weights: {0}")]
    Weights(#[from] candle_core::Error),
}

/// The model store is empty: nothing loaded yet, or already cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Model not loaded")]
pub struct NotReady;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    #[error("invalid generation parameters: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Error)]
pub enum PredictError {
    #[error(transparent)]
    NotReady(#[from] NotReady),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid CORS origin: {0:?}")]
    InvalidOrigin(String),

    #[error("invalid CORS method: {0:?}")]
    InvalidMethod(String),

    #[error("invalid CORS header: {0:?}")]
    InvalidHeader(String),
}

/// Error returned from HTTP handlers, rendered as `{"detail": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Model not loaded")]
    NotReady,

    #[error("Prediction failed: {0}")]
    Prediction(String),
}

impl From<PredictError> for ApiError {
    fn from(err: PredictError) -> Self {
        match err {
            PredictError::NotReady(_) => ApiError::NotReady,
            PredictError::Inference(e) => ApiError::Prediction(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            detail: self.to_string(),
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}
