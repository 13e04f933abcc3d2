//! HTTP inference server for a fine-tuned T5 model that answers financial
//! questions in the style of Warren Buffett.
//!
//! The model and tokenizer are loaded once into a [`ModelStore`] at startup.
//! `POST /predict` wraps the question in a fixed instruction prompt, runs
//! beam-search decoding and labels the answer with a length-based
//! [`Confidence`](api::models::Confidence).

pub mod api;
pub mod app_state;
pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use app_state::{AppState, ModelHandle, ModelStore};
pub use error::{ApiError, InferenceError, LoadError, NotReady, PredictError};
