use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use candle_core::Device;
use tokenizers::{Tokenizer, TruncationParams};

use crate::error::{LoadError, NotReady};
use crate::llm::inference::MAX_INPUT_TOKENS;
use crate::llm::models::{self, Seq2SeqModel};

pub type SharedModel = Arc<Mutex<Box<dyn Seq2SeqModel>>>;

/// A loaded model and its tokenizer. Cloning shares both.
#[derive(Clone)]
pub struct ModelHandle {
    pub name: String,
    pub model: SharedModel,
    pub tokenizer: Arc<Tokenizer>,
}

/// Holds at most one model/tokenizer pair for the lifetime of the process.
///
/// Written at startup and shutdown only; request handlers read it through
/// [`ModelStore::get`].
#[derive(Default)]
pub struct ModelStore {
    slot: RwLock<Option<ModelHandle>>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a pretrained model directory and installs it.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<ModelHandle, LoadError> {
        let path = path.as_ref();
        let device = Device::cuda_if_available(0)?;
        tracing::info!("Loading fine-tuned model from: {} on {:?}", path.display(), device);

        let (model, tokenizer) = models::load_pretrained(path, &device)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        self.install(name, Box::new(model), tokenizer)
    }

    /// Installs an already constructed pair, replacing any previous one.
    pub fn install(
        &self,
        name: impl Into<String>,
        model: Box<dyn Seq2SeqModel>,
        mut tokenizer: Tokenizer,
    ) -> Result<ModelHandle, LoadError> {
        let name = name.into();
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_INPUT_TOKENS,
                ..Default::default()
            }))
            .map_err(|e| LoadError::Tokenizer {
                path: name.clone().into(),
                message: e.to_string(),
            })?;

        let handle = ModelHandle {
            name,
            model: Arc::new(Mutex::new(model)),
            tokenizer: Arc::new(tokenizer),
        };
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        Ok(handle)
    }

    pub fn get(&self) -> Result<ModelHandle, NotReady> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(NotReady)
    }

    pub fn is_ready(&self) -> bool {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Drops the installed pair. Requests already holding a handle finish
    /// with it; the memory is released when the last handle goes away.
    pub fn clear(&self) {
        let previous = self.slot.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = previous {
            tracing::info!("Cleaning up resources for model {}", handle.name);
        }
    }

    /// Returns a guard that clears the store when dropped.
    pub fn clear_on_drop(self: &Arc<Self>) -> StoreGuard {
        StoreGuard {
            store: Arc::clone(self),
        }
    }
}

pub struct StoreGuard {
    store: Arc<ModelStore>,
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        self.store.clear();
    }
}

/// State shared by all HTTP handlers.
pub struct AppState {
    pub store: Arc<ModelStore>,
    /// Requested `max_length` values are clamped to this.
    pub max_length_limit: usize,
}

impl AppState {
    pub fn new(store: Arc<ModelStore>, max_length_limit: usize) -> Self {
        Self {
            store,
            max_length_limit,
        }
    }
}
