//! Command-line interface

use std::sync::{Arc, PoisonError};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::api::{self, predict::NUM_BEAMS};
use crate::app_state::{AppState, ModelHandle, ModelStore};
use crate::config::{CorsConfig, ModelConfig, ServerConfig};
use crate::llm::inference;

#[derive(Parser)]
#[command(name = "buffett-serve")]
#[command(about = "Financial advisor Q&A served from a fine-tuned T5 model")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load the model and serve the HTTP API
    Serve(ServeArgs),

    /// Answer a single question on stdout
    Ask(AskArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub model: ModelConfig,

    #[command(flatten)]
    pub server: ServerConfig,

    #[command(flatten)]
    pub cors: CorsConfig,
}

#[derive(Debug, Args)]
pub struct AskArgs {
    /// Question to answer
    pub question: String,

    #[command(flatten)]
    pub model: ModelConfig,

    /// Maximum decoder length, start token included
    #[arg(long, default_value_t = 200)]
    pub max_length: usize,

    #[arg(long, default_value_t = NUM_BEAMS)]
    pub num_beams: usize,
}

pub async fn serve(args: ServeArgs) -> Result<()> {
    let cors = args.cors.layer().context("invalid CORS configuration")?;
    tracing::info!("CORS enabled for origins: {:?}", args.cors.allowed_origins);

    let store = Arc::new(ModelStore::new());
    // Clears the store however serve() exits, startup failure included.
    let _guard = store.clear_on_drop();

    load_model(&store, &args.model).await?;

    let state = Arc::new(AppState::new(store.clone(), args.server.max_length_limit));
    let router = api::create_router(state, cors);
    api::server::start(router, &args.server).await
}

pub async fn ask(args: AskArgs) -> Result<()> {
    let store = Arc::new(ModelStore::new());
    let _guard = store.clear_on_drop();

    let handle = load_model(&store, &args.model).await?;

    let answer = tokio::task::spawn_blocking(move || {
        let mut model = handle.model.lock().unwrap_or_else(PoisonError::into_inner);
        inference::generate(
            &args.question,
            &mut **model,
            &handle.tokenizer,
            args.max_length,
            args.num_beams,
        )
        .map_err(anyhow::Error::from)
    })
    .await??;

    println!("{}", answer);
    Ok(())
}

async fn load_model(store: &Arc<ModelStore>, config: &ModelConfig) -> Result<ModelHandle> {
    let loader = Arc::clone(store);
    let path = config.model_path.clone();

    let handle = tokio::task::spawn_blocking(move || loader.load(&path))
        .await?
        .inspect_err(|e| tracing::error!("Failed to load fine-tuned model: {}", e))
        .with_context(|| format!("loading model from {}", config.model_path.display()))?;

    tracing::info!("Fine-tuned model loaded successfully!");
    Ok(handle)
}
