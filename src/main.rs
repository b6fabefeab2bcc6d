mod agent;
mod clock;
mod docs;
mod error;
mod llm;
mod prompts;
mod routes;
mod sandbox;
mod state;
mod tools;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agent::TurnEngine;
use docs::DocumentStore;
use llm::{AnthropicClient, GeminiClient};
use sandbox::Sandbox;
use state::{AppState, Settings};
use tools::reference::ReferenceSearch;
use tools::ToolContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    // Load env
    let _ = dotenv::dotenv();
    let settings = Settings::from_env()?;

    // Init storage
    let store = Arc::new(DocumentStore::open(&settings.database_path)?);
    info!("Document store initialized at {:?}", settings.database_path);

    // Init model clients
    let model = Arc::new(AnthropicClient::from_env()?);
    let gemini = Arc::new(GeminiClient::from_env()?);
    info!("Model clients initialized");

    let tools = Arc::new(ToolContext {
        store: store.clone(),
        reference: Arc::new(ReferenceSearch::new(
            gemini.clone(),
            settings.reference_data_path.clone(),
            settings.search_batch_size,
        )),
        sandbox: Arc::new(Sandbox::new()),
        time_zone: settings.agent.time_zone,
    });

    let engine = Arc::new(TurnEngine::new(model, store.clone(), tools, settings.agent));

    let app_state = AppState {
        store,
        engine,
        transcriber: gemini,
        time_zone: settings.agent.time_zone,
    };

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind_addr))?;
    info!(
        addr = %settings.bind_addr,
        time_zone = %settings.agent.time_zone,
        max_turns = settings.agent.max_turns,
        "Starting coach server..."
    );

    axum::serve(listener, routes::router(app_state))
        .await
        .context("Server error")?;

    Ok(())
}
