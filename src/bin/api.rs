use cricket_stats_agent::{
    agent::Pipeline,
    api::{start_server, ApiState},
    config::AppConfig,
    llm::build_model,
    memory::ConversationMemory,
    seed::seed_collections,
    store::build_store,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;

    if config.model.api_key.is_empty() {
        eprintln!("⚠️  No model API key set (OPENROUTER_API_KEY / OPENAI_API_KEY / GEMINI_API_KEY)");
        eprintln!("📌 See .env.example for setup instructions");
    }

    info!("🏏 Cricket Stats Agent - API Server");
    info!("📍 Port: {}", config.port);

    // Create components
    let store = build_store(config.database_url.as_deref());

    if let Some(dir) = &config.seed_dir {
        match seed_collections(store.as_ref(), dir).await {
            Ok(reports) => info!(?reports, "Seeding finished"),
            Err(e) => warn!("Seeding from {} failed: {}", dir.display(), e),
        }
    }

    let model = build_model(&config.model)?;
    let memory = Arc::new(ConversationMemory::from_config(store.clone(), &config.context));
    let pipeline = Arc::new(
        Pipeline::with_memory(model, store, memory.clone(), config.context.clone())
            .with_snapshot_delay(config.snapshot_delay),
    );

    info!("✅ Pipeline initialized");
    info!("📡 Starting API server...");

    // Start API server
    start_server(ApiState { pipeline, memory }, config.port).await?;

    Ok(())
}
