use finance_assistant_core::{
    api::start_server,
    capabilities::build_registry,
    classifier::IntentClassifier,
    context::{InMemoryFinanceStore, SnapshotBuilder},
    llm::GeminiModel,
    orchestrator::{Orchestrator, OrchestratorConfig},
    session::build_session_store,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let gemini_api_key = std::env::var("GEMINI_API_KEY").unwrap_or_else(|_| {
        eprintln!("⚠️  GEMINI_API_KEY not set in .env");
        eprintln!("📌 See .env.example for setup instructions");
        "mock_key".to_string()
    });

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("🚀 Finance Assistant Core - API Server");
    info!("📍 Port: {}", api_port);

    // Create components
    let model = Arc::new(GeminiModel::new(gemini_api_key));
    let store = Arc::new(InMemoryFinanceStore::new());
    let registry = build_registry(model.clone(), store.clone());
    let classifier = IntentClassifier::new(model);
    let snapshots = SnapshotBuilder::new(store);
    let sessions = build_session_store();

    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        classifier,
        snapshots,
        sessions,
        OrchestratorConfig::default(),
    ));

    info!("✅ Orchestrator initialized");
    info!("📡 Starting API server...");

    start_server(orchestrator, api_port).await?;

    Ok(())
}
