use chrono::{Datelike, Utc};
use finance_assistant_core::{
    capabilities::build_registry,
    classifier::IntentClassifier,
    context::{InMemoryFinanceStore, SnapshotBuilder},
    llm::GeminiModel,
    models::{Budget, BudgetCategory, GoalPriority, SavingsGoal},
    orchestrator::{Orchestrator, OrchestratorConfig},
    session::InMemorySessionStore,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Seed one demo user so budget and goal questions have something to answer.
async fn seed_demo_user(store: &InMemoryFinanceStore, user_id: Uuid) {
    let today = Utc::now().date_naive();
    let period_start = today.with_day(1).unwrap_or(today);

    store
        .put_budget(
            user_id,
            Budget {
                period_start,
                period_end: period_start + chrono::Duration::days(30),
                categories: vec![
                    BudgetCategory {
                        name: "dining".to_string(),
                        limit: 300.0,
                        spent: 120.0,
                    },
                    BudgetCategory {
                        name: "transport".to_string(),
                        limit: 150.0,
                        spent: 40.0,
                    },
                    BudgetCategory {
                        name: "entertainment".to_string(),
                        limit: 100.0,
                        spent: 85.0,
                    },
                ],
            },
        )
        .await;

    store
        .put_goal(
            user_id,
            SavingsGoal {
                name: "vacation".to_string(),
                target: 2000.0,
                current: 650.0,
                priority: GoalPriority::High,
                deadline: None,
            },
        )
        .await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    dotenv::dotenv().ok();

    let gemini_api_key = std::env::var("GEMINI_API_KEY").unwrap_or_else(|_| {
        eprintln!("⚠️  GEMINI_API_KEY not set in .env");
        "mock_key".to_string()
    });

    let message = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let message = if message.is_empty() {
        "How is my dining budget doing this month?".to_string()
    } else {
        message
    };

    info!("Finance Assistant Core - one-shot chat turn");

    let model = Arc::new(GeminiModel::new(gemini_api_key));
    let store = Arc::new(InMemoryFinanceStore::new());

    let user_id = Uuid::new_v4();
    let session_id = Uuid::new_v4();
    seed_demo_user(&store, user_id).await;

    let orchestrator = Orchestrator::new(
        build_registry(model.clone(), store.clone()),
        IntentClassifier::new(model),
        SnapshotBuilder::new(store),
        Arc::new(InMemorySessionStore::new()),
        OrchestratorConfig::default(),
    );

    info!(%user_id, %session_id, message = %message, "Running turn");

    let reply = orchestrator
        .handle_turn(user_id, &message, vec![], session_id)
        .await;

    println!("\n{}", reply.text);
    if reply.requires_clarification {
        println!("(clarification requested)");
    }

    Ok(())
}
