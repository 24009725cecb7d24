//! Session-keyed conversation state
//!
//! Holds the per-session record used for ellipsis resolution and the
//! post-turn updater that derives new active references from the execution
//! trace. The store sits behind a narrow get/set/clear interface and is
//! injected into the orchestrator; backends are in-memory or Postgres.

use crate::models::{ConversationState, ExecutionTrace, Intent};
use crate::Result;
use lazy_static::lazy_static;
use regex::Regex;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Trait for session state persistence
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: Uuid) -> Result<Option<ConversationState>>;
    async fn set(&self, state: ConversationState) -> Result<()>;
    async fn clear(&self, session_id: Uuid) -> Result<()>;
}

/// In-memory session store for development and tests
pub struct InMemorySessionStore {
    states: Arc<RwLock<HashMap<Uuid, ConversationState>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: Uuid) -> Result<Option<ConversationState>> {
        let states = self.states.read().await;
        Ok(states.get(&session_id).cloned())
    }

    async fn set(&self, state: ConversationState) -> Result<()> {
        let mut states = self.states.write().await;
        states.insert(state.session_id, state);
        Ok(())
    }

    async fn clear(&self, session_id: Uuid) -> Result<()> {
        let mut states = self.states.write().await;
        states.remove(&session_id);
        Ok(())
    }
}

//
// ================= Postgres Backend =================
//

/// Postgres-backed session store with lazy schema initialization
pub struct PostgresSessionStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversation_state (
                      session_id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      turn_count INTEGER NOT NULL DEFAULT 0,
                      active_decision_id UUID,
                      active_goal_name TEXT,
                      active_category TEXT,
                      last_intent TEXT,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                crate::error::AssistantError::DatabaseError(format!(
                    "Failed to initialize conversation_state schema: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionStore for PostgresSessionStore {
    async fn get(&self, session_id: Uuid) -> Result<Option<ConversationState>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT session_id, user_id, turn_count, active_decision_id,
                   active_goal_name, active_category, last_intent, updated_at
            FROM conversation_state
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            crate::error::AssistantError::DatabaseError(format!(
                "Failed to load conversation state: {}",
                e
            ))
        })?;

        Ok(row.map(|row| {
            let turn_count: i32 = row.try_get("turn_count").unwrap_or(0);
            let last_intent: Option<String> = row.try_get("last_intent").ok();

            ConversationState {
                session_id,
                user_id: row.try_get("user_id").unwrap_or_else(|_| Uuid::nil()),
                turn_count: turn_count.max(0) as u32,
                active_decision_id: row.try_get("active_decision_id").ok(),
                active_goal_name: row.try_get("active_goal_name").ok(),
                active_category: row.try_get("active_category").ok(),
                last_intent: last_intent.as_deref().and_then(Intent::parse),
                updated_at: row
                    .try_get("updated_at")
                    .unwrap_or_else(|_| chrono::Utc::now()),
            }
        }))
    }

    async fn set(&self, state: ConversationState) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO conversation_state
              (session_id, user_id, turn_count, active_decision_id,
               active_goal_name, active_category, last_intent, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (session_id) DO UPDATE SET
              turn_count = EXCLUDED.turn_count,
              active_decision_id = EXCLUDED.active_decision_id,
              active_goal_name = EXCLUDED.active_goal_name,
              active_category = EXCLUDED.active_category,
              last_intent = EXCLUDED.last_intent,
              updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(state.session_id)
        .bind(state.user_id)
        .bind(state.turn_count as i32)
        .bind(state.active_decision_id)
        .bind(&state.active_goal_name)
        .bind(&state.active_category)
        .bind(state.last_intent.map(|i| i.as_str().to_string()))
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            crate::error::AssistantError::DatabaseError(format!(
                "Failed to save conversation state: {}",
                e
            ))
        })?;

        Ok(())
    }

    async fn clear(&self, session_id: Uuid) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query("DELETE FROM conversation_state WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                crate::error::AssistantError::DatabaseError(format!(
                    "Failed to clear conversation state: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

/// Build a session store from the environment: Postgres when
/// POSTGRES_URL/DATABASE_URL is set and connectable, in-memory otherwise.
pub fn build_session_store() -> Arc<dyn SessionStore> {
    let database_url = env::var("POSTGRES_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .ok();

    if let Some(url) = database_url {
        match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&url)
        {
            Ok(pool) => {
                info!("Session store backend: postgres");
                return Arc::new(PostgresSessionStore::new(pool));
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres session store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Session store backend: in-memory");
    Arc::new(InMemorySessionStore::new())
}

//
// ================= Post-Turn Updater =================
//

/// Stop words dropped before picking the active category token: prepositions,
/// logging verbs, pronouns, articles, and the words "budget"/"category"
/// themselves. Numerals are filtered separately.
const CATEGORY_STOP_WORDS: &[&str] = &[
    // Prepositions
    "for", "to", "in", "on", "at", "of", "under", "from", "with", "into", "over", "about", "by",
    // Verbs
    "add", "log", "logged", "spent", "spend", "spending", "put", "set", "track", "record",
    "bought", "buy", "pay", "paid", "want", "need", "show", "tell", "give",
    // Pronouns
    "i", "me", "my", "mine", "you", "your", "it", "we", "our", "they", "them", "this", "that",
    // Articles & filler
    "a", "an", "the", "please", "just", "some", "and", "or", "but",
    // Question words & auxiliaries
    "how", "what", "which", "is", "are", "was", "do", "does", "did", "can", "much", "many",
    "left", "have", "has",
    // Domain filler
    "budget", "category", "dollars", "bucks", "usd",
];

lazy_static! {
    static ref UUID_TOKEN: Regex = Regex::new(
        r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}"
    )
    .unwrap();
    static ref GOAL_NAME: Regex = Regex::new(r#"goal: "([^"]+)""#).unwrap();
}

/// First non-stop-word token of a message, lowercased and stripped of
/// punctuation. Deterministic and synchronous; known to mis-tag messages
/// that mention several nouns ("log $50 for gas under transport" yields
/// "gas"), which is the accepted accuracy limitation of this heuristic.
pub fn extract_category(message: &str) -> Option<String> {
    message
        .to_lowercase()
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|token| !token.is_empty())
        .filter(|token| !token.chars().all(|c| c.is_ascii_digit() || c == '.'))
        .find(|token| !CATEGORY_STOP_WORDS.contains(token))
        .map(|token| token.to_string())
}

/// Apply the post-turn update to a session's state.
///
/// Must be called only after a turn that terminated normally; aborted turns
/// leave the state untouched because stale references are safer than
/// references derived from a truncated trace.
pub fn update_from_trace(
    state: &mut ConversationState,
    trace: &ExecutionTrace,
    user_message: &str,
) {
    state.turn_count += 1;

    // Newest-to-oldest: the terminal capability's intent wins, a capability
    // invoked earlier in the chain must not override it.
    if let Some(intent) = trace.steps.iter().rev().find_map(|s| s.capability.intent()) {
        state.last_intent = Some(intent);
    }

    if trace.capabilities().any(|c| c.touches_budget()) {
        if let Some(category) = extract_category(user_message) {
            state.active_category = Some(category);
        }
    }

    if trace.contains_intent(Intent::PurchaseDecision) {
        if let Some(step) = trace.final_step() {
            if let Some(found) = UUID_TOKEN.find(&step.output) {
                if let Ok(id) = Uuid::parse_str(found.as_str()) {
                    state.active_decision_id = Some(id);
                }
            }
        }
    }

    if trace.contains_intent(Intent::GoalUpdate) {
        if let Some(step) = trace.final_step() {
            if let Some(captures) = GOAL_NAME.captures(&step.output) {
                state.active_goal_name = Some(captures[1].to_string());
            }
        }
    }

    state.updated_at = chrono::Utc::now();

    debug!(
        session_id = %state.session_id,
        turn_count = state.turn_count,
        last_intent = ?state.last_intent,
        active_category = ?state.active_category,
        "Conversation state updated"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Capability, TraceStep};

    fn trace_of(steps: Vec<(Capability, &str)>) -> ExecutionTrace {
        let count = steps.len().saturating_sub(1) as u32;
        ExecutionTrace {
            steps: steps
                .into_iter()
                .map(|(capability, output)| TraceStep {
                    capability,
                    output: output.to_string(),
                    handoff_to: None,
                })
                .collect(),
            handoff_count: count,
        }
    }

    #[test]
    fn test_category_extraction_is_deterministic() {
        let message = "log $50 for gas under transport";
        let first = extract_category(message);
        for _ in 0..10 {
            assert_eq!(extract_category(message), first);
        }
        // First non-stop-word token wins, even with several nouns present.
        assert_eq!(first.as_deref(), Some("gas"));
    }

    #[test]
    fn test_category_extraction_skips_numerals_and_stop_words() {
        assert_eq!(
            extract_category("add 25.50 to groceries").as_deref(),
            Some("groceries")
        );
        assert_eq!(extract_category("I spent $12").as_deref(), None);
        assert_eq!(
            extract_category("How much is left in my dining budget?").as_deref(),
            Some("dining")
        );
    }

    #[test]
    fn test_last_intent_taken_from_terminal_capability() {
        let mut state = ConversationState::new(Uuid::new_v4(), Uuid::new_v4());
        let trace = trace_of(vec![
            (Capability::Router, "routing"),
            (Capability::PurchaseAdvisor, "thinking"),
            (Capability::ExpenseLogger, "Logged it."),
        ]);

        update_from_trace(&mut state, &trace, "log the coffee");

        assert_eq!(state.last_intent, Some(Intent::LogExpense));
        assert_eq!(state.turn_count, 1);
    }

    #[test]
    fn test_decision_id_extracted_from_terminal_output() {
        let mut state = ConversationState::new(Uuid::new_v4(), Uuid::new_v4());
        let id = Uuid::new_v4();
        let output = format!("Recorded decision {}. I'd hold off for now.", id);
        let trace = trace_of(vec![
            (Capability::Router, "routing"),
            (Capability::PurchaseAdvisor, &output),
        ]);

        update_from_trace(&mut state, &trace, "should I buy the jacket?");

        assert_eq!(state.active_decision_id, Some(id));
    }

    #[test]
    fn test_missing_decision_id_retains_previous() {
        let mut state = ConversationState::new(Uuid::new_v4(), Uuid::new_v4());
        let previous = Uuid::new_v4();
        state.active_decision_id = Some(previous);

        let trace = trace_of(vec![
            (Capability::Router, "routing"),
            (Capability::PurchaseAdvisor, "No identifier in this reply."),
        ]);

        update_from_trace(&mut state, &trace, "should I buy it?");

        assert_eq!(state.active_decision_id, Some(previous));
    }

    #[test]
    fn test_goal_name_extracted_by_pattern() {
        let mut state = ConversationState::new(Uuid::new_v4(), Uuid::new_v4());
        let trace = trace_of(vec![
            (Capability::Router, "routing"),
            (
                Capability::GoalPlanner,
                r#"Added $200 to goal: "emergency fund". Nice progress!"#,
            ),
        ]);

        update_from_trace(&mut state, &trace, "put 200 toward my emergency fund");

        assert_eq!(state.active_goal_name.as_deref(), Some("emergency fund"));
    }

    #[test]
    fn test_active_category_set_only_for_budget_capabilities() {
        let mut state = ConversationState::new(Uuid::new_v4(), Uuid::new_v4());
        let trace = trace_of(vec![
            (Capability::Router, "routing"),
            (Capability::GeneralAssistant, "Here's an overview."),
        ]);

        update_from_trace(&mut state, &trace, "groceries advice please");

        assert_eq!(state.active_category, None);
    }

    #[tokio::test]
    async fn test_in_memory_store_round_trip() {
        let store = InMemorySessionStore::new();
        let session_id = Uuid::new_v4();
        let mut state = ConversationState::new(session_id, Uuid::new_v4());
        state.active_category = Some("transport".to_string());

        store.set(state.clone()).await.unwrap();
        let loaded = store.get(session_id).await.unwrap().unwrap();
        assert_eq!(loaded, state);

        store.clear(session_id).await.unwrap();
        assert!(store.get(session_id).await.unwrap().is_none());
    }
}
