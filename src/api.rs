//! REST API server for the assistant core
//!
//! Exposes the orchestrator over HTTP: a blocking chat endpoint and an SSE
//! streaming variant. Turns for the same session are serialized here with a
//! per-session lock; the orchestrator itself assumes serialized access.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::models::{HistoryTurn, TurnRole};
use crate::orchestrator::Orchestrator;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub messages: Vec<ChatMessage>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    /// One lock per session. Two requests racing on the same session would
    /// otherwise clobber each other's state writes.
    session_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl ApiState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            session_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn lock_for(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// =============================
/// Helpers: String → UUID Parsing
/// =============================

fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

fn parse_or_stable_uuid(value: Option<&str>, fallback_seed: &str) -> Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v))
        }
        _ => stable_uuid_from_string(fallback_seed),
    }
}

struct ChatTurn {
    user_id: Uuid,
    session_id: Uuid,
    message: String,
    history: Vec<HistoryTurn>,
}

/// Pull the current user message and prior transcript out of a request.
fn extract_turn(req: &ChatRequest) -> Option<ChatTurn> {
    let last_user_index = req.messages.iter().rposition(|m| m.role == "user")?;
    let message = req.messages[last_user_index].content.clone();

    let history: Vec<HistoryTurn> = req.messages[..last_user_index]
        .iter()
        .filter_map(|m| {
            let role = match m.role.as_str() {
                "user" => TurnRole::User,
                "assistant" => TurnRole::Assistant,
                _ => return None,
            };
            Some(HistoryTurn {
                role,
                content: m.content.clone(),
            })
        })
        .collect();

    let user_id = parse_or_stable_uuid(req.user_id.as_deref(), "anonymous-user");
    let session_id = parse_or_stable_uuid(
        req.session_id.as_deref(),
        req.user_id.as_deref().unwrap_or("anonymous-session"),
    );

    Some(ChatTurn {
        user_id,
        session_id,
        message,
        history,
    })
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(turn) = extract_turn(&req) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("No user message found".into())),
        );
    };

    info!(
        "chat_handler ids => session_id={} user_id={}",
        turn.session_id, turn.user_id
    );

    let lock = state.lock_for(turn.session_id).await;
    let _guard = lock.lock().await;

    let reply = state
        .orchestrator
        .handle_turn(turn.user_id, &turn.message, turn.history, turn.session_id)
        .await;

    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "session_id": turn.session_id.to_string(),
            "user_id": turn.user_id.to_string(),
            "answer": reply.text,
            "requires_clarification": reply.requires_clarification,
            "metadata": reply.metadata,
        }))),
    )
}

/// =============================
/// Streaming Chat Endpoint
/// =============================

/// Same turn semantics as `chat_handler`, delivered as SSE text chunks.
/// Each `chunk` event carries a piece of the surviving node's reply; narration
/// from abandoned intermediate nodes is never sent.
async fn chat_stream_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> axum::response::Response {
    let Some(turn) = extract_turn(&req) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("No user message found".into())),
        )
            .into_response();
    };

    let (tx, rx) = mpsc::channel::<Result<Event, std::convert::Infallible>>(16);

    tokio::spawn(async move {
        let lock = state.lock_for(turn.session_id).await;
        let _guard = lock.lock().await;

        let events = state
            .orchestrator
            .handle_turn_events(turn.user_id, &turn.message, turn.history, turn.session_id)
            .await;

        match crate::response::aggregate(events) {
            Ok(chunks) => {
                for chunk in chunks {
                    if tx
                        .send(Ok(Event::default().event("chunk").data(chunk)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx
                    .send(Ok(Event::default().event("error").data(e.to_string())))
                    .await;
            }
        }

        let _ = tx.send(Ok(Event::default().event("done").data(""))).await;
    });

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState::new(orchestrator);

    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", post(chat_stream_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_uuid_is_deterministic() {
        let a = stable_uuid_from_string("telegram-4821");
        let b = stable_uuid_from_string("telegram-4821");
        let c = stable_uuid_from_string("telegram-4822");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.get_version_num(), 4);
    }

    #[test]
    fn test_parse_or_stable_uuid_prefers_valid_uuid() {
        let id = Uuid::new_v4();
        assert_eq!(parse_or_stable_uuid(Some(&id.to_string()), "seed"), id);
        assert_eq!(
            parse_or_stable_uuid(Some("not-a-uuid"), "seed"),
            stable_uuid_from_string("not-a-uuid")
        );
        assert_eq!(
            parse_or_stable_uuid(None, "seed"),
            stable_uuid_from_string("seed")
        );
        assert_eq!(
            parse_or_stable_uuid(Some("   "), "seed"),
            stable_uuid_from_string("seed")
        );
    }

    #[test]
    fn test_extract_turn_takes_last_user_message() {
        let req = ChatRequest {
            session_id: None,
            user_id: Some("u1".into()),
            messages: vec![
                ChatMessage {
                    role: "user".into(),
                    content: "can I buy a laptop?".into(),
                },
                ChatMessage {
                    role: "assistant".into(),
                    content: "Tell me the price first.".into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: "it's $900".into(),
                },
            ],
        };

        let turn = extract_turn(&req).unwrap();
        assert_eq!(turn.message, "it's $900");
        assert_eq!(turn.history.len(), 2);
        assert_eq!(turn.history[0].role, TurnRole::User);
        assert_eq!(turn.history[1].role, TurnRole::Assistant);
    }

    #[test]
    fn test_extract_turn_requires_a_user_message() {
        let req = ChatRequest {
            session_id: None,
            user_id: None,
            messages: vec![ChatMessage {
                role: "assistant".into(),
                content: "hello".into(),
            }],
        };
        assert!(extract_turn(&req).is_none());
    }
}
