//! Finance Assistant Core
//!
//! Conversational task routing for a personal-finance assistant:
//! - Classifies each message into one of a closed set of intents
//! - Resolves elliptical follow-ups ("I bought it") from per-session state
//! - Runs a bounded multi-specialist handoff chain per turn
//! - Always produces exactly one user-facing reply, even on failure
//!
//! TURN LOOP:
//! MESSAGE → SNAPSHOT → CLASSIFY → ROUTE → HANDOFF* → REPLY → STATE UPDATE

pub mod api;
pub mod capabilities;
pub mod classifier;
pub mod context;
pub mod error;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod response;
pub mod session;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
