//! Intent classifier
//!
//! One structured request to the inference backend maps (message, short
//! history, context snapshot) to an intent, extracted entities, a confidence
//! score, and an optional clarification question. Read-only; parse failures
//! surface as `ClassificationError` and the caller falls back to
//! `general_question` with a clarification prompt.

use crate::context::summarize_snapshot;
use crate::error::AssistantError;
use crate::llm::{strip_code_fences, CompletionRequest, LanguageModel};
use crate::models::{ContextSnapshot, HistoryTurn, IntentResult, TurnRole};
use crate::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Turns of history older than this carry no classification signal.
const HISTORY_WINDOW: usize = 3;

const CLASSIFIER_SYSTEM: &str = r#"You classify messages sent to a personal-finance assistant.

Pick exactly ONE intent:
- purchase_decision: the user is deciding whether to buy something ("should I get the $300 jacket?")
- purchase_feedback: the user reports the outcome of a past purchase decision ("I bought it", "I returned the shoes"). A report about an earlier decision is purchase_feedback, NOT purchase_decision.
- budget_query: the user asks about budget state ("how much is left for groceries?")
- goal_update: the user adds to, withdraws from, or asks about a savings goal
- log_expense: the user reports spending to record ("log $12 for lunch")
- budget_modification: the user changes budget structure or limits ("raise dining to $250")
- general_question: a substantive question that fits none of the above
- small_talk: greetings, acknowledgements, chit-chat. "Hi", "thanks!", "ok cool" are small_talk, NOT general_question.

Extract entities when present: item_name, amount, category, goal_name, operation.
Set confidence in [0,1]. If the message is too ambiguous to route, set
needs_clarification=true and write a short clarification_question.

Return ONLY JSON:
{"primary_intent": "...", "extracted_entities": {...}, "confidence": 0.0, "needs_clarification": false, "clarification_question": null}"#;

/// Classifies one user message per turn.
pub struct IntentClassifier {
    model: Arc<dyn LanguageModel>,
}

impl IntentClassifier {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Classify a message against the last few turns and the snapshot.
    pub async fn classify(
        &self,
        message: &str,
        history: &[HistoryTurn],
        snapshot: &ContextSnapshot,
    ) -> Result<IntentResult> {
        if message.trim().is_empty() {
            return Err(AssistantError::ClassificationError(
                "Message is empty".to_string(),
            ));
        }

        let prompt = build_prompt(message, history, snapshot);

        let mut request = CompletionRequest::text(CLASSIFIER_SYSTEM, prompt);
        request.response_schema = Some(intent_schema());

        let completion = self.model.complete(request).await?;
        let result = parse_intent_response(&completion.text)?;

        debug!(
            intent = %result.primary_intent,
            confidence = result.confidence,
            needs_clarification = result.needs_clarification,
            "Message classified"
        );

        Ok(result)
    }
}

fn build_prompt(message: &str, history: &[HistoryTurn], snapshot: &ContextSnapshot) -> String {
    let mut prompt = String::new();

    let recent = history.len().saturating_sub(HISTORY_WINDOW);
    if !history[recent..].is_empty() {
        prompt.push_str("Recent conversation:\n");
        for turn in &history[recent..] {
            let role = match turn.role {
                TurnRole::User => "User",
                TurnRole::Assistant => "Assistant",
            };
            prompt.push_str(&format!("{}: {}\n", role, turn.content));
        }
        prompt.push('\n');
    }

    prompt.push_str("User financial context:\n");
    prompt.push_str(&summarize_snapshot(snapshot));
    prompt.push('\n');

    prompt.push_str("Classify this message: ");
    prompt.push_str(message);
    prompt
}

/// Declared output shape for the backend.
fn intent_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "primary_intent": {
                "type": "string",
                "enum": [
                    "purchase_decision", "purchase_feedback", "budget_query",
                    "goal_update", "log_expense", "budget_modification",
                    "general_question", "small_talk"
                ]
            },
            "extracted_entities": { "type": "object" },
            "confidence": { "type": "number" },
            "needs_clarification": { "type": "boolean" },
            "clarification_question": { "type": "string", "nullable": true }
        },
        "required": ["primary_intent", "confidence"]
    })
}

/// Parse the backend's output into an `IntentResult`.
fn parse_intent_response(response: &str) -> Result<IntentResult> {
    let cleaned = strip_code_fences(response);

    let mut result: IntentResult = serde_json::from_str(cleaned).map_err(|e| {
        warn!("Unparseable classifier output: {}", response);
        AssistantError::ClassificationError(format!(
            "Backend output did not match the intent shape: {} | raw={}",
            e, response
        ))
    })?;

    result.confidence = result.confidence.clamp(0.0, 1.0);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockModel;
    use crate::models::Intent;
    use chrono::Utc;
    use uuid::Uuid;

    fn empty_snapshot() -> ContextSnapshot {
        ContextSnapshot {
            user_id: Uuid::new_v4(),
            has_budget: false,
            budget: None,
            goals: Vec::new(),
            recent_decisions: Vec::new(),
            built_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_classify_parses_structured_output() {
        let model = Arc::new(MockModel::with_responses(vec![
            r#"{"primary_intent": "log_expense", "extracted_entities": {"amount": 12.0, "category": "lunch"}, "confidence": 0.93, "needs_clarification": false, "clarification_question": null}"#,
        ]));
        let classifier = IntentClassifier::new(model);

        let result = classifier
            .classify("log $12 for lunch", &[], &empty_snapshot())
            .await
            .unwrap();

        assert_eq!(result.primary_intent, Intent::LogExpense);
        assert!(result.confidence > 0.9);
        assert!(!result.needs_clarification);
    }

    #[tokio::test]
    async fn test_classify_tolerates_code_fences() {
        let model = Arc::new(MockModel::with_responses(vec![
            "```json\n{\"primary_intent\": \"small_talk\", \"confidence\": 0.99}\n```",
        ]));
        let classifier = IntentClassifier::new(model);

        let result = classifier
            .classify("Hi", &[], &empty_snapshot())
            .await
            .unwrap();

        assert_eq!(result.primary_intent, Intent::SmallTalk);
    }

    #[tokio::test]
    async fn test_unparseable_output_is_classification_error() {
        let model = Arc::new(MockModel::with_responses(vec![
            "Sure! The intent here is probably logging an expense.",
        ]));
        let classifier = IntentClassifier::new(model);

        let result = classifier
            .classify("log $12 for lunch", &[], &empty_snapshot())
            .await;

        assert!(matches!(
            result,
            Err(AssistantError::ClassificationError(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let model = Arc::new(MockModel::with_responses(vec![]));
        let classifier = IntentClassifier::new(model);

        let result = classifier.classify("   ", &[], &empty_snapshot()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_history_is_trimmed_to_window() {
        let model = Arc::new(MockModel::with_responses(vec![
            r#"{"primary_intent": "purchase_feedback", "confidence": 0.8}"#,
        ]));
        let classifier = IntentClassifier::new(model.clone());

        let history: Vec<HistoryTurn> = (0..6)
            .map(|i| HistoryTurn {
                role: TurnRole::User,
                content: format!("turn-{}", i),
            })
            .collect();

        classifier
            .classify("I bought it", &history, &empty_snapshot())
            .await
            .unwrap();

        let (_, prompt) = &model.seen_requests()[0];
        assert!(prompt.contains("turn-5"));
        assert!(!prompt.contains("turn-2"));
    }

    #[test]
    fn test_confidence_is_clamped() {
        let result =
            parse_intent_response(r#"{"primary_intent": "budget_query", "confidence": 3.5}"#)
                .unwrap();
        assert_eq!(result.confidence, 1.0);
    }
}
