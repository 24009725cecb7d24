//! Tool trait and store-backed sub-operations
//!
//! Tools are the only write path capabilities have to the data store. Each
//! tool is bound to the turn's user at construction so the model can never
//! address another user's data. A committed write stays committed even if
//! the orchestration aborts afterwards.

use crate::context::{FinanceStore, SnapshotBuilder};
use crate::error::AssistantError;
use crate::models::Capability;
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Trait for a single tool the inference backend may invoke.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of the tool's arguments, as declared to the backend.
    fn parameters(&self) -> Value;
    async fn execute(&self, args: &Value) -> Result<Value>;
}

fn require_str(args: &Value, key: &str) -> Result<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            AssistantError::InvalidToolInput(format!("Expected string argument '{}'", key))
        })
}

fn require_f64(args: &Value, key: &str) -> Result<f64> {
    args.get(key).and_then(|v| v.as_f64()).ok_or_else(|| {
        AssistantError::InvalidToolInput(format!("Expected numeric argument '{}'", key))
    })
}

fn require_bool(args: &Value, key: &str) -> Result<bool> {
    args.get(key).and_then(|v| v.as_bool()).ok_or_else(|| {
        AssistantError::InvalidToolInput(format!("Expected boolean argument '{}'", key))
    })
}

//
// ================= Store-Backed Tools =================
//

pub struct LogExpenseTool {
    store: Arc<dyn FinanceStore>,
    user_id: Uuid,
}

#[async_trait::async_trait]
impl Tool for LogExpenseTool {
    fn name(&self) -> &'static str {
        "log_expense"
    }

    fn description(&self) -> &'static str {
        "Record an expense against a budget category"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "category": { "type": "string" },
                "amount": { "type": "number" }
            },
            "required": ["category", "amount"]
        })
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let category = require_str(args, "category")?;
        let amount = require_f64(args, "amount")?;

        self.store
            .log_expense(self.user_id, &category, amount)
            .await?;

        info!(user_id = %self.user_id, %category, amount, "Expense logged");
        Ok(json!({ "logged": true, "category": category, "amount": amount }))
    }
}

pub struct SetCategoryLimitTool {
    store: Arc<dyn FinanceStore>,
    user_id: Uuid,
}

#[async_trait::async_trait]
impl Tool for SetCategoryLimitTool {
    fn name(&self) -> &'static str {
        "set_category_limit"
    }

    fn description(&self) -> &'static str {
        "Change the monthly limit of a budget category"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "category": { "type": "string" },
                "limit": { "type": "number" }
            },
            "required": ["category", "limit"]
        })
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let category = require_str(args, "category")?;
        let limit = require_f64(args, "limit")?;

        self.store
            .set_category_limit(self.user_id, &category, limit)
            .await?;

        Ok(json!({ "updated": true, "category": category, "limit": limit }))
    }
}

pub struct AdjustGoalTool {
    store: Arc<dyn FinanceStore>,
    user_id: Uuid,
    deduct: bool,
}

#[async_trait::async_trait]
impl Tool for AdjustGoalTool {
    fn name(&self) -> &'static str {
        if self.deduct {
            "deduct_goal_amount"
        } else {
            "add_goal_amount"
        }
    }

    fn description(&self) -> &'static str {
        if self.deduct {
            "Withdraw an amount from a savings goal"
        } else {
            "Add a contribution to a savings goal"
        }
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "goal_name": { "type": "string" },
                "amount": { "type": "number" }
            },
            "required": ["goal_name", "amount"]
        })
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let goal_name = require_str(args, "goal_name")?;
        let amount = require_f64(args, "amount")?;

        if self.deduct {
            self.store
                .deduct_from_goal(self.user_id, &goal_name, amount)
                .await?;
        } else {
            self.store
                .add_to_goal(self.user_id, &goal_name, amount)
                .await?;
        }

        info!(user_id = %self.user_id, goal = %goal_name, amount, deduct = self.deduct, "Goal adjusted");
        Ok(json!({ "updated": true, "goal_name": goal_name, "amount": amount }))
    }
}

pub struct RecordDecisionTool {
    store: Arc<dyn FinanceStore>,
    user_id: Uuid,
}

#[async_trait::async_trait]
impl Tool for RecordDecisionTool {
    fn name(&self) -> &'static str {
        "record_decision"
    }

    fn description(&self) -> &'static str {
        "Persist a purchase decision with its score so it can be referenced later"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "item": { "type": "string" },
                "amount": { "type": "number" },
                "category": { "type": "string" },
                "score": { "type": "number" }
            },
            "required": ["item", "amount", "category", "score"]
        })
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let item = require_str(args, "item")?;
        let amount = require_f64(args, "amount")?;
        let category = require_str(args, "category")?;
        let score = require_f64(args, "score")? as f32;

        let decision_id = self
            .store
            .record_decision(self.user_id, &item, amount, &category, score)
            .await?;

        Ok(json!({ "decision_id": decision_id.to_string(), "item": item }))
    }
}

pub struct RecordFeedbackTool {
    store: Arc<dyn FinanceStore>,
    user_id: Uuid,
}

#[async_trait::async_trait]
impl Tool for RecordFeedbackTool {
    fn name(&self) -> &'static str {
        "record_feedback"
    }

    fn description(&self) -> &'static str {
        "Record whether a past purchase decision was acted on and regretted"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "decision_id": { "type": "string" },
                "purchased": { "type": "boolean" },
                "regret": { "type": "boolean" }
            },
            "required": ["decision_id", "purchased"]
        })
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let decision_id = require_str(args, "decision_id")?;
        let decision_id = Uuid::parse_str(&decision_id).map_err(|_| {
            AssistantError::InvalidToolInput(format!(
                "'decision_id' is not a UUID: {}",
                decision_id
            ))
        })?;
        let purchased = require_bool(args, "purchased")?;
        let regret = args.get("regret").and_then(|v| v.as_bool());

        self.store
            .record_feedback(self.user_id, decision_id, purchased, regret)
            .await?;

        Ok(json!({ "recorded": true, "decision_id": decision_id.to_string() }))
    }
}

/// Freshness re-query. The per-turn snapshot is never mutated, so a
/// capability that has just written and needs current numbers asks for them
/// explicitly through this tool.
pub struct BudgetStatusTool {
    store: Arc<dyn FinanceStore>,
    user_id: Uuid,
}

#[async_trait::async_trait]
impl Tool for BudgetStatusTool {
    fn name(&self) -> &'static str {
        "get_budget_status"
    }

    fn description(&self) -> &'static str {
        "Re-read the current budget from the data store (the turn snapshot is frozen)"
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: &Value) -> Result<Value> {
        let snapshot = SnapshotBuilder::new(self.store.clone())
            .build(self.user_id)
            .await?;

        Ok(match snapshot.budget {
            Some(budget) => serde_json::to_value(budget)?,
            None => json!({ "has_budget": false }),
        })
    }
}

//
// ================= Per-Capability Tool Sets =================

/// The sub-operations a capability is allowed to invoke. Built per turn so
/// each tool is bound to the requesting user.
pub fn tools_for(
    capability: Capability,
    store: Arc<dyn FinanceStore>,
    user_id: Uuid,
) -> Vec<Arc<dyn Tool>> {
    match capability {
        Capability::Router | Capability::GeneralAssistant => Vec::new(),
        Capability::PurchaseAdvisor => vec![
            Arc::new(RecordDecisionTool {
                store: store.clone(),
                user_id,
            }),
            Arc::new(BudgetStatusTool { store, user_id }),
        ],
        Capability::FeedbackRecorder => vec![Arc::new(RecordFeedbackTool { store, user_id })],
        Capability::BudgetAnalyst => vec![Arc::new(BudgetStatusTool { store, user_id })],
        Capability::GoalPlanner => vec![
            Arc::new(AdjustGoalTool {
                store: store.clone(),
                user_id,
                deduct: false,
            }),
            Arc::new(AdjustGoalTool {
                store,
                user_id,
                deduct: true,
            }),
        ],
        Capability::ExpenseLogger => vec![
            Arc::new(LogExpenseTool {
                store: store.clone(),
                user_id,
            }),
            Arc::new(BudgetStatusTool { store, user_id }),
        ],
        Capability::BudgetEditor => vec![
            Arc::new(SetCategoryLimitTool {
                store: store.clone(),
                user_id,
            }),
            Arc::new(BudgetStatusTool { store, user_id }),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InMemoryFinanceStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_log_expense_tool_writes_through() {
        let store = Arc::new(InMemoryFinanceStore::new());
        let user_id = Uuid::new_v4();

        let tool = LogExpenseTool {
            store: store.clone(),
            user_id,
        };
        let result = tool
            .execute(&json!({ "category": "groceries", "amount": 42.0 }))
            .await
            .unwrap();

        assert_eq!(result["logged"], json!(true));

        let budget = store
            .get_budget(user_id, Utc::now().date_naive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(budget.categories[0].spent, 42.0);
    }

    #[tokio::test]
    async fn test_missing_argument_is_rejected() {
        let store: Arc<dyn FinanceStore> = Arc::new(InMemoryFinanceStore::new());
        let tool = LogExpenseTool {
            store,
            user_id: Uuid::new_v4(),
        };

        let result = tool.execute(&json!({ "category": "groceries" })).await;
        assert!(matches!(
            result,
            Err(AssistantError::InvalidToolInput(_))
        ));
    }

    #[tokio::test]
    async fn test_feedback_tool_rejects_bad_uuid() {
        let store: Arc<dyn FinanceStore> = Arc::new(InMemoryFinanceStore::new());
        let tool = RecordFeedbackTool {
            store,
            user_id: Uuid::new_v4(),
        };

        let result = tool
            .execute(&json!({ "decision_id": "not-a-uuid", "purchased": true }))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_capability_tool_sets_are_scoped() {
        let store: Arc<dyn FinanceStore> = Arc::new(InMemoryFinanceStore::new());
        let user_id = Uuid::new_v4();

        assert!(tools_for(Capability::Router, store.clone(), user_id).is_empty());

        let logger_tools: Vec<&str> = tools_for(Capability::ExpenseLogger, store.clone(), user_id)
            .iter()
            .map(|t| t.name())
            .collect();
        assert_eq!(logger_tools, vec!["log_expense", "get_budget_status"]);

        let feedback_tools: Vec<&str> = tools_for(Capability::FeedbackRecorder, store, user_id)
            .iter()
            .map(|t| t.name())
            .collect();
        assert_eq!(feedback_tools, vec!["record_feedback"]);
    }
}
