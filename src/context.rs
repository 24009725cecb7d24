//! Financial data store seam and context snapshot builder
//!
//! The store is the only durable shared resource. Reads are idempotent and
//! safe to retry; writes are single-shot and committed by the capability that
//! made them; an orchestration-level abort never rolls them back.

use crate::models::{
    Budget, BudgetCategory, BudgetOverview, CategoryStatus, ContextSnapshot, DecisionRecord,
    GoalProgress, SavingsGoal,
};
use crate::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Decisions older than this never enter a snapshot.
const DECISION_LOOKBACK_DAYS: i64 = 30;
/// Hard cap on decisions per snapshot.
const DECISION_CAP: usize = 20;

/// Trait for the financial data store
#[async_trait::async_trait]
pub trait FinanceStore: Send + Sync {
    // Reads
    async fn get_budget(&self, user_id: Uuid, on: NaiveDate) -> Result<Option<Budget>>;
    async fn get_open_goals(&self, user_id: Uuid) -> Result<Vec<SavingsGoal>>;
    async fn get_decisions_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DecisionRecord>>;

    // Writes
    async fn log_expense(&self, user_id: Uuid, category: &str, amount: f64) -> Result<()>;
    async fn set_category_limit(&self, user_id: Uuid, category: &str, limit: f64) -> Result<()>;
    async fn add_to_goal(&self, user_id: Uuid, goal_name: &str, amount: f64) -> Result<()>;
    async fn deduct_from_goal(&self, user_id: Uuid, goal_name: &str, amount: f64) -> Result<()>;
    async fn record_decision(
        &self,
        user_id: Uuid,
        item: &str,
        amount: f64,
        category: &str,
        score: f32,
    ) -> Result<Uuid>;
    async fn record_feedback(
        &self,
        user_id: Uuid,
        decision_id: Uuid,
        purchased: bool,
        regret: Option<bool>,
    ) -> Result<()>;
}

//
// ================= Snapshot Builder =================
//

/// Builds the immutable per-turn snapshot with fixed, standardized queries:
/// the budget whose period spans today, goals not yet completed, and
/// decisions from the last 30 days capped at 20.
pub struct SnapshotBuilder {
    store: Arc<dyn FinanceStore>,
}

impl SnapshotBuilder {
    pub fn new(store: Arc<dyn FinanceStore>) -> Self {
        Self { store }
    }

    /// Pure read aggregation. Absence of a budget or goals is a valid,
    /// representable state, not an error.
    pub async fn build(&self, user_id: Uuid) -> Result<ContextSnapshot> {
        let today = Utc::now().date_naive();

        let budget = self
            .store
            .get_budget(user_id, today)
            .await?
            .map(derive_budget_overview);

        let goals: Vec<GoalProgress> = self
            .store
            .get_open_goals(user_id)
            .await?
            .into_iter()
            .map(derive_goal_progress)
            .collect();

        let since = Utc::now() - Duration::days(DECISION_LOOKBACK_DAYS);
        let recent_decisions = self
            .store
            .get_decisions_since(user_id, since, DECISION_CAP)
            .await?;

        debug!(
            %user_id,
            has_budget = budget.is_some(),
            goal_count = goals.len(),
            decision_count = recent_decisions.len(),
            "Context snapshot built"
        );

        Ok(ContextSnapshot {
            user_id,
            has_budget: budget.is_some(),
            budget,
            goals,
            recent_decisions,
            built_at: Utc::now(),
        })
    }
}

fn derive_budget_overview(budget: Budget) -> BudgetOverview {
    let categories: Vec<CategoryStatus> = budget
        .categories
        .iter()
        .map(|c| CategoryStatus {
            name: c.name.clone(),
            limit: c.limit,
            spent: c.spent,
            remaining: c.limit - c.spent,
            percent_used: if c.limit > 0.0 {
                c.spent / c.limit * 100.0
            } else {
                0.0
            },
        })
        .collect();

    let total_limit: f64 = categories.iter().map(|c| c.limit).sum();
    let total_spent: f64 = categories.iter().map(|c| c.spent).sum();

    BudgetOverview {
        period_start: budget.period_start,
        period_end: budget.period_end,
        categories,
        total_limit,
        total_spent,
        total_remaining: total_limit - total_spent,
    }
}

fn derive_goal_progress(goal: SavingsGoal) -> GoalProgress {
    GoalProgress {
        remaining: (goal.target - goal.current).max(0.0),
        percent_complete: if goal.target > 0.0 {
            (goal.current / goal.target * 100.0).min(100.0)
        } else {
            100.0
        },
        name: goal.name,
        target: goal.target,
        current: goal.current,
        priority: goal.priority,
        deadline: goal.deadline,
    }
}

/// Compact plain-text rendering of a snapshot for model prompts.
pub fn summarize_snapshot(snapshot: &ContextSnapshot) -> String {
    let mut out = String::new();

    match &snapshot.budget {
        Some(budget) => {
            out.push_str(&format!(
                "Budget ({} to {}): ${:.0} spent of ${:.0} (${:.0} remaining)\n",
                budget.period_start,
                budget.period_end,
                budget.total_spent,
                budget.total_limit,
                budget.total_remaining
            ));
            for c in &budget.categories {
                out.push_str(&format!(
                    "- {}: ${:.0}/${:.0} ({:.0}% used)\n",
                    c.name, c.spent, c.limit, c.percent_used
                ));
            }
        }
        None => out.push_str("No active budget.\n"),
    }

    if snapshot.goals.is_empty() {
        out.push_str("No active goals.\n");
    } else {
        out.push_str("Goals:\n");
        for g in &snapshot.goals {
            out.push_str(&format!(
                "- {}: ${:.0}/${:.0} ({:.0}% complete)\n",
                g.name, g.current, g.target, g.percent_complete
            ));
        }
    }

    if !snapshot.recent_decisions.is_empty() {
        out.push_str("Recent purchase decisions:\n");
        for d in &snapshot.recent_decisions {
            out.push_str(&format!(
                "- [{}] {} (${:.0}, {}) score {:.2} purchased={:?}\n",
                d.id, d.item, d.amount, d.category, d.score, d.purchased
            ));
        }
    }

    out
}

//
// ================= In-Memory Store =================
//

#[derive(Default)]
struct UserLedger {
    budget: Option<Budget>,
    goals: Vec<SavingsGoal>,
    decisions: Vec<DecisionRecord>,
}

/// In-memory finance store for development and tests
pub struct InMemoryFinanceStore {
    ledgers: Arc<RwLock<HashMap<Uuid, UserLedger>>>,
}

impl InMemoryFinanceStore {
    pub fn new() -> Self {
        Self {
            ledgers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Seed helpers for demos and tests.
    pub async fn put_budget(&self, user_id: Uuid, budget: Budget) {
        let mut ledgers = self.ledgers.write().await;
        ledgers.entry(user_id).or_default().budget = Some(budget);
    }

    pub async fn put_goal(&self, user_id: Uuid, goal: SavingsGoal) {
        let mut ledgers = self.ledgers.write().await;
        ledgers.entry(user_id).or_default().goals.push(goal);
    }

    pub async fn put_decision(&self, user_id: Uuid, decision: DecisionRecord) {
        let mut ledgers = self.ledgers.write().await;
        ledgers.entry(user_id).or_default().decisions.push(decision);
    }
}

impl Default for InMemoryFinanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FinanceStore for InMemoryFinanceStore {

    async fn get_budget(&self, user_id: Uuid, on: NaiveDate) -> Result<Option<Budget>> {
        let ledgers = self.ledgers.read().await;
        Ok(ledgers
            .get(&user_id)
            .and_then(|l| l.budget.as_ref())
            .filter(|b| b.covers(on))
            .cloned())
    }

    async fn get_open_goals(&self, user_id: Uuid) -> Result<Vec<SavingsGoal>> {
        let ledgers = self.ledgers.read().await;
        Ok(ledgers
            .get(&user_id)
            .map(|l| {
                l.goals
                    .iter()
                    .filter(|g| g.current < g.target)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_decisions_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DecisionRecord>> {
        let ledgers = self.ledgers.read().await;

        let mut decisions: Vec<DecisionRecord> = ledgers
            .get(&user_id)
            .map(|l| {
                l.decisions
                    .iter()
                    .filter(|d| d.created_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        // Newest first, then cap.
        decisions.sort_by_key(|d| std::cmp::Reverse(d.created_at));
        decisions.truncate(limit);

        Ok(decisions)
    }

    async fn log_expense(&self, user_id: Uuid, category: &str, amount: f64) -> Result<()> {
        let mut ledgers = self.ledgers.write().await;
        let ledger = ledgers.entry(user_id).or_default();

        let budget = ledger.budget.get_or_insert_with(|| {
            let today = Utc::now().date_naive();
            Budget {
                period_start: today.with_day0(0).unwrap_or(today),
                period_end: today,
                categories: Vec::new(),
            }
        });

        match budget
            .categories
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(category))
        {
            Some(entry) => entry.spent += amount,
            None => budget.categories.push(BudgetCategory {
                name: category.to_string(),
                limit: 0.0,
                spent: amount,
            }),
        }

        Ok(())
    }

    async fn set_category_limit(&self, user_id: Uuid, category: &str, limit: f64) -> Result<()> {
        let mut ledgers = self.ledgers.write().await;
        let ledger = ledgers.entry(user_id).or_default();

        let Some(budget) = ledger.budget.as_mut() else {
            return Err(crate::error::AssistantError::DatabaseError(format!(
                "No active budget for user {}",
                user_id
            )));
        };

        match budget
            .categories
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(category))
        {
            Some(entry) => entry.limit = limit,
            None => budget.categories.push(BudgetCategory {
                name: category.to_string(),
                limit,
                spent: 0.0,
            }),
        }

        Ok(())
    }

    async fn add_to_goal(&self, user_id: Uuid, goal_name: &str, amount: f64) -> Result<()> {
        self.adjust_goal(user_id, goal_name, amount).await
    }

    async fn deduct_from_goal(&self, user_id: Uuid, goal_name: &str, amount: f64) -> Result<()> {
        self.adjust_goal(user_id, goal_name, -amount).await
    }

    async fn record_decision(
        &self,
        user_id: Uuid,
        item: &str,
        amount: f64,
        category: &str,
        score: f32,
    ) -> Result<Uuid> {
        let decision = DecisionRecord {
            id: Uuid::new_v4(),
            item: item.to_string(),
            amount,
            category: category.to_string(),
            score,
            purchased: None,
            regret: None,
            created_at: Utc::now(),
        };
        let id = decision.id;

        let mut ledgers = self.ledgers.write().await;
        ledgers.entry(user_id).or_default().decisions.push(decision);

        Ok(id)
    }

    async fn record_feedback(
        &self,
        user_id: Uuid,
        decision_id: Uuid,
        purchased: bool,
        regret: Option<bool>,
    ) -> Result<()> {
        let mut ledgers = self.ledgers.write().await;
        let ledger = ledgers.entry(user_id).or_default();

        let Some(decision) = ledger.decisions.iter_mut().find(|d| d.id == decision_id) else {
            return Err(crate::error::AssistantError::DatabaseError(format!(
                "Decision {} not found",
                decision_id
            )));
        };

        decision.purchased = Some(purchased);
        decision.regret = regret;

        Ok(())
    }
}

impl InMemoryFinanceStore {
    async fn adjust_goal(&self, user_id: Uuid, goal_name: &str, delta: f64) -> Result<()> {
        let mut ledgers = self.ledgers.write().await;
        let ledger = ledgers.entry(user_id).or_default();

        let Some(goal) = ledger
            .goals
            .iter_mut()
            .find(|g| g.name.eq_ignore_ascii_case(goal_name))
        else {
            return Err(crate::error::AssistantError::DatabaseError(format!(
                "Goal '{}' not found",
                goal_name
            )));
        };

        goal.current = (goal.current + delta).max(0.0);
        Ok(())
    }
}
