//! Core data models for the finance assistant

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Intents =================
//

/// The closed set of tasks a user message can resolve to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    PurchaseDecision,
    PurchaseFeedback,
    BudgetQuery,
    GoalUpdate,
    LogExpense,
    BudgetModification,
    GeneralQuestion,
    SmallTalk,
}

impl Intent {
    pub const ALL: [Intent; 8] = [
        Intent::PurchaseDecision,
        Intent::PurchaseFeedback,
        Intent::BudgetQuery,
        Intent::GoalUpdate,
        Intent::LogExpense,
        Intent::BudgetModification,
        Intent::GeneralQuestion,
        Intent::SmallTalk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::PurchaseDecision => "purchase_decision",
            Intent::PurchaseFeedback => "purchase_feedback",
            Intent::BudgetQuery => "budget_query",
            Intent::GoalUpdate => "goal_update",
            Intent::LogExpense => "log_expense",
            Intent::BudgetModification => "budget_modification",
            Intent::GeneralQuestion => "general_question",
            Intent::SmallTalk => "small_talk",
        }
    }

    pub fn parse(s: &str) -> Option<Intent> {
        Intent::ALL.iter().copied().find(|i| i.as_str() == s)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//
// ================= Capabilities =================
//

/// The closed set of task handlers. The router is the entry node for every
/// turn; each specialist owns exactly one intent. Small talk is answered by
/// the router itself, so it has no dedicated specialist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Router,
    PurchaseAdvisor,
    FeedbackRecorder,
    BudgetAnalyst,
    GoalPlanner,
    ExpenseLogger,
    BudgetEditor,
    GeneralAssistant,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Router,
        Capability::PurchaseAdvisor,
        Capability::FeedbackRecorder,
        Capability::BudgetAnalyst,
        Capability::GoalPlanner,
        Capability::ExpenseLogger,
        Capability::BudgetEditor,
        Capability::GeneralAssistant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Router => "router",
            Capability::PurchaseAdvisor => "purchase_advisor",
            Capability::FeedbackRecorder => "feedback_recorder",
            Capability::BudgetAnalyst => "budget_analyst",
            Capability::GoalPlanner => "goal_planner",
            Capability::ExpenseLogger => "expense_logger",
            Capability::BudgetEditor => "budget_editor",
            Capability::GeneralAssistant => "general_assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Capability> {
        Capability::ALL.iter().copied().find(|c| c.as_str() == s)
    }

    /// The intent a specialist owns. `None` for the router.
    pub fn intent(&self) -> Option<Intent> {
        match self {
            Capability::Router => None,
            Capability::PurchaseAdvisor => Some(Intent::PurchaseDecision),
            Capability::FeedbackRecorder => Some(Intent::PurchaseFeedback),
            Capability::BudgetAnalyst => Some(Intent::BudgetQuery),
            Capability::GoalPlanner => Some(Intent::GoalUpdate),
            Capability::ExpenseLogger => Some(Intent::LogExpense),
            Capability::BudgetEditor => Some(Intent::BudgetModification),
            Capability::GeneralAssistant => Some(Intent::GeneralQuestion),
        }
    }

    /// The specialist a classified intent routes to. Small talk stays with
    /// the router.
    pub fn for_intent(intent: Intent) -> Capability {
        match intent {
            Intent::PurchaseDecision => Capability::PurchaseAdvisor,
            Intent::PurchaseFeedback => Capability::FeedbackRecorder,
            Intent::BudgetQuery => Capability::BudgetAnalyst,
            Intent::GoalUpdate => Capability::GoalPlanner,
            Intent::LogExpense => Capability::ExpenseLogger,
            Intent::BudgetModification => Capability::BudgetEditor,
            Intent::GeneralQuestion => Capability::GeneralAssistant,
            Intent::SmallTalk => Capability::Router,
        }
    }

    /// Whether this capability reads or writes budget data. Used by the
    /// post-turn state updater to re-derive the active category.
    pub fn touches_budget(&self) -> bool {
        matches!(
            self,
            Capability::BudgetAnalyst | Capability::ExpenseLogger | Capability::BudgetEditor
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//
// ================= Intent Result =================
//

/// Output of the intent classifier for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub primary_intent: Intent,
    #[serde(default)]
    pub extracted_entities: serde_json::Map<String, serde_json::Value>,
    pub confidence: f32,
    #[serde(default)]
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarification_question: Option<String>,
}

impl IntentResult {
    /// Fallback used when the backend's output cannot be parsed into the
    /// declared shape.
    pub fn fallback() -> Self {
        Self {
            primary_intent: Intent::GeneralQuestion,
            extracted_entities: serde_json::Map::new(),
            confidence: 0.0,
            needs_clarification: true,
            clarification_question: Some(
                "I'm not sure what you'd like me to do. Could you rephrase that?".to_string(),
            ),
        }
    }
}

//
// ================= Financial Records =================
//

/// A single budget category as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCategory {
    pub name: String,
    pub limit: f64,
    pub spent: f64,
}

/// A budget as stored: one period, several categories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub categories: Vec<BudgetCategory>,
}

impl Budget {
    pub fn covers(&self, day: NaiveDate) -> bool {
        self.period_start <= day && day <= self.period_end
    }
}

/// A savings goal as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavingsGoal {
    pub name: String,
    pub target: f64,
    pub current: f64,
    pub priority: GoalPriority,
    pub deadline: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GoalPriority {
    Low,
    Medium,
    High,
}

/// A past purchase decision, with optional follow-up feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub item: String,
    pub amount: f64,
    pub category: String,
    pub score: f32,
    pub purchased: Option<bool>,
    pub regret: Option<bool>,
    pub created_at: DateTime<Utc>,
}

//
// ================= Context Snapshot =================
//

/// Per-category view with derived fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryStatus {
    pub name: String,
    pub limit: f64,
    pub spent: f64,
    pub remaining: f64,
    pub percent_used: f64,
}

/// Budget view with derived totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetOverview {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub categories: Vec<CategoryStatus>,
    pub total_limit: f64,
    pub total_spent: f64,
    pub total_remaining: f64,
}

/// Per-goal view with derived fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalProgress {
    pub name: String,
    pub target: f64,
    pub current: f64,
    pub remaining: f64,
    pub percent_complete: f64,
    pub priority: GoalPriority,
    pub deadline: Option<NaiveDate>,
}

/// Read-only per-turn aggregate of the user's financial data.
///
/// Built once at the start of a turn and shared by every capability. Writes
/// made during the turn go to the data store and are NOT reflected here;
/// callers that need freshness re-query explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub user_id: Uuid,
    pub has_budget: bool,
    pub budget: Option<BudgetOverview>,
    pub goals: Vec<GoalProgress>,
    pub recent_decisions: Vec<DecisionRecord>,
    pub built_at: DateTime<Utc>,
}

//
// ================= Conversation State =================
//

/// Mutable per-session record used to resolve elliptical references
/// ("I bought it", "how much is left?") across turns.
///
/// Mutated only by the post-turn update step, and only after a turn that
/// terminated normally. Each active reference persists until overwritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub turn_count: u32,
    pub active_decision_id: Option<Uuid>,
    pub active_goal_name: Option<String>,
    pub active_category: Option<String>,
    pub last_intent: Option<Intent>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(session_id: Uuid, user_id: Uuid) -> Self {
        Self {
            session_id,
            user_id,
            turn_count: 0,
            active_decision_id: None,
            active_goal_name: None,
            active_category: None,
            last_intent: None,
            updated_at: Utc::now(),
        }
    }
}

//
// ================= Conversation History =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One prior turn, as supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: TurnRole,
    pub content: String,
}

//
// ================= Handoffs & Trace =================
//

/// A capability's request to transfer control to exactly one other
/// capability, optionally carrying a short note of context for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandoffRequest {
    pub target: Capability,
    pub note: Option<String>,
}

/// What a capability produced: user-facing text, or text plus a handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityOutput {
    pub text: String,
    pub handoff: Option<HandoffRequest>,
}

impl CapabilityOutput {
    pub fn terminal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            handoff: None,
        }
    }

    pub fn handoff(text: impl Into<String>, target: Capability, note: Option<String>) -> Self {
        Self {
            text: text.into(),
            handoff: Some(HandoffRequest { target, note }),
        }
    }
}

/// One executed node in the handoff chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub capability: Capability,
    pub output: String,
    pub handoff_to: Option<Capability>,
}

/// The ordered handoff chain for one turn. Used only to pick the final
/// reply and to update conversation state; discarded after the turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub steps: Vec<TraceStep>,
    pub handoff_count: u32,
}

impl ExecutionTrace {
    pub fn final_step(&self) -> Option<&TraceStep> {
        self.steps.last()
    }

    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.steps.iter().map(|s| s.capability)
    }

    pub fn contains_intent(&self, intent: Intent) -> bool {
        self.capabilities().any(|c| c.intent() == Some(intent))
    }
}

//
// ================= Turn Reply =================
//

/// The single reply `handle_turn` returns for a turn. Internal failures are
/// surfaced here as generic failure text, never as an error to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReply {
    pub text: String,
    pub requires_clarification: bool,
    pub metadata: serde_json::Value,
}

//
// ================= Stream Events =================
//

/// Ordered event stream for the streaming variant of a turn. The stream
/// aggregator is a pure fold over this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    NodeStart { capability: Capability },
    TextChunk { capability: Capability, text: String },
    Handoff { from: Capability, to: Capability },
    End,
}
