//! Capability registry and task handlers
//!
//! One handler per capability, registered once at process start in a closed
//! table. The router is the entry node; it either answers directly or hands
//! off to a specialist chosen by the inference backend. Handoff targets from
//! the backend are validated against the closed enum plus each handler's
//! allowed set: a malformed target is a `CapabilityExecutionError`, never a
//! transition.

use crate::context::{summarize_snapshot, FinanceStore};
use crate::error::AssistantError;
use crate::llm::{strip_code_fences, CompletionRequest, LanguageModel};
use crate::models::{
    Capability, CapabilityOutput, ContextSnapshot, ConversationState, HistoryTurn, Intent,
    IntentResult, TurnRole,
};
use crate::tools::tools_for;
use crate::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Router hands off without consulting the backend above this confidence.
const DIRECT_ROUTE_CONFIDENCE: f32 = 0.8;

/// Everything a capability may read during one turn. The snapshot and state
/// are shared by every node in the chain; writes go through declared tools
/// only.
pub struct TurnContext {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub message: String,
    pub history: Vec<HistoryTurn>,
    pub snapshot: Arc<ContextSnapshot>,
    pub state: ConversationState,
    pub intent: IntentResult,
    pub handoff_note: Option<String>,
}

/// Trait for a single capability
#[async_trait::async_trait]
pub trait CapabilityHandler: Send + Sync {
    fn capability(&self) -> Capability;
    /// The closed set of capabilities this one may transfer control to.
    fn allowed_handoffs(&self) -> &[Capability];
    async fn handle(&self, ctx: &TurnContext) -> Result<CapabilityOutput>;
}

/// Registration table built once at startup.
pub struct CapabilityRegistry {
    handlers: HashMap<Capability, Arc<dyn CapabilityHandler>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn CapabilityHandler>) {
        self.handlers.insert(handler.capability(), handler);
    }

    pub fn get(&self, capability: Capability) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(&capability).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Shared Prompt Pieces =================
//

/// Active cross-turn references, rendered for handler prompts so ellipsis
/// ("it", "that goal") resolves without re-asking the user.
fn render_references(state: &ConversationState) -> String {
    let mut out = String::new();

    if let Some(id) = state.active_decision_id {
        out.push_str(&format!("- last purchase decision id: {}\n", id));
    }
    if let Some(goal) = &state.active_goal_name {
        out.push_str(&format!("- last goal discussed: {}\n", goal));
    }
    if let Some(category) = &state.active_category {
        out.push_str(&format!("- last budget category: {}\n", category));
    }
    if let Some(intent) = state.last_intent {
        out.push_str(&format!("- previous intent: {}\n", intent));
    }

    if out.is_empty() {
        out.push_str("- none\n");
    }
    out
}

fn render_history(history: &[HistoryTurn]) -> String {
    let mut out = String::new();
    for turn in history.iter().rev().take(3).rev() {
        let role = match turn.role {
            TurnRole::User => "User",
            TurnRole::Assistant => "Assistant",
        };
        out.push_str(&format!("{}: {}\n", role, turn.content));
    }
    out
}

fn build_specialist_prompt(ctx: &TurnContext, allowed: &[Capability]) -> String {
    let mut prompt = String::new();

    prompt.push_str("Financial context (frozen at turn start):\n");
    prompt.push_str(&summarize_snapshot(&ctx.snapshot));
    prompt.push('\n');

    prompt.push_str("Active references from earlier turns:\n");
    prompt.push_str(&render_references(&ctx.state));
    prompt.push('\n');

    let history = render_history(&ctx.history);
    if !history.is_empty() {
        prompt.push_str("Recent conversation:\n");
        prompt.push_str(&history);
        prompt.push('\n');
    }

    if let Some(note) = &ctx.handoff_note {
        prompt.push_str(&format!("Note from the previous specialist: {}\n\n", note));
    }

    if !ctx.intent.extracted_entities.is_empty() {
        prompt.push_str(&format!(
            "Extracted entities: {}\n\n",
            serde_json::Value::Object(ctx.intent.extracted_entities.clone())
        ));
    }

    if allowed.is_empty() {
        prompt.push_str(
            "Answer the user directly. Return ONLY JSON: {\"reply\": \"<your reply>\", \"handoff_to\": null, \"handoff_note\": null}\n\n",
        );
    } else {
        let targets: Vec<&str> = allowed.iter().map(|c| c.as_str()).collect();
        prompt.push_str(&format!(
            "Answer the user directly, or transfer to exactly one of [{}] if their request belongs there. Return ONLY JSON: {{\"reply\": \"<your reply>\", \"handoff_to\": null or \"<target>\", \"handoff_note\": null or \"<short note for the target>\"}}\n\n",
            targets.join(", ")
        ));
    }

    prompt.push_str("User message: ");
    prompt.push_str(&ctx.message);
    prompt
}

#[derive(Debug, Deserialize)]
struct SpecialistReply {
    reply: String,
    #[serde(default)]
    handoff_to: Option<String>,
    #[serde(default)]
    handoff_note: Option<String>,
}

/// Validate a backend-chosen handoff target against the closed enum and the
/// handler's allowed set.
fn validate_handoff(
    source: Capability,
    target: &str,
    allowed: &[Capability],
) -> Result<Capability> {
    let target_capability = Capability::parse(target).ok_or_else(|| {
        AssistantError::CapabilityExecutionError(format!(
            "{} named a nonexistent handoff target '{}'",
            source, target
        ))
    })?;

    if !allowed.contains(&target_capability) {
        return Err(AssistantError::CapabilityExecutionError(format!(
            "{} is not allowed to hand off to {}",
            source, target_capability
        )));
    }

    Ok(target_capability)
}

//
// ================= Router =================
//

const ROUTER_TARGETS: [Capability; 7] = [
    Capability::PurchaseAdvisor,
    Capability::FeedbackRecorder,
    Capability::BudgetAnalyst,
    Capability::GoalPlanner,
    Capability::ExpenseLogger,
    Capability::BudgetEditor,
    Capability::GeneralAssistant,
];

const ROUTER_SYSTEM: &str = r#"You route messages inside a personal-finance assistant.
Either answer the user yourself (only for trivial messages) or transfer to the one specialist that owns the task.
Return ONLY JSON: {"action": "answer" or "handoff", "target": null or "<specialist>", "note": null or "<short context note>", "text": null or "<your answer>"}"#;

/// Entry node for every turn.
pub struct RouterHandler {
    model: Arc<dyn LanguageModel>,
}

impl RouterHandler {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[derive(Debug, Deserialize)]
struct RouterReply {
    action: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[async_trait::async_trait]
impl CapabilityHandler for RouterHandler {
    fn capability(&self) -> Capability {
        Capability::Router
    }

    fn allowed_handoffs(&self) -> &[Capability] {
        &ROUTER_TARGETS
    }

    async fn handle(&self, ctx: &TurnContext) -> Result<CapabilityOutput> {
        let intent = ctx.intent.primary_intent;

        // Small talk never leaves the router and never needs the backend.
        if intent == Intent::SmallTalk {
            return Ok(CapabilityOutput::terminal(
                "Hi! I can help with budgets, savings goals, and purchase decisions. What's on your mind?",
            ));
        }

        // High-confidence classifications route deterministically; the
        // backend only arbitrates the ambiguous remainder.
        if ctx.intent.confidence >= DIRECT_ROUTE_CONFIDENCE {
            let target = Capability::for_intent(intent);
            debug!(%intent, %target, "Router: direct route");
            return Ok(CapabilityOutput::handoff(
                format!("Routing to {}.", target),
                target,
                None,
            ));
        }

        let targets: Vec<&str> = ROUTER_TARGETS.iter().map(|c| c.as_str()).collect();
        let prompt = format!(
            "Specialists: [{}]\nClassifier suggestion: {} (confidence {:.2})\n\nActive references:\n{}\nUser message: {}",
            targets.join(", "),
            intent,
            ctx.intent.confidence,
            render_references(&ctx.state),
            ctx.message
        );

        let completion = self
            .model
            .complete(CompletionRequest::text(ROUTER_SYSTEM, prompt))
            .await
            .map_err(|e| AssistantError::CapabilityExecutionError(e.to_string()))?;

        let reply: RouterReply = serde_json::from_str(strip_code_fences(&completion.text))
            .map_err(|e| {
                AssistantError::CapabilityExecutionError(format!(
                    "Router output did not parse: {} | raw={}",
                    e, completion.text
                ))
            })?;

        match reply.action.as_str() {
            "answer" => {
                let text = reply.text.unwrap_or_default();
                Ok(CapabilityOutput::terminal(text))
            }
            "handoff" => {
                let target = reply.target.as_deref().ok_or_else(|| {
                    AssistantError::CapabilityExecutionError(
                        "Router chose handoff without a target".to_string(),
                    )
                })?;
                let target = validate_handoff(Capability::Router, target, &ROUTER_TARGETS)?;
                Ok(CapabilityOutput::handoff(
                    format!("Routing to {}.", target),
                    target,
                    reply.note,
                ))
            }
            other => Err(AssistantError::CapabilityExecutionError(format!(
                "Router returned unknown action '{}'",
                other
            ))),
        }
    }
}

//
// ================= Specialists =================
//

/// A specialist built from a role prompt, an allowed handoff set, and the
/// tools its intent is entitled to. The domain reasoning lives in the
/// backend; this handler supplies context, executes declared tools through
/// the backend's function-calling loop, and validates the outcome.
pub struct SpecialistHandler {
    capability: Capability,
    model: Arc<dyn LanguageModel>,
    store: Arc<dyn FinanceStore>,
    system_prompt: &'static str,
    allowed: Vec<Capability>,
}

impl SpecialistHandler {
    pub fn new(
        capability: Capability,
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn FinanceStore>,
        system_prompt: &'static str,
        allowed: Vec<Capability>,
    ) -> Self {
        Self {
            capability,
            model,
            store,
            system_prompt,
            allowed,
        }
    }
}

#[async_trait::async_trait]
impl CapabilityHandler for SpecialistHandler {
    fn capability(&self) -> Capability {
        self.capability
    }

    fn allowed_handoffs(&self) -> &[Capability] {
        &self.allowed
    }

    async fn handle(&self, ctx: &TurnContext) -> Result<CapabilityOutput> {
        let prompt = build_specialist_prompt(ctx, &self.allowed);
        let tools = tools_for(self.capability, self.store.clone(), ctx.user_id);

        let request = CompletionRequest {
            system: self.system_prompt.to_string(),
            prompt,
            response_schema: None,
            tools,
        };

        let completion = self
            .model
            .complete(request)
            .await
            .map_err(|e| AssistantError::CapabilityExecutionError(e.to_string()))?;

        if !completion.invoked_tools.is_empty() {
            debug!(
                capability = %self.capability,
                tools = ?completion.invoked_tools,
                "Specialist invoked tools"
            );
        }

        // Lenient parse: a model that answers in plain prose instead of the
        // requested JSON still yields a terminal reply.
        match serde_json::from_str::<SpecialistReply>(strip_code_fences(&completion.text)) {
            Ok(reply) => match reply.handoff_to.as_deref() {
                Some(target) if !target.is_empty() => {
                    let target = validate_handoff(self.capability, target, &self.allowed)?;
                    Ok(CapabilityOutput::handoff(
                        reply.reply,
                        target,
                        reply.handoff_note,
                    ))
                }
                _ => Ok(CapabilityOutput::terminal(reply.reply)),
            },
            Err(_) => {
                warn!(
                    capability = %self.capability,
                    "Specialist returned non-JSON output, treating as terminal reply"
                );
                Ok(CapabilityOutput::terminal(completion.text))
            }
        }
    }
}

//
// ================= Registration =================
//

const PURCHASE_ADVISOR_PROMPT: &str = "You are the purchase advisor of a personal-finance assistant. Score whether the user should make the purchase given their budget and goals, record the decision with the record_decision tool, and explain your reasoning briefly. Include the decision id in your reply.";

const FEEDBACK_RECORDER_PROMPT: &str = "You record the outcome of past purchase decisions. Use the 'last purchase decision id' reference to resolve which decision the user means; only ask which purchase they mean if no reference exists. Record with the record_feedback tool and acknowledge briefly.";

const BUDGET_ANALYST_PROMPT: &str = "You answer questions about the user's budget: remaining amounts, category usage, pacing. Use the frozen context; call get_budget_status only when you need post-write freshness.";

const GOAL_PLANNER_PROMPT: &str = "You manage savings goals: contributions, withdrawals, progress. Use the add_goal_amount and deduct_goal_amount tools for changes. When you change a goal, mention it in your reply as goal: \"<name>\".";

const EXPENSE_LOGGER_PROMPT: &str = "You log expenses against budget categories with the log_expense tool. Confirm what was logged and how much remains in the category.";

const BUDGET_EDITOR_PROMPT: &str = "You change budget structure: category limits and new categories, via the set_category_limit tool. Confirm the change.";

const GENERAL_ASSISTANT_PROMPT: &str = "You answer general personal-finance questions clearly and concisely. You have no write access; suggest concrete next steps when useful.";

/// Build the full registration table.
pub fn build_registry(
    model: Arc<dyn LanguageModel>,
    store: Arc<dyn FinanceStore>,
) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();

    registry.register(Arc::new(RouterHandler::new(model.clone())));

    let specialists: [(Capability, &'static str, Vec<Capability>); 7] = [
        (
            Capability::PurchaseAdvisor,
            PURCHASE_ADVISOR_PROMPT,
            vec![Capability::ExpenseLogger, Capability::BudgetAnalyst],
        ),
        (
            Capability::FeedbackRecorder,
            FEEDBACK_RECORDER_PROMPT,
            vec![Capability::ExpenseLogger],
        ),
        (
            Capability::BudgetAnalyst,
            BUDGET_ANALYST_PROMPT,
            vec![Capability::BudgetEditor, Capability::GoalPlanner],
        ),
        (
            Capability::GoalPlanner,
            GOAL_PLANNER_PROMPT,
            vec![Capability::BudgetAnalyst],
        ),
        (
            Capability::ExpenseLogger,
            EXPENSE_LOGGER_PROMPT,
            vec![Capability::BudgetAnalyst],
        ),
        (
            Capability::BudgetEditor,
            BUDGET_EDITOR_PROMPT,
            vec![Capability::BudgetAnalyst],
        ),
        (Capability::GeneralAssistant, GENERAL_ASSISTANT_PROMPT, vec![]),
    ];

    for (capability, prompt, allowed) in specialists {
        registry.register(Arc::new(SpecialistHandler::new(
            capability,
            model.clone(),
            store.clone(),
            prompt,
            allowed,
        )));
    }

    registry
}
