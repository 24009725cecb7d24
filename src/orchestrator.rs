//! Handoff orchestrator
//!
//! A bounded state machine over the capability registry. Every turn enters
//! at the router; each node either returns final text or names exactly one
//! next capability. The machine's only job is to bound, sequence, and
//! terminate that process safely; which node comes next is the selection
//! mechanism's business (usually the inference backend) and is swappable
//! without touching the termination logic here.
//!
//! Termination, first to trigger wins:
//!   1. a node returns without a handoff target (success)
//!   2. handoff count exceeds the configured maximum
//!   3. total node executions exceed the configured maximum
//!   4. execution or per-node timeout
//!   5. loop detection over a sliding handoff window

use crate::capabilities::{CapabilityRegistry, TurnContext};
use crate::classifier::IntentClassifier;
use crate::context::SnapshotBuilder;
use crate::error::AssistantError;
use crate::models::{
    Capability, ContextSnapshot, ConversationState, ExecutionTrace, HistoryTurn, IntentResult,
    StreamEvent, TraceStep, TurnReply,
};
use crate::response::{self, chunk_text};
use crate::session::{update_from_trace, SessionStore};
use crate::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const GENERIC_FAILURE_REPLY: &str = "I couldn't complete that, please try again.";
pub const TIMEOUT_REPLY: &str =
    "That took longer than expected and I had to stop. Please try again.";
pub const EMPTY_REPLY: &str =
    "I couldn't generate a response for that. Could you try rephrasing?";

/// Limits and thresholds for one orchestration run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_handoffs: u32,
    pub max_iterations: u32,
    pub execution_timeout: Duration,
    pub node_timeout: Duration,
    /// Sliding window of recent handoffs inspected for loops.
    pub loop_window: usize,
    /// Abort when the window plus the proposed target involve at most this
    /// many distinct capabilities. Catches A→B→A ping-pong well before the
    /// raw handoff budget runs out.
    pub loop_max_unique: usize,
    pub clarification_threshold: f32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_handoffs: 5,
            max_iterations: 10,
            execution_timeout: Duration::from_secs(120),
            node_timeout: Duration::from_secs(60),
            loop_window: 2,
            loop_max_unique: 2,
            clarification_threshold: 0.5,
        }
    }
}

struct TurnOutcome {
    reply: TurnReply,
    trace: Option<ExecutionTrace>,
}

/// Orchestrates one turn: snapshot → classification → bounded handoff chain
/// → single reply. No error escapes `handle_turn`; the caller only ever sees
/// a well-formed reply or a well-formed failure reply.
pub struct Orchestrator {
    registry: CapabilityRegistry,
    classifier: IntentClassifier,
    snapshots: SnapshotBuilder,
    sessions: Arc<dyn SessionStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        registry: CapabilityRegistry,
        classifier: IntentClassifier,
        snapshots: SnapshotBuilder,
        sessions: Arc<dyn SessionStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            classifier,
            snapshots,
            sessions,
            config,
        }
    }

    /// Handle one turn for one session. Concurrent turns for the SAME
    /// session must be serialized by the caller.
    pub async fn handle_turn(
        &self,
        user_id: Uuid,
        message: &str,
        history: Vec<HistoryTurn>,
        session_id: Uuid,
    ) -> TurnReply {
        self.run_turn(user_id, message, history, session_id)
            .await
            .reply
    }

    /// Streaming variant: the ordered event stream for one turn. Feed it to
    /// `response::aggregate` to obtain the chunks the user may see.
    pub async fn handle_turn_events(
        &self,
        user_id: Uuid,
        message: &str,
        history: Vec<HistoryTurn>,
        session_id: Uuid,
    ) -> Vec<StreamEvent> {
        let outcome = self.run_turn(user_id, message, history, session_id).await;

        match outcome.trace {
            Some(trace) => response::trace_events(&trace),
            // Clarifications and failures stream as a single router node.
            None => {
                let mut events = vec![StreamEvent::NodeStart {
                    capability: Capability::Router,
                }];
                for chunk in chunk_text(&outcome.reply.text) {
                    events.push(StreamEvent::TextChunk {
                        capability: Capability::Router,
                        text: chunk,
                    });
                }
                events.push(StreamEvent::End);
                events
            }
        }
    }

    async fn run_turn(
        &self,
        user_id: Uuid,
        message: &str,
        history: Vec<HistoryTurn>,
        session_id: Uuid,
    ) -> TurnOutcome {
        info!(%user_id, %session_id, "Turn started");

        // Built once, shared read-only by every node this turn.
        let snapshot = match self.snapshots.build(user_id).await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                error!(%user_id, error = %e, "Context snapshot build failed");
                return failure_outcome(GENERIC_FAILURE_REPLY, "internal");
            }
        };

        let state = match self.sessions.get(session_id).await {
            Ok(Some(state)) => state,
            Ok(None) => ConversationState::new(session_id, user_id),
            Err(e) => {
                warn!(%session_id, error = %e, "Session load failed, starting fresh");
                ConversationState::new(session_id, user_id)
            }
        };

        let intent = match self.classifier.classify(message, &history, &snapshot).await {
            Ok(intent) => intent,
            Err(e) => {
                warn!(error = %e, "Classification failed, falling back");
                IntentResult::fallback()
            }
        };

        // Low-confidence or explicitly ambiguous messages get the
        // clarification question back before any capability runs.
        if intent.needs_clarification
            || intent.confidence < self.config.clarification_threshold
        {
            if let Some(question) = intent
                .clarification_question
                .as_deref()
                .filter(|q| !q.trim().is_empty())
            {
                debug!(confidence = intent.confidence, "Returning clarification");
                return TurnOutcome {
                    reply: TurnReply {
                        text: question.to_string(),
                        requires_clarification: true,
                        metadata: json!({
                            "intent": intent.primary_intent.as_str(),
                            "confidence": intent.confidence,
                        }),
                    },
                    trace: None,
                };
            }
        }

        let chain = self
            .run_chain(user_id, session_id, message, &history, snapshot, &state, &intent)
            .await;

        let trace = match chain {
            Ok(trace) => trace,
            Err(e) => {
                let (text, kind) = match &e {
                    AssistantError::TimeoutExceeded(_) => (TIMEOUT_REPLY, "timeout"),
                    AssistantError::HandoffLimitExceeded(_) => {
                        (GENERIC_FAILURE_REPLY, "handoff_limit")
                    }
                    AssistantError::CapabilityExecutionError(_) => {
                        (GENERIC_FAILURE_REPLY, "capability_error")
                    }
                    _ => (GENERIC_FAILURE_REPLY, "internal"),
                };
                // Aborted turn: conversation state stays untouched. Stale
                // references beat references from a truncated trace.
                return failure_outcome(text, kind);
            }
        };

        let text = match response::final_reply(&trace) {
            Ok(text) => text,
            Err(_) => {
                warn!("Terminal capability produced no text");
                self.commit_state(state, &trace, message).await;
                return TurnOutcome {
                    reply: TurnReply {
                        text: EMPTY_REPLY.to_string(),
                        requires_clarification: false,
                        metadata: json!({ "error": "empty_result" }),
                    },
                    trace: Some(trace),
                };
            }
        };

        let capability_path: Vec<&str> =
            trace.steps.iter().map(|s| s.capability.as_str()).collect();
        let metadata = json!({
            "intent": intent.primary_intent.as_str(),
            "confidence": intent.confidence,
            "capability_path": capability_path,
            "handoffs": trace.handoff_count,
        });

        self.commit_state(state, &trace, message).await;

        info!(
            %session_id,
            handoffs = trace.handoff_count,
            nodes = trace.steps.len(),
            "Turn completed"
        );

        TurnOutcome {
            reply: TurnReply {
                text,
                requires_clarification: false,
                metadata,
            },
            trace: Some(trace),
        }
    }

    /// Run the handoff chain until a terminal node or a limit breach.
    #[allow(clippy::too_many_arguments)]
    async fn run_chain(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        message: &str,
        history: &[HistoryTurn],
        snapshot: Arc<ContextSnapshot>,
        state: &ConversationState,
        intent: &IntentResult,
    ) -> Result<ExecutionTrace> {
        let started = Instant::now();
        let mut trace = ExecutionTrace::default();
        let mut current = Capability::Router;
        let mut note: Option<String> = None;
        let mut iterations: u32 = 0;
        let mut handoff_targets: Vec<Capability> = Vec::new();

        loop {
            iterations += 1;
            if iterations > self.config.max_iterations {
                return abort(
                    &trace,
                    AssistantError::HandoffLimitExceeded(format!(
                        "Exceeded {} node executions",
                        self.config.max_iterations
                    )),
                );
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.execution_timeout {
                return abort(
                    &trace,
                    AssistantError::TimeoutExceeded(format!(
                        "Orchestration exceeded {:?}",
                        self.config.execution_timeout
                    )),
                );
            }

            let handler = self.registry.get(current).ok_or_else(|| {
                AssistantError::UnknownCapability(current.as_str().to_string())
            })?;

            let ctx = TurnContext {
                user_id,
                session_id,
                message: message.to_string(),
                history: history.to_vec(),
                snapshot: snapshot.clone(),
                state: state.clone(),
                intent: intent.clone(),
                handoff_note: note.take(),
            };

            debug!(capability = %current, iteration = iterations, "Executing node");

            // Per-node budget, clipped to whatever execution time is left.
            // On expiry the in-flight future is dropped, which cancels the
            // backend call if the transport supports it and abandons the
            // wait otherwise.
            let node_budget = self
                .config
                .node_timeout
                .min(self.config.execution_timeout - elapsed);

            let output = match tokio::time::timeout(node_budget, handler.handle(&ctx)).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return abort(
                        &trace,
                        AssistantError::CapabilityExecutionError(format!(
                            "{} failed: {}",
                            current, e
                        )),
                    );
                }
                Err(_) => {
                    return abort(
                        &trace,
                        AssistantError::TimeoutExceeded(format!(
                            "{} exceeded its {:?} budget",
                            current, node_budget
                        )),
                    );
                }
            };

            trace.steps.push(TraceStep {
                capability: current,
                output: output.text,
                handoff_to: output.handoff.as_ref().map(|h| h.target),
            });

            let Some(handoff) = output.handoff else {
                // Terminal node: success.
                return Ok(trace);
            };

            trace.handoff_count += 1;
            if trace.handoff_count > self.config.max_handoffs {
                return abort(
                    &trace,
                    AssistantError::HandoffLimitExceeded(format!(
                        "Exceeded {} handoffs",
                        self.config.max_handoffs
                    )),
                );
            }

            // Boundary validation: handlers already validate their own
            // LLM-chosen targets, but a transition outside the declared set
            // must be impossible regardless of handler behavior.
            if !handler.allowed_handoffs().contains(&handoff.target) {
                return abort(
                    &trace,
                    AssistantError::CapabilityExecutionError(format!(
                        "{} attempted an undeclared handoff to {}",
                        current, handoff.target
                    )),
                );
            }

            if loop_detected(
                &handoff_targets,
                handoff.target,
                self.config.loop_window,
                self.config.loop_max_unique,
            ) {
                return abort(
                    &trace,
                    AssistantError::HandoffLimitExceeded(format!(
                        "Handoff loop detected entering {}",
                        handoff.target
                    )),
                );
            }

            debug!(from = %current, to = %handoff.target, "Handoff");
            handoff_targets.push(handoff.target);
            current = handoff.target;
            note = handoff.note;
        }
    }

    async fn commit_state(
        &self,
        mut state: ConversationState,
        trace: &ExecutionTrace,
        message: &str,
    ) {
        update_from_trace(&mut state, trace, message);
        if let Err(e) = self.sessions.set(state).await {
            warn!(error = %e, "Session save failed, next turn will see stale state");
        }
    }
}

/// Would transferring to `next` close a loop? Inspects the last `window`
/// handoff targets plus the proposed one; at most `max_unique` distinct
/// participants means the chain is bouncing between the same nodes.
fn loop_detected(
    targets: &[Capability],
    next: Capability,
    window: usize,
    max_unique: usize,
) -> bool {
    if targets.len() < window {
        return false;
    }

    let mut participants: Vec<Capability> = targets[targets.len() - window..].to_vec();
    participants.push(next);
    participants.sort_by_key(|c| c.as_str());
    participants.dedup();

    participants.len() <= max_unique
}

fn failure_outcome(text: &str, kind: &str) -> TurnOutcome {
    TurnOutcome {
        reply: TurnReply {
            text: text.to_string(),
            requires_clarification: false,
            metadata: json!({ "error": kind }),
        },
        trace: None,
    }
}

fn abort<T>(trace: &ExecutionTrace, err: AssistantError) -> Result<T> {
    let partial: Vec<&str> = trace.steps.iter().map(|s| s.capability.as_str()).collect();
    warn!(error = %err, partial_trace = ?partial, "Orchestration aborted");
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{build_registry, CapabilityHandler};
    use crate::context::{InMemoryFinanceStore, SnapshotBuilder};
    use crate::llm::MockModel;
    use crate::models::CapabilityOutput;
    use crate::session::InMemorySessionStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedHandler {
        capability: Capability,
        output: CapabilityOutput,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedHandler {
        fn new(capability: Capability, output: CapabilityOutput) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    capability,
                    output,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait::async_trait]
    impl CapabilityHandler for ScriptedHandler {
        fn capability(&self) -> Capability {
            self.capability
        }

        fn allowed_handoffs(&self) -> &[Capability] {
            &Capability::ALL
        }

        async fn handle(&self, _ctx: &TurnContext) -> Result<CapabilityOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.output.clone())
        }
    }

    struct SleepyHandler;

    #[async_trait::async_trait]
    impl CapabilityHandler for SleepyHandler {
        fn capability(&self) -> Capability {
            Capability::Router
        }

        fn allowed_handoffs(&self) -> &[Capability] {
            &Capability::ALL
        }

        async fn handle(&self, _ctx: &TurnContext) -> Result<CapabilityOutput> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(CapabilityOutput::terminal("too late"))
        }
    }

    const CONFIDENT_LOG_EXPENSE: &str =
        r#"{"primary_intent": "log_expense", "confidence": 0.95}"#;

    fn orchestrator_with(
        registry: CapabilityRegistry,
        classifier_responses: Vec<&str>,
        config: OrchestratorConfig,
    ) -> (Orchestrator, Arc<InMemorySessionStore>) {
        let sessions = Arc::new(InMemorySessionStore::new());
        let store = Arc::new(InMemoryFinanceStore::new());
        let classifier =
            IntentClassifier::new(Arc::new(MockModel::with_responses(classifier_responses)));

        (
            Orchestrator::new(
                registry,
                classifier,
                SnapshotBuilder::new(store),
                sessions.clone(),
                config,
            ),
            sessions,
        )
    }

    fn scripted_registry(handlers: Vec<ScriptedHandler>) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        for handler in handlers {
            registry.register(Arc::new(handler));
        }
        registry
    }

    #[tokio::test]
    async fn test_clarification_short_circuits_capabilities() {
        let (router, router_calls) = ScriptedHandler::new(
            Capability::Router,
            CapabilityOutput::terminal("should not run"),
        );
        let (orchestrator, _) = orchestrator_with(
            scripted_registry(vec![router]),
            vec![
                r#"{"primary_intent": "budget_query", "confidence": 0.2, "needs_clarification": true, "clarification_question": "Which category do you mean?"}"#,
            ],
            OrchestratorConfig::default(),
        );

        let reply = orchestrator
            .handle_turn(Uuid::new_v4(), "how much?", vec![], Uuid::new_v4())
            .await;

        assert_eq!(reply.text, "Which category do you mean?");
        assert!(reply.requires_clarification);
        assert_eq!(router_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_terminal_reply_round_trips_verbatim() {
        let (router, _) = ScriptedHandler::new(
            Capability::Router,
            CapabilityOutput::handoff("Routing.", Capability::ExpenseLogger, None),
        );
        let (logger, _) = ScriptedHandler::new(
            Capability::ExpenseLogger,
            CapabilityOutput::terminal("Logged $12 for lunch."),
        );
        let (orchestrator, _) = orchestrator_with(
            scripted_registry(vec![router, logger]),
            vec![CONFIDENT_LOG_EXPENSE],
            OrchestratorConfig::default(),
        );

        let reply = orchestrator
            .handle_turn(Uuid::new_v4(), "log $12 for lunch", vec![], Uuid::new_v4())
            .await;

        assert_eq!(reply.text, "Logged $12 for lunch.");
        assert!(!reply.requires_clarification);
        assert_eq!(reply.metadata["handoffs"], json!(1));
    }

    #[tokio::test]
    async fn test_ping_pong_loop_aborts_before_handoff_budget() {
        let (router, _) = ScriptedHandler::new(
            Capability::Router,
            CapabilityOutput::handoff("Routing.", Capability::PurchaseAdvisor, None),
        );
        let (advisor, advisor_calls) = ScriptedHandler::new(
            Capability::PurchaseAdvisor,
            CapabilityOutput::handoff("over to analyst", Capability::BudgetAnalyst, None),
        );
        let (analyst, _) = ScriptedHandler::new(
            Capability::BudgetAnalyst,
            CapabilityOutput::handoff("back to advisor", Capability::PurchaseAdvisor, None),
        );
        let (orchestrator, _) = orchestrator_with(
            scripted_registry(vec![router, advisor, analyst]),
            vec![CONFIDENT_LOG_EXPENSE],
            OrchestratorConfig::default(),
        );

        let reply = orchestrator
            .handle_turn(Uuid::new_v4(), "loop please", vec![], Uuid::new_v4())
            .await;

        assert_eq!(reply.text, GENERIC_FAILURE_REPLY);
        assert_eq!(reply.metadata["error"], json!("handoff_limit"));
        // Loop detection fires entering the advisor a second time, well
        // before the 5-handoff budget would have.
        assert_eq!(advisor_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_aborted_turn_leaves_state_untouched() {
        let (router, _) = ScriptedHandler::new(
            Capability::Router,
            CapabilityOutput::handoff("Routing.", Capability::GoalPlanner, None),
        );
        let (planner, _) = ScriptedHandler::new(
            Capability::GoalPlanner,
            CapabilityOutput::handoff("to analyst", Capability::BudgetAnalyst, None),
        );
        let (analyst, _) = ScriptedHandler::new(
            Capability::BudgetAnalyst,
            CapabilityOutput::handoff("to planner", Capability::GoalPlanner, None),
        );
        let (orchestrator, sessions) = orchestrator_with(
            scripted_registry(vec![router, planner, analyst]),
            vec![CONFIDENT_LOG_EXPENSE],
            OrchestratorConfig::default(),
        );

        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let mut seeded = ConversationState::new(session_id, user_id);
        seeded.turn_count = 4;
        seeded.active_category = Some("transport".to_string());
        sessions.set(seeded.clone()).await.unwrap();

        let reply = orchestrator
            .handle_turn(user_id, "loop please", vec![], session_id)
            .await;
        assert_eq!(reply.text, GENERIC_FAILURE_REPLY);

        let after = sessions.get(session_id).await.unwrap().unwrap();
        assert_eq!(after, seeded);
    }

    #[tokio::test]
    async fn test_successful_turn_updates_state() {
        let (router, _) = ScriptedHandler::new(
            Capability::Router,
            CapabilityOutput::handoff("Routing.", Capability::ExpenseLogger, None),
        );
        let (logger, _) = ScriptedHandler::new(
            Capability::ExpenseLogger,
            CapabilityOutput::terminal("Logged."),
        );
        let (orchestrator, sessions) = orchestrator_with(
            scripted_registry(vec![router, logger]),
            vec![CONFIDENT_LOG_EXPENSE],
            OrchestratorConfig::default(),
        );

        let session_id = Uuid::new_v4();
        orchestrator
            .handle_turn(Uuid::new_v4(), "log $12 for lunch", vec![], session_id)
            .await;

        let state = sessions.get(session_id).await.unwrap().unwrap();
        assert_eq!(state.turn_count, 1);
        assert_eq!(state.last_intent, Some(crate::models::Intent::LogExpense));
        assert_eq!(state.active_category.as_deref(), Some("lunch"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_timeout_returns_timeout_reply() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(SleepyHandler));

        let (orchestrator, _) = orchestrator_with(
            registry,
            vec![CONFIDENT_LOG_EXPENSE],
            OrchestratorConfig::default(),
        );

        let reply = orchestrator
            .handle_turn(Uuid::new_v4(), "log $12 for lunch", vec![], Uuid::new_v4())
            .await;

        assert_eq!(reply.text, TIMEOUT_REPLY);
        assert_eq!(reply.metadata["error"], json!("timeout"));
    }

    #[tokio::test]
    async fn test_small_talk_stays_with_router() {
        // Real registry; the mock model has no scripted responses, so any
        // backend call would fail the turn.
        let model = Arc::new(MockModel::with_responses(vec![]));
        let store = Arc::new(InMemoryFinanceStore::new());
        let registry = build_registry(model, store);

        let (orchestrator, _) = orchestrator_with(
            registry,
            vec![r#"{"primary_intent": "small_talk", "confidence": 0.99}"#],
            OrchestratorConfig::default(),
        );

        let reply = orchestrator
            .handle_turn(Uuid::new_v4(), "Hi", vec![], Uuid::new_v4())
            .await;

        assert!(!reply.text.is_empty());
        assert!(!reply.text.contains('$'));
        assert_eq!(reply.metadata["capability_path"], json!(["router"]));
        assert_eq!(reply.metadata["handoffs"], json!(0));
    }

    #[tokio::test]
    async fn test_handoff_budget_exhaustion() {
        let (router, _) = ScriptedHandler::new(
            Capability::Router,
            CapabilityOutput::handoff("Routing.", Capability::PurchaseAdvisor, None),
        );
        let (advisor, _) = ScriptedHandler::new(
            Capability::PurchaseAdvisor,
            CapabilityOutput::handoff("next", Capability::BudgetAnalyst, None),
        );
        let (analyst, _) = ScriptedHandler::new(
            Capability::BudgetAnalyst,
            CapabilityOutput::handoff("next", Capability::GoalPlanner, None),
        );
        let (planner, _) = ScriptedHandler::new(
            Capability::GoalPlanner,
            CapabilityOutput::terminal("done"),
        );

        let config = OrchestratorConfig {
            max_handoffs: 2,
            ..Default::default()
        };
        let (orchestrator, _) = orchestrator_with(
            scripted_registry(vec![router, advisor, analyst, planner]),
            vec![CONFIDENT_LOG_EXPENSE],
            config,
        );

        let reply = orchestrator
            .handle_turn(Uuid::new_v4(), "long chain", vec![], Uuid::new_v4())
            .await;

        assert_eq!(reply.text, GENERIC_FAILURE_REPLY);
        assert_eq!(reply.metadata["error"], json!("handoff_limit"));
    }

    #[tokio::test]
    async fn test_empty_terminal_output_yields_empty_reply() {
        let (router, _) =
            ScriptedHandler::new(Capability::Router, CapabilityOutput::terminal(""));
        let (orchestrator, _) = orchestrator_with(
            scripted_registry(vec![router]),
            vec![CONFIDENT_LOG_EXPENSE],
            OrchestratorConfig::default(),
        );

        let reply = orchestrator
            .handle_turn(Uuid::new_v4(), "anything", vec![], Uuid::new_v4())
            .await;

        assert_eq!(reply.text, EMPTY_REPLY);
        assert_eq!(reply.metadata["error"], json!("empty_result"));
    }

    #[tokio::test]
    async fn test_feedback_turn_receives_decision_reference() {
        let model = Arc::new(MockModel::with_responses(vec![
            // classifier
            r#"{"primary_intent": "purchase_feedback", "confidence": 0.9}"#,
            // feedback recorder
            r#"{"reply": "Noted, glad it worked out!", "handoff_to": null, "handoff_note": null}"#,
        ]));
        let store = Arc::new(InMemoryFinanceStore::new());
        let registry = build_registry(model.clone(), store.clone());

        let sessions = Arc::new(InMemorySessionStore::new());
        let classifier = IntentClassifier::new(model.clone());
        let orchestrator = Orchestrator::new(
            registry,
            classifier,
            SnapshotBuilder::new(store),
            sessions.clone(),
            OrchestratorConfig::default(),
        );

        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let decision_id = Uuid::new_v4();
        let mut state = ConversationState::new(session_id, user_id);
        state.active_decision_id = Some(decision_id);
        state.last_intent = Some(crate::models::Intent::PurchaseDecision);
        sessions.set(state).await.unwrap();

        let reply = orchestrator
            .handle_turn(user_id, "I bought it", vec![], session_id)
            .await;

        assert_eq!(reply.text, "Noted, glad it worked out!");

        // The feedback specialist's prompt carries the active decision id
        // instead of asking the user to re-identify the item.
        let requests = model.seen_requests();
        let specialist_prompt = &requests.last().unwrap().1;
        assert!(specialist_prompt.contains(&decision_id.to_string()));
    }

    #[test]
    fn test_loop_detected_on_ping_pong_window() {
        use Capability::*;
        // Router→A→B→A: proposing A with window [A, B] trips detection.
        assert!(loop_detected(&[PurchaseAdvisor, BudgetAnalyst], PurchaseAdvisor, 2, 2));
        // Distinct chain does not.
        assert!(!loop_detected(&[PurchaseAdvisor, BudgetAnalyst], GoalPlanner, 2, 2));
        // Too few handoffs yet.
        assert!(!loop_detected(&[PurchaseAdvisor], BudgetAnalyst, 2, 2));
    }

    #[tokio::test]
    async fn test_streaming_events_hide_intermediate_narration() {
        let (router, _) = ScriptedHandler::new(
            Capability::Router,
            CapabilityOutput::handoff("I'm handing this over.", Capability::ExpenseLogger, None),
        );
        let (logger, _) = ScriptedHandler::new(
            Capability::ExpenseLogger,
            CapabilityOutput::terminal("Logged $12 for lunch."),
        );
        let (orchestrator, _) = orchestrator_with(
            scripted_registry(vec![router, logger]),
            vec![CONFIDENT_LOG_EXPENSE],
            OrchestratorConfig::default(),
        );

        let events = orchestrator
            .handle_turn_events(Uuid::new_v4(), "log $12 for lunch", vec![], Uuid::new_v4())
            .await;

        let chunks = crate::response::aggregate(events).unwrap();
        let text = chunks.concat();
        assert_eq!(text, "Logged $12 for lunch.");
        assert!(!text.contains("handing"));
    }
}
