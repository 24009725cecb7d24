//! Response extraction and stream aggregation
//!
//! Non-streaming: the reply is the output of the LAST node executed;
//! earlier nodes' text is handoff narration and never reaches the user.
//! Streaming: a pure fold over the ordered event stream that buffers text
//! per active capability, discards the buffer of any capability being left
//! on handoff, and flushes only the final capability's buffer at stream end.

use crate::error::AssistantError;
use crate::models::{Capability, ExecutionTrace, StreamEvent};
use crate::Result;

/// Target size for re-buffered text chunks.
const CHUNK_CHARS: usize = 64;

/// The terminal capability's output, verbatim.
pub fn final_reply(trace: &ExecutionTrace) -> Result<String> {
    let step = trace.final_step().ok_or_else(|| {
        AssistantError::EmptyResult("Execution trace contains no steps".to_string())
    })?;

    if step.output.trim().is_empty() {
        return Err(AssistantError::EmptyResult(format!(
            "Terminal capability {} produced no text",
            step.capability
        )));
    }

    Ok(step.output.clone())
}

/// Split node output into streaming-sized chunks at whitespace boundaries.
pub fn chunk_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in text.split_inclusive(char::is_whitespace) {
        if current.len() + word.len() > CHUNK_CHARS && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Fold an ordered event stream down to the chunks the user may see.
///
/// Only one buffer is ever live: every handoff discards the buffer of the
/// capability being left, so text from intermediate specialists cannot
/// survive to the flush.
pub fn aggregate(events: impl IntoIterator<Item = StreamEvent>) -> Result<Vec<String>> {
    let mut active: Option<Capability> = None;
    let mut buffer: Vec<String> = Vec::new();
    let mut ended = false;

    for event in events {
        match event {
            StreamEvent::NodeStart { capability } => {
                active = Some(capability);
            }
            StreamEvent::TextChunk { capability, text } => {
                if active == Some(capability) {
                    buffer.push(text);
                }
            }
            StreamEvent::Handoff { to, .. } => {
                buffer.clear();
                active = Some(to);
            }
            StreamEvent::End => {
                ended = true;
                break;
            }
        }
    }

    if !ended || active.is_none() {
        return Err(AssistantError::EmptyResult(
            "Stream ended without an active capability".to_string(),
        ));
    }

    if buffer.iter().all(|c| c.trim().is_empty()) {
        return Err(AssistantError::EmptyResult(
            "Final capability streamed no text".to_string(),
        ));
    }

    Ok(buffer)
}

/// Render a finished trace as the event stream a live backend would have
/// produced: node start, re-buffered chunks, handoff, terminated by End.
pub fn trace_events(trace: &ExecutionTrace) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    for step in &trace.steps {
        events.push(StreamEvent::NodeStart {
            capability: step.capability,
        });
        for chunk in chunk_text(&step.output) {
            events.push(StreamEvent::TextChunk {
                capability: step.capability,
                text: chunk,
            });
        }
        if let Some(to) = step.handoff_to {
            events.push(StreamEvent::Handoff {
                from: step.capability,
                to,
            });
        }
    }

    events.push(StreamEvent::End);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TraceStep;

    fn step(capability: Capability, output: &str, handoff_to: Option<Capability>) -> TraceStep {
        TraceStep {
            capability,
            output: output.to_string(),
            handoff_to,
        }
    }

    #[test]
    fn test_final_reply_is_last_node_verbatim() {
        let trace = ExecutionTrace {
            steps: vec![
                step(Capability::Router, "Routing to expense_logger.", Some(Capability::ExpenseLogger)),
                step(Capability::ExpenseLogger, "Logged $12 for lunch.", None),
            ],
            handoff_count: 1,
        };

        assert_eq!(final_reply(&trace).unwrap(), "Logged $12 for lunch.");
    }

    #[test]
    fn test_empty_terminal_output_is_empty_result() {
        let trace = ExecutionTrace {
            steps: vec![step(Capability::Router, "   ", None)],
            handoff_count: 0,
        };

        assert!(matches!(
            final_reply(&trace),
            Err(AssistantError::EmptyResult(_))
        ));
    }

    #[test]
    fn test_aggregate_discards_intermediate_narration() {
        let events = vec![
            StreamEvent::NodeStart {
                capability: Capability::Router,
            },
            StreamEvent::TextChunk {
                capability: Capability::Router,
                text: "I'm handing this to the budget analyst. ".to_string(),
            },
            StreamEvent::Handoff {
                from: Capability::Router,
                to: Capability::BudgetAnalyst,
            },
            StreamEvent::NodeStart {
                capability: Capability::BudgetAnalyst,
            },
            StreamEvent::TextChunk {
                capability: Capability::BudgetAnalyst,
                text: "You have ".to_string(),
            },
            StreamEvent::TextChunk {
                capability: Capability::BudgetAnalyst,
                text: "$170 left.".to_string(),
            },
            StreamEvent::End,
        ];

        let chunks = aggregate(events).unwrap();
        assert_eq!(chunks, vec!["You have ", "$170 left."]);
    }

    #[test]
    fn test_aggregate_flushes_only_final_buffer_after_two_handoffs() {
        let trace = ExecutionTrace {
            steps: vec![
                step(Capability::Router, "Routing to purchase_advisor.", Some(Capability::PurchaseAdvisor)),
                step(Capability::PurchaseAdvisor, "This belongs with the logger.", Some(Capability::ExpenseLogger)),
                step(Capability::ExpenseLogger, "Done, logged it.", None),
            ],
            handoff_count: 2,
        };

        let chunks = aggregate(trace_events(&trace)).unwrap();
        let flushed = chunks.concat();
        assert_eq!(flushed, "Done, logged it.");
        assert!(!flushed.contains("Routing"));
        assert!(!flushed.contains("belongs"));
    }

    #[test]
    fn test_aggregate_empty_final_buffer_is_empty_result() {
        let events = vec![
            StreamEvent::NodeStart {
                capability: Capability::Router,
            },
            StreamEvent::End,
        ];

        assert!(matches!(
            aggregate(events),
            Err(AssistantError::EmptyResult(_))
        ));
    }

    #[test]
    fn test_chunk_text_round_trips() {
        let text = "Logged $12 for lunch. You now have $88 remaining in dining for this month, which is right on pace.";
        let chunks = chunk_text(text);

        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_CHARS + 20));
    }

    #[test]
    fn test_trace_events_round_trip_through_aggregator() {
        let trace = ExecutionTrace {
            steps: vec![
                step(Capability::Router, "Routing to goal_planner.", Some(Capability::GoalPlanner)),
                step(Capability::GoalPlanner, r#"Added $200 to goal: "vacation"."#, None),
            ],
            handoff_count: 1,
        };

        let chunks = aggregate(trace_events(&trace)).unwrap();
        assert_eq!(chunks.concat(), final_reply(&trace).unwrap());
    }
}
