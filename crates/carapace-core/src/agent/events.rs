//! Event protocol between the agent loop and its consumers.
//!
//! Channel adapters subscribe to this stream and render it however their
//! transport wants (live deltas over a socket, batched messages in chat).
//! Events are serialized with a `type` tag so non-Rust consumers can switch
//! on it directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::subagent::TaskStatus;
use crate::approval::ApprovalDecision;
use crate::session::{SessionStatus, TokenUsage};

/// One observable step of a running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// Incremental assistant text, in arrival order.
    TextDelta { delta: String },

    /// A tool call is about to execute (or wait for approval).
    ToolCallStart { id: String, name: String },

    /// A tool call finished, in the order the calls were issued.
    ToolResult {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },

    /// A destructive call is blocked on a human decision.
    ApprovalRequired {
        approval_id: String,
        tool_name: String,
        params_summary: String,
        expires_at: DateTime<Utc>,
    },

    ApprovalResolved {
        approval_id: String,
        decision: ApprovalDecision,
    },

    DelegationStarted {
        task_id: String,
        child_session_id: String,
    },

    DelegationFinished {
        task_id: String,
        status: TaskStatus,
    },

    /// Older history was folded into a summary turn.
    Compacted { tokens_saved: u64 },

    /// Provider-reported usage for one response, already attributed to the
    /// session by the time this is emitted.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },

    /// One full loop iteration finished. `has_more` is false on the last.
    TurnComplete { turn: u32, has_more: bool },

    Error { message: String },

    /// Terminal event; nothing follows it.
    Finished {
        status: SessionStatus,
        usage: TokenUsage,
        cost_usd: f64,
        /// Stable failure token when `status` is `failed`.
        reason: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_with_snake_case_type() {
        let event = LoopEvent::TextDelta {
            delta: "hi".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "text_delta");
        assert_eq!(value["delta"], "hi");

        let event = LoopEvent::TurnComplete {
            turn: 3,
            has_more: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "turn_complete");
        assert_eq!(value["turn"], 3);
    }

    #[test]
    fn finished_carries_reason_only_on_failure() {
        let event = LoopEvent::Finished {
            status: SessionStatus::Failed,
            usage: TokenUsage::new(100, 50),
            cost_usd: 0.0015,
            reason: Some("turn_cap_exceeded".to_string()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "finished");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["reason"], "turn_cap_exceeded");
    }
}
