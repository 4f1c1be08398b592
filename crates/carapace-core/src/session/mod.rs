//! Session data model.
//!
//! A [`Session`] is one logical conversation: an ordered turn history plus
//! cumulative usage, cost, and the delegation bookkeeping that bounds
//! sub-agent spawning. Exactly one agent loop ever mutates a given session;
//! everything here is plain data with no interior locking.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FailReason;
use crate::tools::SideEffect;

/// Character-count heuristic used to decide when compaction fires.
const CHARS_PER_TOKEN: u64 = 4;

/// Cumulative token counts, normalized across providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Compacting,
    AwaitingApproval,
    Done,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Compacting => "compacting",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Role of a turn in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    ToolResult,
}

/// Resolution state of a single tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Approved,
    Denied,
    Executed,
    Failed,
}

/// One requested tool invocation, as recorded on an assistant turn.
///
/// `side_effect` is copied from the registry entry at request time and is
/// authoritative: nothing downstream may relax it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub tool_name: String,
    pub input_params: Value,
    pub side_effect: SideEffect,
    pub result_status: ToolCallStatus,
    pub output: Option<String>,
}

impl ToolCallRecord {
    pub fn new(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        input_params: Value,
        side_effect: SideEffect,
    ) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            input_params,
            side_effect,
            result_status: ToolCallStatus::Pending,
            output: None,
        }
    }

    pub fn mark_executed(&mut self, output: impl Into<String>) {
        self.result_status = ToolCallStatus::Executed;
        self.output = Some(output.into());
    }

    pub fn mark_failed(&mut self, output: impl Into<String>) {
        self.result_status = ToolCallStatus::Failed;
        self.output = Some(output.into());
    }

    pub fn mark_denied(&mut self, output: impl Into<String>) {
        self.result_status = ToolCallStatus::Denied;
        self.output = Some(output.into());
    }

    pub fn mark_approved(&mut self) {
        self.result_status = ToolCallStatus::Approved;
    }
}

/// One immutable message in the turn history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    /// For `ToolResult` turns: the id of the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRecord>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::ToolResult,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            timestamp: Utc::now(),
        }
    }

    /// Estimated token footprint of this turn.
    pub fn estimated_tokens(&self) -> u64 {
        let mut chars = self.content.len() as u64;
        for call in &self.tool_calls {
            chars += call.tool_name.len() as u64;
            chars += call.input_params.to_string().len() as u64;
            if let Some(output) = &call.output {
                chars += output.len() as u64;
            }
        }
        chars / CHARS_PER_TOKEN
    }
}

/// One logical conversation, owned by a single agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub turns: Vec<Turn>,
    pub usage: TokenUsage,
    pub status: SessionStatus,
    pub turn_count: u32,
    pub cost_usd: f64,
    /// Verbatim-preserved snippets (file paths, error codes, stated
    /// preferences). Insert-deduplicated; survives compaction unconditionally.
    pub pinned_facts: Vec<String>,
    /// 0 for root sessions, 1 for delegated children. Never higher.
    pub delegation_depth: u8,
    pub parent_session_id: Option<String>,
    /// Stable reason token, set when `status` is `Failed`.
    pub fail_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a root session (depth 0).
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            turns: Vec::new(),
            usage: TokenUsage::default(),
            status: SessionStatus::Active,
            turn_count: 0,
            cost_usd: 0.0,
            pinned_facts: Vec::new(),
            delegation_depth: 0,
            parent_session_id: None,
            fail_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a delegated child of `parent`, one level deeper.
    pub fn child_of(parent: &Session, id: impl Into<String>) -> Self {
        let mut session = Self::new(id);
        session.delegation_depth = parent.delegation_depth + 1;
        session.parent_session_id = Some(parent.id.clone());
        session
    }

    pub fn push_turn(&mut self, turn: Turn) {
        self.updated_at = Utc::now();
        self.turns.push(turn);
    }

    pub fn add_usage(&mut self, usage: &TokenUsage) {
        self.usage.add(usage);
        self.updated_at = Utc::now();
    }

    pub fn add_cost(&mut self, usd: f64) {
        self.cost_usd += usd;
        self.updated_at = Utc::now();
    }

    /// Record a fact for verbatim survival across compaction. Duplicate
    /// strings are ignored.
    pub fn pin_fact(&mut self, fact: impl Into<String>) {
        let fact = fact.into();
        if fact.is_empty() || self.pinned_facts.iter().any(|f| f == &fact) {
            return;
        }
        self.pinned_facts.push(fact);
        self.updated_at = Utc::now();
    }

    /// Estimated token footprint of the whole turn history.
    pub fn estimated_tokens(&self) -> u64 {
        self.turns.iter().map(Turn::estimated_tokens).sum()
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Terminate with a typed failure reason.
    pub fn fail(&mut self, reason: &FailReason) {
        self.status = SessionStatus::Failed;
        self.fail_reason = Some(reason.to_string());
        self.updated_at = Utc::now();
    }

    /// Terminate successfully.
    pub fn complete(&mut self) {
        self.status = SessionStatus::Done;
        self.updated_at = Utc::now();
    }

    /// Content of the most recent assistant turn, if any. Used as the
    /// terminal payload of delegated sessions.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::Assistant && !t.content.is_empty())
            .map(|t| t.content.as_str())
    }
}
