//! Tool capability surface.
//!
//! Tools are named capabilities with a declared input schema and a declared
//! [`SideEffect`] class. The class is fixed at registration: it decides
//! whether a call runs directly or is gated behind human approval, and no
//! caller can override it per call.

pub mod registry;

pub use registry::ToolRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Byte cap applied to tool output before it enters the conversation.
pub const MAX_TOOL_OUTPUT_BYTES: usize = 30_000;

/// Declared risk tier of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    /// Never modifies state.
    ReadOnly,
    /// Modifies state in ways the agent is trusted to do unsupervised.
    Mutating,
    /// Requires a human decision before every execution.
    Destructive,
}

impl SideEffect {
    pub fn requires_approval(&self) -> bool {
        matches!(self, Self::Destructive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::Mutating => "mutating",
            Self::Destructive => "destructive",
        }
    }
}

/// Declared shape of a tool, as advertised to providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub side_effect: SideEffect,
}

/// Trait for tool implementations.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (id).
    fn name(&self) -> &str;

    /// Description shown to the reasoning provider.
    fn description(&self) -> &str;

    /// JSON schema for parameters.
    fn parameters_schema(&self) -> Value;

    /// Declared side-effect class. Authoritative.
    fn side_effect(&self) -> SideEffect;

    /// Execute the tool.
    async fn execute(&self, params: Value) -> ToolResult;
}

impl dyn Tool {
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
            side_effect: self.side_effect(),
        }
    }
}

/// Tool execution result: a string payload plus an error flag, where error
/// payloads are `{ok: false, error: {code, message}}` envelopes.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Create a success result.
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    /// Create a structured error with explicit code.
    pub fn error_with_code(code: &str, msg: impl std::fmt::Display) -> Self {
        let envelope = serde_json::json!({
            "ok": false,
            "error": {
                "code": code,
                "message": msg.to_string(),
            },
        });
        Self {
            output: envelope.to_string(),
            is_error: true,
        }
    }

    /// Create an error result, classifying the code from the message.
    pub fn error(msg: impl std::fmt::Display) -> Self {
        let message = msg.to_string();
        let code = classify_error_code(&message);
        Self::error_with_code(code, message)
    }

    /// Error code if this is a structured error envelope.
    pub fn error_code(&self) -> Option<String> {
        if !self.is_error {
            return None;
        }
        serde_json::from_str::<Value>(&self.output)
            .ok()
            .and_then(|v| v["error"]["code"].as_str().map(str::to_string))
    }
}

pub(crate) fn classify_error_code(message: &str) -> &'static str {
    let lower = message.to_ascii_lowercase();
    if lower.contains("invalid params") || lower.contains("missing field") {
        "validation"
    } else if lower.contains("timed out") || lower.contains("timeout") {
        "timeout"
    } else if lower.contains("unknown tool") {
        "unknown_tool"
    } else if lower.contains("denied") {
        "permission_denied"
    } else {
        "tool_error"
    }
}

/// Parse tool parameters, returning a ToolResult error on failure.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolResult> {
    serde_json::from_value(params)
        .map_err(|e| ToolResult::error_with_code("validation", format!("invalid params: {e}")))
}

/// Which tools a session may see and call.
///
/// Root sessions usually run with `ToolScope::all()`; delegated children get
/// a scope with the delegation tool denied so they cannot spawn grandchildren.
#[derive(Debug, Clone, Default)]
pub struct ToolScope {
    /// When set, only these names are visible.
    allowed: Option<Vec<String>>,
    /// Always-hidden names, checked after `allowed`.
    denied: Vec<String>,
}

impl ToolScope {
    /// Scope that admits every registered tool.
    pub fn all() -> Self {
        Self::default()
    }

    /// Scope restricted to an explicit allow list.
    pub fn allow_only(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: Some(names.into_iter().map(Into::into).collect()),
            denied: Vec::new(),
        }
    }

    /// Return this scope with `name` denied on top of existing rules.
    pub fn without(mut self, name: impl Into<String>) -> Self {
        self.denied.push(name.into());
        self
    }

    pub fn allows(&self, name: &str) -> bool {
        if self.denied.iter().any(|d| d == name) {
            return false;
        }
        match &self.allowed {
            Some(allowed) => allowed.iter().any(|a| a == name),
            None => true,
        }
    }
}

/// Truncate tool output to `max_bytes` at a char boundary, appending an
/// elision marker when anything was cut.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = output[..cut].to_string();
    truncated.push_str("\n… [output truncated]");
    truncated
}
