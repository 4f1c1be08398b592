//! Request, stream, and configuration types shared by all provider adapters.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{TokenUsage, Turn};
use crate::tools::ToolDescriptor;

/// Static configuration for one provider in the fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Lower tries first.
    #[serde(default)]
    pub priority: u32,
    /// USD per million input tokens, for cost attribution.
    #[serde(default)]
    pub input_price_per_mtok: f64,
    /// USD per million output tokens.
    #[serde(default)]
    pub output_price_per_mtok: f64,
}

impl ProviderConfig {
    /// Cost of `usage` at this provider's prices.
    pub fn cost_usd(&self, usage: &TokenUsage) -> f64 {
        (usage.input as f64 * self.input_price_per_mtok
            + usage.output as f64 * self.output_price_per_mtok)
            / 1_000_000.0
    }
}

/// Runtime availability of one adapter, updated by the manager from recent
/// call outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Healthy,
    /// Skipped until the cooldown instant passes.
    Degraded { until: Instant },
    /// Skipped until process restart (failed auth).
    Unavailable,
}

impl Availability {
    /// Whether the manager may route a call here right now.
    pub fn is_eligible(&self, now: Instant) -> bool {
        match self {
            Self::Healthy => true,
            Self::Degraded { until } => now >= *until,
            Self::Unavailable => false,
        }
    }
}

/// One logical request to the reasoning provider. The manager retries this
/// unchanged across adapters, so everything an adapter needs is in here.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Model override; adapters fall back to their configured model.
    pub model: Option<String>,
    pub system: Option<String>,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolDescriptor>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl ProviderRequest {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            model: None,
            system: None,
            turns,
            tools: Vec::new(),
            max_tokens: 8192,
            temperature: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDescriptor>) -> Self {
        self.tools = tools;
        self
    }
}

/// A structured tool call requested by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Why the provider stopped emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of turn.
    Stop,
    /// Stopped to let requested tools run.
    ToolUse,
    /// Output token cap hit.
    MaxTokens,
    Other,
}

pub fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop" | "stop_sequence" => FinishReason::Stop,
        "tool_use" | "tool_calls" => FinishReason::ToolUse,
        "max_tokens" | "length" => FinishReason::MaxTokens,
        _ => FinishReason::Other,
    }
}

/// One element of a provider response stream, normalized across adapters.
#[derive(Debug, Clone)]
pub enum StreamPart {
    TextDelta(String),
    ToolCall(ToolCallRequest),
    Usage(TokenUsage),
    Finished(FinishReason),
    /// Mid-stream failure after content may already have been relayed.
    StreamError(String),
}

/// Collected non-streaming view of one provider response.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: TokenUsage,
    /// Cost of `usage` at the serving provider's prices.
    pub cost_usd: f64,
    pub finish: Option<FinishReason>,
}
