//! Tool-call extraction from plain assistant text.
//!
//! Structured tool-call parts from the provider stream always take
//! precedence; this fallback exists for models and degraded modes that can
//! only emit text. Two encodings are recognized, a fenced ` ```tool_call `
//! block and a `<tool_call>` element, each holding a
//! `{"tool": ..., "params": ...}` object.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::provider::ToolCallRequest;

static FENCED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```tool_call\s*(\{.*?\})\s*```").unwrap());
static TAGGED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>\s*(\{.*?\})\s*</tool_call>").unwrap());

/// Extracts embedded tool calls in document order. Blocks that fail to parse
/// or name no tool are skipped, never fatal.
pub fn extract_tool_calls(text: &str) -> Vec<ToolCallRequest> {
    let mut blocks: Vec<(usize, &str)> = Vec::new();
    for captures in FENCED.captures_iter(text) {
        if let Some(m) = captures.get(1) {
            blocks.push((m.start(), m.as_str()));
        }
    }
    for captures in TAGGED.captures_iter(text) {
        if let Some(m) = captures.get(1) {
            blocks.push((m.start(), m.as_str()));
        }
    }
    blocks.sort_by_key(|(offset, _)| *offset);

    let mut calls = Vec::new();
    for (_, raw) in blocks {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                debug!(%err, "skipping unparseable tool_call block");
                continue;
            }
        };
        let Some(tool) = value["tool"].as_str().filter(|t| !t.is_empty()) else {
            debug!("skipping tool_call block without a tool name");
            continue;
        };
        let params = value
            .get("params")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        calls.push(ToolCallRequest {
            id: format!("call_{}", Uuid::new_v4()),
            name: tool.to_string(),
            arguments: params,
        });
    }
    calls
}
