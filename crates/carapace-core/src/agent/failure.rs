//! Repeated tool failure detection.
//!
//! Counts tool-failure signatures across loop iterations and trips when the
//! same call keeps failing the same way, so a stuck session terminates
//! instead of burning its remaining turn budget on identical retries.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::session::{ToolCallRecord, ToolCallStatus};
use crate::tools::classify_error_code;

/// Stop after this many identical failures.
pub const REPEATED_FAILURE_THRESHOLD: usize = 3;

/// Feed one iteration's executed calls into `counters`. Returns a diagnostic
/// message once a tool+error signature reaches the threshold.
///
/// Any success clears all counters (the agent recovered). Denied approvals do
/// not count: a denial is a human decision, not a malfunction, and the loop
/// is expected to continue past it.
pub fn detect_repeated_failures(
    counters: &mut HashMap<String, usize>,
    records: &[ToolCallRecord],
) -> Option<String> {
    let mut saw_success = false;
    let mut tripped = None;

    for record in records {
        match record.result_status {
            ToolCallStatus::Executed => {
                saw_success = true;
                continue;
            }
            ToolCallStatus::Failed => {}
            _ => continue,
        }

        let output = record.output.as_deref().unwrap_or_default();
        let (code, fingerprint) = extract_error_signature(output);
        let signature = format!(
            "{}|{}|{}|{}",
            record.tool_name,
            code,
            fingerprint,
            hash_params(&record.input_params)
        );
        let count = counters
            .entry(signature)
            .and_modify(|c| *c += 1)
            .or_insert(1);

        if *count >= REPEATED_FAILURE_THRESHOLD && tripped.is_none() {
            tripped = Some(format!(
                "tool '{}' failed {} times with the same '{}' error; a different strategy is required",
                record.tool_name, *count, code
            ));
        }
    }

    if saw_success {
        counters.clear();
        return None;
    }
    tripped
}

fn hash_params(params: &serde_json::Value) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    params.to_string().hash(&mut hasher);
    hasher.finish()
}

/// Pull (code, fingerprint) out of an error payload. Structured envelopes
/// carry the code directly; free-form text is classified by keyword.
fn extract_error_signature(output: &str) -> (String, String) {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(output) {
        if let Some(error) = value.get("error").and_then(|e| e.as_object()) {
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let code = error
                .get("code")
                .and_then(|v| v.as_str())
                .map(|c| c.to_ascii_lowercase())
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| classify_error_code(message).to_string());
            return (code, normalize_fingerprint(message));
        }
    }
    (
        classify_error_code(output).to_string(),
        normalize_fingerprint(output),
    )
}

fn normalize_fingerprint(message: &str) -> String {
    let mut compact = String::new();
    for part in message.split_whitespace() {
        if !compact.is_empty() {
            compact.push(' ');
        }
        compact.push_str(part);
    }
    if compact.is_empty() {
        return "unknown".to_string();
    }
    compact.make_ascii_lowercase();
    compact.chars().take(160).collect()
}
