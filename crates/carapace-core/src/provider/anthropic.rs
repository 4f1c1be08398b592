//! Anthropic Messages API adapter (SSE streaming).

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::provider::types::{
    parse_finish_reason, FinishReason, ProviderConfig, ProviderRequest, StreamPart,
    ToolCallRequest,
};
use crate::provider::{ProviderAdapter, PART_CHANNEL_CAPACITY};
use crate::session::{TokenUsage, TurnRole};

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Connect deadline only. The response body is a long-lived stream, so the
/// overall request deadline stays unset and silence is policed per chunk.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub struct AnthropicAdapter {
    config: ProviderConfig,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    /// Reads the API key from the env var named in the config. A missing key
    /// does not fail construction; it fails `send` with an auth error so the
    /// manager can mark this provider unavailable and move on.
    pub fn new(config: ProviderConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.is_empty());
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            config,
            api_key,
            client,
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn send(
        &self,
        request: &ProviderRequest,
    ) -> Result<mpsc::Receiver<StreamPart>, ProviderError> {
        let Some(api_key) = &self.api_key else {
            return Err(ProviderError::Auth(format!(
                "{} is not set",
                self.config.api_key_env
            )));
        };

        let model = request.model.as_deref().unwrap_or(&self.config.model);
        let body = build_request_body(model, request);
        debug!(provider = %self.config.name, %model, "sending messages request");

        let response = self
            .client
            .post(&self.config.base_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            let mut err = ProviderError::from_status(status.as_u16(), &text);
            if let ProviderError::RateLimited { retry_after: slot } = &mut err {
                *slot = retry_after;
            }
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(PART_CHANNEL_CAPACITY);
        tokio::spawn(read_sse_stream(response, tx));
        Ok(rx)
    }
}

fn classify_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Network(err.to_string())
    }
}

// ── Request body ──────────────────────────────────────────────────────────

/// Maps session turns onto Messages API content blocks. Tool results become
/// `tool_result` blocks on a user message; adjacent same-role messages are
/// merged because the API rejects non-alternating roles (a compaction summary
/// directly followed by the live user turn would otherwise trip it).
fn build_request_body(model: &str, request: &ProviderRequest) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    let mut push = |role: &str, blocks: Vec<Value>| {
        if blocks.is_empty() {
            return;
        }
        if let Some(last) = messages.last_mut() {
            if last["role"] == role {
                if let Some(content) = last["content"].as_array_mut() {
                    content.extend(blocks);
                    return;
                }
            }
        }
        messages.push(json!({ "role": role, "content": blocks }));
    };

    for turn in &request.turns {
        match turn.role {
            TurnRole::User => {
                push("user", vec![json!({ "type": "text", "text": turn.content })]);
            }
            TurnRole::Assistant => {
                let mut blocks = Vec::new();
                if !turn.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": turn.content }));
                }
                for call in &turn.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.tool_name,
                        "input": call.input_params,
                    }));
                }
                push("assistant", blocks);
            }
            TurnRole::ToolResult => {
                let Some(call_id) = &turn.tool_call_id else {
                    warn!("tool result turn without a call id; skipping");
                    continue;
                };
                push(
                    "user",
                    vec![json!({
                        "type": "tool_result",
                        "tool_use_id": call_id,
                        "content": turn.content,
                    })],
                );
            }
        }
    }

    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "messages": messages,
        "stream": true,
    });
    if let Some(system) = &request.system {
        body["system"] = json!(system);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    body
}

// ── SSE decoding ──────────────────────────────────────────────────────────

#[derive(Default)]
struct ToolUseAccumulator {
    id: String,
    name: String,
    json: String,
}

/// Per-response decode state. Tool input JSON arrives as deltas keyed by
/// content block index and is only parsed once the block closes. Usage is
/// held back and emitted as a single part so the consumer can add it without
/// double counting.
#[derive(Default)]
struct SseState {
    tools: HashMap<u64, ToolUseAccumulator>,
    usage: TokenUsage,
    finish: Option<FinishReason>,
    done: bool,
}

impl SseState {
    fn apply(&mut self, event: &Value) -> Vec<StreamPart> {
        match event["type"].as_str().unwrap_or_default() {
            "message_start" => {
                if let Some(tokens) = event["message"]["usage"]["input_tokens"].as_u64() {
                    self.usage.input = tokens;
                }
                Vec::new()
            }
            "content_block_start" => {
                let block = &event["content_block"];
                if block["type"] == "tool_use" {
                    let index = event["index"].as_u64().unwrap_or_default();
                    self.tools.insert(
                        index,
                        ToolUseAccumulator {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            json: String::new(),
                        },
                    );
                }
                Vec::new()
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => delta["text"]
                        .as_str()
                        .map(|text| vec![StreamPart::TextDelta(text.to_string())])
                        .unwrap_or_default(),
                    "input_json_delta" => {
                        let index = event["index"].as_u64().unwrap_or_default();
                        if let (Some(acc), Some(partial)) =
                            (self.tools.get_mut(&index), delta["partial_json"].as_str())
                        {
                            acc.json.push_str(partial);
                        }
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => {
                let index = event["index"].as_u64().unwrap_or_default();
                match self.tools.remove(&index) {
                    Some(acc) => {
                        let arguments = if acc.json.trim().is_empty() {
                            json!({})
                        } else {
                            serde_json::from_str(&acc.json).unwrap_or_else(|err| {
                                warn!(tool = %acc.name, %err, "unparseable tool input; passing empty object");
                                json!({})
                            })
                        };
                        vec![StreamPart::ToolCall(ToolCallRequest {
                            id: acc.id,
                            name: acc.name,
                            arguments,
                        })]
                    }
                    None => Vec::new(),
                }
            }
            "message_delta" => {
                if let Some(tokens) = event["usage"]["output_tokens"].as_u64() {
                    self.usage.output = tokens;
                }
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.finish = Some(parse_finish_reason(reason));
                }
                Vec::new()
            }
            "message_stop" => self.finish_parts(),
            "error" => {
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("provider reported an error")
                    .to_string();
                self.done = true;
                vec![StreamPart::StreamError(message)]
            }
            // ping and future event types
            _ => Vec::new(),
        }
    }

    fn finish_parts(&mut self) -> Vec<StreamPart> {
        self.done = true;
        let mut parts = Vec::new();
        if self.usage.total() > 0 {
            parts.push(StreamPart::Usage(self.usage));
        }
        parts.push(StreamPart::Finished(
            self.finish.unwrap_or(FinishReason::Stop),
        ));
        parts
    }
}

async fn read_sse_stream(response: reqwest::Response, tx: mpsc::Sender<StreamPart>) {
    let mut stream = response.bytes_stream();
    let mut state = SseState::default();
    let mut buffer = String::new();

    loop {
        let chunk = match tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(err))) => {
                let _ = tx
                    .send(StreamPart::StreamError(format!("stream read failed: {err}")))
                    .await;
                return;
            }
            Ok(None) => break,
            Err(_) => {
                let _ = tx
                    .send(StreamPart::StreamError("stream idle timeout".to_string()))
                    .await;
                return;
            }
        };

        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();
            let line = line.trim_end();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            let event: Value = match serde_json::from_str(data) {
                Ok(event) => event,
                Err(err) => {
                    debug!(%err, "skipping undecodable sse line");
                    continue;
                }
            };
            for part in state.apply(&event) {
                if tx.send(part).await.is_err() {
                    return;
                }
            }
            if state.done {
                return;
            }
        }
    }

    // The connection closed without message_stop. Flush what we know so the
    // consumer still sees usage and a finish marker.
    if !state.done {
        for part in state.finish_parts() {
            if tx.send(part).await.is_err() {
                return;
            }
        }
    }
}
