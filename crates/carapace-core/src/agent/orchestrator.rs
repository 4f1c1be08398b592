//! Agent loop — the single canonical execution loop.
//!
//! `AgentOrchestrator` drives one session end to end: provider streaming,
//! tool execution gated by side-effect class, delegation, compaction, and
//! failure detection. Channel adapters are thin consumers that map the
//! `LoopEvent` stream to their transport and call back into the
//! `ApprovalManager` when a human decides.
//!
//! ```text
//!  ┌──────────────┐        LoopEvent          ┌──────────────┐
//!  │ Orchestrator │ ─────────────────────►    │   Consumer   │
//!  │    (core)    │                           │ (chat/HTTP)  │
//!  │              │ ◄─────────────────────    │              │
//!  └──────────────┘   resolve(approval_id)    └──────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalDecision, ApprovalManager, Resolution};
use crate::channel::{ChannelRef, InboundMessage};
use crate::error::{DelegateError, FailReason};
use crate::provider::{
    FinishReason, ProviderManager, ProviderRequest, StreamPart, ToolCallRequest,
};
use crate::session::store::SessionStore;
use crate::session::{Session, SessionStatus, TokenUsage, ToolCallRecord, Turn};
use crate::tools::registry::ToolRegistry;
use crate::tools::{SideEffect, ToolResult, ToolScope};

use super::compactor::SessionCompactor;
use super::events::LoopEvent;
use super::extract;
use super::failure;
use super::subagent::{self, SubAgentOutcome, SubAgentPool, SubAgentSpec, DELEGATE_TOOL_NAME};

pub(crate) const DEFAULT_MAX_TURNS: u32 = 50;
/// Cumulative input+output token budget per session.
pub(crate) const DEFAULT_TOKEN_BUDGET: u64 = 500_000;

/// Per-session loop configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub session_id: String,
    pub system_prompt: Option<String>,
    /// Model override passed through to the provider chain.
    pub model: Option<String>,
    pub max_turns: u32,
    pub max_tokens: u64,
    pub tool_scope: ToolScope,
    /// Channels notified when a destructive call needs a decision.
    pub approval_channels: Vec<ChannelRef>,
}

impl AgentConfig {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            system_prompt: None,
            model: None,
            max_turns: DEFAULT_MAX_TURNS,
            max_tokens: DEFAULT_TOKEN_BUDGET,
            tool_scope: ToolScope::all(),
            approval_channels: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_tool_scope(mut self, scope: ToolScope) -> Self {
        self.tool_scope = scope;
        self
    }

    pub fn with_approval_channels(mut self, channels: Vec<ChannelRef>) -> Self {
        self.approval_channels = channels;
        self
    }
}

/// Shared services the loop needs. Cheap to clone; everything is an `Arc`.
#[derive(Clone)]
pub struct AgentServices {
    pub providers: Arc<ProviderManager>,
    pub tools: Arc<ToolRegistry>,
    pub approvals: Arc<ApprovalManager>,
    pub subagents: Arc<SubAgentPool>,
    pub store: Arc<dyn SessionStore>,
    pub compactor: Arc<SessionCompactor>,
}

/// Handle to one running session loop.
pub struct SessionHandle {
    pub session_id: String,
    pub events: mpsc::UnboundedReceiver<LoopEvent>,
    /// Cancels the loop at its next suspension point and cascades to any
    /// running children.
    pub cancel: CancellationToken,
}

pub struct AgentOrchestrator {
    services: AgentServices,
    config: AgentConfig,
}

impl AgentOrchestrator {
    pub fn new(services: AgentServices, config: AgentConfig) -> Self {
        Self { services, config }
    }

    /// Start the loop as a spawned task.
    ///
    /// The returned handle carries the event stream; the stream ends after a
    /// terminal `Finished` event. Exactly one loop may own a session at a
    /// time; callers are responsible for not starting a second.
    pub fn run(self, inbound: InboundMessage, cancel: CancellationToken) -> SessionHandle {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session_id = self.config.session_id.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            self.run_inner(inbound, token, event_tx).await;
        });

        SessionHandle {
            session_id,
            events: event_rx,
            cancel,
        }
    }

    async fn run_inner(
        self,
        inbound: InboundMessage,
        cancel: CancellationToken,
        event_tx: mpsc::UnboundedSender<LoopEvent>,
    ) {
        let services = self.services.clone();
        let AgentServices {
            providers,
            tools,
            approvals,
            subagents,
            store,
            compactor,
        } = self.services;

        let AgentConfig {
            session_id,
            system_prompt,
            model,
            max_turns,
            max_tokens,
            tool_scope,
            approval_channels,
        } = self.config;

        // Load or create the session.
        let mut session = match store.load_session(&session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => Session::new(session_id.clone()),
            Err(err) => {
                let _ = event_tx.send(LoopEvent::Error {
                    message: format!("storage: {err}"),
                });
                return;
            }
        };
        if session.status.is_terminal() {
            let _ = event_tx.send(LoopEvent::Error {
                message: format!("session {} is already {}", session.id, session.status.as_str()),
            });
            return;
        }

        info!(session_id = %session.id, depth = session.delegation_depth, "agent loop started");
        session.push_turn(Turn::user(render_inbound(&inbound)));
        session.set_status(SessionStatus::Active);
        if let Err(err) = store.save_session(&session).await {
            let _ = event_tx.send(LoopEvent::Error {
                message: format!("storage: {err}"),
            });
            return;
        }

        let mut failure_signatures: HashMap<String, usize> = HashMap::new();

        loop {
            // Compaction check comes first so the next request is built from
            // the folded history.
            if compactor.should_compact(&session) {
                match compactor.compact(&mut session).await {
                    Ok(outcome) => {
                        // The history was rewritten; persist the whole document.
                        if let Err(err) = store.save_session(&session).await {
                            warn!(session_id = %session.id, error = %err, "failed to persist compaction");
                        }
                        let _ = event_tx.send(LoopEvent::Compacted {
                            tokens_saved: outcome.tokens_saved,
                        });
                    }
                    Err(err) => {
                        warn!(session_id = %session.id, error = %err, "compaction skipped");
                    }
                }
            }

            // Turn cap. The count may reach the cap, never pass it.
            if session.turn_count >= max_turns {
                fail_session(
                    &mut session,
                    FailReason::TurnCapExceeded,
                    &store,
                    &approvals,
                    &event_tx,
                )
                .await;
                return;
            }
            session.turn_count += 1;
            let turn = session.turn_count;

            // Build the provider request from post-compaction history.
            let mut descriptors = tools.resolve_tools(&tool_scope).await;
            if session.delegation_depth == 0 && tool_scope.allows(DELEGATE_TOOL_NAME) {
                descriptors.push(subagent::delegate_descriptor());
            }
            let mut request = ProviderRequest::new(session.turns.clone()).with_tools(descriptors);
            request.model = model.clone();
            request.system = system_prompt.clone();

            let mut stream = tokio::select! {
                result = providers.send(&request) => match result {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = event_tx.send(LoopEvent::Error {
                            message: err.to_string(),
                        });
                        fail_session(
                            &mut session,
                            FailReason::Provider(err.to_string()),
                            &store,
                            &approvals,
                            &event_tx,
                        )
                        .await;
                        return;
                    }
                },
                _ = cancel.cancelled() => {
                    fail_session(&mut session, FailReason::Cancelled, &store, &approvals, &event_tx)
                        .await;
                    return;
                }
            };
            debug!(session_id = %session.id, turn, provider = %stream.provider, "streaming response");

            // Consume the stream.
            let mut text = String::new();
            let mut calls: Vec<ToolCallRequest> = Vec::new();
            let mut finish: Option<FinishReason> = None;
            let mut stream_error: Option<String> = None;
            loop {
                let part = tokio::select! {
                    part = stream.parts.recv() => part,
                    _ = cancel.cancelled() => {
                        fail_session(&mut session, FailReason::Cancelled, &store, &approvals, &event_tx)
                            .await;
                        return;
                    }
                };
                let Some(part) = part else { break };
                match part {
                    StreamPart::TextDelta(delta) => {
                        text.push_str(&delta);
                        let _ = event_tx.send(LoopEvent::TextDelta { delta });
                    }
                    StreamPart::ToolCall(call) => calls.push(call),
                    StreamPart::Usage(usage) => {
                        session.add_usage(&usage);
                        session.add_cost(stream.cost_usd(&usage));
                        let _ = event_tx.send(LoopEvent::Usage {
                            input_tokens: usage.input,
                            output_tokens: usage.output,
                        });
                    }
                    StreamPart::Finished(reason) => {
                        finish = Some(reason);
                        break;
                    }
                    StreamPart::StreamError(message) => {
                        stream_error = Some(message);
                        break;
                    }
                }
            }
            if let Some(message) = stream_error {
                let _ = event_tx.send(LoopEvent::Error {
                    message: message.clone(),
                });
                fail_session(
                    &mut session,
                    FailReason::Provider(message),
                    &store,
                    &approvals,
                    &event_tx,
                )
                .await;
                return;
            }

            // Structured tool calls win; only a call-free response gets the
            // text scanned for an embedded call block.
            if calls.is_empty() {
                calls = extract::extract_tool_calls(&text);
            }

            // Record the assistant turn with one call record per request.
            // `side_effect` is copied from the registry here and is
            // authoritative for the rest of the call's life.
            let mut records = Vec::with_capacity(calls.len());
            for call in &calls {
                let side_effect = if call.name == DELEGATE_TOOL_NAME {
                    subagent::delegate_descriptor().side_effect
                } else {
                    tools
                        .side_effect(&call.name)
                        .await
                        .unwrap_or(SideEffect::ReadOnly)
                };
                records.push(ToolCallRecord::new(
                    call.id.clone(),
                    call.name.clone(),
                    call.arguments.clone(),
                    side_effect,
                ));
            }
            let assistant_turn = Turn::assistant(text.clone(), records);
            if let Err(err) = store.append_turn(&session.id, &assistant_turn).await {
                warn!(session_id = %session.id, error = %err, "failed to persist assistant turn");
            }
            session.push_turn(assistant_turn);
            let assistant_index = session.turns.len() - 1;

            // Token budget, checked after every usage update.
            if session.usage.total() > max_tokens {
                fail_session(
                    &mut session,
                    FailReason::TokenBudgetExceeded,
                    &store,
                    &approvals,
                    &event_tx,
                )
                .await;
                return;
            }

            // Text-only response with an end-of-turn signal: done.
            if calls.is_empty() {
                let _ = event_tx.send(LoopEvent::TurnComplete {
                    turn,
                    has_more: false,
                });
                complete_session(&mut session, &store, &event_tx).await;
                return;
            }
            if finish == Some(FinishReason::MaxTokens) {
                debug!(session_id = %session.id, "response hit max_tokens mid-call");
            }

            // Execute calls strictly in issue order; each result is appended
            // before the next call starts, so ordering is structural.
            for (call_index, call) in calls.iter().enumerate() {
                let _ = event_tx.send(LoopEvent::ToolCallStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
                let side_effect = session.turns[assistant_index].tool_calls[call_index].side_effect;
                let mut denial: Option<ApprovalDecision> = None;

                let result: ToolResult = if call.name == DELEGATE_TOOL_NAME {
                    match delegate_call(
                        &subagents,
                        services.clone(),
                        &session,
                        call,
                        &cancel,
                        &event_tx,
                    )
                    .await
                    {
                        Ok(Some(result)) => result,
                        // Parent cancelled while the child ran.
                        Ok(None) => {
                            fail_session(&mut session, FailReason::Cancelled, &store, &approvals, &event_tx)
                                .await;
                            return;
                        }
                        Err(DelegateError::DepthExceeded) => {
                            fail_session(
                                &mut session,
                                FailReason::DelegationDepthExceeded,
                                &store,
                                &approvals,
                                &event_tx,
                            )
                            .await;
                            return;
                        }
                        Err(err @ DelegateError::PoolClosed) => {
                            ToolResult::error_with_code("delegate_failed", err)
                        }
                    }
                } else if side_effect.requires_approval() {
                    // Persist the suspension marker, then wait.
                    session.set_status(SessionStatus::AwaitingApproval);
                    if let Err(err) = store.save_session(&session).await {
                        warn!(session_id = %session.id, error = %err, "failed to persist approval wait");
                    }
                    let (pending, rx) = approvals
                        .request(
                            &session.id,
                            &call.id,
                            &call.name,
                            &call.arguments,
                            &approval_channels,
                        )
                        .await;
                    let _ = event_tx.send(LoopEvent::ApprovalRequired {
                        approval_id: pending.id.clone(),
                        tool_name: pending.tool_name.clone(),
                        params_summary: pending.params_summary.clone(),
                        expires_at: pending.expires_at,
                    });

                    let resolution = tokio::select! {
                        result = approvals.wait(&pending.id, rx) => match result {
                            Ok(resolution) => resolution,
                            Err(err) => {
                                warn!(session_id = %session.id, error = %err,
                                    "approval wait failed; treating as expired");
                                Resolution {
                                    decision: ApprovalDecision::Expired,
                                    decided_by: "system".to_string(),
                                    decided_at: Utc::now(),
                                }
                            }
                        },
                        _ = cancel.cancelled() => {
                            fail_session(&mut session, FailReason::Cancelled, &store, &approvals, &event_tx)
                                .await;
                            return;
                        }
                    };
                    let _ = event_tx.send(LoopEvent::ApprovalResolved {
                        approval_id: pending.id.clone(),
                        decision: resolution.decision,
                    });
                    session.set_status(SessionStatus::Active);
                    if let Err(err) = store.save_session(&session).await {
                        warn!(session_id = %session.id, error = %err, "failed to persist approval outcome");
                    }

                    match resolution.decision {
                        ApprovalDecision::Approved => {
                            session.turns[assistant_index].tool_calls[call_index].mark_approved();
                            tools.execute(&call.name, call.arguments.clone()).await
                        }
                        ApprovalDecision::Denied => {
                            denial = Some(ApprovalDecision::Denied);
                            ToolResult::error_with_code(
                                "approval_denied",
                                format!("approval denied by {}", resolution.decided_by),
                            )
                        }
                        ApprovalDecision::Expired => {
                            denial = Some(ApprovalDecision::Expired);
                            ToolResult::error_with_code(
                                "approval_expired",
                                "approval request expired without a decision",
                            )
                        }
                    }
                } else {
                    tools.execute(&call.name, call.arguments.clone()).await
                };

                {
                    let record = &mut session.turns[assistant_index].tool_calls[call_index];
                    match denial {
                        Some(_) => record.mark_denied(result.output.clone()),
                        None if result.is_error => record.mark_failed(result.output.clone()),
                        None => record.mark_executed(result.output.clone()),
                    }
                }
                let _ = event_tx.send(LoopEvent::ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    output: result.output.clone(),
                    is_error: result.is_error,
                });
                let result_turn = Turn::tool_result(call.id.clone(), result.output);
                if let Err(err) = store.append_turn(&session.id, &result_turn).await {
                    warn!(session_id = %session.id, error = %err, "failed to persist tool result");
                }
                session.push_turn(result_turn);
            }

            // Repeated-failure guard over this iteration's records.
            let records = &session.turns[assistant_index].tool_calls;
            if let Some(diagnostic) =
                failure::detect_repeated_failures(&mut failure_signatures, records)
            {
                warn!(session_id = %session.id, turn, %diagnostic, "stopping repeated failure loop");
                let _ = event_tx.send(LoopEvent::Error {
                    message: diagnostic,
                });
                fail_session(
                    &mut session,
                    FailReason::RepeatedToolFailures,
                    &store,
                    &approvals,
                    &event_tx,
                )
                .await;
                return;
            }

            let _ = event_tx.send(LoopEvent::TurnComplete {
                turn,
                has_more: true,
            });
        }
    }
}

// ── Delegation ────────────────────────────────────────────────────────────

/// Run one `delegate` call to completion.
///
/// `Ok(None)` means the parent was cancelled mid-wait (the derived child
/// token has already cascaded). Depth violations bubble up as errors and
/// fail the calling session; everything else becomes a tool result.
async fn delegate_call(
    subagents: &Arc<SubAgentPool>,
    services: AgentServices,
    session: &Session,
    call: &ToolCallRequest,
    cancel: &CancellationToken,
    event_tx: &mpsc::UnboundedSender<LoopEvent>,
) -> Result<Option<ToolResult>, DelegateError> {
    let spec: SubAgentSpec = match serde_json::from_value(call.arguments.clone()) {
        Ok(spec) => spec,
        Err(err) => {
            return Ok(Some(ToolResult::error_with_code(
                "validation",
                format!("invalid params: {err}"),
            )));
        }
    };

    let handle = subagents.delegate(services, session, spec, cancel)?;
    let task_id = handle.task_id.clone();
    let _ = event_tx.send(LoopEvent::DelegationStarted {
        task_id: task_id.clone(),
        child_session_id: handle.child_session_id.clone(),
    });

    let outcome = tokio::select! {
        outcome = handle.outcome => outcome.unwrap_or_else(|_| SubAgentOutcome {
            task_id,
            status: subagent::TaskStatus::Failed,
            output: String::new(),
            usage: TokenUsage::default(),
            turns_used: 0,
            error: Some("sub-agent task dropped".to_string()),
        }),
        _ = cancel.cancelled() => return Ok(None),
    };

    let _ = event_tx.send(LoopEvent::DelegationFinished {
        task_id: outcome.task_id.clone(),
        status: outcome.status,
    });
    Ok(Some(delegation_result(&outcome)))
}

/// Wrap a child's terminal payload as a tool result for the parent. Child
/// failure is an error result, never a parent failure.
fn delegation_result(outcome: &SubAgentOutcome) -> ToolResult {
    if outcome.status == subagent::TaskStatus::Completed {
        ToolResult::success(
            serde_json::json!({
                "ok": true,
                "task_id": outcome.task_id,
                "status": outcome.status.as_str(),
                "output": outcome.output,
                "turns_used": outcome.turns_used,
                "usage": { "input": outcome.usage.input, "output": outcome.usage.output },
            })
            .to_string(),
        )
    } else {
        ToolResult::error_with_code(
            "delegate_failed",
            format!(
                "sub-agent {}: {}",
                outcome.status.as_str(),
                outcome.error.as_deref().unwrap_or("no detail")
            ),
        )
    }
}

// ── Session helpers ───────────────────────────────────────────────────────

fn render_inbound(inbound: &InboundMessage) -> String {
    if inbound.attachments.is_empty() {
        return inbound.text.clone();
    }
    let mut text = inbound.text.clone();
    text.push_str("\n\n[attachments]");
    for attachment in &inbound.attachments {
        text.push_str("\n- ");
        text.push_str(attachment);
    }
    text
}

async fn fail_session(
    session: &mut Session,
    reason: FailReason,
    store: &Arc<dyn SessionStore>,
    approvals: &Arc<ApprovalManager>,
    event_tx: &mpsc::UnboundedSender<LoopEvent>,
) {
    warn!(session_id = %session.id, reason = %reason, "session failed");
    session.fail(&reason);
    // Expire any approval still waiting on a human; nobody is listening now.
    approvals.cancel_session(&session.id).await;
    if let Err(err) = store.save_session(session).await {
        warn!(session_id = %session.id, error = %err, "failed to persist terminal session");
    }
    let _ = event_tx.send(LoopEvent::Finished {
        status: session.status,
        usage: session.usage,
        cost_usd: session.cost_usd,
        reason: session.fail_reason.clone(),
    });
}

async fn complete_session(
    session: &mut Session,
    store: &Arc<dyn SessionStore>,
    event_tx: &mpsc::UnboundedSender<LoopEvent>,
) {
    session.complete();
    info!(
        session_id = %session.id,
        turns = session.turn_count,
        tokens = session.usage.total(),
        cost_usd = session.cost_usd,
        "session completed"
    );
    if let Err(err) = store.save_session(session).await {
        warn!(session_id = %session.id, error = %err, "failed to persist terminal session");
    }
    let _ = event_tx.send(LoopEvent::Finished {
        status: session.status,
        usage: session.usage,
        cost_usd: session.cost_usd,
        reason: None,
    });
}
