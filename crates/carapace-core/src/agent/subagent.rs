//! Bounded sub-agent delegation.
//!
//! A `delegate` tool call spawns one child agent loop per task. Two hard
//! bounds apply: children can never delegate again (depth limit 1, checked
//! before any child state exists), and a global semaphore caps how many
//! children run at once, queueing the rest FIFO. A child's terminal payload
//! flows back to the parent as an ordinary tool result; a failed child is an
//! error result, never a parent failure.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::events::LoopEvent;
use crate::agent::orchestrator::{AgentConfig, AgentOrchestrator, AgentServices};
use crate::channel::InboundMessage;
use crate::error::DelegateError;
use crate::session::{Session, SessionStatus, TokenUsage};
use crate::tools::{SideEffect, ToolDescriptor, ToolScope};

/// Name the reasoning provider uses to request a delegation.
pub const DELEGATE_TOOL_NAME: &str = "delegate";

const DEFAULT_MAX_CONCURRENT: usize = 2;
const DEFAULT_CHILD_MAX_TURNS: u32 = 15;
const DEFAULT_CHILD_MAX_TOKENS: u64 = 100_000;

const CHILD_SYSTEM_PROMPT: &str = "You are a focused sub-agent. Complete the \
delegated task with the tools available and finish with a concise report of \
the outcome.";

/// Parameters of one `delegate` call, as sent by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct SubAgentSpec {
    pub task_description: String,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// Row in the pool's task table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentTask {
    pub task_id: String,
    pub parent_session_id: String,
    pub child_session_id: String,
    pub max_turns: u32,
    pub max_tokens: u64,
    pub status: TaskStatus,
}

/// Terminal payload handed back to the parent loop.
#[derive(Debug, Clone, Serialize)]
pub struct SubAgentOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub output: String,
    pub usage: TokenUsage,
    pub turns_used: u32,
    pub error: Option<String>,
}

/// Handle to one delegated task.
#[derive(Debug)]
pub struct SubAgentHandle {
    pub task_id: String,
    pub child_session_id: String,
    /// Resolves with the terminal payload. Dropped-without-send means the
    /// child task itself died; callers treat that as a failed outcome.
    pub outcome: oneshot::Receiver<SubAgentOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubAgentConfig {
    /// How many children may run at once, across all sessions.
    pub max_concurrent: usize,
    pub child_max_turns: u32,
    pub child_max_tokens: u64,
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            child_max_turns: DEFAULT_CHILD_MAX_TURNS,
            child_max_tokens: DEFAULT_CHILD_MAX_TOKENS,
        }
    }
}

pub struct SubAgentPool {
    semaphore: Arc<Semaphore>,
    tasks: Arc<DashMap<String, SubAgentTask>>,
    config: SubAgentConfig,
}

impl SubAgentPool {
    pub fn new(config: SubAgentConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            tasks: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Start one delegated task.
    ///
    /// The depth check runs before any child state is created. The returned
    /// handle resolves once the child loop terminates; the child may sit
    /// `Queued` first if all slots are busy (FIFO by the semaphore's
    /// fairness). `parent_token` is the parent loop's cancellation token; the
    /// child gets a derived token so parent cancellation cascades.
    pub fn delegate(
        &self,
        services: AgentServices,
        parent: &Session,
        spec: SubAgentSpec,
        parent_token: &CancellationToken,
    ) -> Result<SubAgentHandle, DelegateError> {
        if parent.delegation_depth >= 1 {
            return Err(DelegateError::DepthExceeded);
        }
        if self.semaphore.is_closed() {
            return Err(DelegateError::PoolClosed);
        }

        let child = Session::child_of(parent, Uuid::new_v4().to_string());
        let task = SubAgentTask {
            task_id: Uuid::new_v4().to_string(),
            parent_session_id: parent.id.clone(),
            child_session_id: child.id.clone(),
            max_turns: spec.max_turns.unwrap_or(self.config.child_max_turns),
            max_tokens: spec.max_tokens.unwrap_or(self.config.child_max_tokens),
            status: TaskStatus::Queued,
        };
        self.tasks.insert(task.task_id.clone(), task.clone());
        info!(
            task_id = %task.task_id,
            parent_session_id = %parent.id,
            child_session_id = %child.id,
            "delegation queued"
        );

        let (done_tx, done_rx) = oneshot::channel();
        let handle = SubAgentHandle {
            task_id: task.task_id.clone(),
            child_session_id: child.id.clone(),
            outcome: done_rx,
        };
        tokio::spawn(run_child(
            services,
            child,
            task,
            spec.task_description,
            self.semaphore.clone(),
            self.tasks.clone(),
            parent_token.child_token(),
            done_tx,
        ));
        Ok(handle)
    }

    /// Refuse new delegations and wake queued children with a closed error.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn task(&self, task_id: &str) -> Option<SubAgentTask> {
        self.tasks.get(task_id).map(|entry| entry.value().clone())
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| entry.status == TaskStatus::Running)
            .count()
    }
}

impl Default for SubAgentPool {
    fn default() -> Self {
        Self::new(SubAgentConfig::default())
    }
}

/// Descriptor for the synthetic `delegate` tool, offered only to sessions at
/// depth 0.
pub fn delegate_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: DELEGATE_TOOL_NAME.to_string(),
        description: "Delegate a self-contained task to a sub-agent with its own \
            turn and token budget. Returns the sub-agent's final report."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "task_description": {
                    "type": "string",
                    "description": "Complete instructions for the sub-agent."
                },
                "max_turns": { "type": "integer" },
                "max_tokens": { "type": "integer" }
            },
            "required": ["task_description"]
        }),
        side_effect: SideEffect::Mutating,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_child(
    services: AgentServices,
    child: Session,
    task: SubAgentTask,
    task_description: String,
    semaphore: Arc<Semaphore>,
    tasks: Arc<DashMap<String, SubAgentTask>>,
    token: CancellationToken,
    done: oneshot::Sender<SubAgentOutcome>,
) {
    let task_id = task.task_id.clone();

    // Queued until a slot frees up. Cancellation while queued never runs the
    // child at all.
    let _permit = tokio::select! {
        permit = semaphore.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                finish(&tasks, &task_id, done, SubAgentOutcome {
                    task_id: task_id.clone(),
                    status: TaskStatus::Failed,
                    output: String::new(),
                    usage: TokenUsage::default(),
                    turns_used: 0,
                    error: Some("delegation pool is closed".to_string()),
                });
                return;
            }
        },
        _ = token.cancelled() => {
            debug!(task_id = %task_id, "delegation cancelled while queued");
            finish(&tasks, &task_id, done, SubAgentOutcome {
                task_id: task_id.clone(),
                status: TaskStatus::Cancelled,
                output: String::new(),
                usage: TokenUsage::default(),
                turns_used: 0,
                error: Some("cancelled".to_string()),
            });
            return;
        }
    };

    set_status(&tasks, &task_id, TaskStatus::Running);

    if let Err(err) = services.store.save_session(&child).await {
        warn!(task_id = %task_id, error = %err, "failed to persist child session");
        finish(&tasks, &task_id, done, SubAgentOutcome {
            task_id: task_id.clone(),
            status: TaskStatus::Failed,
            output: String::new(),
            usage: TokenUsage::default(),
            turns_used: 0,
            error: Some(format!("storage: {err}")),
        });
        return;
    }

    let config = AgentConfig::new(&child.id)
        .with_system_prompt(CHILD_SYSTEM_PROMPT)
        .with_max_turns(task.max_turns)
        .with_max_tokens(task.max_tokens)
        .with_tool_scope(ToolScope::all().without(DELEGATE_TOOL_NAME));

    let store = services.store.clone();
    let orchestrator = AgentOrchestrator::new(services, config);
    let mut handle = orchestrator.run(
        InboundMessage::new(&child.id, &task_description),
        token.clone(),
    );

    // Drain the child's events; only the terminal one matters here.
    while let Some(event) = handle.events.recv().await {
        if let LoopEvent::Finished { .. } = event {
            break;
        }
    }

    let outcome = match store.load_session(&child.id).await {
        Ok(Some(session)) => session_outcome(&task_id, &session),
        Ok(None) => SubAgentOutcome {
            task_id: task_id.clone(),
            status: TaskStatus::Failed,
            output: String::new(),
            usage: TokenUsage::default(),
            turns_used: 0,
            error: Some("child session disappeared".to_string()),
        },
        Err(err) => SubAgentOutcome {
            task_id: task_id.clone(),
            status: TaskStatus::Failed,
            output: String::new(),
            usage: TokenUsage::default(),
            turns_used: 0,
            error: Some(format!("storage: {err}")),
        },
    };

    finish(&tasks, &task_id, done, outcome);
    // _permit drops here, releasing the slot on every exit path.
}

/// Map a terminal child session onto the payload the parent sees.
fn session_outcome(task_id: &str, session: &Session) -> SubAgentOutcome {
    let status = match session.status {
        SessionStatus::Done => TaskStatus::Completed,
        SessionStatus::Failed if session.fail_reason.as_deref() == Some("cancelled") => {
            TaskStatus::Cancelled
        }
        _ => TaskStatus::Failed,
    };
    SubAgentOutcome {
        task_id: task_id.to_string(),
        status,
        output: session.last_assistant_text().unwrap_or_default().to_string(),
        usage: session.usage,
        turns_used: session.turn_count,
        error: session.fail_reason.clone(),
    }
}

fn set_status(tasks: &DashMap<String, SubAgentTask>, task_id: &str, status: TaskStatus) {
    if let Some(mut task) = tasks.get_mut(task_id) {
        task.status = status;
    }
}

fn finish(
    tasks: &DashMap<String, SubAgentTask>,
    task_id: &str,
    done: oneshot::Sender<SubAgentOutcome>,
    outcome: SubAgentOutcome,
) {
    set_status(tasks, task_id, outcome.status);
    info!(task_id = %task_id, status = outcome.status.as_str(), "delegation finished");
    let _ = done.send(outcome);
}
