//! Agent system for Carapace
//!
//! ## Orchestrator (the canonical agent loop)
//! - `AgentOrchestrator` - Unified loop: streaming, tools, approvals, failure detection
//! - `LoopEvent` - Event protocol between the loop and its consumers
//! - `AgentConfig` / `AgentServices` - Per-session configuration and shared dependencies
//!
//! ## Compaction
//! - `SessionCompactor` - Folds older history into a summary turn, keeping pinned facts
//!
//! ## Sub-agents
//! - `SubAgentPool` - Bounded concurrent execution of delegated child loops
//! - `SubAgentSpec` / `SubAgentOutcome` - Task parameters and terminal payload
//!
//! ## Failure Detection
//! - `detect_repeated_failures` - Stops loops stuck on the same failing call
//! - `extract_tool_calls` - Recovers calls embedded in plain assistant text

pub mod compactor;
pub mod events;
pub mod extract;
pub mod failure;
pub mod orchestrator;
pub mod subagent;

pub use compactor::{CompactionConfig, CompactionOutcome, SessionCompactor};
pub use events::LoopEvent;
pub use extract::extract_tool_calls;
pub use failure::{detect_repeated_failures, REPEATED_FAILURE_THRESHOLD};
pub use orchestrator::{AgentConfig, AgentOrchestrator, AgentServices, SessionHandle};
pub use subagent::{
    delegate_descriptor, SubAgentConfig, SubAgentHandle, SubAgentOutcome, SubAgentPool,
    SubAgentSpec, SubAgentTask, TaskStatus, DELEGATE_TOOL_NAME,
};
