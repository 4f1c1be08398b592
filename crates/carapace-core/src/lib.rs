//! Carapace Core
//!
//! Embeddable agent execution core: the canonical agent loop plus the
//! services it depends on — a provider chain with failover, a tool registry
//! classed by side effect, human approval for destructive calls, bounded
//! sub-agent delegation, and token-aware session compaction. Channel
//! adapters and storage backends plug in at the [`channel`] and
//! [`session::store`] boundaries; everything else lives here.

pub mod agent;
pub mod approval;
pub mod channel;
pub mod config;
pub mod error;
pub mod provider;
pub mod session;
pub mod tools;

pub use agent::{
    AgentConfig, AgentOrchestrator, AgentServices, LoopEvent, SessionHandle, SubAgentPool,
};
pub use approval::ApprovalManager;
pub use config::CoreConfig;
pub use error::{DelegateError, FailReason, ProviderError, ToolError};
pub use provider::ProviderManager;
pub use session::store::{MemoryStore, SessionStore};
pub use session::{Session, SessionStatus};
pub use tools::ToolRegistry;
