//! Channel-facing message types.
//!
//! The core is channel-agnostic: chat adapters hand it normalized
//! [`InboundMessage`]s and consume the orchestrator's `LoopEvent` stream on
//! the way out. Approval notifications go through the [`ApprovalNotifier`]
//! collaborator so the core never knows which transport reaches the approver.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized inbound message from any chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub session_id: String,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl InboundMessage {
    pub fn new(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// Opaque reference to a notification channel ("telegram:1234", "web:alice").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelRef(pub String);

impl ChannelRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload sent to every configured channel when a destructive tool call
/// needs a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub params_summary: String,
    pub expires_at: DateTime<Utc>,
}

/// Collaborator that delivers approval requests to a channel.
///
/// Transport is out of scope here; implementations push to Telegram, a web
/// socket, email, whatever. Delivery failure is logged and does not block the
/// approval from being resolved through another channel.
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn notify(&self, channel: &ChannelRef, request: &ApprovalRequest) -> anyhow::Result<()>;
}

/// Notifier that only logs. Useful for headless deployments and tests where
/// approvals are resolved programmatically.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl ApprovalNotifier for TracingNotifier {
    async fn notify(&self, channel: &ChannelRef, request: &ApprovalRequest) -> anyhow::Result<()> {
        tracing::info!(
            channel = %channel,
            approval_id = %request.approval_id,
            tool = %request.tool_name,
            expires_at = %request.expires_at,
            "approval requested"
        );
        Ok(())
    }
}
