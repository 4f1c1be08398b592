//! Core configuration
//!
//! Deployment-level settings loaded from a TOML file. Every section carries
//! serde defaults, so a partial file (or no file at all) still yields a
//! working configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::agent::compactor::CompactionConfig;
use crate::agent::orchestrator::{AgentConfig, DEFAULT_MAX_TURNS, DEFAULT_TOKEN_BUDGET};
use crate::agent::subagent::SubAgentConfig;
use crate::approval::DEFAULT_APPROVAL_TIMEOUT;
use crate::channel::ChannelRef;
use crate::provider::ProviderConfig;

/// Top-level configuration for one deployment of the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub limits: LimitsConfig,
    pub approval: ApprovalConfig,
    pub subagents: SubAgentConfig,
    pub compaction: CompactionConfig,
    /// Provider chain, tried in ascending `priority` order.
    pub providers: Vec<ProviderConfig>,
}

/// Per-session caps applied to every root loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_turns: u32,
    pub max_tokens: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            max_tokens: DEFAULT_TOKEN_BUDGET,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Seconds before an unanswered approval expires as a denial.
    pub timeout_secs: u64,
    /// Channels notified of pending approvals.
    pub channels: Vec<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_APPROVAL_TIMEOUT.as_secs(),
            channels: Vec::new(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            providers = config.providers.len(),
            "loaded configuration"
        );
        Ok(config)
    }

    /// Loop configuration for a root session under these settings.
    pub fn agent_config(&self, session_id: impl Into<String>) -> AgentConfig {
        AgentConfig::new(session_id)
            .with_max_turns(self.limits.max_turns)
            .with_max_tokens(self.limits.max_tokens)
            .with_approval_channels(
                self.approval
                    .channels
                    .iter()
                    .cloned()
                    .map(ChannelRef)
                    .collect(),
            )
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval.timeout_secs)
    }
}
