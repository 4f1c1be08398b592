//! Reasoning-provider layer.
//!
//! One [`ProviderAdapter`] per external provider, normalized to a common
//! request/stream shape; the [`manager::ProviderManager`] holds them in an
//! explicit priority-ordered list and fails over on retryable errors. No
//! provider discovery, no reflection: adding a provider means constructing an
//! adapter and putting it in the chain.

pub mod anthropic;
pub mod manager;
pub mod retry;
pub mod types;

pub use anthropic::AnthropicAdapter;
pub use manager::{ManagedStream, ProviderManager};
pub use retry::RetryConfig;
pub use types::{
    parse_finish_reason, Availability, Completion, FinishReason, ProviderConfig, ProviderRequest,
    StreamPart, ToolCallRequest,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ProviderError;

/// Slack between the stream producer and the consuming loop.
pub(crate) const PART_CHANNEL_CAPACITY: usize = 256;

/// One external reasoning provider, normalized.
///
/// `send` performs the request and hands back the part stream. Failures
/// before any stream exists (connect errors, non-2xx statuses) come back as
/// `Err`; failures after that arrive in-band as
/// [`StreamPart::StreamError`](types::StreamPart::StreamError) so the
/// receiver is never left waiting on a dead channel.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        request: &ProviderRequest,
    ) -> Result<mpsc::Receiver<StreamPart>, ProviderError>;
}
