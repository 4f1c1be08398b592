//! Error taxonomy for the execution core.
//!
//! Split by fate rather than by origin: `ProviderError` and `ToolError` are
//! boundary failures, `DelegateError` covers delegation rejection, and
//! `FailReason` is the typed reason attached to a session that terminates in
//! `Failed`. Non-fatal errors fold back into the conversation as failed tool
//! results; fatal ones end the loop with a `FailReason`.

use std::time::Duration;

use thiserror::Error;

/// Failure at the provider boundary.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 429. May carry a server-provided retry delay.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx or a provider-reported overload.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The request or stream exceeded its deadline.
    #[error("provider timed out")]
    Timeout,

    /// Connection-level failure before any response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 401/403. Never retried, never failed over.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP 400/422. The request itself is wrong; fallback would resend the
    /// same wrong request, so this surfaces immediately.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The provider answered with something we could not parse.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Every adapter in the chain failed on a retryable class.
    #[error("all providers exhausted: {0}")]
    Exhausted(String),
}

impl ProviderError {
    /// Whether the manager should fall over to the next adapter.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unavailable(_) | Self::Timeout | Self::Network(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Map an HTTP status to the matching variant.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::Auth(body),
            400 | 422 => Self::MalformedRequest(body),
            429 => Self::RateLimited { retry_after: None },
            408 => Self::Timeout,
            s if s >= 500 => Self::Unavailable(format!("HTTP {s}: {body}")),
            s => Self::Protocol(format!("unexpected status {s}: {body}")),
        }
    }
}

/// Failure at the tool boundary. All variants are non-fatal to the session:
/// they become failed tool results the reasoning step can react to.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Params did not match the declared input schema.
    #[error("invalid params: {0}")]
    Validation(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("tool timed out after {0:?}")]
    Timeout(Duration),
}

impl ToolError {
    /// Stable code carried in failed tool-result envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::Validation(_) => "validation",
            Self::Execution(_) => "execution",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Rejection of a delegation request.
#[derive(Debug, Error)]
pub enum DelegateError {
    /// The parent is already a delegated child; no grandchildren.
    #[error("delegation depth limit reached")]
    DepthExceeded,

    #[error("delegation pool is closed")]
    PoolClosed,
}

/// Typed reason attached to a session terminating in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    TurnCapExceeded,
    TokenBudgetExceeded,
    DelegationDepthExceeded,
    RepeatedToolFailures,
    Provider(String),
    Cancelled,
}

impl FailReason {
    /// Stable token used in terminal events and persisted sessions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TurnCapExceeded => "turn_cap_exceeded",
            Self::TokenBudgetExceeded => "token_budget_exceeded",
            Self::DelegationDepthExceeded => "delegation_depth_exceeded",
            Self::RepeatedToolFailures => "repeated_tool_failures",
            Self::Provider(_) => "provider_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider(detail) => write!(f, "provider_error: {detail}"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::Unavailable("overloaded".into()).is_retryable());
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Network("connection reset".into()).is_retryable());
        assert!(!ProviderError::Auth("bad key".into()).is_retryable());
        assert!(!ProviderError::MalformedRequest("missing model".into()).is_retryable());
        assert!(!ProviderError::Protocol("garbage".into()).is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            ProviderError::from_status(429, ""),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(503, "overloaded"),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            ProviderError::from_status(401, "no key"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(422, "bad schema"),
            ProviderError::MalformedRequest(_)
        ));
    }

    #[test]
    fn fail_reason_tokens_are_stable() {
        assert_eq!(FailReason::TurnCapExceeded.as_str(), "turn_cap_exceeded");
        assert_eq!(FailReason::Cancelled.as_str(), "cancelled");
        assert_eq!(
            FailReason::Provider("boom".into()).to_string(),
            "provider_error: boom"
        );
    }

    #[test]
    fn tool_error_codes() {
        assert_eq!(ToolError::UnknownTool("x".into()).code(), "unknown_tool");
        assert_eq!(ToolError::Validation("y".into()).code(), "validation");
        assert_eq!(
            ToolError::Timeout(Duration::from_secs(30)).code(),
            "timeout"
        );
    }
}
