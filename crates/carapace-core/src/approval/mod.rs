//! Human-in-the-loop approval for destructive tool calls.
//!
//! The manager owns the lifecycle `Requested -> Notified -> Approved | Denied
//! | Expired`. A resolution can arrive from any channel; the first one wins
//! and later attempts get the original outcome back unchanged. Every
//! resolution, including expiry, lands in the audit log exactly once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::channel::{ApprovalNotifier, ApprovalRequest, ChannelRef};
use crate::session::store::SessionStore;

/// How long an approval stays open before it expires. Expiry counts as a
/// denial.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Length cap for the one-line params rendering in notifications and audit.
const PARAMS_SUMMARY_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Denied,
    Expired,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Requested,
    Notified,
    Approved,
    Denied,
    Expired,
}

impl ApprovalState {
    fn from_decision(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approved => Self::Approved,
            ApprovalDecision::Denied => Self::Denied,
            ApprovalDecision::Expired => Self::Expired,
        }
    }
}

/// One open (or just-resolved) approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: String,
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub params_summary: String,
    pub state: ApprovalState,
    /// Channels that accepted the notification; any of them may resolve.
    pub notified_channels: Vec<ChannelRef>,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of one approval. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub decision: ApprovalDecision,
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
}

/// Audit log row. Written once per approval, at resolution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub approval_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub params_summary: String,
    pub decision: ApprovalDecision,
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
}

/// Compact single-line rendering of tool params, capped for display.
pub fn params_summary(params: &Value) -> String {
    let rendered = params.to_string();
    if rendered.chars().count() <= PARAMS_SUMMARY_MAX_CHARS {
        return rendered;
    }
    let mut truncated: String = rendered.chars().take(PARAMS_SUMMARY_MAX_CHARS).collect();
    truncated.push('…');
    truncated
}

struct OpenApproval {
    record: PendingApproval,
    waiter: Option<oneshot::Sender<Resolution>>,
}

pub struct ApprovalManager {
    store: Arc<dyn SessionStore>,
    notifier: Arc<dyn ApprovalNotifier>,
    open: DashMap<String, OpenApproval>,
    resolved: DashMap<String, Resolution>,
    /// tool_call_id -> approval_id, enforcing one open approval per call.
    open_by_call: DashMap<String, String>,
    timeout: Duration,
}

impl ApprovalManager {
    pub fn new(store: Arc<dyn SessionStore>, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        Self {
            store,
            notifier,
            open: DashMap::new(),
            resolved: DashMap::new(),
            open_by_call: DashMap::new(),
            timeout: DEFAULT_APPROVAL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Opens an approval for one tool call and notifies every channel.
    ///
    /// Notification failures are logged and do not block resolution; the
    /// approval can still be decided through any working channel or the API.
    /// A repeated request for the same call returns the already-open approval
    /// instead of opening a second one.
    pub async fn request(
        &self,
        session_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        params: &Value,
        channels: &[ChannelRef],
    ) -> (PendingApproval, oneshot::Receiver<Resolution>) {
        if let Some(existing_id) = self
            .open_by_call
            .get(tool_call_id)
            .map(|entry| entry.value().clone())
        {
            if let Some(mut entry) = self.open.get_mut(&existing_id) {
                let (tx, rx) = oneshot::channel();
                entry.waiter = Some(tx);
                return (entry.record.clone(), rx);
            }
        }

        let now = Utc::now();
        let record = PendingApproval {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            params_summary: params_summary(params),
            state: ApprovalState::Requested,
            notified_channels: Vec::new(),
            requested_at: now,
            expires_at: now + chrono::Duration::from_std(self.timeout).unwrap_or_default(),
        };

        let (tx, rx) = oneshot::channel();
        self.open.insert(
            record.id.clone(),
            OpenApproval {
                record: record.clone(),
                waiter: Some(tx),
            },
        );
        self.open_by_call
            .insert(tool_call_id.to_string(), record.id.clone());

        let request = ApprovalRequest {
            approval_id: record.id.clone(),
            session_id: record.session_id.clone(),
            tool_name: record.tool_name.clone(),
            params_summary: record.params_summary.clone(),
            expires_at: record.expires_at,
        };
        let mut notified = Vec::new();
        for channel in channels {
            match self.notifier.notify(channel, &request).await {
                Ok(()) => notified.push(channel.clone()),
                Err(err) => {
                    warn!(channel = %channel, approval_id = %record.id, error = %err,
                        "approval notification failed");
                }
            }
        }

        let record = if notified.is_empty() {
            record
        } else {
            match self.open.get_mut(&record.id) {
                Some(mut entry) => {
                    entry.record.state = ApprovalState::Notified;
                    entry.record.notified_channels = notified;
                    entry.record.clone()
                }
                // Resolved while we were notifying.
                None => record,
            }
        };

        (record, rx)
    }

    /// Resolves an approval. Idempotent: once decided, later calls return the
    /// original resolution and write nothing further, so racing a human
    /// decision against expiry cannot double-audit or flip the outcome.
    pub async fn resolve(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
        decided_by: &str,
    ) -> anyhow::Result<Resolution> {
        if let Some(existing) = self.resolved.get(approval_id) {
            return Ok(existing.value().clone());
        }

        let Some((_, mut entry)) = self.open.remove(approval_id) else {
            anyhow::bail!("unknown approval: {approval_id}");
        };
        self.open_by_call.remove(&entry.record.tool_call_id);

        let resolution = Resolution {
            decision,
            decided_by: decided_by.to_string(),
            decided_at: Utc::now(),
        };
        self.resolved
            .insert(approval_id.to_string(), resolution.clone());

        entry.record.state = ApprovalState::from_decision(decision);
        self.store
            .save_audit_entry(&AuditEntry {
                approval_id: entry.record.id.clone(),
                session_id: entry.record.session_id.clone(),
                tool_name: entry.record.tool_name.clone(),
                params_summary: entry.record.params_summary.clone(),
                decision,
                decided_by: resolution.decided_by.clone(),
                decided_at: resolution.decided_at,
            })
            .await?;

        info!(
            approval_id = %approval_id,
            tool = %entry.record.tool_name,
            decision = %decision,
            decided_by = %resolution.decided_by,
            "approval resolved"
        );

        if let Some(waiter) = entry.waiter.take() {
            let _ = waiter.send(resolution.clone());
        }
        Ok(resolution)
    }

    /// Waits for the approval to be decided, expiring it at its deadline.
    /// Expiry goes through [`resolve`](Self::resolve), so a human decision
    /// that lands first always wins.
    pub async fn wait(
        &self,
        approval_id: &str,
        rx: oneshot::Receiver<Resolution>,
    ) -> anyhow::Result<Resolution> {
        let remaining = self
            .open
            .get(approval_id)
            .map(|entry| entry.record.expires_at)
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);

        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(resolution)) => Ok(resolution),
            // Deadline passed, or the waiter slot was replaced.
            Ok(Err(_)) | Err(_) => {
                self.resolve(approval_id, ApprovalDecision::Expired, "system")
                    .await
            }
        }
    }

    /// Expires every open approval belonging to `session_id`. Used when a
    /// session is cancelled or fails while a decision is pending.
    pub async fn cancel_session(&self, session_id: &str) -> usize {
        let ids: Vec<String> = self
            .open
            .iter()
            .filter(|entry| entry.record.session_id == session_id)
            .map(|entry| entry.record.id.clone())
            .collect();
        let mut expired = 0;
        for id in &ids {
            match self
                .resolve(id, ApprovalDecision::Expired, "system")
                .await
            {
                Ok(_) => expired += 1,
                Err(err) => warn!(approval_id = %id, error = %err, "failed to expire approval"),
            }
        }
        expired
    }

    pub fn open_approval(&self, approval_id: &str) -> Option<PendingApproval> {
        self.open
            .get(approval_id)
            .map(|entry| entry.record.clone())
    }

    pub fn open_for_call(&self, tool_call_id: &str) -> Option<PendingApproval> {
        let id = self.open_by_call.get(tool_call_id)?.value().clone();
        self.open_approval(&id)
    }

    pub fn resolution(&self, approval_id: &str) -> Option<Resolution> {
        self.resolved
            .get(approval_id)
            .map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TracingNotifier;
    use crate::session::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingNotifier;

    #[async_trait]
    impl ApprovalNotifier for FailingNotifier {
        async fn notify(
            &self,
            _channel: &ChannelRef,
            _request: &ApprovalRequest,
        ) -> anyhow::Result<()> {
            anyhow::bail!("channel down")
        }
    }

    fn channels() -> Vec<ChannelRef> {
        vec![ChannelRef::new("telegram:1")]
    }

    fn manager(store: Arc<MemoryStore>) -> ApprovalManager {
        ApprovalManager::new(store, Arc::new(TracingNotifier))
    }

    #[tokio::test]
    async fn first_resolution_wins_and_audits_once() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone());

        let (record, rx) = manager
            .request("s1", "call_1", "delete_path", &json!({"path": "/tmp/x"}), &channels())
            .await;
        assert_eq!(record.state, ApprovalState::Notified);
        assert_eq!(record.notified_channels, channels());

        let first = manager
            .resolve(&record.id, ApprovalDecision::Approved, "alice")
            .await
            .unwrap();
        assert_eq!(first.decision, ApprovalDecision::Approved);
        assert_eq!(rx.await.unwrap().decision, ApprovalDecision::Approved);

        // A later conflicting resolution returns the original outcome and
        // writes no second audit row.
        let second = manager
            .resolve(&record.id, ApprovalDecision::Denied, "bob")
            .await
            .unwrap();
        assert_eq!(second.decision, ApprovalDecision::Approved);
        assert_eq!(second.decided_by, "alice");

        let audit = store.audit_entries();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].decision, ApprovalDecision::Approved);
        assert!(manager.open_approval(&record.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_resolves_as_denial_by_system() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone()).with_timeout(Duration::from_millis(50));

        let (record, rx) = manager
            .request("s1", "call_1", "wipe_disk", &json!({}), &channels())
            .await;
        let resolution = manager.wait(&record.id, rx).await.unwrap();

        assert_eq!(resolution.decision, ApprovalDecision::Expired);
        assert_eq!(resolution.decided_by, "system");
        let audit = store.audit_entries();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].decision, ApprovalDecision::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn human_decision_beats_late_expiry() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone()).with_timeout(Duration::from_millis(50));

        let (record, rx) = manager
            .request("s1", "call_1", "delete_path", &json!({}), &channels())
            .await;
        manager
            .resolve(&record.id, ApprovalDecision::Approved, "alice")
            .await
            .unwrap();

        // Even after resolution, wait must hand back the human decision, not
        // an expiry.
        let resolution = manager.wait(&record.id, rx).await.unwrap();
        assert_eq!(resolution.decision, ApprovalDecision::Approved);
        assert_eq!(store.audit_entries().len(), 1);
    }

    #[tokio::test]
    async fn notification_failure_leaves_approval_resolvable() {
        let store = Arc::new(MemoryStore::new());
        let manager = ApprovalManager::new(store.clone(), Arc::new(FailingNotifier));

        let (record, rx) = manager
            .request("s1", "call_1", "delete_path", &json!({}), &channels())
            .await;
        assert_eq!(record.state, ApprovalState::Requested);
        assert!(record.notified_channels.is_empty());

        manager
            .resolve(&record.id, ApprovalDecision::Denied, "carol")
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap().decision, ApprovalDecision::Denied);
        assert_eq!(store.audit_entries().len(), 1);
    }

    #[tokio::test]
    async fn repeated_request_reuses_the_open_approval() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store);

        let (first, _rx1) = manager
            .request("s1", "call_1", "delete_path", &json!({}), &channels())
            .await;
        let (second, _rx2) = manager
            .request("s1", "call_1", "delete_path", &json!({}), &channels())
            .await;

        assert_eq!(first.id, second.id);
        assert!(manager.open_for_call("call_1").is_some());
    }

    #[tokio::test]
    async fn cancel_session_expires_only_that_sessions_approvals() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone());

        let (a, _) = manager
            .request("s1", "call_1", "delete_path", &json!({}), &channels())
            .await;
        let (b, _) = manager
            .request("s1", "call_2", "wipe_disk", &json!({}), &channels())
            .await;
        let (other, _) = manager
            .request("s2", "call_3", "delete_path", &json!({}), &channels())
            .await;

        let expired = manager.cancel_session("s1").await;
        assert_eq!(expired, 2);
        assert_eq!(
            manager.resolution(&a.id).unwrap().decision,
            ApprovalDecision::Expired
        );
        assert_eq!(
            manager.resolution(&b.id).unwrap().decision,
            ApprovalDecision::Expired
        );
        assert!(manager.open_approval(&other.id).is_some());
        assert_eq!(store.audit_entries().len(), 2);
    }

    #[test]
    fn params_summary_is_single_line_and_capped() {
        let value = json!({"path": "/tmp/x", "recursive": true});
        let summary = params_summary(&value);
        assert!(!summary.contains('\n'));

        let long = json!({"data": "x".repeat(500)});
        let summary = params_summary(&long);
        assert!(summary.chars().count() <= PARAMS_SUMMARY_MAX_CHARS + 1);
        assert!(summary.ends_with('…'));
    }
}
