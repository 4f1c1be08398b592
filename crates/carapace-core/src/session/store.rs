//! Persistence boundary for sessions and the approval audit log.
//!
//! The core treats the store as durable, ordered, and available; retry and
//! backoff on this boundary belong to the storage collaborator, not here.
//! [`MemoryStore`] is the bundled implementation used by tests and
//! single-process embeddings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::approval::AuditEntry;
use crate::session::{Session, Turn};

/// Narrow storage interface the core depends on.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Append one turn to a session's durable history.
    async fn append_turn(&self, session_id: &str, turn: &Turn) -> anyhow::Result<()>;

    async fn load_session(&self, session_id: &str) -> anyhow::Result<Option<Session>>;

    /// Upsert the full session document (status, usage, compacted history).
    async fn save_session(&self, session: &Session) -> anyhow::Result<()>;

    /// Append one immutable audit entry.
    async fn save_audit_entry(&self, entry: &AuditEntry) -> anyhow::Result<()>;
}

/// In-memory store backed by a concurrent session table.
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<String, Session>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the audit log, oldest first.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop sessions not touched since `cutoff`. Returns how many were
    /// evicted. Idle-timeout policy lives with the embedder; this is just the
    /// mechanism.
    pub fn evict_idle(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.updated_at >= cutoff);
        before - self.sessions.len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn append_turn(&self, session_id: &str, turn: &Turn) -> anyhow::Result<()> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow::anyhow!("unknown session: {session_id}"))?;
        entry.turns.push(turn.clone());
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }

    async fn save_session(&self, session: &Session) -> anyhow::Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn save_audit_entry(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        self.audit.lock().push(entry.clone());
        Ok(())
    }
}
