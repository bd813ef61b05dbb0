use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{AaaError, AaaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEndStatus {
    Completed,
    Expired,
}

impl SessionEndStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEndStatus::Completed => "completed",
            SessionEndStatus::Expired => "expired",
        }
    }
}

/// Durable audit trail capability. Implementations are internally synchronised; the
/// core calls them only from the accounting worker, never from the request path.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_session_start(
        &self,
        id: &str,
        principal: &str,
        client_address: &str,
        started_at: DateTime<Utc>,
    ) -> AaaResult<()>;

    async fn mark_session_ended(&self, id: &str, ended_at: DateTime<Utc>, status: SessionEndStatus) -> AaaResult<()>;

    async fn append_command(
        &self,
        session_id: &str,
        command: &str,
        timestamp: DateTime<Utc>,
        allowed: bool,
    ) -> AaaResult<()>;

    /// Release the underlying resource. Called once, after the worker has drained.
    async fn close(&self) {}
}

/// One row of the in-memory audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditRecord {
    SessionStart { id: String, principal: String, client_address: String, started_at: DateTime<Utc> },
    SessionEnd { id: String, ended_at: DateTime<Utc>, status: SessionEndStatus },
    Command { session_id: String, command: String, timestamp: DateTime<Utc>, allowed: bool },
}

/// Audit store kept in process memory. Used when no database is configured and in tests;
/// `set_failing(true)` simulates an outage.
#[derive(Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
    failing: Mutex<bool>,
    closed: Mutex<bool>,
}

impl MemoryAuditStore {
    pub fn new() -> Self { Self::default() }

    pub fn records(&self) -> Vec<AuditRecord> { self.records.lock().clone() }
    pub fn set_failing(&self, failing: bool) { *self.failing.lock() = failing; }
    pub fn is_closed(&self) -> bool { *self.closed.lock() }

    pub fn commands_for(&self, session_id: &str) -> Vec<(String, bool)> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                AuditRecord::Command { session_id: sid, command, allowed, .. } if sid == session_id => {
                    Some((command.clone(), *allowed))
                }
                _ => None,
            })
            .collect()
    }

    pub fn end_status(&self, session_id: &str) -> Option<SessionEndStatus> {
        self.records.lock().iter().rev().find_map(|r| match r {
            AuditRecord::SessionEnd { id, status, .. } if id == session_id => Some(*status),
            _ => None,
        })
    }

    fn push(&self, rec: AuditRecord) -> AaaResult<()> {
        if *self.failing.lock() {
            return Err(AaaError::PersistenceUnavailable("memory audit store is failing".into()));
        }
        self.records.lock().push(rec);
        Ok(())
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append_session_start(
        &self,
        id: &str,
        principal: &str,
        client_address: &str,
        started_at: DateTime<Utc>,
    ) -> AaaResult<()> {
        self.push(AuditRecord::SessionStart {
            id: id.to_string(),
            principal: principal.to_string(),
            client_address: client_address.to_string(),
            started_at,
        })
    }

    async fn mark_session_ended(&self, id: &str, ended_at: DateTime<Utc>, status: SessionEndStatus) -> AaaResult<()> {
        self.push(AuditRecord::SessionEnd { id: id.to_string(), ended_at, status })
    }

    async fn append_command(
        &self,
        session_id: &str,
        command: &str,
        timestamp: DateTime<Utc>,
        allowed: bool,
    ) -> AaaResult<()> {
        self.push(AuditRecord::Command {
            session_id: session_id.to_string(),
            command: command.to_string(),
            timestamp,
            allowed,
        })
    }

    async fn close(&self) { *self.closed.lock() = true; }
}
