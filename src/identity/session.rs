use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use super::policy::is_authorized;
use crate::accounting::AccountingRecorder;
use crate::tprintln;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandRecord {
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    pub principal: String,
    pub client_address: String,
    pub roles: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub active: bool,
    pub commands: Vec<CommandRecord>,
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
    /// Creation order; breaks ties between sessions started in the same instant.
    seq: u64,
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<String, SessionEntry>,
    by_principal: HashMap<String, HashSet<String>>,
    next_seq: u64,
}

impl SessionTable {
    /// Most recent active session for a principal: latest `started_at`, then latest created.
    fn current_id(&self, principal: &str) -> Option<String> {
        let ids = self.by_principal.get(principal)?;
        ids.iter()
            .filter_map(|id| self.sessions.get(id))
            .filter(|e| e.session.active)
            .max_by_key(|e| (e.session.started_at, e.seq))
            .map(|e| e.session.id.clone())
    }

    fn remove(&mut self, id: &str) -> Option<SessionEntry> {
        let entry = self.sessions.remove(id)?;
        let principal = &entry.session.principal;
        let now_empty = match self.by_principal.get_mut(principal) {
            Some(set) => {
                set.remove(id);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_principal.remove(principal);
        }
        Some(entry)
    }
}

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Random url-safe token; falls back to a process-unique counter if the OS RNG fails.
pub fn gen_token() -> String {
    let mut buf = [0u8; 12];
    if getrandom::getrandom(&mut buf).is_err() {
        let n = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let nanos = Utc::now().timestamp_subsec_nanos();
        buf[..8].copy_from_slice(&n.to_be_bytes());
        buf[8..].copy_from_slice(&nanos.to_be_bytes());
    }
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// Live session table, keyed by session id with a principal index.
/// All mutation goes through a single write lock; lookups share the read lock.
pub struct SessionRegistry {
    table: RwLock<SessionTable>,
    recorder: AccountingRecorder,
}

impl SessionRegistry {
    pub fn new(recorder: AccountingRecorder) -> Self {
        Self { table: RwLock::new(SessionTable::default()), recorder }
    }

    /// Register a freshly authenticated principal. The start record is queued before the
    /// session becomes visible to lookups.
    pub fn create(&self, principal: &str, client_address: &str, roles: Vec<String>) -> Session {
        let started_at = Utc::now();
        let session = Session {
            id: format!("{}_{}_{}", principal, started_at.timestamp(), gen_token()),
            principal: principal.to_string(),
            client_address: client_address.to_string(),
            roles,
            started_at,
            active: true,
            commands: Vec::new(),
        };
        {
            let mut t = self.table.write();
            let seq = t.next_seq;
            t.next_seq += 1;
            self.recorder.record_start(&session);
            t.by_principal.entry(principal.to_string()).or_default().insert(session.id.clone());
            t.sessions.insert(session.id.clone(), SessionEntry { session: session.clone(), seq });
        }
        info!(target: "tacplane::session", "session.create user={} sid={} client={}", principal, session.id, client_address);
        session
    }

    pub fn find_active_by_principal(&self, principal: &str) -> Option<Session> {
        let t = self.table.read();
        let id = t.current_id(principal)?;
        t.sessions.get(&id).map(|e| e.session.clone())
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.table.read().sessions.get(id).map(|e| e.session.clone())
    }

    /// End the principal's current session on an explicit stop. The session leaves the
    /// live table; its id is returned so the caller can record the end.
    pub fn deactivate(&self, principal: &str) -> Option<String> {
        let mut t = self.table.write();
        let id = t.current_id(principal)?;
        let mut entry = t.remove(&id)?;
        entry.session.active = false;
        debug!(target: "tacplane::session", "session.deactivate user={} sid={} commands={}", principal, id, entry.session.commands.len());
        Some(id)
    }

    /// Append an authorization decision to the principal's current session and queue it
    /// for the audit trail in the same critical section, so per-session order holds.
    /// Returns the session id the record was attributed to (a placeholder without one).
    pub fn record_command(&self, principal: &str, command: &str, allowed: bool) -> String {
        let mut t = self.table.write();
        let current = t.current_id(principal);
        let Some(id) = current else {
            drop(t);
            return self.recorder.record_command(None, principal, command, allowed);
        };
        let sid = self.recorder.record_command(Some(&id), principal, command, allowed);
        if let Some(entry) = t.sessions.get_mut(&id) {
            entry.session.commands.push(CommandRecord { command: command.to_string(), timestamp: Utc::now(), allowed });
        }
        sid
    }

    /// Decide `command` against the principal's current session and record the decision on
    /// that same session, all under one write lock. `None` when there is no active session.
    pub fn authorize(&self, principal: &str, command: &str) -> Option<(String, bool)> {
        let mut t = self.table.write();
        let id = t.current_id(principal)?;
        let entry = t.sessions.get_mut(&id)?;
        let allowed = is_authorized(&entry.session.roles, command);
        let sid = self.recorder.record_command(Some(&id), principal, command, allowed);
        entry.session.commands.push(CommandRecord { command: command.to_string(), timestamp: Utc::now(), allowed });
        Some((sid, allowed))
    }

    /// Expire every active session started before `cutoff`. Each one leaves the table and
    /// gets exactly one expired record; repeated calls with the same cutoff are no-ops.
    pub fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut t = self.table.write();
        let stale: Vec<String> = t
            .sessions
            .values()
            .filter(|e| e.session.started_at < cutoff)
            .map(|e| e.session.id.clone())
            .collect();
        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(mut entry) = t.remove(&id) {
                if entry.session.active {
                    entry.session.active = false;
                    self.recorder.record_expired(&id);
                    expired.push(id);
                }
            }
        }
        if !expired.is_empty() {
            tprintln!("session.expire count={} cutoff={}", expired.len(), cutoff);
            info!(target: "tacplane::session", "expired {} session(s) started before {}", expired.len(), cutoff);
        }
        expired
    }

    pub fn active_count(&self) -> usize {
        self.table.read().sessions.values().filter(|e| e.session.active).count()
    }

    pub fn len(&self) -> usize { self.table.read().sessions.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
