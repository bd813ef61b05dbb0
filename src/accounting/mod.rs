//! Accounting: turns session and command events into audit-store writes.
//!
//! The request path only ever enqueues (`AccountingRecorder`); a single background
//! `AccountingWorker` performs the writes in queue order, retrying briefly and logging
//! anything it has to give up on. A slow or failed database never delays a reply.

mod store;
pub mod postgres;

pub use store::{AuditRecord, AuditStore, MemoryAuditStore, SessionEndStatus};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::identity::{gen_token, Session};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountingEvent {
    SessionStart { id: String, principal: String, client_address: String, started_at: DateTime<Utc> },
    SessionEnd { id: String, ended_at: DateTime<Utc>, status: SessionEndStatus },
    Command { session_id: String, command: String, timestamp: DateTime<Utc>, allowed: bool },
}

impl AccountingEvent {
    fn label(&self) -> &'static str {
        match self {
            AccountingEvent::SessionStart { .. } => "session_start",
            AccountingEvent::SessionEnd { .. } => "session_end",
            AccountingEvent::Command { .. } => "command",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccountingStats {
    pub queued: u64,
    pub written: u64,
    pub dropped: u64,
}

impl AccountingStats {
    pub fn pending(&self) -> u64 { self.queued.saturating_sub(self.written + self.dropped) }
}

/// Cheap, cloneable handle used by the request path. Every method returns immediately.
#[derive(Clone)]
pub struct AccountingRecorder {
    tx: mpsc::UnboundedSender<AccountingEvent>,
    counters: Arc<Counters>,
}

impl AccountingRecorder {
    /// New recorder plus the receiving end for `AccountingWorker::spawn`.
    pub fn channel() -> (Self, AccountingQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        (Self { tx, counters: counters.clone() }, AccountingQueue { rx, counters })
    }

    pub fn record_start(&self, session: &Session) {
        self.enqueue(AccountingEvent::SessionStart {
            id: session.id.clone(),
            principal: session.principal.clone(),
            client_address: session.client_address.clone(),
            started_at: session.started_at,
        });
    }

    pub fn record_stop(&self, session_id: &str) { self.record_end(session_id, SessionEndStatus::Completed); }

    pub fn record_expired(&self, session_id: &str) { self.record_end(session_id, SessionEndStatus::Expired); }

    fn record_end(&self, session_id: &str, status: SessionEndStatus) {
        self.enqueue(AccountingEvent::SessionEnd { id: session_id.to_string(), ended_at: Utc::now(), status });
    }

    /// Queue a command record. Without a session the command is attributed to a
    /// placeholder id derived from the principal; the id used is returned.
    pub fn record_command(&self, session_id: Option<&str>, principal: &str, command: &str, allowed: bool) -> String {
        let now = Utc::now();
        let sid = match session_id {
            Some(id) => id.to_string(),
            None => {
                let placeholder = format!("{}_unknown_{}_{}", principal, now.timestamp(), gen_token());
                debug!(target: "tacplane::accounting", "no active session for {}; recording command under {}", principal, placeholder);
                placeholder
            }
        };
        self.enqueue(AccountingEvent::Command { session_id: sid.clone(), command: command.to_string(), timestamp: now, allowed });
        sid
    }

    /// Watchdog updates are logged only.
    pub fn record_watchdog(&self, principal: &str) {
        debug!(target: "tacplane::accounting", "watchdog update for user {}", principal);
    }

    pub fn stats(&self) -> AccountingStats {
        AccountingStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    fn enqueue(&self, ev: AccountingEvent) {
        let label = ev.label();
        if self.tx.send(ev).is_err() {
            warn!(target: "tacplane::accounting", "accounting worker is gone; dropping {} event", label);
            return;
        }
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
    }
}

/// Receiving side of the accounting queue.
pub struct AccountingQueue {
    pub(crate) rx: mpsc::UnboundedReceiver<AccountingEvent>,
    counters: Arc<Counters>,
}

/// Background writer draining the accounting queue into an `AuditStore`.
pub struct AccountingWorker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    counters: Arc<Counters>,
}

impl AccountingWorker {
    /// Must be called from within a tokio runtime.
    pub fn spawn(queue: AccountingQueue, store: Arc<dyn AuditStore>, attempts: u32) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let counters = queue.counters.clone();
        let handle = tokio::spawn(run(queue, store, attempts.max(1), shutdown_rx));
        Self { handle, shutdown, counters }
    }

    /// Signal shutdown and flush what is already queued, giving up after `grace`.
    /// Returns the number of events that were never written.
    pub async fn shutdown(mut self, grace: Duration) -> u64 {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(grace, &mut self.handle).await.is_err() {
            self.handle.abort();
            warn!(target: "tacplane::accounting", "accounting drain exceeded {:?}; abandoning remaining events", grace);
        }
        let queued = self.counters.queued.load(Ordering::Relaxed);
        let written = self.counters.written.load(Ordering::Relaxed);
        let dropped = self.counters.dropped.load(Ordering::Relaxed);
        let lost = queued.saturating_sub(written);
        info!(target: "tacplane::accounting", "accounting stopped: queued={} written={} dropped={} unwritten={}", queued, written, dropped, lost);
        lost
    }
}

async fn run(mut queue: AccountingQueue, store: Arc<dyn AuditStore>, attempts: u32, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            ev = queue.rx.recv() => match ev {
                Some(ev) => deliver(store.as_ref(), &queue.counters, &ev, attempts).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    // Refuse new events, then flush whatever is already queued.
    queue.rx.close();
    while let Some(ev) = queue.rx.recv().await {
        deliver(store.as_ref(), &queue.counters, &ev, attempts).await;
    }
}

async fn deliver(store: &dyn AuditStore, counters: &Counters, ev: &AccountingEvent, attempts: u32) {
    for attempt in 1..=attempts {
        let res = match ev {
            AccountingEvent::SessionStart { id, principal, client_address, started_at } => {
                store.append_session_start(id, principal, client_address, *started_at).await
            }
            AccountingEvent::SessionEnd { id, ended_at, status } => store.mark_session_ended(id, *ended_at, *status).await,
            AccountingEvent::Command { session_id, command, timestamp, allowed } => {
                store.append_command(session_id, command, *timestamp, *allowed).await
            }
        };
        match res {
            Ok(()) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) if attempt < attempts => {
                debug!(target: "tacplane::accounting", "{} write attempt {} failed: {}", ev.label(), attempt, e);
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => {
                warn!(target: "tacplane::accounting", "dropping {} after {} attempts: {}", ev.label(), attempts, e);
            }
        }
    }
    counters.dropped.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, principal: &str) -> Session {
        Session {
            id: id.to_string(),
            principal: principal.to_string(),
            client_address: "192.0.2.1".to_string(),
            roles: vec!["admin".to_string()],
            started_at: Utc::now(),
            active: true,
            commands: Vec::new(),
        }
    }

    #[tokio::test]
    async fn events_are_written_in_queue_order() {
        let store = Arc::new(MemoryAuditStore::new());
        let (rec, queue) = AccountingRecorder::channel();
        let worker = AccountingWorker::spawn(queue, store.clone(), 1);

        rec.record_start(&session("s1", "alice"));
        rec.record_command(Some("s1"), "alice", "show version", true);
        rec.record_command(Some("s1"), "alice", "reload", false);
        rec.record_stop("s1");
        rec.record_watchdog("alice");

        assert_eq!(worker.shutdown(Duration::from_secs(2)).await, 0);
        let records = store.records();
        assert_eq!(records.len(), 4);
        assert!(matches!(&records[0], AuditRecord::SessionStart { id, .. } if id == "s1"));
        assert_eq!(
            store.commands_for("s1"),
            vec![("show version".to_string(), true), ("reload".to_string(), false)]
        );
        assert_eq!(store.end_status("s1"), Some(SessionEndStatus::Completed));
        assert_eq!(rec.stats().written, 4);
    }

    #[tokio::test]
    async fn command_without_session_gets_placeholder_id() {
        let (rec, _queue) = AccountingRecorder::channel();
        let a = rec.record_command(None, "carol", "show clock", true);
        let b = rec.record_command(None, "carol", "show clock", true);
        assert!(a.starts_with("carol_unknown_"));
        assert_ne!(a, b);
        assert_eq!(rec.stats().queued, 2);
    }

    #[tokio::test]
    async fn persistence_outage_is_logged_and_dropped() {
        let store = Arc::new(MemoryAuditStore::new());
        store.set_failing(true);
        let (rec, queue) = AccountingRecorder::channel();
        let worker = AccountingWorker::spawn(queue, store.clone(), 2);
        rec.record_stop("s9");
        rec.record_expired("s10");

        let lost = worker.shutdown(Duration::from_secs(2)).await;
        assert_eq!(lost, 2);
        let st = rec.stats();
        assert_eq!(st.dropped, 2);
        assert_eq!(st.written, 0);
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn recorder_outliving_worker_does_not_panic() {
        let store = Arc::new(MemoryAuditStore::new());
        let (rec, queue) = AccountingRecorder::channel();
        let worker = AccountingWorker::spawn(queue, store.clone(), 1);
        worker.shutdown(Duration::from_millis(500)).await;
        rec.record_stop("late");
        assert_eq!(rec.stats().queued, 0);
    }
}
