//! Periodic cleanup: evicts expired credentials and expires stale sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::identity::{CredentialCache, SessionRegistry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub credentials_evicted: usize,
    pub sessions_expired: usize,
}

/// One cleanup pass. Safe to run at any time; a pass over clean state changes nothing.
pub fn sweep(cache: &CredentialCache, registry: &SessionRegistry, session_timeout: Duration) -> SweepReport {
    let credentials_evicted = cache.evict_expired();
    let timeout = match chrono::Duration::from_std(session_timeout) {
        Ok(d) => d,
        Err(e) => {
            warn!(target: "tacplane::scheduler", "session timeout {:?} out of range: {}", session_timeout, e);
            chrono::Duration::MAX
        }
    };
    let cutoff = Utc::now().checked_sub_signed(timeout).unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
    let sessions_expired = registry.expire_older_than(cutoff).len();

    let stats = cache.stats();
    debug!(
        target: "tacplane::scheduler",
        evicted = credentials_evicted,
        expired = sessions_expired,
        cache_entries = stats.entries,
        active_sessions = registry.active_count(),
        "cleanup pass"
    );
    SweepReport { credentials_evicted, sessions_expired }
}

/// Background ticker running `sweep` every `interval` until stopped.
pub struct CleanupScheduler {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl CleanupScheduler {
    /// The first pass runs one full interval after start. Must be called inside a runtime.
    pub fn start(
        cache: Arc<CredentialCache>,
        registry: Arc<SessionRegistry>,
        interval: Duration,
        session_timeout: Duration,
    ) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);
        let period = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&cache, &registry, session_timeout);
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!(target: "tacplane::scheduler", "cleanup ticker exited");
        });
        info!(target: "tacplane::scheduler", "cleanup every {:?}, session timeout {:?}", period, session_timeout);
        Self { handle, stop }
    }

    /// Stop ticking. No further passes begin once this returns; a pass already running
    /// completes first.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!(target: "tacplane::scheduler", "cleanup ticker ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::{AccountingEvent, AccountingRecorder, SessionEndStatus};
    use crate::identity::StaticIdentityProvider;

    fn fixture(ttl: Duration) -> (Arc<CredentialCache>, Arc<SessionRegistry>, crate::accounting::AccountingQueue) {
        let provider = Arc::new(StaticIdentityProvider::new().with_user("alice", "pw1", &["admin"]));
        let cache = Arc::new(CredentialCache::new(provider, ttl, Duration::from_secs(5)));
        let (rec, queue) = AccountingRecorder::channel();
        (cache, Arc::new(SessionRegistry::new(rec)), queue)
    }

    #[tokio::test]
    async fn sweep_evicts_and_expires() {
        let (cache, registry, mut queue) = fixture(Duration::from_millis(20));
        cache.resolve("alice", "pw1").await.unwrap();
        let s = registry.create("alice", "unknown", vec!["admin".into()]);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let report = sweep(&cache, &registry, Duration::ZERO);
        assert_eq!(report, SweepReport { credentials_evicted: 1, sessions_expired: 1 });
        assert!(cache.is_empty());
        assert!(registry.find_active_by_principal("alice").is_none());

        let again = sweep(&cache, &registry, Duration::ZERO);
        assert_eq!(again, SweepReport::default());

        let mut ends = Vec::new();
        while let Ok(ev) = queue.rx.try_recv() {
            if let AccountingEvent::SessionEnd { id, status, .. } = ev { ends.push((id, status)); }
        }
        assert_eq!(ends, vec![(s.id, SessionEndStatus::Expired)]);
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_sessions() {
        let (cache, registry, _queue) = fixture(Duration::from_secs(60));
        registry.create("alice", "unknown", vec!["admin".into()]);
        let report = sweep(&cache, &registry, Duration::from_secs(3600));
        assert_eq!(report.sessions_expired, 0);
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn ticker_runs_and_stops() {
        let (cache, registry, _queue) = fixture(Duration::from_secs(60));
        registry.create("alice", "unknown", vec!["admin".into()]);
        let sched = CleanupScheduler::start(cache, registry.clone(), Duration::from_millis(10), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(60)).await;
        sched.stop().await;
        assert_eq!(registry.active_count(), 0);

        // Nothing sweeps after stop.
        registry.create("alice", "unknown", vec!["admin".into()]);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(registry.active_count(), 1);
    }
}
