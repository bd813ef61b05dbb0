//! Time-bounded credential cache in front of the identity provider.
//!
//! Concurrent lookups for the same credential pair share one provider call: the first
//! miss installs a pending flight under the write lock and every later caller awaits a
//! clone of it. No lock is held while the provider is being awaited.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::provider::IdentityProvider;
use crate::error::{AaaError, AaaResult};
use crate::tprintln;

type Flight = Shared<BoxFuture<'static, AaaResult<Vec<String>>>>;

/// Stable, collision-resistant key for a credential pair. Both parts are length-prefixed
/// so ("ab", "c") and ("a", "bc") never share a key; the secret itself is never stored.
pub fn fingerprint(principal: &str, secret: &str) -> String {
    let mut h = Sha256::new();
    h.update((principal.len() as u64).to_be_bytes());
    h.update(principal.as_bytes());
    h.update((secret.len() as u64).to_be_bytes());
    h.update(secret.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(h.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCredential {
    pub fingerprint: String,
    pub roles: Vec<String>,
    pub expires_at: Instant,
}

enum Slot {
    Ready(CachedCredential),
    /// Only present when negative caching is enabled.
    Denied { error: AaaError, expires_at: Instant },
    /// A flight cannot outlive `started_at + provider_timeout`; past that the slot is
    /// orphaned (its caller was cancelled) and is treated as absent.
    Pending { flight_id: u64, flight: Flight, started_at: Instant },
}

enum Lookup {
    Hit(Vec<String>),
    Denied(AaaError),
    Join(u64, Flight),
    Miss,
}

fn lookup(slot: Option<&Slot>, now: Instant, flight_limit: Duration) -> Lookup {
    match slot {
        Some(Slot::Ready(c)) if now < c.expires_at => Lookup::Hit(c.roles.clone()),
        Some(Slot::Denied { error, expires_at }) if now < *expires_at => Lookup::Denied(error.clone()),
        Some(Slot::Pending { flight_id, flight, started_at }) if now < *started_at + flight_limit => {
            Lookup::Join(*flight_id, flight.clone())
        }
        _ => Lookup::Miss,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups that piggybacked on another caller's in-flight provider call.
    pub coalesced: u64,
    pub evictions: u64,
    pub entries: usize,
}

pub struct CredentialCache {
    provider: Arc<dyn IdentityProvider>,
    ttl: Duration,
    negative_ttl: Duration,
    provider_timeout: Duration,
    entries: RwLock<HashMap<String, Slot>>,
    next_flight: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

impl CredentialCache {
    pub fn new(provider: Arc<dyn IdentityProvider>, ttl: Duration, provider_timeout: Duration) -> Self {
        Self {
            provider,
            ttl,
            negative_ttl: Duration::ZERO,
            provider_timeout,
            entries: RwLock::new(HashMap::new()),
            next_flight: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cache rejected credentials for `ttl`. Zero (the default) never caches failures.
    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = ttl;
        self
    }

    /// Roles for a credential pair, from cache when live, otherwise from the provider.
    pub async fn resolve(&self, principal: &str, secret: &str) -> AaaResult<Vec<String>> {
        let key = fingerprint(principal, secret);

        let fast = {
            let r = self.entries.read();
            lookup(r.get(&key), Instant::now(), self.provider_timeout)
        };
        let (flight_id, flight) = match fast {
            Lookup::Hit(roles) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tprintln!("cache.hit user={}", principal);
                return Ok(roles);
            }
            Lookup::Denied(err) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
            Lookup::Join(id, flight) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                (id, flight)
            }
            Lookup::Miss => {
                // Re-check under the write lock: another caller may have started a flight.
                let mut w = self.entries.write();
                match lookup(w.get(&key), Instant::now(), self.provider_timeout) {
                    Lookup::Hit(roles) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(roles);
                    }
                    Lookup::Denied(err) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Err(err);
                    }
                    Lookup::Join(id, flight) => {
                        self.coalesced.fetch_add(1, Ordering::Relaxed);
                        (id, flight)
                    }
                    Lookup::Miss => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        let (id, flight) = self.start_flight(principal, secret);
                        let started_at = Instant::now();
                        w.insert(key.clone(), Slot::Pending { flight_id: id, flight: flight.clone(), started_at });
                        debug!(target: "tacplane::cache", "cache miss user={} flight={}", principal, id);
                        (id, flight)
                    }
                }
            }
        };

        let outcome = flight.await;
        self.settle(&key, principal, flight_id, &outcome);
        outcome
    }

    fn start_flight(&self, principal: &str, secret: &str) -> (u64, Flight) {
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let provider = self.provider.clone();
        let timeout = self.provider_timeout;
        let principal = principal.to_string();
        let secret = secret.to_string();
        let flight = async move {
            match tokio::time::timeout(timeout, provider.authenticate(&principal, &secret)).await {
                Ok(Ok(info)) => {
                    if !info.groups.is_empty() {
                        debug!(target: "tacplane::cache", "user={} groups={:?}", principal, info.groups);
                    }
                    Ok(info.roles)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(AaaError::ProviderTimeout(timeout)),
            }
        }
        .boxed()
        .shared();
        (id, flight)
    }

    /// Replace the pending slot with the flight's outcome. Every waiter calls this; only
    /// the first one to arrive still finds its own flight in place.
    fn settle(&self, key: &str, principal: &str, flight_id: u64, outcome: &AaaResult<Vec<String>>) {
        let mut w = self.entries.write();
        let ours = matches!(w.get(key), Some(Slot::Pending { flight_id: id, .. }) if *id == flight_id);
        if !ours {
            return;
        }
        let now = Instant::now();
        match outcome {
            Ok(roles) => {
                info!(target: "tacplane::cache", "user={} authenticated with roles={:?}", principal, roles);
                w.insert(
                    key.to_string(),
                    Slot::Ready(CachedCredential { fingerprint: key.to_string(), roles: roles.clone(), expires_at: now + self.ttl }),
                );
            }
            Err(err @ AaaError::AuthenticationFailed { .. }) => {
                info!(target: "tacplane::cache", "authentication rejected for user={}: {}", principal, err);
                if self.negative_ttl.is_zero() {
                    w.remove(key);
                } else {
                    w.insert(key.to_string(), Slot::Denied { error: err.clone(), expires_at: now + self.negative_ttl });
                }
            }
            Err(err) => {
                warn!(target: "tacplane::cache", "identity provider {} failed for user={}: {} ({})",
                    self.provider.name(), principal, err, err.code_str());
                w.remove(key);
            }
        }
    }

    /// Drop every entry past its expiry, and pending flights whose caller went away
    /// before the provider timeout could settle them.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let flight_limit = self.provider_timeout;
        let mut w = self.entries.write();
        let before = w.len();
        w.retain(|_, slot| match slot {
            Slot::Ready(c) => now < c.expires_at,
            Slot::Denied { expires_at, .. } => now < *expires_at,
            Slot::Pending { started_at, .. } => now < *started_at + flight_limit,
        });
        let removed = before - w.len();
        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(target: "tacplane::cache", removed = removed, "cache_evict");
        }
        removed
    }

    /// Live cached entry for a credential pair, if any.
    pub fn peek(&self, principal: &str, secret: &str) -> Option<CachedCredential> {
        let key = fingerprint(principal, secret);
        match self.entries.read().get(&key) {
            Some(Slot::Ready(c)) if Instant::now() < c.expires_at => Some(c.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize { self.entries.read().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentityProvider;

    fn cache_with(provider: &Arc<StaticIdentityProvider>, ttl: Duration) -> CredentialCache {
        CredentialCache::new(provider.clone(), ttl, Duration::from_secs(5))
    }

    #[test]
    fn fingerprint_is_unambiguous() {
        assert_ne!(fingerprint("ab", "c"), fingerprint("a", "bc"));
        assert_ne!(fingerprint("alice", "pw1"), fingerprint("alice", "pw2"));
        assert_eq!(fingerprint("alice", "pw1"), fingerprint("alice", "pw1"));
        assert!(!fingerprint("alice", "pw1").contains("pw1"));
    }

    #[tokio::test]
    async fn live_hit_skips_provider_and_expiry_refetches_once() {
        let provider = Arc::new(StaticIdentityProvider::new().with_user("alice", "pw1", &["admin"]));
        let cache = cache_with(&provider, Duration::from_millis(80));

        assert_eq!(cache.resolve("alice", "pw1").await.unwrap(), vec!["admin".to_string()]);
        assert_eq!(cache.resolve("alice", "pw1").await.unwrap(), vec!["admin".to_string()]);
        assert_eq!(provider.calls(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.peek("alice", "pw1").is_none());
        cache.resolve("alice", "pw1").await.unwrap();
        assert_eq!(provider.calls(), 2);

        let st = cache.stats();
        assert_eq!(st.hits, 1);
        assert_eq!(st.misses, 2);
    }

    #[tokio::test]
    async fn refresh_replaces_roles_wholesale() {
        let provider = Arc::new(StaticIdentityProvider::new().with_user("bob", "pw2", &["viewer", "ops"]));
        let cache = cache_with(&provider, Duration::from_millis(50));
        cache.resolve("bob", "pw2").await.unwrap();
        provider.set_roles("bob", &["user"]);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.resolve("bob", "pw2").await.unwrap(), vec!["user".to_string()]);
        assert_eq!(cache.peek("bob", "pw2").unwrap().roles, vec!["user".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_identical_lookups_share_one_provider_call() {
        let provider = Arc::new(StaticIdentityProvider::new().with_user("alice", "pw1", &["admin"]));
        provider.set_delay(Some(Duration::from_millis(60)));
        let cache = Arc::new(cache_with(&provider, Duration::from_secs(60)));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let c = cache.clone();
            tasks.push(tokio::spawn(async move { c.resolve("alice", "pw1").await }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap(), vec!["admin".to_string()]);
        }
        assert_eq!(provider.calls(), 1);
        let st = cache.stats();
        assert_eq!(st.misses, 1);
        assert_eq!(st.coalesced + st.hits, 15);
    }

    #[tokio::test]
    async fn failures_are_not_cached_by_default() {
        let provider = Arc::new(StaticIdentityProvider::new().with_user("alice", "pw1", &["admin"]));
        let cache = cache_with(&provider, Duration::from_secs(60));
        for _ in 0..3 {
            let err = cache.resolve("alice", "wrong").await.unwrap_err();
            assert_eq!(err.code_str(), "authentication_failed");
        }
        assert_eq!(provider.calls(), 3);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn negative_cache_holds_rejections_when_enabled() {
        let provider = Arc::new(StaticIdentityProvider::new().with_user("alice", "pw1", &["admin"]));
        let cache = cache_with(&provider, Duration::from_secs(60)).with_negative_ttl(Duration::from_millis(60));
        assert!(cache.resolve("alice", "wrong").await.is_err());
        assert!(cache.resolve("alice", "wrong").await.is_err());
        assert_eq!(provider.calls(), 1);
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.resolve("alice", "wrong").await.is_err());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn provider_outage_is_never_negatively_cached() {
        let provider = Arc::new(StaticIdentityProvider::new().with_user("alice", "pw1", &["admin"]));
        provider.set_unavailable(true);
        let cache = cache_with(&provider, Duration::from_secs(60)).with_negative_ttl(Duration::from_secs(60));
        let err = cache.resolve("alice", "pw1").await.unwrap_err();
        assert_eq!(err.code_str(), "provider_unavailable");
        provider.set_unavailable(false);
        assert!(cache.resolve("alice", "pw1").await.is_ok());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn slow_provider_times_out_and_is_not_cached() {
        let provider = Arc::new(StaticIdentityProvider::new().with_user("alice", "pw1", &["admin"]));
        provider.set_delay(Some(Duration::from_millis(200)));
        let cache = CredentialCache::new(provider.clone(), Duration::from_secs(60), Duration::from_millis(30));
        let err = cache.resolve("alice", "pw1").await.unwrap_err();
        assert!(matches!(err, AaaError::ProviderTimeout(_)));
        assert!(err.is_authentication_failure());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn evict_expired_only_removes_stale_entries() {
        let provider = Arc::new(
            StaticIdentityProvider::new()
                .with_user("alice", "pw1", &["admin"])
                .with_user("bob", "pw2", &["viewer"]),
        );
        let cache = cache_with(&provider, Duration::from_millis(50));
        cache.resolve("alice", "pw1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.resolve("bob", "pw2").await.unwrap();

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.peek("bob", "pw2").is_some());
        assert_eq!(cache.evict_expired(), 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn cancelled_lookups_do_not_pin_pending_slots() {
        let provider = Arc::new(StaticIdentityProvider::new().with_user("alice", "pw1", &["admin"]));
        provider.set_delay(Some(Duration::from_millis(50)));
        let cache = Arc::new(CredentialCache::new(provider.clone(), Duration::from_secs(60), Duration::from_millis(100)));

        let mut tasks = Vec::new();
        for i in 0..20 {
            let c = cache.clone();
            tasks.push(tokio::spawn(async move { c.resolve("alice", &format!("guess{}", i)).await }));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        for t in &tasks {
            t.abort();
        }
        // Still inside the provider timeout: the flights count as live.
        assert_eq!(cache.evict_expired(), 0);
        assert_eq!(cache.len(), 20);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.evict_expired(), 20);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn orphaned_flight_is_replaced_by_a_fresh_call() {
        let provider = Arc::new(StaticIdentityProvider::new().with_user("alice", "pw1", &["admin"]));
        provider.set_delay(Some(Duration::from_millis(50)));
        let cache = Arc::new(CredentialCache::new(provider.clone(), Duration::from_secs(60), Duration::from_millis(100)));

        let c = cache.clone();
        let first = tokio::spawn(async move { c.resolve("alice", "pw1").await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        first.abort();
        tokio::time::sleep(Duration::from_millis(120)).await;

        // The stale slot is still there (no sweep ran) but must not hand out its old deadline.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.resolve("alice", "pw1").await.unwrap(), vec!["admin".to_string()]);
        assert_eq!(provider.calls(), 2);
        assert_eq!(cache.stats().misses, 2);
    }
}
