//! Coordinator lifecycle: wires the cache, registry, accounting worker and cleanup ticker
//! together and tears them down in order.

use std::sync::Arc;

use tracing::{info, warn};

use crate::accounting::{AccountingRecorder, AccountingStats, AccountingWorker, AuditStore};
use crate::config::CoordinatorConfig;
use crate::identity::{CacheStats, CredentialCache, IdentityProvider, SessionRegistry};
use crate::router::RequestRouter;
use crate::scheduler::CleanupScheduler;

pub struct Coordinator {
    config: CoordinatorConfig,
    cache: Arc<CredentialCache>,
    registry: Arc<SessionRegistry>,
    recorder: AccountingRecorder,
    router: RequestRouter,
    worker: AccountingWorker,
    scheduler: CleanupScheduler,
    store: Arc<dyn AuditStore>,
}

impl Coordinator {
    /// Build the core and start its background tasks. Must be called inside a runtime.
    pub fn start(config: CoordinatorConfig, provider: Arc<dyn IdentityProvider>, store: Arc<dyn AuditStore>) -> Self {
        let provider_name = provider.name();
        let cache = Arc::new(
            CredentialCache::new(provider, config.credential_cache_ttl(), config.provider_timeout())
                .with_negative_ttl(config.negative_cache_ttl()),
        );
        let (recorder, queue) = AccountingRecorder::channel();
        let worker = AccountingWorker::spawn(queue, store.clone(), config.persistence_attempts);
        let registry = Arc::new(SessionRegistry::new(recorder.clone()));
        let scheduler =
            CleanupScheduler::start(cache.clone(), registry.clone(), config.cleanup_interval(), config.session_timeout());
        let router = RequestRouter::new(cache.clone(), registry.clone(), recorder.clone());
        info!(
            target: "tacplane",
            "coordinator started: provider={} session_timeout={}s cache_ttl={}s negative_ttl={}s",
            provider_name, config.session_timeout_secs, config.credential_cache_ttl_secs, config.negative_cache_ttl_secs
        );
        Self { config, cache, registry, recorder, router, worker, scheduler, store }
    }

    /// Cloneable handle for front-ends; every clone shares the same core.
    pub fn router(&self) -> RequestRouter { self.router.clone() }

    pub fn cache(&self) -> &Arc<CredentialCache> { &self.cache }
    pub fn registry(&self) -> &Arc<SessionRegistry> { &self.registry }
    pub fn config(&self) -> &CoordinatorConfig { &self.config }

    pub fn cache_stats(&self) -> CacheStats { self.cache.stats() }
    pub fn accounting_stats(&self) -> AccountingStats { self.recorder.stats() }

    /// Stop the cleanup ticker, flush queued accounting within the configured grace, then
    /// close the audit store. Returns the number of audit events never written.
    pub async fn shutdown(self) -> u64 {
        let Self { config, worker, scheduler, store, registry, .. } = self;
        scheduler.stop().await;
        let lost = worker.shutdown(config.accounting_drain_grace()).await;
        store.close().await;
        if lost > 0 {
            warn!(target: "tacplane", "shutdown complete; {} audit event(s) were not written", lost);
        } else {
            info!(target: "tacplane", "shutdown complete; {} session(s) were still active", registry.active_count());
        }
        lost
    }
}
