//! Coordinator settings.
//! Values come from `TACPLANE_*` environment variables; anything unset or unparsable keeps
//! the default below.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// OIDC identity provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZitadelConfig {
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    /// Sessions older than this are expired by the cleanup tick.
    pub session_timeout_secs: u64,
    pub credential_cache_ttl_secs: u64,
    /// 0 disables caching of failed authentications.
    pub negative_cache_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub provider_timeout_secs: u64,
    /// Time allowed on shutdown to flush queued accounting writes.
    pub accounting_drain_grace_secs: u64,
    pub persistence_attempts: u32,

    #[serde(default)]
    pub zitadel: Option<ZitadelConfig>,
    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 3600,
            credential_cache_ttl_secs: 300,
            negative_cache_ttl_secs: 0,
            cleanup_interval_secs: 300,
            provider_timeout_secs: 30,
            accounting_drain_grace_secs: 10,
            persistence_attempts: 2,
            zitadel: None,
            database_url: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build from any key lookup (environment, test map, ...).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let num = |key: &str, default: u64| -> u64 {
            match lookup(key) {
                Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                    warn!(target: "tacplane::config", "ignoring {}='{}': not a number, using {}", key, raw, default);
                    default
                }),
                None => default,
            }
        };
        cfg.session_timeout_secs = num("TACPLANE_SESSION_TIMEOUT", cfg.session_timeout_secs);
        cfg.credential_cache_ttl_secs = num("TACPLANE_TOKEN_CACHE_TIMEOUT", cfg.credential_cache_ttl_secs);
        cfg.negative_cache_ttl_secs = num("TACPLANE_NEGATIVE_CACHE_TIMEOUT", cfg.negative_cache_ttl_secs);
        cfg.cleanup_interval_secs = num("TACPLANE_CLEANUP_INTERVAL", cfg.cleanup_interval_secs);
        cfg.provider_timeout_secs = num("TACPLANE_PROVIDER_TIMEOUT", cfg.provider_timeout_secs);
        cfg.accounting_drain_grace_secs = num("TACPLANE_ACCOUNTING_DRAIN_GRACE", cfg.accounting_drain_grace_secs);
        cfg.persistence_attempts = num("TACPLANE_PERSISTENCE_ATTEMPTS", cfg.persistence_attempts as u64).clamp(1, 10) as u32;

        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty("TACPLANE_ZITADEL_URL") {
            cfg.zitadel = Some(ZitadelConfig {
                url: url.trim_end_matches('/').to_string(),
                client_id: non_empty("TACPLANE_ZITADEL_CLIENT_ID").unwrap_or_default(),
                client_secret: non_empty("TACPLANE_ZITADEL_CLIENT_SECRET").unwrap_or_default(),
                project_id: non_empty("TACPLANE_ZITADEL_PROJECT_ID"),
            });
        }
        cfg.database_url = non_empty("TACPLANE_DATABASE_URL");
        cfg
    }

    pub fn session_timeout(&self) -> Duration { Duration::from_secs(self.session_timeout_secs) }
    pub fn credential_cache_ttl(&self) -> Duration { Duration::from_secs(self.credential_cache_ttl_secs) }
    pub fn negative_cache_ttl(&self) -> Duration { Duration::from_secs(self.negative_cache_ttl_secs) }
    /// Never zero; a zero period would spin the cleanup loop.
    pub fn cleanup_interval(&self) -> Duration { Duration::from_secs(self.cleanup_interval_secs.max(1)) }
    pub fn provider_timeout(&self) -> Duration { Duration::from_secs(self.provider_timeout_secs.max(1)) }
    pub fn accounting_drain_grace(&self) -> Duration { Duration::from_secs(self.accounting_drain_grace_secs) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = CoordinatorConfig::from_lookup(|_| None);
        assert_eq!(cfg, CoordinatorConfig::default());
        assert_eq!(cfg.session_timeout(), Duration::from_secs(3600));
        assert_eq!(cfg.credential_cache_ttl(), Duration::from_secs(300));
        assert_eq!(cfg.cleanup_interval(), Duration::from_secs(300));
        assert_eq!(cfg.negative_cache_ttl(), Duration::ZERO);
        assert!(cfg.zitadel.is_none());
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn overrides_and_bad_numbers() {
        let cfg = CoordinatorConfig::from_lookup(lookup_from(&[
            ("TACPLANE_SESSION_TIMEOUT", "120"),
            ("TACPLANE_TOKEN_CACHE_TIMEOUT", "soon"),
            ("TACPLANE_CLEANUP_INTERVAL", "0"),
            ("TACPLANE_PERSISTENCE_ATTEMPTS", "99"),
            ("TACPLANE_ZITADEL_URL", "https://idp.example.net/"),
            ("TACPLANE_ZITADEL_CLIENT_ID", "tacacs"),
            ("TACPLANE_DATABASE_URL", ""),
        ]));
        assert_eq!(cfg.session_timeout_secs, 120);
        assert_eq!(cfg.credential_cache_ttl_secs, 300);
        assert_eq!(cfg.cleanup_interval(), Duration::from_secs(1));
        assert_eq!(cfg.persistence_attempts, 10);
        let z = cfg.zitadel.expect("zitadel configured");
        assert_eq!(z.url, "https://idp.example.net");
        assert_eq!(z.client_id, "tacacs");
        assert_eq!(z.client_secret, "");
        assert!(cfg.database_url.is_none());
    }
}
