use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{AaaError, AaaResult};
use crate::tprintln;

/// What an identity provider knows about a principal after a successful login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
    /// Provider order, duplicates kept.
    pub roles: Vec<String>,
    pub groups: Vec<String>,
}

/// External identity capability. Implementations may be slow or unavailable; callers
/// bound every call with a timeout.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, principal: &str, secret: &str) -> AaaResult<UserInfo>;

    fn name(&self) -> &'static str { "identity" }
}

#[derive(Debug, Clone)]
struct StaticUser {
    secret: String,
    roles: Vec<String>,
    groups: Vec<String>,
}

/// In-memory provider for local runs and tests.
/// Counts every authentication call and can simulate a slow or unreachable backend.
#[derive(Default)]
pub struct StaticIdentityProvider {
    users: RwLock<HashMap<String, StaticUser>>,
    delay: RwLock<Option<Duration>>,
    unavailable: RwLock<bool>,
    calls: AtomicUsize,
}

impl StaticIdentityProvider {
    pub fn new() -> Self { Self::default() }

    pub fn with_user(self, principal: &str, secret: &str, roles: &[&str]) -> Self {
        self.add_user(principal, secret, roles, &[]);
        self
    }

    pub fn add_user(&self, principal: &str, secret: &str, roles: &[&str], groups: &[&str]) {
        let user = StaticUser {
            secret: secret.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        };
        self.users.write().insert(principal.to_string(), user);
    }

    /// Replace the roles a principal will receive on its next provider call.
    pub fn set_roles(&self, principal: &str, roles: &[&str]) {
        if let Some(u) = self.users.write().get_mut(principal) {
            u.roles = roles.iter().map(|r| r.to_string()).collect();
        }
    }

    pub fn set_delay(&self, delay: Option<Duration>) { *self.delay.write() = delay; }
    pub fn set_unavailable(&self, down: bool) { *self.unavailable.write() = down; }
    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn authenticate(&self, principal: &str, secret: &str) -> AaaResult<UserInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.read();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if *self.unavailable.read() {
            return Err(AaaError::ProviderUnavailable("static provider marked unavailable".into()));
        }
        let user = self.users.read().get(principal).cloned();
        match user {
            Some(u) if u.secret == secret => {
                tprintln!("static_provider.authenticate user={} roles={:?}", principal, u.roles);
                Ok(UserInfo { username: principal.to_string(), roles: u.roles, groups: u.groups })
            }
            Some(_) => Err(AaaError::auth_failed(principal, "invalid credentials")),
            None => Err(AaaError::auth_failed(principal, "unknown user")),
        }
    }

    fn name(&self) -> &'static str { "static" }
}
