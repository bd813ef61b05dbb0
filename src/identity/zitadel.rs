//! Zitadel (OIDC) identity provider.
//! Resource-owner password grant, then userinfo. Roles are read from the access token's
//! payload when present; the token signature is not verified here because the token was
//! just issued to us over the provider's own TLS endpoint.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::provider::{IdentityProvider, UserInfo};
use crate::config::ZitadelConfig;
use crate::error::{AaaError, AaaResult};

const PROJECT_ROLES_CLAIM: &str = "urn:zitadel:iam:org:project:roles";
const SCOPE: &str = "openid profile email urn:zitadel:iam:org:project:id:zitadel:aud";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct ZitadelUserInfo {
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default, rename = "urn:zitadel:iam:org:project:roles")]
    roles: Option<JsonValue>,
    #[serde(default)]
    groups: Vec<String>,
}

pub struct ZitadelProvider {
    client: reqwest::Client,
    cfg: ZitadelConfig,
}

impl ZitadelProvider {
    pub fn new(cfg: ZitadelConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, cfg })
    }

    async fn password_grant(&self, principal: &str, secret: &str) -> AaaResult<TokenResponse> {
        let url = format!("{}/oauth/v2/token", self.cfg.url);
        let scope = match &self.cfg.project_id {
            Some(id) => format!("{} urn:zitadel:iam:org:project:id:{}:aud", SCOPE, id),
            None => SCOPE.to_string(),
        };
        let form = [
            ("grant_type", "password"),
            ("client_id", self.cfg.client_id.as_str()),
            ("client_secret", self.cfg.client_secret.as_str()),
            ("username", principal),
            ("password", secret),
            ("scope", scope.as_str()),
        ];
        let resp = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AaaError::ProviderUnavailable(format!("token request: {}", e)))?;
        let status = resp.status();
        if status.is_client_error() {
            return Err(AaaError::auth_failed(principal, format!("token endpoint answered {}", status)));
        }
        if status != StatusCode::OK {
            return Err(AaaError::ProviderUnavailable(format!("token endpoint answered {}", status)));
        }
        resp.json::<TokenResponse>()
            .await
            .map_err(|e| AaaError::ProviderUnavailable(format!("token response: {}", e)))
    }

    async fn user_info(&self, access_token: &str) -> AaaResult<ZitadelUserInfo> {
        let url = format!("{}/oidc/v1/userinfo", self.cfg.url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AaaError::ProviderUnavailable(format!("userinfo request: {}", e)))?;
        if resp.status() != StatusCode::OK {
            return Err(AaaError::ProviderUnavailable(format!("userinfo answered {}", resp.status())));
        }
        resp.json::<ZitadelUserInfo>()
            .await
            .map_err(|e| AaaError::ProviderUnavailable(format!("userinfo response: {}", e)))
    }
}

#[async_trait]
impl IdentityProvider for ZitadelProvider {
    async fn authenticate(&self, principal: &str, secret: &str) -> AaaResult<UserInfo> {
        let token = self.password_grant(principal, secret).await?;
        let info = self.user_info(&token.access_token).await?;

        let mut roles = roles_from_access_token(&token.access_token);
        if roles.is_empty() {
            roles = info.roles.as_ref().map(roles_from_claim).unwrap_or_default();
        }
        debug!(target: "tacplane::zitadel", "user={} roles={:?} groups={:?}", principal, roles, info.groups);
        Ok(UserInfo {
            username: info.preferred_username.unwrap_or_else(|| principal.to_string()),
            roles,
            groups: info.groups,
        })
    }

    fn name(&self) -> &'static str { "zitadel" }
}

/// Role names from either claim shape: an object keyed by role (Zitadel project roles)
/// or a plain array of strings.
fn roles_from_claim(claim: &JsonValue) -> Vec<String> {
    match claim {
        JsonValue::Object(map) => map.keys().cloned().collect(),
        JsonValue::Array(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    }
}

/// Roles carried in a JWT access token: project-role keys first, then a `roles` array.
/// Opaque (non-JWT) tokens yield no roles.
pub(crate) fn roles_from_access_token(token: &str) -> Vec<String> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_sig)) = (parts.next(), parts.next(), parts.next()) else {
        return Vec::new();
    };
    let bytes = match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
        Ok(b) => b,
        Err(e) => {
            warn!(target: "tacplane::zitadel", "failed to decode access token payload: {}", e);
            return Vec::new();
        }
    };
    let claims: JsonValue = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => {
            warn!(target: "tacplane::zitadel", "failed to parse access token claims: {}", e);
            return Vec::new();
        }
    };
    let mut roles = Vec::new();
    if let Some(c) = claims.get(PROJECT_ROLES_CLAIM).filter(|v| v.is_object()) {
        roles.extend(roles_from_claim(c));
    }
    if let Some(c) = claims.get("roles").filter(|v| v.is_array()) {
        roles.extend(roles_from_claim(c));
    }
    roles
}
