//! Error model for the AAA core and its mapping onto protocol reply fields.
//! Nothing here is fatal to the process: every variant ends as a reply at the router.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{RequestKind, ReplyStatus};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AaaError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("authentication failed for {principal}: {reason}")]
    AuthenticationFailed { principal: String, reason: String },
    #[error("no active session for {0}")]
    NoActiveSession(String),
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
    #[error("identity provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("identity provider did not answer within {0:?}")]
    ProviderTimeout(Duration),
}

pub type AaaResult<T> = Result<T, AaaError>;

impl AaaError {
    pub fn auth_failed<P: Into<String>, R: Into<String>>(principal: P, reason: R) -> Self {
        AaaError::AuthenticationFailed { principal: principal.into(), reason: reason.into() }
    }

    pub fn code_str(&self) -> &'static str {
        match self {
            AaaError::MalformedRequest(_) => "malformed_request",
            AaaError::AuthenticationFailed { .. } => "authentication_failed",
            AaaError::NoActiveSession(_) => "no_active_session",
            AaaError::PersistenceUnavailable(_) => "persistence_unavailable",
            AaaError::ProviderUnavailable(_) => "provider_unavailable",
            AaaError::ProviderTimeout(_) => "provider_timeout",
        }
    }

    /// Provider outages are answered like a bad password but logged apart from it.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            AaaError::AuthenticationFailed { .. } | AaaError::ProviderUnavailable(_) | AaaError::ProviderTimeout(_)
        )
    }

    /// Reply mapping: (status, server message) for a request of `kind`.
    pub fn reply_fields(&self, kind: RequestKind) -> (ReplyStatus, &'static str) {
        match (self, kind) {
            (AaaError::MalformedRequest(_), RequestKind::Authenticate) => (ReplyStatus::Error, "Invalid authentication request"),
            (AaaError::MalformedRequest(_), RequestKind::Authorize) => (ReplyStatus::Error, "Invalid authorization request"),
            (AaaError::MalformedRequest(_), _) => (ReplyStatus::Error, "Invalid accounting request"),
            (e, RequestKind::Authenticate) if e.is_authentication_failure() => (ReplyStatus::Fail, "Authentication failed"),
            (e, RequestKind::Authorize) if e.is_authentication_failure() => (ReplyStatus::Fail, "Authorization denied"),
            (AaaError::NoActiveSession(_), RequestKind::Authorize) => (ReplyStatus::Fail, "No active session"),
            (AaaError::NoActiveSession(_), RequestKind::Authenticate) => (ReplyStatus::Fail, "Authentication failed"),
            // Audit writes never decide a reply; accounting always acknowledges.
            (_, RequestKind::Accounting) | (_, RequestKind::Unknown(_)) => (ReplyStatus::Success, "Accounting recorded"),
            (AaaError::PersistenceUnavailable(_), RequestKind::Authenticate) => (ReplyStatus::Error, "Authentication error"),
            (AaaError::PersistenceUnavailable(_), RequestKind::Authorize) => (ReplyStatus::Error, "Authorization error"),
            // Covered by the guards above; kept so the match stays total.
            (_, RequestKind::Authenticate) => (ReplyStatus::Fail, "Authentication failed"),
            (_, RequestKind::Authorize) => (ReplyStatus::Fail, "Authorization denied"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_side_errors_count_as_authentication_failures() {
        assert!(AaaError::auth_failed("alice", "bad password").is_authentication_failure());
        assert!(AaaError::ProviderUnavailable("503".into()).is_authentication_failure());
        assert!(AaaError::ProviderTimeout(Duration::from_secs(30)).is_authentication_failure());
        assert!(!AaaError::NoActiveSession("carol".into()).is_authentication_failure());
        assert!(!AaaError::PersistenceUnavailable("db down".into()).is_authentication_failure());
    }

    #[test]
    fn reply_fields_mapping() {
        let (st, msg) = AaaError::MalformedRequest("short body".into()).reply_fields(RequestKind::Authenticate);
        assert_eq!(st, ReplyStatus::Error);
        assert_eq!(msg, "Invalid authentication request");

        let (st, _) = AaaError::MalformedRequest("x".into()).reply_fields(RequestKind::Accounting);
        assert_eq!(st, ReplyStatus::Error);

        let (st, msg) = AaaError::ProviderTimeout(Duration::from_secs(1)).reply_fields(RequestKind::Authenticate);
        assert_eq!(st, ReplyStatus::Fail);
        assert_eq!(msg, "Authentication failed");

        let (st, msg) = AaaError::NoActiveSession("carol".into()).reply_fields(RequestKind::Authorize);
        assert_eq!(st, ReplyStatus::Fail);
        assert_eq!(msg, "No active session");
    }

    #[test]
    fn codes_are_distinct() {
        let errors = vec![
            AaaError::MalformedRequest("m".into()),
            AaaError::auth_failed("p", "r"),
            AaaError::NoActiveSession("p".into()),
            AaaError::PersistenceUnavailable("d".into()),
            AaaError::ProviderUnavailable("u".into()),
            AaaError::ProviderTimeout(Duration::from_millis(5)),
        ];
        let mut codes: Vec<&str> = errors.iter().map(|e| e.code_str()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        for e in errors {
            assert!(!e.to_string().is_empty());
        }
    }
}
