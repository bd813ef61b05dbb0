//! Request dispatch: one decoded request in, at most one reply out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::accounting::AccountingRecorder;
use crate::error::AaaError;
use crate::identity::{privilege_of, CredentialCache, SessionRegistry};
use crate::protocol::{
    command_from_args, AccountingFlag, DecodedRequest, Inbound, Reply, ReplySink, ReplyStatus, RequestKind,
};

const UNKNOWN_CLIENT: &str = "unknown";

static REQ_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct RequestRouter {
    cache: Arc<CredentialCache>,
    registry: Arc<SessionRegistry>,
    recorder: AccountingRecorder,
}

impl RequestRouter {
    pub fn new(cache: Arc<CredentialCache>, registry: Arc<SessionRegistry>, recorder: AccountingRecorder) -> Self {
        Self { cache, registry, recorder }
    }

    /// Handle one request and push its reply (if any) into `sink`.
    pub async fn dispatch<S: ReplySink + ?Sized>(&self, inbound: Inbound, sink: &mut S) {
        if let Some(reply) = self.handle(inbound).await {
            sink.reply(reply);
        }
    }

    /// Reply for one request; `None` for packet types this router does not know.
    pub async fn handle(&self, inbound: Inbound) -> Option<Reply> {
        let req_id = REQ_SEQ.fetch_add(1, Ordering::Relaxed);
        let req = match inbound {
            Inbound::Malformed { kind, reason } => {
                if let RequestKind::Unknown(t) = kind {
                    error!(target: "tacplane::router", req_id, "unknown packet type {} (undecodable: {})", t, reason);
                    return None;
                }
                let err = AaaError::MalformedRequest(reason);
                warn!(target: "tacplane::router", req_id, kind = kind.as_str(), "{}", err);
                let (status, msg) = err.reply_fields(kind);
                return Some(Reply::new(kind, status, msg));
            }
            Inbound::Decoded(req) => req,
        };
        debug!(target: "tacplane::router", req_id, kind = req.kind.as_str(), user = %req.principal, "request");
        match req.kind {
            RequestKind::Authenticate => Some(self.authenticate(req_id, req).await),
            RequestKind::Authorize => Some(self.authorize(req_id, req)),
            RequestKind::Accounting => Some(self.accounting(req_id, req)),
            RequestKind::Unknown(t) => {
                error!(target: "tacplane::router", req_id, "unknown packet type {}", t);
                None
            }
        }
    }

    async fn authenticate(&self, req_id: u64, req: DecodedRequest) -> Reply {
        let kind = RequestKind::Authenticate;
        match self.cache.resolve(&req.principal, &req.data).await {
            Ok(roles) => {
                let client = req.client_address.as_deref().unwrap_or(UNKNOWN_CLIENT);
                let level = privilege_of(&roles);
                let session = self.registry.create(&req.principal, client, roles);
                info!(
                    target: "tacplane::router",
                    req_id,
                    user = %req.principal,
                    sid = %session.id,
                    privilege = level.as_u8(),
                    "authentication successful"
                );
                Reply::new(kind, ReplyStatus::Pass, "Authentication successful")
            }
            Err(e) => {
                match &e {
                    AaaError::ProviderUnavailable(_) | AaaError::ProviderTimeout(_) => {
                        warn!(target: "tacplane::router", req_id, user = %req.principal, code = e.code_str(), "authentication failed: {}", e)
                    }
                    _ => info!(target: "tacplane::router", req_id, user = %req.principal, "authentication failed: {}", e),
                }
                let (status, msg) = e.reply_fields(kind);
                Reply::new(kind, status, msg)
            }
        }
    }

    fn authorize(&self, req_id: u64, req: DecodedRequest) -> Reply {
        let kind = RequestKind::Authorize;
        let command = command_from_args(&req.args);
        let Some((sid, allowed)) = self.registry.authorize(&req.principal, &command) else {
            let err = AaaError::NoActiveSession(req.principal.clone());
            info!(target: "tacplane::router", req_id, command = %command, "{}", err);
            let (status, msg) = err.reply_fields(kind);
            return Reply::new(kind, status, msg);
        };
        info!(
            target: "tacplane::router",
            req_id,
            user = %req.principal,
            sid = %sid,
            command = %command,
            allowed,
            "authorization decision"
        );
        if allowed {
            Reply::new(kind, ReplyStatus::PassAdd, "Authorization granted")
        } else {
            Reply::new(kind, ReplyStatus::Fail, "Authorization denied")
        }
    }

    fn accounting(&self, req_id: u64, req: DecodedRequest) -> Reply {
        let flags = req.accounting_flags;
        if flags.has(AccountingFlag::Start) {
            info!(target: "tacplane::router", req_id, user = %req.principal, "accounting start");
        } else if flags.has(AccountingFlag::Stop) {
            match self.registry.deactivate(&req.principal) {
                Some(sid) => {
                    self.recorder.record_stop(&sid);
                    info!(target: "tacplane::router", req_id, user = %req.principal, sid = %sid, "accounting stop");
                }
                None => debug!(target: "tacplane::router", req_id, user = %req.principal, "accounting stop without active session"),
            }
        } else if flags.has(AccountingFlag::Watchdog) {
            self.recorder.record_watchdog(&req.principal);
        } else {
            debug!(target: "tacplane::router", req_id, flags = flags.bits(), "accounting request without start/stop/watchdog flag");
        }
        Reply::new(RequestKind::Accounting, ReplyStatus::Success, "Accounting recorded")
    }
}
