//! Boundary types exchanged with the TACACS+ codec.
//! The codec owns framing, header parsing and body obfuscation; the core only sees the
//! decoded request fields below and hands back a `Reply` per request kind.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Authenticate,
    Authorize,
    Accounting,
    /// Header type the codec could not map; routed as a no-op.
    Unknown(u8),
}

impl RequestKind {
    /// Map the TACACS+ header packet type byte.
    pub fn from_packet_type(t: u8) -> Self {
        match t {
            0x01 => RequestKind::Authenticate,
            0x02 => RequestKind::Authorize,
            0x03 => RequestKind::Accounting,
            other => RequestKind::Unknown(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Authenticate => "authenticate",
            RequestKind::Authorize => "authorize",
            RequestKind::Accounting => "accounting",
            RequestKind::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountingFlag {
    Start,
    Stop,
    Watchdog,
}

impl AccountingFlag {
    fn bit(self) -> u8 {
        match self {
            AccountingFlag::Start => 0x02,
            AccountingFlag::Stop => 0x04,
            AccountingFlag::Watchdog => 0x08,
        }
    }
}

/// Accounting flag set, bit-compatible with the TACACS+ `flags` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountingFlags {
    bits: u8,
}

impl AccountingFlags {
    pub fn empty() -> Self { Self { bits: 0 } }
    pub fn from_bits(bits: u8) -> Self { Self { bits } }
    pub fn bits(&self) -> u8 { self.bits }
    pub fn with(mut self, flag: AccountingFlag) -> Self {
        self.bits |= flag.bit();
        self
    }
    pub fn has(&self, flag: AccountingFlag) -> bool { self.bits & flag.bit() != 0 }
}

impl From<AccountingFlag> for AccountingFlags {
    fn from(flag: AccountingFlag) -> Self { AccountingFlags::empty().with(flag) }
}

/// A request body after the codec has decoded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub kind: RequestKind,
    pub principal: String,
    /// Secret for authentication starts, free-form data otherwise.
    pub data: String,
    pub args: Vec<String>,
    pub accounting_flags: AccountingFlags,
    /// Peer IP (no port) as seen by the transport, if the codec knows it. Set it with
    /// `with_peer` from the accepted socket address.
    pub client_address: Option<String>,
}

impl DecodedRequest {
    pub fn authenticate(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Authenticate,
            principal: principal.into(),
            data: secret.into(),
            args: Vec::new(),
            accounting_flags: AccountingFlags::empty(),
            client_address: None,
        }
    }

    pub fn authorize(principal: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: RequestKind::Authorize,
            principal: principal.into(),
            data: String::new(),
            args,
            accounting_flags: AccountingFlags::empty(),
            client_address: None,
        }
    }

    pub fn accounting(principal: impl Into<String>, flags: impl Into<AccountingFlags>) -> Self {
        Self {
            kind: RequestKind::Accounting,
            principal: principal.into(),
            data: String::new(),
            args: Vec::new(),
            accounting_flags: flags.into(),
            client_address: None,
        }
    }

    pub fn with_client_address(mut self, addr: impl Into<String>) -> Self {
        self.client_address = Some(addr.into());
        self
    }

    /// Attach the transport peer; only the IP is kept, the source port is dropped.
    pub fn with_peer(self, peer: &SocketAddr) -> Self { self.with_client_address(client_ip(peer)) }
}

/// What the codec hands up: either a decoded body or the reason it could not decode one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Decoded(DecodedRequest),
    Malformed { kind: RequestKind, reason: String },
}

impl From<DecodedRequest> for Inbound {
    fn from(req: DecodedRequest) -> Self { Inbound::Decoded(req) }
}

/// Reply status. Valid per kind: Pass/Fail/Error for authentication,
/// PassAdd/Fail/Error for authorization, Success/Error for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Pass,
    PassAdd,
    Fail,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub kind: RequestKind,
    pub status: ReplyStatus,
    pub message: String,
}

impl Reply {
    pub fn new(kind: RequestKind, status: ReplyStatus, message: impl Into<String>) -> Self {
        Self { kind, status, message: message.into() }
    }
}

/// Outbound half of the codec.
pub trait ReplySink {
    fn reply(&mut self, reply: Reply);
}

impl ReplySink for Vec<Reply> {
    fn reply(&mut self, reply: Reply) { self.push(reply); }
}

/// Peer IP without the port.
fn client_ip(addr: &SocketAddr) -> String { addr.ip().to_string() }

/// Command line carried by an authorization request.
///
/// Devices normally send attribute-value pairs (`service=shell`, `cmd=show`,
/// `cmd-arg=version`); those are joined back into `show version`. A request without
/// `cmd=` uses its first raw argument as the command.
pub fn command_from_args(args: &[String]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let mut saw_cmd = false;
    for arg in args {
        if let Some(v) = arg.strip_prefix("cmd=").or_else(|| arg.strip_prefix("cmd*")) {
            saw_cmd = true;
            if !v.is_empty() { parts.insert(0, v); }
        } else if let Some(v) = arg.strip_prefix("cmd-arg=").or_else(|| arg.strip_prefix("cmd-arg*")) {
            if !v.is_empty() && v != "<cr>" { parts.push(v); }
        }
    }
    if saw_cmd && !parts.is_empty() {
        return parts.join(" ");
    }
    match args.first() {
        Some(first) if !first.trim().is_empty() => first.clone(),
        _ => "unknown".to_string(),
    }
}
