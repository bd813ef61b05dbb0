//! Privilege derivation and command authorization.
//! Pure functions: no I/O, no shared state.

use serde::{Deserialize, Serialize};

/// Ordinal authorization tier, wire-compatible with TACACS+ `priv-lvl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PrivilegeLevel {
    ReadOnly,
    Standard,
    Administrative,
}

impl PrivilegeLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            PrivilegeLevel::ReadOnly => 0,
            PrivilegeLevel::Standard => 1,
            PrivilegeLevel::Administrative => 15,
        }
    }
}

const ADMIN_ROLES: &[&str] = &["network-admin", "admin", "zitadel.admin"];
const STANDARD_ROLES: &[&str] = &["network-user", "user", "zitadel.user"];
const READ_ONLY_ROLES: &[&str] = &["network-readonly", "readonly", "viewer"];

/// Command prefixes permitted at the read-only tier.
pub const READ_ONLY_COMMANDS: &[&str] = &["show", "ping", "traceroute", "telnet", "ssh"];

fn tier_of(role: &str) -> Option<PrivilegeLevel> {
    let r = role.to_ascii_lowercase();
    if ADMIN_ROLES.contains(&r.as_str()) {
        Some(PrivilegeLevel::Administrative)
    } else if STANDARD_ROLES.contains(&r.as_str()) {
        Some(PrivilegeLevel::Standard)
    } else if READ_ONLY_ROLES.contains(&r.as_str()) {
        Some(PrivilegeLevel::ReadOnly)
    } else {
        None
    }
}

/// First recognised role wins, in provider order. Unrecognised role sets fall back to
/// read-only rather than deny.
pub fn privilege_of<S: AsRef<str>>(roles: &[S]) -> PrivilegeLevel {
    roles
        .iter()
        .find_map(|r| tier_of(r.as_ref()))
        .unwrap_or(PrivilegeLevel::ReadOnly)
}

/// Standard and administrative tiers may run anything; read-only is limited to
/// `READ_ONLY_COMMANDS` prefixes, compared case-insensitively.
pub fn is_privilege_authorized(level: PrivilegeLevel, command: &str) -> bool {
    if level >= PrivilegeLevel::Standard {
        return true;
    }
    let cmd = command.to_ascii_lowercase();
    READ_ONLY_COMMANDS.iter().any(|prefix| cmd.starts_with(prefix))
}

pub fn is_authorized<S: AsRef<str>>(roles: &[S], command: &str) -> bool {
    is_privilege_authorized(privilege_of(roles), command)
}
