//! Identity: provider capability, credential cache, privilege policy and live sessions.
//! Keep the public surface thin and split implementation across sub-modules.

mod provider;
mod session;
pub mod cache;
pub mod policy;
pub mod zitadel;

pub use provider::{IdentityProvider, StaticIdentityProvider, UserInfo};
pub use session::{gen_token, CommandRecord, Session, SessionRegistry};
pub use cache::{CacheStats, CachedCredential, CredentialCache};
pub use policy::{is_authorized, privilege_of, PrivilegeLevel};
pub use zitadel::ZitadelProvider;
