//! `openlabs-auth`: ownership-based access decisions.
//!
//! Decoupled from HTTP, sessions and storage: callers resolve who is asking
//! and this crate answers whether they may see an owned resource.

pub mod authorize;
pub mod requester;

pub use authorize::{AuthzError, authorize_owner, can_access};
pub use requester::Requester;
