use serde::{Deserialize, Serialize};

use openlabs_core::UserId;

/// The identity a request or job acts on behalf of.
///
/// `privileged` is set for administrators; they see every user's jobs and
/// ranges. Everyone else sees only what they own.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub user_id: UserId,
    pub privileged: bool,
}

impl Requester {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            privileged: false,
        }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            privileged: true,
        }
    }
}
