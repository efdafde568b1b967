use thiserror::Error;

use openlabs_core::{DomainError, UserId};

use crate::Requester;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    /// Deliberately carries no detail: "not yours" and "does not exist" must be
    /// indistinguishable to the caller.
    #[error("not found")]
    Hidden,
}

impl From<AuthzError> for DomainError {
    fn from(_: AuthzError) -> Self {
        DomainError::NotFound
    }
}

/// Whether `requester` may see a resource owned by `owner`.
///
/// - No IO
/// - No panics
pub fn can_access(requester: &Requester, owner: UserId) -> bool {
    requester.privileged || requester.user_id == owner
}

/// Fallible form of [`can_access`] for `?` chains.
pub fn authorize_owner(requester: &Requester, owner: UserId) -> Result<(), AuthzError> {
    if can_access(requester, owner) {
        Ok(())
    } else {
        Err(AuthzError::Hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_can_access() {
        let owner = UserId::new();
        assert!(can_access(&Requester::user(owner), owner));
    }

    #[test]
    fn stranger_is_hidden() {
        let owner = UserId::new();
        let stranger = Requester::user(UserId::new());
        assert_eq!(authorize_owner(&stranger, owner), Err(AuthzError::Hidden));
        assert_eq!(DomainError::from(AuthzError::Hidden), DomainError::NotFound);
    }

    #[test]
    fn privileged_sees_everything() {
        let admin = Requester::admin(UserId::new());
        assert!(can_access(&admin, UserId::new()));
    }
}
