//! Collaborator stores: blueprints, user credentials and deployed ranges.
//!
//! Every lookup that takes a [`Requester`] returns `None` for resources the
//! requester may not see, exactly as for resources that do not exist.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use openlabs_auth::Requester;
use openlabs_core::{BlueprintId, RangeId, UserId};
use openlabs_ranges::{BlueprintRange, DeployedRange};

use crate::provisioning::{MasterKey, ProviderSecrets};

pub use memory::{InMemoryBlueprintStore, InMemoryCredentialStore, InMemoryRangeStore};
pub use postgres::{PostgresBlueprintStore, PostgresCredentialStore, PostgresRangeStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record already exists: {0}")]
    Conflict(String),

    /// Wrong master key or corrupt ciphertext.
    #[error("failed to decrypt secrets: {0}")]
    Decryption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait BlueprintStore: Send + Sync {
    async fn get_blueprint(
        &self,
        id: BlueprintId,
        requester: &Requester,
    ) -> Result<Option<BlueprintRange>, StoreError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `None` when the user never stored credentials.
    async fn get_decrypted_secrets(
        &self,
        user: UserId,
        master_key: &MasterKey,
    ) -> Result<Option<ProviderSecrets>, StoreError>;
}

#[async_trait]
pub trait RangeStore: Send + Sync {
    /// Persist a fully populated range. Fails if the id is taken.
    async fn create(&self, range: &DeployedRange) -> Result<(), StoreError>;

    async fn get(
        &self,
        id: RangeId,
        requester: &Requester,
    ) -> Result<Option<DeployedRange>, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: RangeId) -> Result<bool, StoreError>;
}
