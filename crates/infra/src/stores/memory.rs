//! In-memory stores for tests/dev.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use openlabs_auth::{Requester, can_access};
use openlabs_core::{BlueprintId, RangeId, UserId};
use openlabs_ranges::{BlueprintRange, DeployedRange};

use crate::provisioning::{MasterKey, ProviderSecrets};

use super::{BlueprintStore, CredentialStore, RangeStore, StoreError};

#[derive(Debug, Default)]
pub struct InMemoryBlueprintStore {
    blueprints: RwLock<HashMap<BlueprintId, BlueprintRange>>,
}

impl InMemoryBlueprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, blueprint: BlueprintRange) {
        self.blueprints.write().await.insert(blueprint.id, blueprint);
    }
}

#[async_trait]
impl BlueprintStore for InMemoryBlueprintStore {
    async fn get_blueprint(
        &self,
        id: BlueprintId,
        requester: &Requester,
    ) -> Result<Option<BlueprintRange>, StoreError> {
        Ok(self
            .blueprints
            .read()
            .await
            .get(&id)
            .filter(|bp| can_access(requester, bp.owner))
            .cloned())
    }
}

/// Secrets sealed under a master key; the wrong key fails like a real decrypt.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    secrets: RwLock<HashMap<UserId, (MasterKey, ProviderSecrets)>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: UserId, master_key: MasterKey, secrets: ProviderSecrets) {
        self.secrets.write().await.insert(user, (master_key, secrets));
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get_decrypted_secrets(
        &self,
        user: UserId,
        master_key: &MasterKey,
    ) -> Result<Option<ProviderSecrets>, StoreError> {
        match self.secrets.read().await.get(&user) {
            None => Ok(None),
            Some((key, secrets)) if key == master_key => Ok(Some(secrets.clone())),
            Some(_) => Err(StoreError::Decryption("wrong key or corrupt data".to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRangeStore {
    ranges: RwLock<HashMap<RangeId, DeployedRange>>,
}

impl InMemoryRangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.ranges.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ranges.read().await.is_empty()
    }

    /// Every stored range, regardless of owner.
    pub async fn all(&self) -> Vec<DeployedRange> {
        self.ranges.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl RangeStore for InMemoryRangeStore {
    async fn create(&self, range: &DeployedRange) -> Result<(), StoreError> {
        let mut ranges = self.ranges.write().await;
        if ranges.contains_key(&range.id) {
            return Err(StoreError::Conflict(range.id.to_string()));
        }
        ranges.insert(range.id, range.clone());
        Ok(())
    }

    async fn get(
        &self,
        id: RangeId,
        requester: &Requester,
    ) -> Result<Option<DeployedRange>, StoreError> {
        Ok(self
            .ranges
            .read()
            .await
            .get(&id)
            .filter(|range| can_access(requester, range.owner))
            .cloned())
    }

    async fn delete(&self, id: RangeId) -> Result<bool, StoreError> {
        Ok(self.ranges.write().await.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::{AwsSecrets, Secret};

    #[tokio::test]
    async fn wrong_master_key_fails_to_decrypt() {
        let store = InMemoryCredentialStore::new();
        let user = UserId::new();
        let secrets = ProviderSecrets {
            aws: Some(AwsSecrets {
                access_key: Secret::new("a"),
                secret_key: Secret::new("b"),
            }),
            azure: None,
        };
        store.insert(user, MasterKey::new("right"), secrets.clone()).await;

        assert_eq!(
            store.get_decrypted_secrets(user, &MasterKey::new("right")).await.unwrap(),
            Some(secrets)
        );
        assert!(matches!(
            store.get_decrypted_secrets(user, &MasterKey::new("wrong")).await,
            Err(StoreError::Decryption(_))
        ));
        assert!(store
            .get_decrypted_secrets(UserId::new(), &MasterKey::new("right"))
            .await
            .unwrap()
            .is_none());
    }
}
