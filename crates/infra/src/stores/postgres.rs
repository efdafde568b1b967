//! Postgres-backed stores.
//!
//! Blueprints and deployed ranges are stored as JSONB documents next to the
//! columns used for lookups. User secrets are a pgcrypto-encrypted blob that is
//! only ever decrypted inside the query, with the caller's master key.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use openlabs_auth::{Requester, can_access};
use openlabs_core::{BlueprintId, RangeId, UserId};
use openlabs_ranges::{BlueprintRange, DeployedRange};

use crate::provisioning::{MasterKey, ProviderSecrets};

use super::{BlueprintStore, CredentialStore, RangeStore, StoreError};

#[derive(Debug, Clone)]
pub struct PostgresBlueprintStore {
    pool: Arc<PgPool>,
}

impl PostgresBlueprintStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Insert or replace a blueprint document.
    #[instrument(skip(self, blueprint), fields(blueprint_id = %blueprint.id), err)]
    pub async fn put(&self, blueprint: &BlueprintRange) -> Result<(), StoreError> {
        let document = serde_json::to_value(blueprint)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO blueprints (id, owner_id, document)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET owner_id = EXCLUDED.owner_id, document = EXCLUDED.document
            "#,
        )
        .bind(blueprint.id.as_uuid())
        .bind(blueprint.owner.as_uuid())
        .bind(document)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put_blueprint", e))?;
        Ok(())
    }
}

#[async_trait]
impl BlueprintStore for PostgresBlueprintStore {
    #[instrument(skip(self, requester), fields(blueprint_id = %id), err)]
    async fn get_blueprint(
        &self,
        id: BlueprintId,
        requester: &Requester,
    ) -> Result<Option<BlueprintRange>, StoreError> {
        let row = sqlx::query("SELECT document FROM blueprints WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_blueprint", e))?;
        let Some(row) = row else {
            return Ok(None);
        };

        let document: serde_json::Value = row
            .try_get("document")
            .map_err(|e| map_sqlx_error("get_blueprint", e))?;
        let blueprint: BlueprintRange = serde_json::from_value(document)
            .map_err(|e| StoreError::Serialization(format!("blueprint {id}: {e}")))?;
        Ok(can_access(requester, blueprint.owner).then_some(blueprint))
    }
}

#[derive(Debug, Clone)]
pub struct PostgresCredentialStore {
    pool: Arc<PgPool>,
}

impl PostgresCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Encrypt and store a user's secrets, replacing any previous value.
    #[instrument(skip(self, master_key, secrets), fields(user_id = %user), err)]
    pub async fn put_secrets(
        &self,
        user: UserId,
        master_key: &MasterKey,
        secrets: &ProviderSecrets,
    ) -> Result<(), StoreError> {
        let plaintext = serde_json::to_string(secrets)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO user_secrets (user_id, encrypted_secrets)
            VALUES ($1, pgp_sym_encrypt($2, $3))
            ON CONFLICT (user_id) DO UPDATE SET encrypted_secrets = EXCLUDED.encrypted_secrets
            "#,
        )
        .bind(user.as_uuid())
        .bind(plaintext)
        .bind(master_key.expose())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put_secrets", e))?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for PostgresCredentialStore {
    #[instrument(skip(self, master_key), fields(user_id = %user), err)]
    async fn get_decrypted_secrets(
        &self,
        user: UserId,
        master_key: &MasterKey,
    ) -> Result<Option<ProviderSecrets>, StoreError> {
        let row = sqlx::query(
            "SELECT pgp_sym_decrypt(encrypted_secrets, $2) AS secrets FROM user_secrets WHERE user_id = $1",
        )
        .bind(user.as_uuid())
        .bind(master_key.expose())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| match e {
            // pgcrypto raises 39000 on a wrong key or corrupt data.
            sqlx::Error::Database(db) if db.code().as_deref() == Some("39000") => {
                StoreError::Decryption(db.message().to_string())
            }
            other => map_sqlx_error("get_decrypted_secrets", other),
        })?;
        let Some(row) = row else {
            return Ok(None);
        };

        let plaintext: String = row
            .try_get("secrets")
            .map_err(|e| map_sqlx_error("get_decrypted_secrets", e))?;
        let secrets = serde_json::from_str(&plaintext)
            .map_err(|e| StoreError::Serialization(format!("secrets for {user}: {e}")))?;
        Ok(Some(secrets))
    }
}

#[derive(Debug, Clone)]
pub struct PostgresRangeStore {
    pool: Arc<PgPool>,
}

impl PostgresRangeStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl RangeStore for PostgresRangeStore {
    #[instrument(skip(self, range), fields(range_id = %range.id, owner = %range.owner), err)]
    async fn create(&self, range: &DeployedRange) -> Result<(), StoreError> {
        let document =
            serde_json::to_value(range).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO deployed_ranges (id, owner_id, name, provider, region, state, created_at, document)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(range.id.as_uuid())
        .bind(range.owner.as_uuid())
        .bind(&range.name)
        .bind(range.provider.as_str())
        .bind(range.region.as_str())
        .bind(range.state.as_str())
        .bind(range.created_at)
        .bind(document)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_range", e))?;
        Ok(())
    }

    #[instrument(skip(self, requester), fields(range_id = %id), err)]
    async fn get(
        &self,
        id: RangeId,
        requester: &Requester,
    ) -> Result<Option<DeployedRange>, StoreError> {
        let row = sqlx::query("SELECT owner_id, document FROM deployed_ranges WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_range", e))?;
        let Some(row) = row else {
            return Ok(None);
        };

        let owner: uuid::Uuid = row
            .try_get("owner_id")
            .map_err(|e| map_sqlx_error("get_range", e))?;
        if !can_access(requester, UserId::from_uuid(owner)) {
            return Ok(None);
        }
        let document: serde_json::Value = row
            .try_get("document")
            .map_err(|e| map_sqlx_error("get_range", e))?;
        let range = serde_json::from_value(document)
            .map_err(|e| StoreError::Serialization(format!("range {id}: {e}")))?;
        Ok(Some(range))
    }

    #[instrument(skip(self), fields(range_id = %id), err)]
    async fn delete(&self, id: RangeId) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM deployed_ranges WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_range", e))?;
        Ok(deleted.rows_affected() > 0)
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                StoreError::Conflict(format!("{operation}: {}", db_err.message()))
            } else {
                StoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
            }
        }
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {operation}")),
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
