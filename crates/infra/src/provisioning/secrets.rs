//! Decrypted provider credentials.
//!
//! Plaintext lives only for the duration of one provisioning operation. None of
//! these types print their contents through `Debug`.

use serde::{Deserialize, Serialize};

/// A credential string that never appears in logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl core::fmt::Debug for Secret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsSecrets {
    pub access_key: Secret,
    pub secret_key: Secret,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureSecrets {
    pub client_id: Secret,
    pub client_secret: Secret,
    pub tenant_id: Secret,
    pub subscription_id: Secret,
}

/// A user's cloud credentials, one optional block per provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSecrets {
    #[serde(default)]
    pub aws: Option<AwsSecrets>,
    #[serde(default)]
    pub azure: Option<AzureSecrets>,
}

/// Key the credential store decrypts a user's secrets with.
///
/// Supplied per request and carried in the task arguments; never stored.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MasterKey(Secret);

impl MasterKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Secret::new(value))
    }

    pub fn expose(&self) -> &str {
        self.0.expose()
    }
}

impl core::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}
