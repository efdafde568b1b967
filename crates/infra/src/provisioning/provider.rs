//! Provider plugins and their registry.

use std::collections::HashMap;
use std::sync::Arc;

use openlabs_ranges::{BlueprintRange, Provider, RangeLayout, Region};

use super::ProvisioningError;
use super::program::{ConfigValues, InfraProgram, ProgramError};
use super::secrets::ProviderSecrets;

/// Everything provider-specific about building a range.
pub trait ProviderPlugin: Send + Sync {
    fn provider(&self) -> Provider;

    fn has_required_secrets(&self, secrets: &ProviderSecrets) -> bool;

    /// Values the program needs in its workspace (credentials, region).
    fn config_values(
        &self,
        secrets: &ProviderSecrets,
        region: Region,
    ) -> Result<ConfigValues, ProvisioningError>;

    fn build_program(
        &self,
        range: &BlueprintRange,
        layout: &RangeLayout,
        region: Region,
    ) -> Result<Arc<dyn InfraProgram>, ProvisioningError>;

    /// One-time shared setup such as a plugin cache. Must be idempotent.
    fn bootstrap(&self) -> Result<(), ProgramError> {
        Ok(())
    }
}

/// Provider -> plugin lookup, filled once at startup.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    plugins: HashMap<Provider, Arc<dyn ProviderPlugin>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn ProviderPlugin>) {
        self.plugins.insert(plugin.provider(), plugin);
    }

    pub fn with(mut self, plugin: Arc<dyn ProviderPlugin>) -> Self {
        self.register(plugin);
        self
    }

    pub fn lookup(&self, provider: Provider) -> Option<Arc<dyn ProviderPlugin>> {
        self.plugins.get(&provider).cloned()
    }
}

impl core::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}
