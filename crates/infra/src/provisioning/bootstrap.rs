//! Process-scoped named mutexes for one-time provider bootstrap.
//!
//! These locks only serialize tasks inside one worker process. Two worker
//! processes may bootstrap concurrently, so bootstrap steps must be idempotent.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use tracing::debug;

use super::ProvisioningError;
use super::program::ProgramError;
use super::provider::ProviderPlugin;

static NAMED_LOCKS: LazyLock<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// The mutex registered under `name`, created on first use.
pub fn named_lock(name: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = NAMED_LOCKS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    locks
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

/// Run the plugin's bootstrap with at most one caller per provider in this process.
pub async fn bootstrap_provider(plugin: Arc<dyn ProviderPlugin>) -> Result<(), ProvisioningError> {
    let provider = plugin.provider();
    let lock = named_lock(&format!("bootstrap:{provider}"));
    let _guard = lock.lock().await;
    debug!(provider = %provider, "running provider bootstrap");

    tokio::task::spawn_blocking(move || plugin.bootstrap())
        .await
        .map_err(|e| ProgramError::Join(e.to_string()))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_yields_same_lock() {
        let a = named_lock("bootstrap:test");
        let b = named_lock("bootstrap:test");
        let c = named_lock("bootstrap:other");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
