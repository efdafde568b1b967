//! Per-operation scratch directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};
use uuid::Uuid;

use openlabs_ranges::normalize_name;

/// Short random id that makes a workspace and stack unique to one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeploymentId(String);

impl DeploymentId {
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(hex[..10].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `<root>/<deployment_id>-<range-name>`, removed when the last handle drops.
///
/// Blocking program calls hold a clone, so a workspace outlives a cancelled
/// operation until the in-flight call returns.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    removed: AtomicBool,
}

impl Workspace {
    pub async fn create(
        root: &Path,
        deployment_id: &DeploymentId,
        range_name: &str,
    ) -> std::io::Result<Arc<Self>> {
        let path = root.join(format!("{deployment_id}-{}", normalize_name(range_name)));
        tokio::fs::create_dir_all(&path).await?;
        debug!(path = %path.display(), "workspace created");
        Ok(Arc::new(Self {
            path,
            removed: AtomicBool::new(false),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory now. Later calls and the drop are no-ops.
    pub fn remove(&self) -> std::io::Result<()> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match std::fs::remove_dir_all(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(path = %self.path.display(), error = %e, "failed to remove workspace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_ids_are_short_hex() {
        let id = DeploymentId::generate();
        assert_eq!(id.as_str().len(), 10);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, DeploymentId::generate());
    }

    #[tokio::test]
    async fn workspace_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let id = DeploymentId::generate();
        let ws = Workspace::create(root.path(), &id, "Red Team Lab").await.unwrap();
        let path = ws.path().to_path_buf();

        assert!(path.ends_with(format!("{id}-red-team-lab")));
        assert!(path.is_dir());

        let held = ws.clone();
        drop(ws);
        assert!(path.is_dir());
        drop(held);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn explicit_remove_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path(), &DeploymentId::generate(), "r").await.unwrap();
        ws.remove().unwrap();
        ws.remove().unwrap();
        assert!(!ws.path().exists());
    }
}
