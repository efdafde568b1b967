//! The executable infrastructure program a provider plugin builds.
//!
//! Every method blocks (external CLI, SDK calls) and is only ever invoked from
//! `tokio::task::spawn_blocking` through [`run_blocking`], which trips the
//! call's [`Cancellation`] if the awaiting future is dropped.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value as JsonValue;

/// Explicit success discriminator of an apply/destroy run.
///
/// Callers must check it; a run that returned without an error may still
/// have failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpResult {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpResult {
    pub result: OpResult,
    /// Flat output map, keyed as laid out by `RangeLayout`.
    pub outputs: HashMap<String, String>,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DestroyRun {
    pub result: OpResult,
    /// Nothing was left to destroy.
    pub already_absent: bool,
    pub summary: String,
}

/// One configuration value written into a workspace.
#[derive(Clone, PartialEq, Eq)]
pub struct ConfigValue {
    pub value: String,
    pub secret: bool,
}

impl ConfigValue {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secret: false,
        }
    }

    pub fn secret(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secret: true,
        }
    }
}

impl core::fmt::Debug for ConfigValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.secret {
            f.write_str("ConfigValue(<redacted>)")
        } else {
            write!(f, "ConfigValue({:?})", self.value)
        }
    }
}

pub type ConfigValues = BTreeMap<String, ConfigValue>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProgramError {
    #[error("workspace io error: {0}")]
    Io(String),

    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unreadable program output: {0}")]
    Parse(String),

    #[error("blocking program call aborted: {0}")]
    Join(String),

    #[error("`{0}` was killed after its caller went away")]
    Cancelled(String),
}

impl From<std::io::Error> for ProgramError {
    fn from(e: std::io::Error) -> Self {
        ProgramError::Io(e.to_string())
    }
}

/// Kill signal for one blocking program call.
///
/// Long-running implementations poll it and terminate their child process
/// once it is set.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

struct CancelOnDrop(Cancellation);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Run `f` on the blocking pool. Dropping the returned future (runner
/// timeout, shutdown) cancels the call instead of leaving it running.
pub async fn run_blocking<T, F>(f: F) -> Result<T, ProgramError>
where
    F: FnOnce(&Cancellation) -> Result<T, ProgramError> + Send + 'static,
    T: Send + 'static,
{
    let cancel = Cancellation::default();
    let _guard = CancelOnDrop(cancel.clone());
    tokio::task::spawn_blocking(move || f(&cancel))
        .await
        .map_err(|e| ProgramError::Join(e.to_string()))?
}

pub trait InfraProgram: Send + Sync {
    /// Write configuration values and prepare the workspace. No cloud mutation.
    fn configure(
        &self,
        workspace: &Path,
        values: &ConfigValues,
        cancel: &Cancellation,
    ) -> Result<(), ProgramError>;

    fn up(&self, workspace: &Path, cancel: &Cancellation) -> Result<UpResult, ProgramError>;

    fn destroy(&self, workspace: &Path, cancel: &Cancellation) -> Result<DestroyRun, ProgramError>;

    /// Serialized provider state, enough to destroy from a fresh workspace.
    fn export_state(&self, workspace: &Path, cancel: &Cancellation) -> Result<JsonValue, ProgramError>;

    fn import_state(&self, workspace: &Path, state: &JsonValue) -> Result<(), ProgramError>;
}
