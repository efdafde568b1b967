//! Provisioning: turning a blueprint into live infrastructure and back.
//!
//! A [`ProvisioningOperation`] owns one isolated workspace and one provider
//! program. [`Provisioner`] wraps the operation lifecycle (initialize, apply or
//! destroy, cleanup) for the task bodies.

pub mod bootstrap;
pub mod cli;
pub mod operation;
pub mod outputs;
pub mod program;
pub mod provider;
pub mod secrets;
pub mod workspace;

use openlabs_core::DomainError;
use openlabs_ranges::{NamingError, Provider};

pub use cli::{AwsPlugin, AzurePlugin, CliProgram, CliSettings};
pub use operation::{DestroyResult, OperationState, ProvisioningOperation, Provisioner};
pub use outputs::{RangeMeta, parse_outputs};
pub use program::{
    Cancellation, ConfigValue, ConfigValues, DestroyRun, InfraProgram, OpResult, ProgramError, UpResult,
    run_blocking,
};
pub use provider::{ProviderPlugin, ProviderRegistry};
pub use secrets::{AwsSecrets, AzureSecrets, MasterKey, ProviderSecrets, Secret};
pub use workspace::{DeploymentId, Workspace};

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(Provider),

    #[error("no {0} credentials configured")]
    MissingSecrets(Provider),

    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error("{operation} is not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: OperationState,
    },

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error("apply did not succeed: {0}")]
    ApplyFailed(String),

    #[error("missing output key '{0}'")]
    MissingOutput(String),

    #[error("invalid output '{key}': {reason}")]
    InvalidOutput { key: String, reason: String },
}

impl From<NamingError> for ProvisioningError {
    fn from(e: NamingError) -> Self {
        ProvisioningError::Invalid(e.into())
    }
}
