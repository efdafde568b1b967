//! Rollback property: whenever apply fails after the program started, a
//! destroy is attempted, the original apply error is what the caller sees
//! whether that destroy succeeds, reports failure or errors out, no range
//! comes back and the workspace is gone.

mod support;

use std::sync::Arc;

use proptest::prelude::*;

use openlabs_core::UserId;
use openlabs_infra::provisioning::{ProgramError, ProviderRegistry, Provisioner, ProvisioningError};
use openlabs_ranges::Region;

use support::{Apply, CallLog, Script, ScriptedPlugin, Teardown, aws_secrets, sample_blueprint};

fn failing_apply() -> impl Strategy<Value = Apply> {
    prop_oneof![
        Just(Apply::FailAfterVpc),
        Just(Apply::Crash),
        Just(Apply::MissingHosts),
    ]
}

fn any_teardown() -> impl Strategy<Value = Teardown> {
    prop_oneof![
        Just(Teardown::Succeed),
        Just(Teardown::Fail),
        Just(Teardown::Error),
    ]
}

fn run_deploy(script: Script) -> (Result<(), ProvisioningError>, Vec<String>, usize) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let root = tempfile::tempdir().unwrap();
    let calls: CallLog = Arc::default();
    let registry = Arc::new(ProviderRegistry::new().with(Arc::new(ScriptedPlugin {
        script,
        calls: calls.clone(),
    })));
    let provisioner = Provisioner::new(registry, root.path());

    let result = runtime.block_on(provisioner.deploy(
        sample_blueprint(UserId::new()),
        Region::UsEast2,
        UserId::new(),
        aws_secrets(),
    ));
    let entries = std::fs::read_dir(root.path()).unwrap().count();
    let calls = calls.lock().unwrap().clone();
    (result.map(|_| ()), calls, entries)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn failed_apply_always_attempts_destroy(apply in failing_apply(), teardown in any_teardown()) {
        let (result, calls, entries) = run_deploy(Script { apply, teardown });

        let err = result.unwrap_err();
        // The rollback's own failure never replaces the apply error.
        let message = err.to_string();
        prop_assert!(!message.contains("dependency violation"), "{}", message);
        prop_assert!(!message.contains("state lock held"), "{}", message);
        match apply {
            Apply::FailAfterVpc => prop_assert!(matches!(err, ProvisioningError::ApplyFailed(_))),
            Apply::Crash => prop_assert!(matches!(
                err,
                ProvisioningError::Program(ProgramError::Command { .. })
            ), "{}", err),
            Apply::MissingHosts => prop_assert!(matches!(err, ProvisioningError::MissingOutput(_))),
            Apply::Succeed => unreachable!(),
        }
        prop_assert_eq!(calls.iter().filter(|c| c.as_str() == "destroy").count(), 1);
        prop_assert_eq!(calls.last().map(String::as_str), Some("destroy"));
        prop_assert_eq!(entries, 0);
    }
}

#[test]
fn successful_apply_never_destroys() {
    let (result, calls, entries) = run_deploy(Script::default());
    assert!(result.is_ok());
    assert!(!calls.contains(&"destroy".to_string()));
    assert_eq!(entries, 0);
}

#[test]
fn erroring_rollback_surfaces_the_apply_failure() {
    let (result, calls, entries) = run_deploy(Script {
        apply: Apply::FailAfterVpc,
        teardown: Teardown::Error,
    });

    let err = result.unwrap_err();
    assert!(
        matches!(err, ProvisioningError::ApplyFailed(ref summary) if summary.contains("quota exceeded")),
        "got {err:?}"
    );
    assert_eq!(calls, vec!["configure", "up", "destroy"]);
    assert_eq!(entries, 0);
}
