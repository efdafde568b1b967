//! Provider plugins backed by an external IaC CLI (OpenTofu/Terraform).
//!
//! Each workspace gets a generated `main.tf.json` that instantiates the
//! provider's module with the range document, plus a `terraform.tfvars.json`
//! holding credentials and region. The module must publish one output,
//! `resources`, a flat map keyed exactly as `RangeLayout` lays keys out.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{Map, Value as JsonValue, json};
use tracing::{debug, error, info, warn};

use openlabs_ranges::{BlueprintRange, Provider, RangeLayout, Region};

use super::ProvisioningError;
use super::program::{
    Cancellation, ConfigValue, ConfigValues, DestroyRun, InfraProgram, OpResult, ProgramError, UpResult,
};
use super::provider::ProviderPlugin;
use super::secrets::ProviderSecrets;

const MAIN_FILE: &str = "main.tf.json";
const VARS_FILE: &str = "terraform.tfvars.json";
const STATE_FILE: &str = "terraform.tfstate";
const RESOURCES_OUTPUT: &str = "resources";
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Where the CLI and the provider modules live.
#[derive(Debug, Clone)]
pub struct CliSettings {
    pub binary: PathBuf,
    pub modules_dir: PathBuf,
    pub plugin_cache_dir: Option<PathBuf>,
}

/// One range's program: a module directory plus the rendered range document.
#[derive(Debug, Clone)]
pub struct CliProgram {
    settings: CliSettings,
    module: PathBuf,
    document: JsonValue,
}

impl CliProgram {
    pub fn new(settings: CliSettings, module: PathBuf, document: JsonValue) -> Self {
        Self {
            settings,
            module,
            document,
        }
    }

    /// Run one CLI command to completion, killing it if `cancel` trips first.
    fn run(&self, workspace: &Path, args: &[&str], cancel: &Cancellation) -> Result<Output, ProgramError> {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(args)
            .current_dir(workspace)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cache) = &self.settings.plugin_cache_dir {
            cmd.env("TF_PLUGIN_CACHE_DIR", cache);
        }
        debug!(binary = %self.settings.binary.display(), args = ?args, "running iac command");
        let mut child = cmd.spawn().map_err(|e| {
            ProgramError::Io(format!(
                "failed to execute {}: {e}",
                self.settings.binary.display()
            ))
        })?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() {
                let command = args.join(" ");
                warn!(pid = child.id(), command = %command, "killing iac command");
                if let Err(e) = child.kill() {
                    error!(pid = child.id(), error = %e, "failed to kill iac command");
                }
                // Reap; the drain threads finish on their own once the pipes close.
                child.wait()?;
                return Err(ProgramError::Cancelled(command));
            }
            std::thread::sleep(EXIT_POLL);
        };

        Ok(Output {
            status,
            stdout: collect(stdout)?,
            stderr: collect(stderr)?,
        })
    }

    fn run_checked(&self, workspace: &Path, args: &[&str], cancel: &Cancellation) -> Result<Output, ProgramError> {
        let output = self.run(workspace, args, cancel)?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(ProgramError::Command {
                command: args.join(" "),
                status: output.status.to_string(),
                stderr: tail(&output.stderr),
            })
        }
    }

    fn main_document(&self, values: &ConfigValues) -> JsonValue {
        let mut variables = Map::new();
        let mut module = Map::new();
        module.insert("source".into(), json!(self.module.display().to_string()));
        module.insert("range".into(), self.document.clone());
        for (name, value) in values {
            variables.insert(name.clone(), json!({"type": "string", "sensitive": value.secret}));
            module.insert(name.clone(), json!(format!("${{var.{name}}}")));
        }

        json!({
            "terraform": {"backend": {"local": {"path": STATE_FILE}}},
            "variable": variables,
            "module": {"range": module},
            "output": {
                RESOURCES_OUTPUT: {
                    "value": "${module.range.resources}",
                    "sensitive": true
                }
            }
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<std::io::Result<Vec<u8>>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn collect(handle: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> Result<Vec<u8>, ProgramError> {
    match handle {
        Some(handle) => handle
            .join()
            .map_err(|_| ProgramError::Io("output reader panicked".to_string()))?
            .map_err(ProgramError::from),
        None => Ok(Vec::new()),
    }
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(20)..].join("\n")
}

fn write_json(path: &Path, value: &JsonValue) -> Result<(), ProgramError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| ProgramError::Parse(e.to_string()))?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Flatten the `resources` output into strings.
fn parse_resources(stdout: &[u8]) -> Result<HashMap<String, String>, ProgramError> {
    let value: JsonValue =
        serde_json::from_slice(stdout).map_err(|e| ProgramError::Parse(e.to_string()))?;
    let JsonValue::Object(map) = value else {
        return Err(ProgramError::Parse(format!("`{RESOURCES_OUTPUT}` output is not an object")));
    };
    Ok(map
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                JsonValue::String(s) => s,
                other => other.to_string(),
            };
            (key, text)
        })
        .collect())
}

impl InfraProgram for CliProgram {
    fn configure(
        &self,
        workspace: &Path,
        values: &ConfigValues,
        cancel: &Cancellation,
    ) -> Result<(), ProgramError> {
        write_json(&workspace.join(MAIN_FILE), &self.main_document(values))?;

        let vars: Map<String, JsonValue> = values
            .iter()
            .map(|(name, value)| (name.clone(), json!(value.value)))
            .collect();
        let vars_path = workspace.join(VARS_FILE);
        write_json(&vars_path, &JsonValue::Object(vars))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&vars_path, std::fs::Permissions::from_mode(0o600))?;
        }

        self.run_checked(workspace, &["init", "-input=false", "-no-color"], cancel)?;
        Ok(())
    }

    fn up(&self, workspace: &Path, cancel: &Cancellation) -> Result<UpResult, ProgramError> {
        let applied = self.run(
            workspace,
            &["apply", "-auto-approve", "-input=false", "-no-color"],
            cancel,
        )?;
        if !applied.status.success() {
            return Ok(UpResult {
                result: OpResult::Failed,
                outputs: HashMap::new(),
                summary: tail(&applied.stderr),
            });
        }

        let output = self.run_checked(workspace, &["output", "-json", RESOURCES_OUTPUT], cancel)?;
        let outputs = parse_resources(&output.stdout)?;
        info!(outputs = outputs.len(), "apply finished");
        Ok(UpResult {
            result: OpResult::Succeeded,
            outputs,
            summary: tail(&applied.stdout),
        })
    }

    fn destroy(&self, workspace: &Path, cancel: &Cancellation) -> Result<DestroyRun, ProgramError> {
        let listed = self.run(workspace, &["state", "list"], cancel)?;
        if listed.status.success() && listed.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(DestroyRun {
                result: OpResult::Succeeded,
                already_absent: true,
                summary: "no resources in state".to_string(),
            });
        }

        let destroyed = self.run(
            workspace,
            &["destroy", "-auto-approve", "-input=false", "-no-color"],
            cancel,
        )?;
        let (result, summary) = if destroyed.status.success() {
            (OpResult::Succeeded, tail(&destroyed.stdout))
        } else {
            (OpResult::Failed, tail(&destroyed.stderr))
        };
        Ok(DestroyRun {
            result,
            already_absent: false,
            summary,
        })
    }

    fn export_state(&self, workspace: &Path, cancel: &Cancellation) -> Result<JsonValue, ProgramError> {
        let pulled = self.run_checked(workspace, &["state", "pull"], cancel)?;
        serde_json::from_slice(&pulled.stdout).map_err(|e| ProgramError::Parse(e.to_string()))
    }

    fn import_state(&self, workspace: &Path, state: &JsonValue) -> Result<(), ProgramError> {
        write_json(&workspace.join(STATE_FILE), state)
    }
}

/// Range document handed to the provider module.
fn range_document(range: &BlueprintRange, layout: &RangeLayout, region: &str) -> JsonValue {
    let vpcs: Vec<JsonValue> = range
        .vpcs
        .iter()
        .zip(&layout.vpcs)
        .map(|(vpc, vpc_layout)| {
            let subnets: Vec<JsonValue> = vpc
                .subnets
                .iter()
                .zip(&vpc_layout.subnets)
                .map(|(subnet, subnet_layout)| {
                    let hosts: Vec<JsonValue> = subnet
                        .hosts
                        .iter()
                        .zip(&subnet_layout.hosts)
                        .map(|(host, host_layout)| {
                            json!({
                                "key": host_layout.key,
                                "hostname": host.hostname,
                                "os": host.os,
                                "spec": host.spec,
                                "size_gb": host.size_gb,
                                "tags": host.tags,
                            })
                        })
                        .collect();
                    json!({
                        "key": subnet_layout.key,
                        "name": subnet.name,
                        "cidr": subnet.cidr,
                        "hosts": hosts,
                    })
                })
                .collect();
            json!({
                "key": vpc_layout.key,
                "name": vpc.name,
                "cidr": vpc.cidr,
                "subnets": subnets,
            })
        })
        .collect();

    json!({
        "stack_name": layout.stack_name,
        "provider": range.provider,
        "region": region,
        "vnc": range.vnc,
        "vpn": range.vpn,
        "range_key": layout.range,
        "jumpbox_key": layout.jumpbox,
        "vpcs": vpcs,
    })
}

fn cli_bootstrap(settings: &CliSettings) -> Result<(), ProgramError> {
    if let Some(cache) = &settings.plugin_cache_dir {
        std::fs::create_dir_all(cache)?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct AwsPlugin {
    settings: CliSettings,
}

impl AwsPlugin {
    pub fn new(settings: CliSettings) -> Self {
        Self { settings }
    }

    fn region_name(region: Region) -> &'static str {
        match region {
            Region::UsEast1 => "us-east-1",
            Region::UsEast2 => "us-east-2",
        }
    }
}

impl ProviderPlugin for AwsPlugin {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    fn has_required_secrets(&self, secrets: &ProviderSecrets) -> bool {
        secrets
            .aws
            .as_ref()
            .is_some_and(|aws| !aws.access_key.is_blank() && !aws.secret_key.is_blank())
    }

    fn config_values(
        &self,
        secrets: &ProviderSecrets,
        region: Region,
    ) -> Result<ConfigValues, ProvisioningError> {
        let aws = secrets
            .aws
            .as_ref()
            .ok_or(ProvisioningError::MissingSecrets(Provider::Aws))?;
        Ok(ConfigValues::from([
            ("aws_access_key".to_string(), ConfigValue::secret(aws.access_key.expose())),
            ("aws_secret_key".to_string(), ConfigValue::secret(aws.secret_key.expose())),
            ("region".to_string(), ConfigValue::plain(Self::region_name(region))),
        ]))
    }

    fn build_program(
        &self,
        range: &BlueprintRange,
        layout: &RangeLayout,
        region: Region,
    ) -> Result<Arc<dyn InfraProgram>, ProvisioningError> {
        Ok(Arc::new(CliProgram::new(
            self.settings.clone(),
            self.settings.modules_dir.join("aws"),
            range_document(range, layout, Self::region_name(region)),
        )))
    }

    fn bootstrap(&self) -> Result<(), ProgramError> {
        cli_bootstrap(&self.settings)
    }
}

#[derive(Debug, Clone)]
pub struct AzurePlugin {
    settings: CliSettings,
}

impl AzurePlugin {
    pub fn new(settings: CliSettings) -> Self {
        Self { settings }
    }

    fn region_name(region: Region) -> &'static str {
        match region {
            Region::UsEast1 => "eastus",
            Region::UsEast2 => "eastus2",
        }
    }
}

impl ProviderPlugin for AzurePlugin {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    fn has_required_secrets(&self, secrets: &ProviderSecrets) -> bool {
        secrets.azure.as_ref().is_some_and(|az| {
            [&az.client_id, &az.client_secret, &az.tenant_id, &az.subscription_id]
                .iter()
                .all(|s| !s.is_blank())
        })
    }

    fn config_values(
        &self,
        secrets: &ProviderSecrets,
        region: Region,
    ) -> Result<ConfigValues, ProvisioningError> {
        let az = secrets
            .azure
            .as_ref()
            .ok_or(ProvisioningError::MissingSecrets(Provider::Azure))?;
        Ok(ConfigValues::from([
            ("azure_client_id".to_string(), ConfigValue::secret(az.client_id.expose())),
            ("azure_client_secret".to_string(), ConfigValue::secret(az.client_secret.expose())),
            ("azure_tenant_id".to_string(), ConfigValue::secret(az.tenant_id.expose())),
            ("azure_subscription_id".to_string(), ConfigValue::secret(az.subscription_id.expose())),
            ("region".to_string(), ConfigValue::plain(Self::region_name(region))),
        ]))
    }

    fn build_program(
        &self,
        range: &BlueprintRange,
        layout: &RangeLayout,
        region: Region,
    ) -> Result<Arc<dyn InfraProgram>, ProvisioningError> {
        Ok(Arc::new(CliProgram::new(
            self.settings.clone(),
            self.settings.modules_dir.join("azure"),
            range_document(range, layout, Self::region_name(region)),
        )))
    }

    fn bootstrap(&self) -> Result<(), ProgramError> {
        cli_bootstrap(&self.settings)
    }
}
