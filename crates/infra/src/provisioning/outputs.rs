//! Turning a provider's flat output map into a [`DeployedRange`].
//!
//! Keys are built from the [`RangeLayout`] and looked up directly; any missing
//! or malformed value fails the whole parse.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use openlabs_core::{RangeId, UserId};
use openlabs_ranges::{
    BlueprintRange, DeployedHost, DeployedRange, DeployedSubnet, DeployedVpc, Jumpbox, NodeKey,
    OutputAttr, PrivateKey, RangeLayout, RangeState, Region,
};

use super::ProvisioningError;

/// Deployment facts that do not come from provider outputs.
#[derive(Debug, Clone)]
pub struct RangeMeta {
    pub owner: UserId,
    pub region: Region,
    pub created_at: DateTime<Utc>,
    pub state_snapshot: JsonValue,
}

struct Outputs<'a>(&'a HashMap<String, String>);

impl Outputs<'_> {
    fn text(&self, node: &NodeKey, attr: OutputAttr) -> Result<String, ProvisioningError> {
        let key = node.key(attr);
        match self.0.get(&key) {
            Some(value) if !value.trim().is_empty() => Ok(value.clone()),
            Some(_) => Err(ProvisioningError::InvalidOutput {
                key,
                reason: "empty value".to_string(),
            }),
            None => Err(ProvisioningError::MissingOutput(key)),
        }
    }

    fn ip(&self, node: &NodeKey, attr: OutputAttr) -> Result<IpAddr, ProvisioningError> {
        let raw = self.text(node, attr)?;
        raw.trim().parse().map_err(|_| ProvisioningError::InvalidOutput {
            key: node.key(attr),
            reason: format!("'{raw}' is not an IP address"),
        })
    }
}

/// Walk range -> jumpbox -> vpc -> subnet -> host and read every expected key.
pub fn parse_outputs(
    blueprint: &BlueprintRange,
    layout: &RangeLayout,
    outputs: &HashMap<String, String>,
    meta: RangeMeta,
) -> Result<DeployedRange, ProvisioningError> {
    let out = Outputs(outputs);

    let private_key = PrivateKey::new(out.text(&layout.range, OutputAttr::PrivateKey)?);
    let jumpbox = Jumpbox {
        resource_id: out.text(&layout.jumpbox, OutputAttr::ResourceId)?,
        public_ip: out.ip(&layout.jumpbox, OutputAttr::PublicIp)?,
    };

    let mut vpcs = Vec::with_capacity(blueprint.vpcs.len());
    for (vpc, vpc_layout) in blueprint.vpcs.iter().zip(&layout.vpcs) {
        let mut subnets = Vec::with_capacity(vpc.subnets.len());
        for (subnet, subnet_layout) in vpc.subnets.iter().zip(&vpc_layout.subnets) {
            let mut hosts = Vec::with_capacity(subnet.hosts.len());
            for (host, host_layout) in subnet.hosts.iter().zip(&subnet_layout.hosts) {
                hosts.push(DeployedHost {
                    hostname: host.hostname.clone(),
                    os: host.os.clone(),
                    spec: host.spec.clone(),
                    size_gb: host.size_gb,
                    tags: host.tags.clone(),
                    resource_id: out.text(&host_layout.key, OutputAttr::ResourceId)?,
                    ip_address: out.ip(&host_layout.key, OutputAttr::IpAddress)?,
                });
            }
            subnets.push(DeployedSubnet {
                name: subnet.name.clone(),
                cidr: subnet.cidr.clone(),
                resource_id: out.text(&subnet_layout.key, OutputAttr::ResourceId)?,
                hosts,
            });
        }
        vpcs.push(DeployedVpc {
            name: vpc.name.clone(),
            cidr: vpc.cidr.clone(),
            resource_id: out.text(&vpc_layout.key, OutputAttr::ResourceId)?,
            subnets,
        });
    }

    Ok(DeployedRange {
        id: RangeId::new(),
        owner: meta.owner,
        blueprint_id: blueprint.id,
        name: blueprint.name.clone(),
        description: blueprint.description.clone(),
        provider: blueprint.provider,
        region: meta.region,
        created_at: meta.created_at,
        state: RangeState::On,
        vnc: blueprint.vnc,
        vpn: blueprint.vpn,
        jumpbox,
        private_key,
        vpcs,
        state_snapshot: meta.state_snapshot,
    })
}
