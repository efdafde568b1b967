//! Deployed range: a blueprint realized as live cloud infrastructure.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use openlabs_core::{BlueprintId, RangeId, UserId};

use crate::blueprint::{BlueprintHost, BlueprintRange, BlueprintSubnet, BlueprintVpc};
use crate::provider::{Provider, Region};

/// Operational state of a deployed range.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeState {
    On,
    Off,
    Starting,
    Stopping,
}

impl RangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeState::On => "on",
            RangeState::Off => "off",
            RangeState::Starting => "starting",
            RangeState::Stopping => "stopping",
        }
    }
}

/// SSH private key material for the range. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(pem: impl Into<String>) -> Self {
        Self(pem.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// SSH entry point into the range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jumpbox {
    pub resource_id: String,
    pub public_ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedHost {
    pub hostname: String,
    pub os: String,
    pub spec: String,
    pub size_gb: u32,
    pub tags: Vec<String>,
    pub resource_id: String,
    pub ip_address: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedSubnet {
    pub name: String,
    pub cidr: String,
    pub resource_id: String,
    pub hosts: Vec<DeployedHost>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedVpc {
    pub name: String,
    pub cidr: String,
    pub resource_id: String,
    pub subnets: Vec<DeployedSubnet>,
}

/// Persisted result of a successful provisioning operation.
///
/// Only ever constructed fully populated: every node carries its provider
/// resource id. Ownership never changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedRange {
    pub id: RangeId,
    pub owner: UserId,
    pub blueprint_id: BlueprintId,
    pub name: String,
    pub description: String,
    pub provider: Provider,
    pub region: Region,
    pub created_at: DateTime<Utc>,
    pub state: RangeState,
    pub vnc: bool,
    pub vpn: bool,
    pub jumpbox: Jumpbox,
    pub private_key: PrivateKey,
    pub vpcs: Vec<DeployedVpc>,
    /// Provider state export; replayed into a fresh workspace to destroy.
    pub state_snapshot: serde_json::Value,
}

impl DeployedRange {
    /// Rebuild the tree this range was deployed from.
    pub fn to_blueprint(&self) -> BlueprintRange {
        BlueprintRange {
            id: self.blueprint_id,
            owner: self.owner,
            name: self.name.clone(),
            description: self.description.clone(),
            provider: self.provider,
            vnc: self.vnc,
            vpn: self.vpn,
            vpcs: self
                .vpcs
                .iter()
                .map(|vpc| BlueprintVpc {
                    name: vpc.name.clone(),
                    cidr: vpc.cidr.clone(),
                    subnets: vpc
                        .subnets
                        .iter()
                        .map(|subnet| BlueprintSubnet {
                            name: subnet.name.clone(),
                            cidr: subnet.cidr.clone(),
                            hosts: subnet
                                .hosts
                                .iter()
                                .map(|host| BlueprintHost {
                                    hostname: host.hostname.clone(),
                                    os: host.os.clone(),
                                    spec: host.spec.clone(),
                                    size_gb: host.size_gb,
                                    tags: host.tags.clone(),
                                })
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    pub fn host_count(&self) -> usize {
        self.vpcs
            .iter()
            .flat_map(|vpc| &vpc.subnets)
            .map(|subnet| subnet.hosts.len())
            .sum()
    }
}
