//! Blueprint tree: the immutable shape a deployment is built from.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use openlabs_core::{BlueprintId, DomainError, DomainResult, UserId};

use crate::naming::derive_logical_ids;
use crate::provider::Provider;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueprintHost {
    pub hostname: String,
    pub os: String,
    pub spec: String,
    pub size_gb: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueprintSubnet {
    pub name: String,
    pub cidr: String,
    pub hosts: Vec<BlueprintHost>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueprintVpc {
    pub name: String,
    pub cidr: String,
    pub subnets: Vec<BlueprintSubnet>,
}

/// A user-authored range template, not yet deployed anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueprintRange {
    pub id: BlueprintId,
    pub owner: UserId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub provider: Provider,
    #[serde(default)]
    pub vnc: bool,
    #[serde(default)]
    pub vpn: bool,
    pub vpcs: Vec<BlueprintVpc>,
}

impl BlueprintRange {
    pub fn host_count(&self) -> usize {
        self.vpcs
            .iter()
            .flat_map(|vpc| &vpc.subnets)
            .map(|subnet| subnet.hosts.len())
            .sum()
    }

    /// Check the tree before it is handed to a provider.
    ///
    /// Sibling names must yield distinct logical ids, CIDRs must parse, and
    /// every subnet must sit inside its VPC.
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("range name must not be empty"));
        }
        if self.vpcs.is_empty() {
            return Err(DomainError::validation(format!(
                "range '{}' must contain at least one vpc",
                self.name
            )));
        }

        derive_logical_ids(self.vpcs.iter().map(|v| v.name.as_str()))?;

        for vpc in &self.vpcs {
            let vpc_net = Ipv4Cidr::parse(&vpc.cidr)?;
            derive_logical_ids(vpc.subnets.iter().map(|s| s.name.as_str()))?;

            for subnet in &vpc.subnets {
                let subnet_net = Ipv4Cidr::parse(&subnet.cidr)?;
                if !vpc_net.contains(&subnet_net) {
                    return Err(DomainError::validation(format!(
                        "subnet '{}' ({}) is outside vpc '{}' ({})",
                        subnet.name, subnet.cidr, vpc.name, vpc.cidr
                    )));
                }
                derive_logical_ids(subnet.hosts.iter().map(|h| h.hostname.as_str()))?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    fn parse(raw: &str) -> DomainResult<Self> {
        let invalid = || DomainError::validation(format!("invalid IPv4 CIDR '{raw}'"));

        let (addr, prefix) = raw.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }

        Ok(Self {
            network: u32::from(addr) & Self::mask(prefix),
            prefix,
        })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
    }

    fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && other.network & Self::mask(self.prefix) == self.network
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn host(name: &str) -> BlueprintHost {
        BlueprintHost {
            hostname: name.to_string(),
            os: "debian_11".to_string(),
            spec: "tiny".to_string(),
            size_gb: 8,
            tags: vec![],
        }
    }

    pub(crate) fn sample_blueprint() -> BlueprintRange {
        BlueprintRange {
            id: BlueprintId::new(),
            owner: UserId::new(),
            name: "Red Team Lab".to_string(),
            description: "one of everything".to_string(),
            provider: Provider::Aws,
            vnc: false,
            vpn: false,
            vpcs: vec![BlueprintVpc {
                name: "Corp VPC".to_string(),
                cidr: "10.0.0.0/16".to_string(),
                subnets: vec![BlueprintSubnet {
                    name: "DMZ".to_string(),
                    cidr: "10.0.1.0/24".to_string(),
                    hosts: vec![host("web-01"), host("Web 01")],
                }],
            }],
        }
    }

    #[test]
    fn sample_blueprint_is_valid() {
        let bp = sample_blueprint();
        bp.validate().unwrap();
        assert_eq!(bp.host_count(), 2);
    }

    #[test]
    fn duplicate_hostnames_fail_validation() {
        let mut bp = sample_blueprint();
        bp.vpcs[0].subnets[0].hosts = vec![host("dc"), host("dc")];
        let err = bp.validate().unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn subnet_outside_vpc_fails_validation() {
        let mut bp = sample_blueprint();
        bp.vpcs[0].subnets[0].cidr = "192.168.1.0/24".to_string();
        assert!(bp.validate().is_err());
    }

    #[test]
    fn malformed_cidr_fails_validation() {
        let mut bp = sample_blueprint();
        bp.vpcs[0].cidr = "10.0.0.0/40".to_string();
        assert!(bp.validate().is_err());
    }

    #[test]
    fn empty_range_fails_validation() {
        let mut bp = sample_blueprint();
        bp.vpcs.clear();
        assert!(bp.validate().is_err());
    }
}
