//! Output-key layout for one deployment.
//!
//! Every node in the range tree gets a key prefix built from the stack name and
//! the logical ids on its path. The provider program publishes outputs under
//! these keys and output parsing reads them back; both sides go through
//! [`RangeLayout::plan`], so they cannot disagree.
//!
//! Key shapes (`<attr>` is an [`OutputAttr`]):
//!
//! ```text
//! <stack>:range:private_key
//! <stack>:jumpbox:<attr>
//! <stack>:vpc:<vpc>:<attr>
//! <stack>:vpc:<vpc>:subnet:<subnet>:<attr>
//! <stack>:vpc:<vpc>:subnet:<subnet>:host:<host>:<attr>
//! ```
//!
//! Logical ids only contain `[a-z0-9-]`, so `:` cannot appear inside a segment.

use serde::Serialize;

use crate::blueprint::BlueprintRange;
use crate::naming::{NamingError, derive_logical_ids};

/// Attribute published for a node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OutputAttr {
    ResourceId,
    PublicIp,
    IpAddress,
    PrivateKey,
}

impl OutputAttr {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputAttr::ResourceId => "resource_id",
            OutputAttr::PublicIp => "public_ip",
            OutputAttr::IpAddress => "ip_address",
            OutputAttr::PrivateKey => "private_key",
        }
    }
}

/// Key prefix of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    fn child(&self, kind: &str, logical_id: &str) -> NodeKey {
        NodeKey(format!("{}:{kind}:{logical_id}", self.0))
    }

    pub fn prefix(&self) -> &str {
        &self.0
    }

    pub fn key(&self, attr: OutputAttr) -> String {
        format!("{}:{}", self.0, attr.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostLayout {
    pub hostname: String,
    pub logical_id: String,
    pub key: NodeKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubnetLayout {
    pub name: String,
    pub logical_id: String,
    pub key: NodeKey,
    pub hosts: Vec<HostLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VpcLayout {
    pub name: String,
    pub logical_id: String,
    pub key: NodeKey,
    pub subnets: Vec<SubnetLayout>,
}

/// Key layout for a whole range, in blueprint order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeLayout {
    pub stack_name: String,
    pub range: NodeKey,
    pub jumpbox: NodeKey,
    pub vpcs: Vec<VpcLayout>,
}

impl RangeLayout {
    pub fn plan(range: &BlueprintRange, stack_name: &str) -> Result<Self, NamingError> {
        let root = NodeKey(stack_name.to_string());
        let vpc_ids = derive_logical_ids(range.vpcs.iter().map(|v| v.name.as_str()))?;

        let mut vpcs = Vec::with_capacity(range.vpcs.len());
        for vpc in &range.vpcs {
            let vpc_id = vpc_ids[&vpc.name].clone();
            let vpc_key = root.child("vpc", &vpc_id);
            let subnet_ids = derive_logical_ids(vpc.subnets.iter().map(|s| s.name.as_str()))?;

            let mut subnets = Vec::with_capacity(vpc.subnets.len());
            for subnet in &vpc.subnets {
                let subnet_id = subnet_ids[&subnet.name].clone();
                let subnet_key = vpc_key.child("subnet", &subnet_id);
                let host_ids =
                    derive_logical_ids(subnet.hosts.iter().map(|h| h.hostname.as_str()))?;

                let hosts = subnet
                    .hosts
                    .iter()
                    .map(|host| {
                        let host_id = host_ids[&host.hostname].clone();
                        HostLayout {
                            hostname: host.hostname.clone(),
                            key: subnet_key.child("host", &host_id),
                            logical_id: host_id,
                        }
                    })
                    .collect();

                subnets.push(SubnetLayout {
                    name: subnet.name.clone(),
                    key: subnet_key,
                    logical_id: subnet_id,
                    hosts,
                });
            }

            vpcs.push(VpcLayout {
                name: vpc.name.clone(),
                key: vpc_key,
                logical_id: vpc_id,
                subnets,
            });
        }

        Ok(Self {
            stack_name: stack_name.to_string(),
            range: NodeKey(format!("{stack_name}:range")),
            jumpbox: NodeKey(format!("{stack_name}:jumpbox")),
            vpcs,
        })
    }

    /// Every key a complete provider output must contain.
    pub fn expected_keys(&self) -> Vec<String> {
        let mut keys = vec![
            self.range.key(OutputAttr::PrivateKey),
            self.jumpbox.key(OutputAttr::ResourceId),
            self.jumpbox.key(OutputAttr::PublicIp),
        ];
        for vpc in &self.vpcs {
            keys.push(vpc.key.key(OutputAttr::ResourceId));
            for subnet in &vpc.subnets {
                keys.push(subnet.key.key(OutputAttr::ResourceId));
                for host in &subnet.hosts {
                    keys.push(host.key.key(OutputAttr::ResourceId));
                    keys.push(host.key.key(OutputAttr::IpAddress));
                }
            }
        }
        keys
    }
}
