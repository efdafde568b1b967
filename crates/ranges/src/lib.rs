//! Range domain model.
//!
//! Blueprints (what a user wants), deployed ranges (what the cloud gave back)
//! and the deterministic naming rules that tie the two together. Pure logic:
//! no IO, no provider calls.

pub mod blueprint;
pub mod deployed;
pub mod layout;
pub mod naming;
pub mod provider;

pub use blueprint::{BlueprintHost, BlueprintRange, BlueprintSubnet, BlueprintVpc};
pub use deployed::{
    DeployedHost, DeployedRange, DeployedSubnet, DeployedVpc, Jumpbox, PrivateKey, RangeState,
};
pub use layout::{HostLayout, NodeKey, OutputAttr, RangeLayout, SubnetLayout, VpcLayout};
pub use naming::{NamingError, derive_logical_ids, normalize_name, stack_name};
pub use provider::{Provider, Region};
