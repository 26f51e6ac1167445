use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod cluster;
mod component;
mod instance_set;
mod ops_request;
mod parameters;

pub use cluster::*;
pub use component::*;
pub use instance_set::*;
pub use ops_request::*;
pub use parameters::*;

/// A role a replica can take, as reported by the role probe
#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaRole {
    /// The name of the role, matched against the `kubeblocks.io/role` pod label.
    pub name: String,

    /// Whether a replica with this role may serve traffic.
    #[serde(default)]
    pub serviceable: bool,

    /// Whether a replica with this role may receive writes.
    #[serde(default)]
    pub writable: bool,
}
