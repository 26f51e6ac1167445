use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::PersistentVolumeClaimSpec, apimachinery::pkg::api::resource::Quantity,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of a database cluster made of components and shardings
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Cluster",
    group = "apps.kubeblocks.io",
    version = "v1",
    status = "ClusterStatus",
    derive = "Default",
    doc = "A database cluster",
    namespaced,
    printcolumn = r#"{ "name": "status", "type": "string", "description": "cluster phase", "jsonPath": ".status.phase" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Plain components of the cluster.
    #[serde(default)]
    pub component_specs: Vec<ClusterComponentSpec>,

    /// Components replicated as independent shards.
    #[serde(default)]
    pub shardings: Vec<ClusterSharding>,
}

/// A single component of a cluster
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentSpec {
    pub name: String,

    /// Name of the ComponentDefinition this component is built from.
    #[serde(default)]
    pub component_def: String,

    pub replicas: i32,

    /// Heterogeneous instance templates, which carve replicas out of the default template.
    #[serde(default)]
    pub instances: Vec<InstanceTemplate>,

    /// Instance names taken offline; their ordinals are skipped.
    #[serde(default)]
    pub offline_instances: Vec<String>,

    #[serde(default)]
    pub volume_claim_templates: Vec<PersistentVolumeClaimTemplate>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplate {
    pub name: String,
    pub replicas: Option<i32>,
}

impl InstanceTemplate {
    pub fn get_replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimTemplate {
    pub name: String,
    pub spec: PersistentVolumeClaimSpec,
}

impl PersistentVolumeClaimTemplate {
    /// The requested storage size
    pub fn storage(&self) -> Option<&Quantity> {
        self.spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
    }

    pub fn set_storage(&mut self, storage: Quantity) {
        self.spec
            .resources
            .get_or_insert_with(Default::default)
            .requests
            .get_or_insert_with(Default::default)
            .insert("storage".into(), storage);
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSharding {
    pub name: String,
    pub shards: i32,

    /// Template every shard component is created from.
    pub template: ClusterComponentSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub phase: Option<ClusterPhase>,

    #[serde(default)]
    pub components: BTreeMap<String, ClusterComponentStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentStatus {
    pub phase: Option<ComponentPhase>,

    /// Messages about objects of the component, keyed by `Kind/name`.
    #[serde(default)]
    pub message: BTreeMap<String, String>,
}

impl ClusterComponentStatus {
    pub fn object_message(&self, kind: &str, name: &str) -> String {
        self.message
            .get(&format!("{kind}/{name}"))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    Creating,
    Running,
    Updating,
    Stopping,
    Stopped,
    Deleting,
    Failed,
    Abnormal,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ComponentPhase {
    Creating,
    Running,
    Updating,
    Starting,
    Stopping,
    Stopped,
    Deleting,
    Failed,
    Abnormal,
}

impl Cluster {
    pub fn component_spec(&self, name: &str) -> Option<&ClusterComponentSpec> {
        self.spec.component_specs.iter().find(|c| c.name == name)
    }

    pub fn sharding(&self, name: &str) -> Option<&ClusterSharding> {
        self.spec.shardings.iter().find(|s| s.name == name)
    }
}
