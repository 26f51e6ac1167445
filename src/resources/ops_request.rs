use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ComponentPhase;

/// A day-2 operation against a cluster
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "OpsRequest",
    group = "operations.kubeblocks.io",
    version = "v1alpha1",
    status = "OpsRequestStatus",
    derive = "Default",
    namespaced,
    shortname = "ops",
    printcolumn = r#"{ "name": "type", "type": "string", "description": "operation type", "jsonPath": ".spec.type" }"#,
    printcolumn = r#"{ "name": "cluster", "type": "string", "description": "target cluster", "jsonPath": ".spec.clusterName" }"#,
    printcolumn = r#"{ "name": "status", "type": "string", "description": "operation phase", "jsonPath": ".status.phase" }"#,
    printcolumn = r#"{ "name": "progress", "type": "string", "description": "completed/expected", "jsonPath": ".status.progress" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestSpec {
    pub cluster_name: String,

    #[serde(rename = "type")]
    pub type_: OpsType,

    /// Cancel a running operation, rolling back what can be rolled back.
    #[serde(default)]
    pub cancel: bool,

    #[serde(default)]
    pub horizontal_scaling: Vec<HorizontalScaling>,

    #[serde(default)]
    pub volume_expansion: Vec<VolumeExpansion>,

    #[serde(default)]
    pub restart: Vec<ComponentOpsTarget>,

    #[serde(default)]
    pub reconfigures: Vec<Reconfigure>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpsType {
    #[default]
    HorizontalScaling,
    VolumeExpansion,
    Restart,
    Reconfiguring,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentOpsTarget {
    /// A component or sharding name of the cluster.
    pub component_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScaling {
    pub component_name: String,

    /// Target replicas of the component.
    pub replicas: Option<i32>,

    /// Target shard count when the component is a sharding.
    pub shards: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeExpansion {
    pub component_name: String,
    pub volume_claim_templates: Vec<OpsRequestVolumeClaimTemplate>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestVolumeClaimTemplate {
    pub name: String,
    pub storage: Quantity,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reconfigure {
    pub component_name: String,

    /// Config template whose rendered ConfigMap is changed.
    pub config_spec: String,

    /// The file of the ConfigMap the parameters belong to.
    pub file_name: String,

    pub parameters: Vec<ParameterPair>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterPair {
    pub key: String,

    /// New value, or nothing to remove the parameter.
    pub value: Option<String>,
}

/// The per-component payload of an operation
#[derive(Clone, Debug, PartialEq)]
pub enum ComponentOps {
    HorizontalScaling(HorizontalScaling),
    VolumeExpansion(VolumeExpansion),
    Restart(ComponentOpsTarget),
    Reconfigure(Reconfigure),
}

impl ComponentOps {
    pub fn component_name(&self) -> &str {
        match self {
            ComponentOps::HorizontalScaling(h) => &h.component_name,
            ComponentOps::VolumeExpansion(v) => &v.component_name,
            ComponentOps::Restart(r) => &r.component_name,
            ComponentOps::Reconfigure(r) => &r.component_name,
        }
    }
}

impl OpsRequestSpec {
    /// Component payloads of this operation's type, keyed by component name
    pub fn component_ops(&self) -> BTreeMap<String, ComponentOps> {
        let ops: Vec<ComponentOps> = match self.type_ {
            OpsType::HorizontalScaling => self
                .horizontal_scaling
                .iter()
                .cloned()
                .map(ComponentOps::HorizontalScaling)
                .collect(),
            OpsType::VolumeExpansion => self
                .volume_expansion
                .iter()
                .cloned()
                .map(ComponentOps::VolumeExpansion)
                .collect(),
            OpsType::Restart => self
                .restart
                .iter()
                .cloned()
                .map(ComponentOps::Restart)
                .collect(),
            OpsType::Reconfiguring => self
                .reconfigures
                .iter()
                .cloned()
                .map(ComponentOps::Reconfigure)
                .collect(),
        };
        ops.into_iter()
            .map(|o| (o.component_name().to_string(), o))
            .collect()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestStatus {
    pub phase: Option<OpsPhase>,

    /// Completed and expected progress as `completed/expected`.
    #[serde(default)]
    pub progress: String,

    pub start_timestamp: Option<Time>,
    pub cancel_timestamp: Option<Time>,
    pub completion_timestamp: Option<Time>,

    #[serde(default)]
    pub components: BTreeMap<String, OpsRequestComponentStatus>,

    #[serde(default)]
    pub last_configuration: LastConfiguration,

    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum OpsPhase {
    Pending,
    Running,
    Cancelling,
    Succeed,
    Cancelled,
    Failed,
}

impl OpsPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OpsPhase::Succeed | OpsPhase::Cancelled | OpsPhase::Failed)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestComponentStatus {
    pub phase: Option<ComponentPhase>,

    #[serde(default)]
    pub progress_details: Vec<ProgressStatusDetail>,
}

/// Progress of one object touched by an operation
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStatusDetail {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,

    /// `Kind/name` of the object, the identity of the row when present.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub object_key: String,

    /// Identity of the row when no object key is set.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_tasks: Vec<ActionTask>,

    pub status: ProgressStatus,

    #[serde(default)]
    pub message: String,

    pub start_time: Option<Time>,
    pub end_time: Option<Time>,
}

impl ProgressStatusDetail {
    /// Whether `new` updates this row: by object key, or by action name when `new` has no key
    pub fn same_identity(&self, new: &ProgressStatusDetail) -> bool {
        if new.object_key.is_empty() {
            return self.action_name == new.action_name;
        }
        self.object_key == new.object_key
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionTask {
    pub object_key: String,
    pub namespace: String,
    pub status: ActionTaskStatus,
    pub target_pod_name: Option<String>,
    #[serde(default)]
    pub retries: i32,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ActionTaskStatus {
    #[default]
    Processing,
    Failed,
    Succeed,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ProgressStatus {
    #[default]
    Pending,
    Processing,
    Succeed,
    Failed,
}

impl ProgressStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, ProgressStatus::Succeed | ProgressStatus::Failed)
    }
}

/// Component settings captured before an operation changed them
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastConfiguration {
    #[serde(default)]
    pub components: BTreeMap<String, LastComponentConfiguration>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastComponentConfiguration {
    pub replicas: Option<i32>,
    pub shards: Option<i32>,

    #[serde(default)]
    pub volume_claim_templates: Vec<OpsRequestVolumeClaimTemplate>,
}

impl OpsRequest {
    pub fn phase(&self) -> OpsPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or(OpsPhase::Pending)
    }

    pub fn start_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.status
            .as_ref()
            .and_then(|s| s.start_timestamp.as_ref())
            .map(|t| t.0)
    }

    pub fn cancel_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.status
            .as_ref()
            .and_then(|s| s.cancel_timestamp.as_ref())
            .map(|t| t.0)
    }

    pub fn is_cancelling(&self) -> bool {
        self.phase() == OpsPhase::Cancelling
    }
}
