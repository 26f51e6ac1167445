use k8s_openapi::api::core::v1::EnvVar;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ComponentPhase, ReplicaRole};

/// A component instance owned by a cluster
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Component",
    group = "apps.kubeblocks.io",
    version = "v1",
    status = "ComponentStatus",
    derive = "Default",
    namespaced,
    printcolumn = r#"{ "name": "definition", "type": "string", "description": "component definition", "jsonPath": ".spec.compDef" }"#,
    printcolumn = r#"{ "name": "status", "type": "string", "description": "component phase", "jsonPath": ".status.phase" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    pub comp_def: String,
    pub replicas: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub phase: Option<ComponentPhase>,
    pub message: Option<String>,
}

/// The blueprint components are created from
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "ComponentDefinition",
    group = "apps.kubeblocks.io",
    version = "v1",
    derive = "Default",
    shortname = "cmpd"
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinitionSpec {
    #[serde(default)]
    pub roles: Vec<ReplicaRole>,

    #[serde(default)]
    pub lifecycle_actions: ComponentLifecycleActions,

    /// Config file templates rendered into ConfigMaps per component.
    #[serde(default)]
    pub configs: Vec<ComponentFileTemplate>,
}

/// Hooks executed through the remote agent
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentLifecycleActions {
    pub post_provision: Option<Action>,
    pub pre_terminate: Option<Action>,
    pub role_probe: Option<Probe>,
    pub switchover: Option<Action>,
    pub member_join: Option<Action>,
    pub member_leave: Option<Action>,
    pub reconfigure: Option<Action>,
    pub account_provision: Option<Action>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub exec: Option<ExecAction>,
    pub timeout_seconds: Option<i32>,
    pub retry_policy: Option<RetryPolicy>,
    pub pre_condition: Option<PreConditionType>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecAction {
    pub image: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    pub target_pod_selector: Option<TargetPodSelector>,

    /// Role name the `Role` selector matches against.
    pub matching_key: Option<String>,
    pub container: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: i32,

    /// Milliseconds between two attempts.
    #[serde(default)]
    pub retry_interval: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    #[serde(flatten)]
    pub action: Action,
    #[serde(default)]
    pub initial_delay_seconds: i32,
    #[serde(default)]
    pub period_seconds: i32,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum TargetPodSelector {
    Any,
    All,
    Role,
    Ordinal,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum PreConditionType {
    Immediately,
    RuntimeReady,
    ComponentReady,
    ClusterReady,
}

/// A config file template of a component definition
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentFileTemplate {
    pub name: String,
    pub template: Option<String>,
    pub namespace: Option<String>,
    pub volume_name: Option<String>,

    /// Any change to a file of this template restarts the component.
    pub restart_on_file_change: Option<bool>,
}

impl ComponentDefinition {
    pub fn config_template(&self, name: &str) -> Option<&ComponentFileTemplate> {
        self.spec.configs.iter().find(|c| c.name == name)
    }
}
