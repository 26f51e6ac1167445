//! Applying a changed configuration to the running component: which reload is needed,
//! executing it, and tracking the outcome in the ComponentParameter status.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use sha2::{Digest, Sha256};

use crate::{
    lifecycle::{AgentClientFactory, LifecycleError},
    resources::{
        ComponentDefinition, ComponentFileTemplate, InstanceSet, ParamConfigRendererSpec,
        ParameterPhase, ParametersDefinition,
    },
};

mod executor;
mod planner;
mod status;

pub use executor::{DynamicReloadTask, ReloadTask, RestartTask};
pub use planner::gen_reconfigure_action_tasks;
pub use status::{config_item_status, update_config_phase};

/// Outcome of executing one reload task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecStatus {
    /// Applied, nothing left to do
    None,
    /// Not done yet, run again later
    Retry,
    /// Retrying cannot help
    Failed,
    /// Failed this time, a later attempt may succeed
    FailedAndRetry,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::None => "none",
            ExecStatus::Retry => "retry",
            ExecStatus::Failed => "failed",
            ExecStatus::FailedAndRetry => "failedAndRetry",
        }
    }
}

impl From<&LifecycleError> for ExecStatus {
    fn from(e: &LifecycleError) -> Self {
        if e.is_retryable() {
            ExecStatus::Retry
        } else if e.is_fatal() {
            ExecStatus::Failed
        } else {
            ExecStatus::FailedAndRetry
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReturnedStatus {
    pub status: ExecStatus,
    pub succeed_count: i32,
    pub expected_count: i32,
    pub message: Option<String>,
}

impl ReturnedStatus {
    pub fn new(status: ExecStatus) -> Self {
        Self {
            status,
            succeed_count: 0,
            expected_count: 0,
            message: None,
        }
    }

    pub fn with_counts(mut self, succeed: i32, expected: i32) -> Self {
        self.succeed_count = succeed;
        self.expected_count = expected;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Phase the config item moves to after an executor reported `status`
pub fn transition(status: ExecStatus) -> ParameterPhase {
    match status {
        ExecStatus::None => ParameterPhase::Finished,
        ExecStatus::Retry => ParameterPhase::Upgrading,
        ExecStatus::FailedAndRetry => ParameterPhase::Failed,
        ExecStatus::Failed => ParameterPhase::FailedAndPause,
    }
}

/// The revision a ConfigMap is reconciled at, changes with every edit of its data
pub fn config_revision(cm: &ConfigMap) -> String {
    data_revision(cm.data.as_ref().unwrap_or(&BTreeMap::new()))
}

pub fn data_revision(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (file, content) in data {
        hasher.update(file.as_bytes());
        hasher.update([0]);
        hasher.update(content.as_bytes());
        hasher.update([0]);
    }
    hex::encode(&hasher.finalize()[..8])
}

/// Everything the planner and the executors need about one component
pub struct ReconcileContext<'a, S> {
    pub cli: &'a S,
    pub agents: Arc<dyn AgentClientFactory>,
    pub namespace: String,
    pub cluster_name: String,
    pub comp_name: String,
    pub config_map: ConfigMap,
    pub component_def: ComponentDefinition,
    pub config_spec: ComponentFileTemplate,
    pub renderer: Option<ParamConfigRendererSpec>,
    pub parameters_defs: Vec<ParametersDefinition>,
    pub instance_sets: Vec<InstanceSet>,
    pub pods: Vec<Pod>,
    pub now: DateTime<Utc>,
}
