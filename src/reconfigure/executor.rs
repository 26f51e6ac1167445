use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{ExecStatus, ReconcileContext, ReturnedStatus};
use crate::{
    configuration::ConfigPatch,
    lifecycle::{Kbagent, Lifecycle},
    resources::InstanceSet,
    store::ObjectStore,
    workload::is_pod_available,
};

const CONFIG_FILE_NAME_PARAMETER: &str = "KB_CONFIG_FILE_NAME";

/// One step of applying a configuration change
#[derive(Clone, Debug)]
pub enum ReloadTask {
    /// The change needs no action on the running component
    NoOp,
    /// Push the changed parameters into one pod through the reconfigure action
    Dynamic(DynamicReloadTask),
    /// Roll the workloads of the component
    Restart(RestartTask),
}

#[derive(Clone, Debug)]
pub struct DynamicReloadTask {
    pub pod: Pod,
    /// The part of the change this pod has to apply
    pub patch: ConfigPatch,
}

#[derive(Clone, Debug)]
pub struct RestartTask {
    /// InstanceSets to roll
    pub workloads: Vec<String>,
    /// Pod template annotation whose change triggers the rollout
    pub annotation_key: String,
    pub revision: String,
}

impl ReloadTask {
    pub fn reload_type(&self) -> &'static str {
        match self {
            ReloadTask::NoOp => "none",
            ReloadTask::Dynamic(_) => "dynamicReload",
            ReloadTask::Restart(_) => "restart",
        }
    }

    pub async fn exec<S: ObjectStore>(&self, rctx: &ReconcileContext<'_, S>) -> ReturnedStatus {
        match self {
            ReloadTask::NoOp => ReturnedStatus::new(ExecStatus::None),
            ReloadTask::Dynamic(task) => task.exec(rctx).await,
            ReloadTask::Restart(task) => task.exec(rctx).await,
        }
    }
}

impl DynamicReloadTask {
    async fn exec<S: ObjectStore>(&self, rctx: &ReconcileContext<'_, S>) -> ReturnedStatus {
        let agent = Kbagent::new(
            &rctx.namespace,
            &rctx.cluster_name,
            &rctx.comp_name,
            rctx.component_def.spec.lifecycle_actions.clone(),
            rctx.agents.clone(),
        )
        .with_pods(rctx.pods.clone())
        .with_pod(self.pod.clone());

        for (file, mut args) in self.patch.reload_parameters() {
            args.insert(CONFIG_FILE_NAME_PARAMETER.to_string(), file.clone());
            if let Err(e) = agent.reconfigure(rctx.cli, None, args).await {
                warn!(pod = %self.pod.name_any(), file, "dynamic reload failed: {e}");
                return ReturnedStatus::new(ExecStatus::from(&e))
                    .with_counts(0, 1)
                    .with_message(e.to_string());
            }
        }
        info!(pod = %self.pod.name_any(), "dynamic reload applied");
        ReturnedStatus::new(ExecStatus::None).with_counts(1, 1)
    }
}

/// Whether `pod` is one of the ordinal instances `<workload>-<n>` of `workload`
fn is_instance_of(pod: &str, workload: &str) -> bool {
    pod.strip_prefix(workload)
        .and_then(|rest| rest.strip_prefix('-'))
        .map_or(false, |ordinal| {
            !ordinal.is_empty() && ordinal.bytes().all(|b| b.is_ascii_digit())
        })
}

impl RestartTask {
    fn instance_sets<'a, S>(&self, rctx: &'a ReconcileContext<'_, S>) -> Vec<&'a InstanceSet> {
        rctx.instance_sets
            .iter()
            .filter(|its| self.workloads.contains(&its.name_any()))
            .collect()
    }

    /// Pods of the workload that run the new revision and are available
    fn rolled_pods<S>(&self, rctx: &ReconcileContext<'_, S>, its: &InstanceSet) -> i32 {
        let workload = its.name_any();
        rctx.pods
            .iter()
            .filter(|p| is_instance_of(&p.name_any(), &workload))
            .filter(|p| p.annotations().get(&self.annotation_key) == Some(&self.revision))
            .filter(|p| is_pod_available(p, its.spec.min_ready_seconds, rctx.now))
            .count() as i32
    }

    async fn exec<S: ObjectStore>(&self, rctx: &ReconcileContext<'_, S>) -> ReturnedStatus {
        let workloads = self.instance_sets(rctx);
        let expected: i32 = workloads
            .iter()
            .map(|its| its.spec.replicas.unwrap_or(1))
            .sum();

        let mut patched = false;
        for its in &workloads {
            if its.template_annotation(&self.annotation_key) == Some(self.revision.as_str()) {
                continue;
            }
            let mut annotations = Map::new();
            annotations.insert(self.annotation_key.clone(), Value::from(self.revision.as_str()));
            let patch = json!({
                "spec": {"template": {"metadata": {"annotations": annotations}}}
            });
            if let Err(e) = rctx
                .cli
                .merge_patch::<InstanceSet>(&rctx.namespace, &its.name_any(), &patch)
                .await
            {
                warn!(workload = %its.name_any(), "failed to roll workload: {e}");
                return ReturnedStatus::new(ExecStatus::FailedAndRetry)
                    .with_counts(0, expected)
                    .with_message(e.to_string());
            }
            info!(workload = %its.name_any(), revision = %self.revision, "rolling workload");
            patched = true;
        }
        if patched {
            return ReturnedStatus::new(ExecStatus::Retry).with_counts(0, expected);
        }

        let succeed: i32 = workloads
            .iter()
            .map(|its| self.rolled_pods(rctx, its))
            .sum();
        let status = if succeed >= expected {
            ExecStatus::None
        } else {
            ExecStatus::Retry
        };
        ReturnedStatus::new(status).with_counts(succeed.min(expected), expected)
    }
}
