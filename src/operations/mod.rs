//! Day-2 operations against a cluster.
//!
//! Every operation type is registered in the [`OpsManager`] table with a handler that
//! changes the cluster (`action`) and then reports progress (`reconcile_action`) until it
//! reaches a terminal phase. Progress rows are computed by the helpers in [`progress`].

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    constant::{APP_INSTANCE_LABEL_KEY, KB_APP_COMPONENT_LABEL_KEY, KB_APP_SHARDING_NAME_LABEL_KEY},
    events::EventBuffer,
    resources::{
        Cluster, ClusterComponentSpec, Component, ComponentDefinition, ComponentOps, OpsPhase,
        OpsRequest, OpsRequestComponentStatus, OpsRequestStatus, OpsType, ProgressStatus,
    },
    store::ObjectStore,
    Error, Result,
};

mod horizontal_scaling;
pub mod progress;
mod reconfigure;
mod restart;
mod volume_expansion;

pub use horizontal_scaling::HorizontalScalingHandler;
pub use reconfigure::ReconfigureHandler;
pub use restart::RestartHandler;
pub use volume_expansion::VolumeExpansionHandler;

/// The objects an operation works on during one reconcile pass
pub struct OpsResource {
    pub cluster: Cluster,
    pub ops_request: OpsRequest,
    /// Events to publish once the status is written
    pub events: EventBuffer,
    pub now: DateTime<Utc>,
}

impl OpsResource {
    pub fn new(cluster: Cluster, ops_request: OpsRequest, now: DateTime<Utc>) -> Self {
        Self {
            cluster,
            ops_request,
            events: EventBuffer::default(),
            now,
        }
    }

    pub fn namespace(&self) -> String {
        self.ops_request.namespace().unwrap_or_default()
    }

    pub fn component_ops(&self) -> BTreeMap<String, ComponentOps> {
        self.ops_request.spec.component_ops()
    }

    pub fn status_mut(&mut self) -> &mut OpsRequestStatus {
        self.ops_request.status.get_or_insert_with(Default::default)
    }

    /// Detach the status of a component so it can be updated next to the resource
    pub fn take_component_status(&mut self, name: &str) -> OpsRequestComponentStatus {
        self.status_mut().components.remove(name).unwrap_or_default()
    }

    pub fn put_component_status(&mut self, name: &str, status: OpsRequestComponentStatus) {
        self.status_mut().components.insert(name.to_string(), status);
    }

    fn has_failed_rows(&self) -> bool {
        self.ops_request
            .status
            .iter()
            .flat_map(|s| s.components.values())
            .flat_map(|c| c.progress_details.iter())
            .any(|d| d.status == ProgressStatus::Failed)
    }
}

/// Where a pass left the operation
#[derive(Clone, Debug, PartialEq)]
pub struct OpsOutcome {
    pub phase: OpsPhase,
    /// Check again after this delay instead of the default interval
    pub requeue_after: Option<Duration>,
    pub message: Option<String>,
}

impl OpsOutcome {
    pub fn running(requeue_after: Option<Duration>) -> Self {
        Self {
            phase: OpsPhase::Running,
            requeue_after,
            message: None,
        }
    }

    pub fn succeed() -> Self {
        Self {
            phase: OpsPhase::Succeed,
            requeue_after: None,
            message: None,
        }
    }

    pub fn failed(message: Option<String>) -> Self {
        Self {
            phase: OpsPhase::Failed,
            requeue_after: None,
            message,
        }
    }

    fn with_phase(phase: OpsPhase) -> Self {
        Self {
            phase,
            requeue_after: None,
            message: None,
        }
    }

    /// Succeed or Failed once everything completed, Running before
    fn from_progress(res: &OpsResource, expected: i32, completed: i32) -> Self {
        if completed < expected {
            return Self::running(None);
        }
        if res.has_failed_rows() {
            return Self::failed(None);
        }
        Self::succeed()
    }
}

#[async_trait]
pub trait OpsHandler<S: ObjectStore>: Send + Sync {
    /// Change the cluster as the operation requests
    async fn action(&self, cli: &S, res: &mut OpsResource) -> Result<()>;

    /// Compute progress, persist it and report the phase the operation is in
    async fn reconcile_action(&self, cli: &S, res: &mut OpsResource) -> Result<OpsOutcome>;

    /// Record what `action` is about to change; already recorded components are kept
    fn save_last_configuration(&self, res: &mut OpsResource);

    /// Roll the cluster back to the last configuration
    async fn cancel(&self, _cli: &S, _res: &mut OpsResource) -> Result<()> {
        Ok(())
    }
}

pub struct OpsBehaviour<S> {
    pub handler: Box<dyn OpsHandler<S>>,
    pub cancellable: bool,
    /// Only operations of the same type queue this one
    pub queue_by_self: bool,
}

/// The table of supported operation types
pub struct OpsManager<S> {
    behaviours: BTreeMap<OpsType, OpsBehaviour<S>>,
}

impl<S: ObjectStore + 'static> Default for OpsManager<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ObjectStore + 'static> OpsManager<S> {
    pub fn new() -> Self {
        let mut behaviours = BTreeMap::new();
        behaviours.insert(
            OpsType::HorizontalScaling,
            OpsBehaviour {
                handler: Box::new(HorizontalScalingHandler) as Box<dyn OpsHandler<S>>,
                cancellable: true,
                queue_by_self: false,
            },
        );
        behaviours.insert(
            OpsType::VolumeExpansion,
            OpsBehaviour {
                handler: Box::new(VolumeExpansionHandler),
                cancellable: false,
                queue_by_self: true,
            },
        );
        behaviours.insert(
            OpsType::Restart,
            OpsBehaviour {
                handler: Box::new(RestartHandler),
                cancellable: true,
                queue_by_self: false,
            },
        );
        behaviours.insert(
            OpsType::Reconfiguring,
            OpsBehaviour {
                handler: Box::new(ReconfigureHandler),
                cancellable: false,
                queue_by_self: true,
            },
        );
        Self { behaviours }
    }

    pub fn behaviour(&self, ops_type: OpsType) -> Option<&OpsBehaviour<S>> {
        self.behaviours.get(&ops_type)
    }

    /// Another running operation of the cluster this one has to wait for
    async fn blocking_ops(&self, cli: &S, res: &OpsResource, queue_by_self: bool) -> Result<Option<String>> {
        let ops = &res.ops_request;
        let others: Vec<OpsRequest> = cli.list(&res.namespace(), &BTreeMap::new()).await?;
        Ok(others
            .into_iter()
            .filter(|o| o.name_any() != ops.name_any())
            .filter(|o| o.spec.cluster_name == ops.spec.cluster_name)
            .filter(|o| matches!(o.phase(), OpsPhase::Running | OpsPhase::Cancelling))
            .find(|o| !queue_by_self || o.spec.type_ == ops.spec.type_)
            .map(|o| o.name_any()))
    }

    /// Mark an operation failed before it started, e.g. when its cluster does not exist
    pub async fn reject(&self, cli: &S, res: &mut OpsResource, message: String) -> Result<OpsOutcome> {
        let before = res.ops_request.clone();
        self.finish(res, OpsPhase::Failed, Some(message));
        progress::patch_ops_request_status(cli, &before, &res.ops_request).await?;
        Ok(OpsOutcome::failed(res.ops_request.status.as_ref().and_then(|s| s.message.clone())))
    }

    fn finish(&self, res: &mut OpsResource, phase: OpsPhase, message: Option<String>) {
        let now = res.now;
        let name = res.ops_request.name_any();
        let phase = match (res.ops_request.phase(), phase) {
            (OpsPhase::Cancelling, OpsPhase::Succeed) => OpsPhase::Cancelled,
            (_, phase) => phase,
        };
        let status = res.status_mut();
        status.phase = Some(phase);
        status.completion_timestamp = Some(Time(now));
        if message.is_some() {
            status.message = message.clone();
        }
        let note = message.unwrap_or_else(|| format!("OpsRequest {name} is {phase:?}"));
        match phase {
            OpsPhase::Failed => res.events.warning("Failed", note),
            OpsPhase::Cancelled => res.events.normal("Cancelled", note),
            _ => res.events.normal("Succeed", note),
        }
        info!(ops = %name, ?phase, "operation finished");
    }

    /// Drive the operation one step: start it, cancel it, or follow its progress
    pub async fn reconcile(&self, cli: &S, res: &mut OpsResource) -> Result<OpsOutcome> {
        let phase = res.ops_request.phase();
        if phase.is_terminal() {
            return Ok(OpsOutcome::with_phase(phase));
        }
        let ops_type = res.ops_request.spec.type_;
        let behaviour = self.behaviour(ops_type).ok_or_else(|| {
            Error::IllegalObject("OpsRequest".into(), format!("unsupported type {ops_type:?}"))
        })?;
        let now = res.now;

        match phase {
            OpsPhase::Pending => {
                if let Some(blocker) = self.blocking_ops(cli, res, behaviour.queue_by_self).await? {
                    debug!(ops = %res.ops_request.name_any(), %blocker, "waiting for running operation");
                    return Ok(OpsOutcome::with_phase(OpsPhase::Pending));
                }
                let before = res.ops_request.clone();
                behaviour.handler.save_last_configuration(res);
                progress::patch_ops_request_status(cli, &before, &res.ops_request).await?;

                let before = res.ops_request.clone();
                if let Err(e) = behaviour.handler.action(cli, res).await {
                    return match e {
                        Error::IllegalObject(..) | Error::NotFound { .. } | Error::ConfigParse { .. } => {
                            self.reject(cli, res, e.to_string()).await
                        }
                        e => Err(e),
                    };
                }
                let status = res.status_mut();
                status.phase = Some(OpsPhase::Running);
                status.start_timestamp = Some(Time(now));
                res.events.normal(
                    "Running",
                    format!("Start to process {ops_type:?} OpsRequest"),
                );
                progress::patch_ops_request_status(cli, &before, &res.ops_request).await?;
                info!(ops = %res.ops_request.name_any(), ?ops_type, "operation started");
                Ok(OpsOutcome::running(None))
            }
            OpsPhase::Running if res.ops_request.spec.cancel && behaviour.cancellable => {
                let before = res.ops_request.clone();
                behaviour.handler.cancel(cli, res).await?;
                let status = res.status_mut();
                status.phase = Some(OpsPhase::Cancelling);
                status.cancel_timestamp = Some(Time(now));
                res.events.normal(
                    "Cancelling",
                    format!("Start to cancel {ops_type:?} OpsRequest"),
                );
                progress::patch_ops_request_status(cli, &before, &res.ops_request).await?;
                Ok(OpsOutcome::with_phase(OpsPhase::Cancelling))
            }
            _ => {
                if res.ops_request.spec.cancel && !behaviour.cancellable {
                    warn!(ops = %res.ops_request.name_any(), ?ops_type, "operation cannot be cancelled");
                }
                let mut outcome = behaviour.handler.reconcile_action(cli, res).await?;
                if !outcome.phase.is_terminal() {
                    outcome.phase = res.ops_request.phase();
                    return Ok(outcome);
                }
                let synced = res.ops_request.clone();
                self.finish(res, outcome.phase, outcome.message.clone());
                progress::patch_ops_request_status(cli, &synced, &res.ops_request).await?;
                outcome.phase = res.ops_request.phase();
                Ok(outcome)
            }
        }
    }
}

/// Labels selecting the objects of one component
pub(crate) fn component_labels(cluster: &str, full_component_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_INSTANCE_LABEL_KEY.to_string(), cluster.to_string()),
        (KB_APP_COMPONENT_LABEL_KEY.to_string(), full_component_name.to_string()),
    ])
}

/// Shard components of a sharding, sorted by name
pub(crate) async fn sharding_components<S: ObjectStore>(
    cli: &S,
    res: &OpsResource,
    sharding: &str,
) -> Result<Vec<Component>> {
    let labels = BTreeMap::from([
        (APP_INSTANCE_LABEL_KEY.to_string(), res.cluster.name_any()),
        (KB_APP_SHARDING_NAME_LABEL_KEY.to_string(), sharding.to_string()),
    ]);
    let mut comps: Vec<Component> = cli.list(&res.namespace(), &labels).await?;
    comps.sort_by_key(|c| c.name_any());
    Ok(comps)
}

/// Name of a shard component without the cluster prefix
fn full_component_name(cluster: &str, comp: &Component) -> String {
    comp.labels()
        .get(KB_APP_COMPONENT_LABEL_KEY)
        .cloned()
        .unwrap_or_else(|| {
            let name = comp.name_any();
            name.strip_prefix(&format!("{cluster}-"))
                .map(String::from)
                .unwrap_or(name)
        })
}

/// One component object an operation applies to
#[derive(Clone, Debug)]
pub struct ComponentTarget {
    /// Component or sharding name used in the OpsRequest
    pub ops_name: String,
    pub spec: ClusterComponentSpec,
    pub full_component_name: String,
}

/// Resolve every component of the operation; shardings expand to their shard components
pub(crate) async fn component_targets<S: ObjectStore>(
    cli: &S,
    res: &OpsResource,
) -> Result<Vec<ComponentTarget>> {
    let cluster = res.cluster.name_any();
    let mut targets = vec![];
    for name in res.component_ops().into_keys() {
        if let Some(spec) = res.cluster.component_spec(&name) {
            targets.push(ComponentTarget {
                ops_name: name.clone(),
                spec: spec.clone(),
                full_component_name: name,
            });
            continue;
        }
        let Some(sharding) = res.cluster.sharding(&name) else {
            return Err(Error::IllegalObject(
                "OpsRequest".into(),
                format!("component {name} not found in cluster {cluster}"),
            ));
        };
        let mut spec = sharding.template.clone();
        spec.name = name.clone();
        for comp in sharding_components(cli, res, &name).await? {
            targets.push(ComponentTarget {
                ops_name: name.clone(),
                spec: spec.clone(),
                full_component_name: full_component_name(&cluster, &comp),
            });
        }
    }
    Ok(targets)
}

/// Whether pods of the definition report roles
pub(crate) async fn component_has_roles<S: ObjectStore>(cli: &S, component_def: &str) -> Result<bool> {
    if component_def.is_empty() {
        return Ok(false);
    }
    match cli.get_cluster::<ComponentDefinition>(component_def).await {
        Ok(def) => Ok(!def.spec.roles.is_empty()),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Write the component and sharding specs of the cluster
pub(crate) async fn update_cluster_spec<S: ObjectStore>(cli: &S, cluster: &Cluster) -> Result<()> {
    let patch = json!({
        "spec": {
            "componentSpecs": cluster.spec.component_specs,
            "shardings": cluster.spec.shardings,
        }
    });
    cli.merge_patch::<Cluster>(
        &cluster.namespace().unwrap_or_default(),
        &cluster.name_any(),
        &patch,
    )
    .await
}

/// The spec of a component or sharding template of the cluster, by name
pub(crate) fn component_spec_mut<'a>(
    cluster: &'a mut Cluster,
    name: &str,
) -> Option<&'a mut ClusterComponentSpec> {
    if let Some(i) = cluster.spec.component_specs.iter().position(|c| c.name == name) {
        return cluster.spec.component_specs.get_mut(i);
    }
    cluster
        .spec
        .shardings
        .iter_mut()
        .find(|s| s.name == name)
        .map(|s| &mut s.template)
}
