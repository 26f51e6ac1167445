//! Per-object progress of an operation.
//!
//! Each handler classifies the objects it touches (pods, volumes, shard components) into
//! progress rows of the OpsRequest component status. Rows are merged with
//! [`set_component_status_progress_detail`], which never lets a failed row regress and
//! emits one event per visible change.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use k8s_openapi::{api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::Time};
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use super::{component_labels, OpsResource};
use crate::{
    constant::{
        generate_workload_name_pattern, progress_object_key, APP_INSTANCE_LABEL_KEY,
        COMPONENT_KIND, KB_APP_SHARDING_NAME_LABEL_KEY, POD_KIND,
    },
    events::EventBuffer,
    resources::{
        ClusterComponentSpec, Component, ComponentPhase, InstanceSet, OpsRequest,
        OpsRequestComponentStatus, ProgressStatus, ProgressStatusDetail,
        INSTANCE_AVAILABLE_CONDITION, INSTANCE_FAILURE_CONDITION, INSTANCE_READY_CONDITION,
    },
    store::ObjectStore,
    workload::{is_pod_available, is_pod_deleting, is_pod_failed_and_timed_out, pod_created_at, pod_is_ready_with_label},
    Result,
};

/// Whether the operation has been applied to the pod
pub type PodApplyOps = fn(&OpsRequest, &Pod, &ProgressResource) -> bool;

/// Scope of one component while its progress is computed
#[derive(Clone, Debug, Default)]
pub struct ProgressResource {
    /// Verb used in progress messages, e.g. `restart`
    pub ops_message_key: String,
    pub component: ClusterComponentSpec,

    /// Name of the component object, differs from the spec name for shards
    pub full_component_name: String,

    /// Availability requires the role label
    pub check_role: bool,
    pub min_ready_seconds: i32,

    /// Pods the operation updates; empty means every pod of the component
    pub updated_pod_set: BTreeSet<String>,
    pub created_pod_set: BTreeSet<String>,
    pub deleted_pod_set: BTreeSet<String>,

    pub shards: i32,
    pub last_shards: i32,
}

impl ProgressResource {
    pub fn new(ops_message_key: &str, component: ClusterComponentSpec, full_component_name: &str) -> Self {
        Self {
            ops_message_key: ops_message_key.to_string(),
            component,
            full_component_name: full_component_name.to_string(),
            ..Default::default()
        }
    }
}

fn event_reason(status: ProgressStatus) -> &'static str {
    match status {
        ProgressStatus::Succeed => "Succeed",
        ProgressStatus::Processing => "Processing",
        ProgressStatus::Failed => "Failed",
        ProgressStatus::Pending => "",
    }
}

fn send_progress_detail_event(events: &mut EventBuffer, detail: &ProgressStatusDetail) {
    match detail.status {
        ProgressStatus::Pending => {}
        ProgressStatus::Failed => events.warning(event_reason(detail.status), detail.message.clone()),
        status => events.normal(event_reason(status), detail.message.clone()),
    }
}

fn update_progress_detail_time(detail: &mut ProgressStatusDetail, now: DateTime<Utc>) {
    if detail.status == ProgressStatus::Processing && detail.start_time.is_none() {
        detail.start_time = Some(Time(now));
    }
    if detail.status.is_completed() && detail.end_time.is_none() {
        detail.end_time = Some(Time(now));
    }
}

/// Merge `new` into `details`
///
/// A row is identified by its object key, or by its action name when it has none. An
/// unchanged status and message is a no-op. A failed row only changes to succeeded.
pub fn set_component_status_progress_detail(
    events: &mut EventBuffer,
    details: &mut Vec<ProgressStatusDetail>,
    mut new: ProgressStatusDetail,
    now: DateTime<Utc>,
) {
    let Some(i) = details.iter().position(|d| d.same_identity(&new)) else {
        update_progress_detail_time(&mut new, now);
        send_progress_detail_event(events, &new);
        details.push(new);
        return;
    };
    let existing = &mut details[i];
    if existing.status == new.status && existing.message == new.message {
        return;
    }
    if existing.status == ProgressStatus::Failed && new.status != ProgressStatus::Succeed {
        return;
    }
    existing.status = new.status;
    existing.message = new.message.clone();
    existing.action_tasks = new.action_tasks.clone();
    update_progress_detail_time(existing, now);
    send_progress_detail_event(events, &new);
}

pub fn processing_message(key: &str, object_key: &str, component: &str) -> String {
    format!("Start to {key}: {object_key} in Component: {component}")
}

pub fn succeed_message(key: &str, object_key: &str, component: &str) -> String {
    format!("Successfully {key}: {object_key} in Component: {component}")
}

pub fn failed_message(key: &str, object_key: &str, component: &str, pod_message: &str) -> String {
    format!("Failed to {key}: {object_key} in Component: {component}, message: {pod_message}")
}

fn created_before(created: Option<DateTime<Utc>>, at: Option<DateTime<Utc>>) -> bool {
    matches!((created, at), (Some(c), Some(t)) if c < t)
}

/// The pod existed before `at` and is not being replaced
fn not_recreated_during_operation(at: Option<DateTime<Utc>>, pod: &Pod) -> bool {
    created_before(pod_created_at(pod), at) && !is_pod_deleting(pod)
}

fn pod_is_available(pg: &ProgressResource, pod: &Pod, now: DateTime<Utc>) -> bool {
    if pg.check_role {
        return pod_is_ready_with_label(pod);
    }
    is_pod_available(pod, pg.min_ready_seconds, now)
}

fn pod_processed_successful(
    pg: &ProgressResource,
    ops: &OpsRequest,
    pod: &Pod,
    now: DateTime<Utc>,
    pod_apply_ops: PodApplyOps,
) -> bool {
    !is_pod_deleting(pod) && pod_is_available(pg, pod, now) && pod_apply_ops(ops, pod, pg)
}

fn handle_succeed_progress_detail(
    res: &mut OpsResource,
    pg: &ProgressResource,
    comp_status: &mut OpsRequestComponentStatus,
    object_key: String,
) {
    let message = succeed_message(&pg.ops_message_key, &object_key, &pg.component.name);
    let detail = ProgressStatusDetail {
        object_key,
        status: ProgressStatus::Succeed,
        message,
        ..Default::default()
    };
    set_component_status_progress_detail(&mut res.events, &mut comp_status.progress_details, detail, res.now);
}

fn handle_pending_progress_detail(
    res: &mut OpsResource,
    comp_status: &mut OpsRequestComponentStatus,
    object_key: String,
) {
    let detail = ProgressStatusDetail {
        object_key,
        status: ProgressStatus::Pending,
        ..Default::default()
    };
    set_component_status_progress_detail(&mut res.events, &mut comp_status.progress_details, detail, res.now);
}

/// Returns 1 when the pod failed for good
fn handle_failed_or_processing_progress_detail(
    res: &mut OpsResource,
    pg: &ProgressResource,
    comp_status: &mut OpsRequestComponentStatus,
    object_key: String,
    pod: &Pod,
) -> i32 {
    let component = &pg.component.name;
    let (failed, timed_out, _) = is_pod_failed_and_timed_out(pod, res.now);
    let (status, message, completed) = if failed && timed_out {
        let pod_message = res
            .cluster
            .status
            .as_ref()
            .and_then(|s| s.components.get(component))
            .map(|c| c.object_message(POD_KIND, &pod.name_any()))
            .unwrap_or_default();
        (
            ProgressStatus::Failed,
            failed_message(&pg.ops_message_key, &object_key, component, &pod_message),
            1,
        )
    } else {
        (
            ProgressStatus::Processing,
            processing_message(&pg.ops_message_key, &object_key, component),
            0,
        )
    };
    let detail = ProgressStatusDetail {
        object_key,
        status,
        message,
        ..Default::default()
    };
    set_component_status_progress_detail(&mut res.events, &mut comp_status.progress_details, detail, res.now);
    completed
}

fn handle_progress_for_pods_rolling_update(
    res: &mut OpsResource,
    pods: &[Pod],
    pg: &ProgressResource,
    comp_status: &mut OpsRequestComponentStatus,
    pod_apply_ops: PodApplyOps,
) -> i32 {
    let start = res.ops_request.start_time();
    let mut completed = 0;
    for pod in pods {
        let object_key = progress_object_key(POD_KIND, &pod.name_any());
        if pod_processed_successful(pg, &res.ops_request, pod, res.now, pod_apply_ops) {
            completed += 1;
            handle_succeed_progress_detail(res, pg, comp_status, object_key);
            continue;
        }
        if not_recreated_during_operation(start, pod) && !pod_apply_ops(&res.ops_request, pod, pg) {
            handle_pending_progress_detail(res, comp_status, object_key);
            continue;
        }
        completed += handle_failed_or_processing_progress_detail(res, pg, comp_status, object_key, pod);
    }
    completed
}

fn handle_cancel_progress_for_pods_rolling_update(
    res: &mut OpsResource,
    pods: &[Pod],
    pg: &mut ProgressResource,
    comp_status: &mut OpsRequestComponentStatus,
    pod_apply_ops: PodApplyOps,
) -> i32 {
    comp_status
        .progress_details
        .retain(|d| d.status != ProgressStatus::Pending);
    pg.ops_message_key = format!("{} with rollback", pg.ops_message_key);

    let cancelled_at = res.ops_request.cancel_time();
    let mut completed = 0;
    for pod in pods {
        let object_key = progress_object_key(POD_KIND, &pod.name_any());
        if pod_processed_successful(pg, &res.ops_request, pod, res.now, pod_apply_ops) {
            completed += 1;
            handle_succeed_progress_detail(res, pg, comp_status, object_key);
            continue;
        }
        if not_recreated_during_operation(cancelled_at, pod) && !pod_apply_ops(&res.ops_request, pod, pg) {
            continue;
        }
        completed += handle_failed_or_processing_progress_detail(res, pg, comp_status, object_key, pod);
    }
    completed
}

/// Classify the pods of a component whose every pod is rolled by the operation
///
/// Returns `(expected, completed)`.
pub fn classify_component_pods(
    res: &mut OpsResource,
    pg: &mut ProgressResource,
    comp_status: &mut OpsRequestComponentStatus,
    pods: Vec<Pod>,
    pod_apply_ops: PodApplyOps,
) -> (i32, i32) {
    let mut expected = pg.component.replicas;
    let pods: Vec<Pod> = if pg.updated_pod_set.is_empty() {
        pods
    } else {
        expected = pg.updated_pod_set.len() as i32;
        pods.into_iter()
            .filter(|p| pg.updated_pod_set.contains(&p.name_any()))
            .collect()
    };

    let completed = if res.ops_request.is_cancelling() {
        let completed =
            handle_cancel_progress_for_pods_rolling_update(res, &pods, pg, comp_status, pod_apply_ops);
        // only pods re-created so far are rolled back
        expected = comp_status.progress_details.len() as i32;
        completed
    } else {
        handle_progress_for_pods_rolling_update(res, &pods, pg, comp_status, pod_apply_ops)
    };
    (expected, completed)
}

/// Fetch the pods and workload of the component and classify its pods
pub async fn handle_component_status_progress<S: ObjectStore>(
    cli: &S,
    res: &mut OpsResource,
    pg: &mut ProgressResource,
    comp_status: &mut OpsRequestComponentStatus,
    pod_apply_ops: PodApplyOps,
) -> Result<(i32, i32)> {
    let namespace = res.namespace();
    let cluster = res.cluster.name_any();
    let pods: Vec<Pod> = cli
        .list(&namespace, &component_labels(&cluster, &pg.full_component_name))
        .await?;
    let its = cli
        .get_opt::<InstanceSet>(
            &namespace,
            &generate_workload_name_pattern(&cluster, &pg.full_component_name),
        )
        .await?;
    pg.min_ready_seconds = its.map_or(0, |its| its.spec.min_ready_seconds);
    Ok(classify_component_pods(res, pg, comp_status, pods, pod_apply_ops))
}

fn update_progress_detail_for_hscale(
    res: &mut OpsResource,
    pg: &ProgressResource,
    comp_status: &mut OpsRequestComponentStatus,
    object_key: &str,
    status: ProgressStatus,
) {
    let group = if pg.full_component_name.is_empty() {
        String::new()
    } else {
        format!("{}/{}", pg.full_component_name, pg.ops_message_key)
    };
    let prefix = match status {
        ProgressStatus::Succeed => "Successfully",
        ProgressStatus::Processing => "Start to",
        ProgressStatus::Pending => "wait to",
        ProgressStatus::Failed => "Failed to",
    };
    let message = format!(
        "{prefix} {} \"{object_key}\" in Component: {}",
        pg.ops_message_key.to_lowercase(),
        pg.component.name
    );
    let detail = ProgressStatusDetail {
        group,
        object_key: object_key.to_string(),
        status,
        message,
        ..Default::default()
    };
    set_component_status_progress_detail(&mut res.events, &mut comp_status.progress_details, detail, res.now);
}

fn scale_out_progress(
    res: &mut OpsResource,
    pg: &mut ProgressResource,
    its: &InstanceSet,
    comp_status: &mut OpsRequestComponentStatus,
) -> i32 {
    let not_ready = its.pods_in_condition(INSTANCE_READY_CONDITION);
    let not_available = its.pods_in_condition(INSTANCE_AVAILABLE_CONDITION);
    let failed = its.pods_in_condition(INSTANCE_FAILURE_CONDITION);
    let members: BTreeSet<&str> = its
        .status
        .iter()
        .flat_map(|s| s.members_status.iter())
        .map(|m| m.pod_name.as_str())
        .collect();
    pg.ops_message_key = "Create".into();

    let mut completed = 0;
    for pod in pg.created_pod_set.clone() {
        let object_key = progress_object_key(POD_KIND, &pod);
        let status = if its.pod_revision(&pod).is_none() {
            ProgressStatus::Pending
        } else if failed.contains(&pod) {
            completed += 1;
            ProgressStatus::Failed
        } else if not_ready.contains(&pod) {
            ProgressStatus::Processing
        } else if not_available.contains(&pod) || (pg.check_role && !members.contains(pod.as_str())) {
            continue;
        } else {
            completed += 1;
            ProgressStatus::Succeed
        };
        update_progress_detail_for_hscale(res, pg, comp_status, &object_key, status);
    }
    completed
}

fn scale_in_progress(
    res: &mut OpsResource,
    pg: &mut ProgressResource,
    its: &InstanceSet,
    comp_status: &mut OpsRequestComponentStatus,
) -> i32 {
    let not_ready = its.pods_in_condition(INSTANCE_READY_CONDITION);
    pg.ops_message_key = "Delete".into();

    let mut completed = 0;
    for pod in pg.deleted_pod_set.clone() {
        let object_key = progress_object_key(POD_KIND, &pod);
        let status = if its.pod_revision(&pod).is_none() {
            completed += 1;
            ProgressStatus::Succeed
        } else if not_ready.contains(&pod) {
            ProgressStatus::Processing
        } else {
            ProgressStatus::Pending
        };
        update_progress_detail_for_hscale(res, pg, comp_status, &object_key, status);
    }
    completed
}

/// Classify the pods created and deleted by a replica change of the component
///
/// Returns `(expected, completed)`.
pub async fn handle_component_progress_for_scaling_replicas<S: ObjectStore>(
    cli: &S,
    res: &mut OpsResource,
    pg: &mut ProgressResource,
    comp_status: &mut OpsRequestComponentStatus,
) -> Result<(i32, i32)> {
    let updated = (pg.created_pod_set.len() + pg.deleted_pod_set.len()) as i32;
    if updated == 0 {
        return Ok((0, 0));
    }
    let its: InstanceSet = cli
        .get(
            &res.namespace(),
            &generate_workload_name_pattern(&res.cluster.name_any(), &pg.full_component_name),
        )
        .await?;

    let mut completed = 0;
    if !pg.created_pod_set.is_empty() {
        completed += scale_out_progress(res, pg, &its, comp_status);
    }
    if !pg.deleted_pod_set.is_empty() {
        completed += scale_in_progress(res, pg, &its, comp_status);
    }
    Ok((updated, completed))
}

fn scale_out_shards(
    res: &mut OpsResource,
    pg: &mut ProgressResource,
    comp_status: &mut OpsRequestComponentStatus,
    components: &[Component],
) -> i32 {
    let start = res.ops_request.start_time();
    pg.ops_message_key = "create".into();
    let mut completed = 0;
    for comp in components {
        if created_before(comp.metadata.creation_timestamp.as_ref().map(|t| t.0), start) {
            continue;
        }
        let object_key = progress_object_key(COMPONENT_KIND, &comp.name_any());
        let status = match comp.status.as_ref().and_then(|s| s.phase) {
            Some(ComponentPhase::Running) => {
                completed += 1;
                ProgressStatus::Succeed
            }
            Some(ComponentPhase::Failed) => {
                completed += 1;
                ProgressStatus::Failed
            }
            _ => ProgressStatus::Processing,
        };
        update_progress_detail_for_hscale(res, pg, comp_status, &object_key, status);
    }
    completed
}

fn scale_in_shards(
    res: &mut OpsResource,
    pg: &mut ProgressResource,
    comp_status: &mut OpsRequestComponentStatus,
    components: &[Component],
    update_shards: i32,
) -> i32 {
    let start = res.ops_request.start_time();
    pg.ops_message_key = "delete".into();
    let mut live = BTreeSet::new();
    for comp in components {
        let object_key = progress_object_key(COMPONENT_KIND, &comp.name_any());
        live.insert(object_key.clone());
        let deleted_at = comp.metadata.deletion_timestamp.as_ref().map(|t| t.0);
        if deleted_at.is_none() || created_before(deleted_at, start) {
            continue;
        }
        update_progress_detail_for_hscale(res, pg, comp_status, &object_key, ProgressStatus::Processing);
    }

    let mut completed = 0;
    let gone: Vec<String> = comp_status
        .progress_details
        .iter()
        .map(|d| d.object_key.clone())
        .filter(|k| !live.contains(k))
        .collect();
    for object_key in gone {
        completed += 1;
        update_progress_detail_for_hscale(res, pg, comp_status, &object_key, ProgressStatus::Succeed);
    }
    if components.len() as i32 == pg.shards {
        completed = update_shards;
    }
    completed
}

/// Classify the shard components created or deleted by a shard count change
///
/// Returns `(expected, completed)`, completed never exceeds expected.
pub async fn handle_component_progress_for_scaling_shards<S: ObjectStore>(
    cli: &S,
    res: &mut OpsResource,
    pg: &mut ProgressResource,
    comp_status: &mut OpsRequestComponentStatus,
) -> Result<(i32, i32)> {
    let mut update_shards = pg.shards - pg.last_shards;
    if update_shards == 0 {
        return Ok((0, 0));
    }
    let labels = [
        (APP_INSTANCE_LABEL_KEY.to_string(), res.cluster.name_any()),
        (KB_APP_SHARDING_NAME_LABEL_KEY.to_string(), pg.component.name.clone()),
    ]
    .into_iter()
    .collect();
    let components: Vec<Component> = cli.list(&res.namespace(), &labels).await?;

    let completed = if update_shards > 0 {
        scale_out_shards(res, pg, comp_status, &components)
    } else {
        update_shards = -update_shards;
        scale_in_shards(res, pg, comp_status, &components, update_shards)
    };
    // shards rebuilt by other operations may be counted too
    Ok((update_shards, completed.min(update_shards)))
}

/// Write `after.status` when it differs from `before`; returns whether a patch was issued
pub async fn patch_ops_request_status<S: ObjectStore>(
    cli: &S,
    before: &OpsRequest,
    after: &OpsRequest,
) -> Result<bool> {
    if before.status == after.status {
        return Ok(false);
    }
    let patch = json!({ "status": after.status });
    cli.merge_patch_status::<OpsRequest>(
        &after.namespace().unwrap_or_default(),
        &after.name_any(),
        &patch,
    )
    .await?;
    debug!(ops = %after.name_any(), "patched ops status");
    Ok(true)
}

/// Record `completed/expected` and persist the status if it changed since `before`
pub async fn sync_progress_to_ops_request<S: ObjectStore>(
    cli: &S,
    before: &OpsRequest,
    ops: &mut OpsRequest,
    completed: i32,
    expected: i32,
) -> Result<bool> {
    ops.status.get_or_insert_with(Default::default).progress = format!("{completed}/{expected}");
    patch_ops_request_status(cli, before, ops).await
}
