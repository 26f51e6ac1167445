use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::{api::core::v1::PersistentVolumeClaim, apimachinery::pkg::api::resource::Quantity};
use kube::ResourceExt;
use kube_quantity::ParsedQuantity;
use tracing::{debug, info};

use super::{
    component_labels, component_spec_mut, progress, sharding_components, update_cluster_spec,
    OpsHandler, OpsOutcome, OpsResource,
};
use crate::{
    constant::{
        generate_workload_name_pattern, progress_object_key, PVC_KIND,
        VOLUME_CLAIM_TEMPLATE_NAME_LABEL_KEY,
    },
    resources::{
        ClusterComponentSpec, ComponentOps, InstanceTemplate, LastComponentConfiguration,
        OpsRequestComponentStatus, OpsRequestVolumeClaimTemplate, ProgressStatus,
        ProgressStatusDetail, VolumeExpansion,
    },
    store::ObjectStore,
    workload::generate_instance_names,
    Error, Result,
};

const VOLUME_EXPANSION_TIMEOUT_MINUTES: i64 = 30;
const VOLUME_EXPANSION_REQUEUE: Duration = Duration::from_secs(60);

/// Grows the volume claim templates of components and waits for the claims to follow
pub struct VolumeExpansionHandler;

fn volume_expansions(res: &OpsResource) -> Vec<VolumeExpansion> {
    res.component_ops()
        .into_values()
        .filter_map(|ops| match ops {
            ComponentOps::VolumeExpansion(v) => Some(v),
            ComponentOps::HorizontalScaling(_) | ComponentOps::Restart(_) | ComponentOps::Reconfigure(_) => None,
        })
        .collect()
}

fn quantity_bytes(q: &Quantity) -> Option<i64> {
    ParsedQuantity::try_from(q.clone()).ok()?.to_bytes_i64()
}

fn storage_request(pvc: &PersistentVolumeClaim) -> Option<i64> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .and_then(quantity_bytes)
}

fn storage_capacity(pvc: &PersistentVolumeClaim) -> Option<i64> {
    pvc.status
        .as_ref()?
        .capacity
        .as_ref()?
        .get("storage")
        .and_then(quantity_bytes)
}

/// Progress of one claim towards `requested` bytes
fn classify_pvc(
    pvc: &PersistentVolumeClaim,
    requested: i64,
    object_key: &str,
    component: &str,
) -> (ProgressStatus, String) {
    let status = pvc.status.as_ref();
    let bound = status.and_then(|s| s.phase.as_deref()) == Some("Bound");
    if bound
        && storage_capacity(pvc).map_or(false, |c| c >= requested)
        && storage_request(pvc) == Some(requested)
    {
        return (
            ProgressStatus::Succeed,
            format!("Successfully expand volume: {object_key} in component: {component}"),
        );
    }
    let resizing = status
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "Resizing" || c.type_ == "FileSystemResizePending");
    if resizing {
        return (
            ProgressStatus::Processing,
            format!("Start expanding volume: {object_key} in component: {component}"),
        );
    }
    (
        ProgressStatus::Pending,
        format!("Waiting for an external controller to process the pvc: {object_key} in component: {component}"),
    )
}

fn target_spec(res: &OpsResource, name: &str) -> Result<ClusterComponentSpec> {
    res.cluster
        .component_spec(name)
        .or_else(|| res.cluster.sharding(name).map(|s| &s.template))
        .map(|spec| ClusterComponentSpec {
            name: name.to_string(),
            ..spec.clone()
        })
        .ok_or_else(|| {
            Error::IllegalObject(
                "OpsRequest".into(),
                format!("component {name} not found in cluster {}", res.cluster.name_any()),
            )
        })
}

/// Returns `(expected, completed)` for the claims of one template of one component
async fn handle_vct_progress<S: ObjectStore>(
    cli: &S,
    res: &mut OpsResource,
    spec: &ClusterComponentSpec,
    full_component_name: &str,
    vct: &OpsRequestVolumeClaimTemplate,
    comp_status: &mut OpsRequestComponentStatus,
) -> Result<(i32, i32)> {
    let cluster = res.cluster.name_any();
    let requested = quantity_bytes(&vct.storage).ok_or_else(|| {
        Error::IllegalObject("OpsRequest".into(), format!("invalid storage {}", vct.storage.0))
    })?;
    let replicas = spec.replicas - spec.instances.iter().map(InstanceTemplate::get_replicas).sum::<i32>();
    let workload = generate_workload_name_pattern(&cluster, full_component_name);
    let instances = generate_instance_names(&workload, replicas, &spec.offline_instances);

    let mut labels = component_labels(&cluster, full_component_name);
    labels.insert(VOLUME_CLAIM_TEMPLATE_NAME_LABEL_KEY.to_string(), vct.name.clone());
    let mut pvcs: Vec<PersistentVolumeClaim> = cli.list(&res.namespace(), &labels).await?;
    pvcs.sort_by_key(|p| p.name_any());

    let prefix = format!("{}-", vct.name);
    let mut completed = 0;
    for pvc in &pvcs {
        let pvc_name = pvc.name_any();
        let instance = pvc_name.strip_prefix(&prefix).unwrap_or(&pvc_name);
        if !instances.contains(instance) {
            continue;
        }
        let object_key = progress_object_key(PVC_KIND, &pvc_name);
        let failed = comp_status
            .progress_details
            .iter()
            .any(|d| d.object_key == object_key && d.status == ProgressStatus::Failed);
        if failed {
            completed += 1;
            continue;
        }
        let (status, message) = classify_pvc(pvc, requested, &object_key, &spec.name);
        if status == ProgressStatus::Succeed {
            completed += 1;
        }
        let detail = ProgressStatusDetail {
            group: vct.name.clone(),
            object_key,
            status,
            message,
            ..Default::default()
        };
        progress::set_component_status_progress_detail(
            &mut res.events,
            &mut comp_status.progress_details,
            detail,
            res.now,
        );
    }
    Ok((instances.len() as i32, completed))
}

#[async_trait]
impl<S: ObjectStore> OpsHandler<S> for VolumeExpansionHandler {
    async fn action(&self, cli: &S, res: &mut OpsResource) -> Result<()> {
        let mut cluster = res.cluster.clone();
        for ve in volume_expansions(res) {
            let name = &ve.component_name;
            let spec = component_spec_mut(&mut cluster, name).ok_or_else(|| {
                Error::IllegalObject("OpsRequest".into(), format!("component {name} not found"))
            })?;
            for vct in &ve.volume_claim_templates {
                let template = spec
                    .volume_claim_templates
                    .iter_mut()
                    .find(|t| t.name == vct.name)
                    .ok_or_else(|| {
                        Error::IllegalObject(
                            "OpsRequest".into(),
                            format!("volume claim template {} not found in component {name}", vct.name),
                        )
                    })?;
                template.set_storage(vct.storage.clone());
            }
        }
        update_cluster_spec(cli, &cluster).await?;
        info!(cluster = %cluster.name_any(), "expanding volumes");
        res.cluster = cluster;
        Ok(())
    }

    async fn reconcile_action(&self, cli: &S, res: &mut OpsResource) -> Result<OpsOutcome> {
        let before = res.ops_request.clone();
        let cluster = res.cluster.name_any();
        let (mut expected, mut completed) = (0, 0);

        for ve in volume_expansions(res) {
            let name = ve.component_name.clone();
            let spec = target_spec(res, &name)?;
            let full_names: Vec<String> = if res.cluster.sharding(&name).is_some() {
                sharding_components(cli, res, &name)
                    .await?
                    .iter()
                    .map(|c| super::full_component_name(&cluster, c))
                    .collect()
            } else {
                vec![name.clone()]
            };
            let mut comp_status = res.take_component_status(&name);
            for vct in &ve.volume_claim_templates {
                for full in &full_names {
                    let result = handle_vct_progress(cli, res, &spec, full, vct, &mut comp_status).await;
                    let (e, c) = match result {
                        Ok(counts) => counts,
                        Err(e) => {
                            res.put_component_status(&name, comp_status);
                            return Err(e);
                        }
                    };
                    expected += e;
                    completed += c;
                }
            }
            res.put_component_status(&name, comp_status);
        }

        progress::sync_progress_to_ops_request(cli, &before, &mut res.ops_request, completed, expected).await?;
        if completed >= expected {
            return Ok(OpsOutcome::from_progress(res, expected, completed));
        }
        let timed_out = res.ops_request.start_time().map_or(false, |start| {
            res.now - start > chrono::Duration::minutes(VOLUME_EXPANSION_TIMEOUT_MINUTES)
        });
        if timed_out {
            return Ok(OpsOutcome::failed(Some(format!(
                "Timed out waiting for volume expansion to complete, the timeout value is {VOLUME_EXPANSION_TIMEOUT_MINUTES} minutes"
            ))));
        }
        debug!(completed, expected, "volume expansion in progress");
        Ok(OpsOutcome::running(Some(VOLUME_EXPANSION_REQUEUE)))
    }

    fn save_last_configuration(&self, res: &mut OpsResource) {
        for ve in volume_expansions(res) {
            let Ok(spec) = target_spec(res, &ve.component_name) else {
                continue;
            };
            let previous: Vec<OpsRequestVolumeClaimTemplate> = ve
                .volume_claim_templates
                .iter()
                .filter_map(|vct| {
                    let template = spec.volume_claim_templates.iter().find(|t| t.name == vct.name)?;
                    Some(OpsRequestVolumeClaimTemplate {
                        name: vct.name.clone(),
                        storage: template.storage()?.clone(),
                    })
                })
                .collect();
            res.status_mut()
                .last_configuration
                .components
                .entry(ve.component_name.clone())
                .or_insert(LastComponentConfiguration {
                    volume_claim_templates: previous,
                    ..Default::default()
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use super::*;
    use crate::{
        fixtures::{ops_resource, FakeStore},
        operations::OpsManager,
        resources::{Cluster, OpsPhase, OpsType, PersistentVolumeClaimTemplate},
    };

    fn pvc(capacity: &str, request: &str, conditions: &[&str]) -> PersistentVolumeClaim {
        claim("data-c-mysql-0", capacity, request, conditions)
    }

    fn claim(name: &str, capacity: &str, request: &str, conditions: &[&str]) -> PersistentVolumeClaim {
        serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "namespace": "default",
                "labels": {
                    "app.kubernetes.io/instance": "c",
                    "apps.kubeblocks.io/component-name": "mysql",
                    "apps.kubeblocks.io/vct-name": "data",
                },
            },
            "spec": {"resources": {"requests": {"storage": request}}},
            "status": {
                "phase": "Bound",
                "capacity": {"storage": capacity},
                "conditions": conditions
                    .iter()
                    .map(|c| json!({"type": c, "status": "True"}))
                    .collect::<Vec<_>>(),
            },
        }))
        .unwrap()
    }

    #[test]
    fn pvc_progress_follows_capacity() {
        let requested = quantity_bytes(&Quantity("20Gi".into())).unwrap();
        let key = "PVC/data-c-mysql-0";

        let (status, message) = classify_pvc(&pvc("20Gi", "20Gi", &[]), requested, key, "mysql");
        assert_eq!(status, ProgressStatus::Succeed);
        assert_eq!(message, "Successfully expand volume: PVC/data-c-mysql-0 in component: mysql");

        let (status, _) = classify_pvc(&pvc("10Gi", "20Gi", &["Resizing"]), requested, key, "mysql");
        assert_eq!(status, ProgressStatus::Processing);

        let (status, message) = classify_pvc(&pvc("10Gi", "10Gi", &[]), requested, key, "mysql");
        assert_eq!(status, ProgressStatus::Pending);
        assert!(message.starts_with("Waiting for an external controller"));
    }

    fn expand_to(storage: &str) -> (FakeStore, OpsResource) {
        let store = FakeStore::default();
        let mut res = ops_resource(OpsType::VolumeExpansion);
        let mut data = PersistentVolumeClaimTemplate {
            name: "data".into(),
            ..Default::default()
        };
        data.set_storage(Quantity("10Gi".into()));
        res.cluster.spec.component_specs[0].volume_claim_templates = vec![data];
        res.ops_request.spec.volume_expansion = vec![VolumeExpansion {
            component_name: "mysql".into(),
            volume_claim_templates: vec![OpsRequestVolumeClaimTemplate {
                name: "data".into(),
                storage: Quantity(storage.into()),
            }],
        }];
        store.insert(&res.cluster);
        store.insert(&res.ops_request);
        (store, res)
    }

    #[tokio::test]
    async fn expansion_completes_when_claims_grow() {
        let (store, mut res) = expand_to("20Gi");
        let manager = OpsManager::<FakeStore>::new();

        manager.reconcile(&store, &mut res).await.unwrap();
        let cluster: Cluster = store.get("default", "c").await.unwrap();
        let storage = cluster.component_spec("mysql").unwrap().volume_claim_templates[0]
            .storage()
            .cloned();
        assert_eq!(storage, Some(Quantity("20Gi".into())));
        let last = &res.ops_request.status.as_ref().unwrap().last_configuration.components["mysql"];
        assert_eq!(last.volume_claim_templates[0].storage, Quantity("10Gi".into()));

        store.insert(&pvc("10Gi", "20Gi", &["Resizing"]));
        let outcome = manager.reconcile(&store, &mut res).await.unwrap();
        assert_eq!(outcome.phase, OpsPhase::Running);
        assert_eq!(outcome.requeue_after, Some(VOLUME_EXPANSION_REQUEUE));

        store.insert(&pvc("20Gi", "20Gi", &[]));
        let outcome = manager.reconcile(&store, &mut res).await.unwrap();
        assert_eq!(outcome.phase, OpsPhase::Succeed);
        let details = &res.ops_request.status.as_ref().unwrap().components["mysql"].progress_details;
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].group, "data");
        assert_eq!(details[0].status, ProgressStatus::Succeed);
    }

    #[tokio::test]
    async fn three_replicas_with_one_claim_resizing() {
        let (store, mut res) = expand_to("20Gi");
        res.cluster.spec.component_specs[0].replicas = 3;
        store.insert(&res.cluster);
        let manager = OpsManager::<FakeStore>::new();
        manager.reconcile(&store, &mut res).await.unwrap();

        store.insert(&claim("data-c-mysql-0", "20Gi", "20Gi", &[]));
        store.insert(&claim("data-c-mysql-1", "20Gi", "20Gi", &[]));
        store.insert(&claim("data-c-mysql-2", "10Gi", "20Gi", &["Resizing"]));
        let outcome = manager.reconcile(&store, &mut res).await.unwrap();
        assert_eq!(outcome.phase, OpsPhase::Running);
        assert_eq!(outcome.requeue_after, Some(Duration::from_secs(60)));
        assert_eq!(res.ops_request.status.as_ref().unwrap().progress, "2/3");
        let statuses: Vec<ProgressStatus> = res.ops_request.status.as_ref().unwrap().components["mysql"]
            .progress_details
            .iter()
            .map(|d| d.status)
            .collect();
        assert_eq!(
            statuses,
            vec![ProgressStatus::Succeed, ProgressStatus::Succeed, ProgressStatus::Processing]
        );
    }

    #[tokio::test]
    async fn expansion_times_out() {
        let (store, mut res) = expand_to("20Gi");
        let manager = OpsManager::<FakeStore>::new();
        manager.reconcile(&store, &mut res).await.unwrap();

        store.insert(&pvc("10Gi", "10Gi", &[]));
        res.now = res.now + ChronoDuration::minutes(31);
        let outcome = manager.reconcile(&store, &mut res).await.unwrap();
        assert_eq!(outcome.phase, OpsPhase::Failed);
        assert_eq!(
            res.ops_request.status.as_ref().and_then(|s| s.message.as_deref()),
            Some("Timed out waiting for volume expansion to complete, the timeout value is 30 minutes")
        );
    }
}
