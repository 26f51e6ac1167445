use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use tracing::info;

use super::{
    component_has_roles, component_targets, progress, OpsHandler, OpsOutcome, OpsResource,
};
use crate::{
    constant::{generate_workload_name_pattern, RESTART_ANNOTATION_KEY},
    resources::{InstanceSet, OpsRequest},
    store::ObjectStore,
    workload::pod_created_at,
    Result,
};

/// Rolls every pod of the selected components
pub struct RestartHandler;

fn pod_created_after_start(ops: &OpsRequest, pod: &Pod, _: &progress::ProgressResource) -> bool {
    matches!((pod_created_at(pod), ops.start_time()), (Some(created), Some(start)) if created >= start)
}

#[async_trait]
impl<S: ObjectStore> OpsHandler<S> for RestartHandler {
    async fn action(&self, cli: &S, res: &mut OpsResource) -> Result<()> {
        let cluster = res.cluster.name_any();
        let mut annotations = Map::new();
        annotations.insert(RESTART_ANNOTATION_KEY.into(), Value::from(res.now.to_rfc3339()));
        let patch = json!({ "spec": { "template": { "metadata": { "annotations": annotations } } } });

        for target in component_targets(cli, res).await? {
            let workload = generate_workload_name_pattern(&cluster, &target.full_component_name);
            cli.merge_patch::<InstanceSet>(&res.namespace(), &workload, &patch).await?;
            info!(%workload, "restarting workload");
        }
        Ok(())
    }

    async fn reconcile_action(&self, cli: &S, res: &mut OpsResource) -> Result<OpsOutcome> {
        let before = res.ops_request.clone();
        let (mut expected, mut completed) = (0, 0);
        for target in component_targets(cli, res).await? {
            let mut pg = progress::ProgressResource::new("restart", target.spec.clone(), &target.full_component_name);
            pg.check_role = component_has_roles(cli, &target.spec.component_def).await?;
            let mut comp_status = res.take_component_status(&target.ops_name);
            let result = progress::handle_component_status_progress(
                cli,
                res,
                &mut pg,
                &mut comp_status,
                pod_created_after_start,
            )
            .await;
            res.put_component_status(&target.ops_name, comp_status);
            let (e, c) = result?;
            expected += e;
            completed += c;
        }
        progress::sync_progress_to_ops_request(cli, &before, &mut res.ops_request, completed, expected).await?;
        Ok(OpsOutcome::from_progress(res, expected, completed))
    }

    fn save_last_configuration(&self, _res: &mut OpsResource) {}
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::fixtures::{created_at, pod};

    #[test]
    fn applied_means_recreated_after_start() {
        let mut ops = OpsRequest::default();
        let start = Utc::now();
        ops.status = Some(crate::resources::OpsRequestStatus {
            start_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(start)),
            ..Default::default()
        });
        let pg = progress::ProgressResource::default();

        let old = created_at(pod("c-mysql-0"), start - Duration::minutes(1));
        let new = created_at(pod("c-mysql-0"), start + Duration::seconds(1));
        assert!(!pod_created_after_start(&ops, &old, &pg));
        assert!(pod_created_after_start(&ops, &new, &pg));
        assert!(!pod_created_after_start(&OpsRequest::default(), &new, &pg));
    }
}
