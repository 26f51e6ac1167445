use std::collections::BTreeSet;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

use super::{
    component_has_roles, component_spec_mut, progress, sharding_components, update_cluster_spec,
    OpsHandler, OpsOutcome, OpsResource,
};
use crate::{
    constant::generate_workload_name_pattern,
    resources::{Cluster, ClusterComponentSpec, ComponentOps, HorizontalScaling, LastComponentConfiguration},
    store::ObjectStore,
    workload::generate_instance_names,
    Error, Result,
};

/// Changes replicas of components and shard counts of shardings
pub struct HorizontalScalingHandler;

fn horizontal_scalings(res: &OpsResource) -> Vec<HorizontalScaling> {
    res.component_ops()
        .into_values()
        .filter_map(|ops| match ops {
            ComponentOps::HorizontalScaling(h) => Some(h),
            ComponentOps::VolumeExpansion(_) | ComponentOps::Restart(_) | ComponentOps::Reconfigure(_) => None,
        })
        .collect()
}

fn current_spec(cluster: &Cluster, name: &str) -> Result<ClusterComponentSpec> {
    let spec = cluster
        .component_spec(name)
        .or_else(|| cluster.sharding(name).map(|s| &s.template))
        .ok_or_else(|| {
            Error::IllegalObject(
                "OpsRequest".into(),
                format!("component {name} not found in cluster {}", cluster.name_any()),
            )
        })?;
    Ok(ClusterComponentSpec {
        name: name.to_string(),
        ..spec.clone()
    })
}

/// Set replicas and shards on the cluster copy
fn apply_scaling(
    cluster: &mut Cluster,
    name: &str,
    replicas: Option<i32>,
    shards: Option<i32>,
) -> Result<()> {
    let cluster_name = cluster.name_any();
    if let Some(replicas) = replicas {
        let spec = component_spec_mut(cluster, name).ok_or_else(|| {
            Error::IllegalObject(
                "OpsRequest".into(),
                format!("component {name} not found in cluster {cluster_name}"),
            )
        })?;
        spec.replicas = replicas;
    }
    if let Some(shards) = shards {
        let sharding = cluster
            .spec
            .shardings
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| {
                Error::IllegalObject(
                    "OpsRequest".into(),
                    format!("{name} is not a sharding of cluster {cluster_name}"),
                )
            })?;
        sharding.shards = shards;
    }
    Ok(())
}

#[async_trait]
impl<S: ObjectStore> OpsHandler<S> for HorizontalScalingHandler {
    async fn action(&self, cli: &S, res: &mut OpsResource) -> Result<()> {
        let mut cluster = res.cluster.clone();
        for h in horizontal_scalings(res) {
            apply_scaling(&mut cluster, &h.component_name, h.replicas, h.shards)?;
        }
        update_cluster_spec(cli, &cluster).await?;
        info!(cluster = %cluster.name_any(), "scaled cluster");
        res.cluster = cluster;
        Ok(())
    }

    async fn reconcile_action(&self, cli: &S, res: &mut OpsResource) -> Result<OpsOutcome> {
        let before = res.ops_request.clone();
        let cluster = res.cluster.name_any();
        let cancelling = res.ops_request.is_cancelling();
        let (mut expected, mut completed) = (0, 0);

        for h in horizontal_scalings(res) {
            let name = h.component_name.clone();
            let last = res
                .ops_request
                .status
                .as_ref()
                .and_then(|s| s.last_configuration.components.get(&name))
                .cloned()
                .unwrap_or_default();
            let spec = current_spec(&res.cluster, &name)?;
            let check_role = component_has_roles(cli, &spec.component_def).await?;
            let mut comp_status = res.take_component_status(&name);

            if let (Some(target), Some(previous)) = (h.replicas, last.replicas) {
                let (from, to) = if cancelling { (target, previous) } else { (previous, target) };
                let full_names: Vec<String> = if res.cluster.sharding(&name).is_some() {
                    sharding_components(cli, res, &name)
                        .await?
                        .iter()
                        .map(|c| super::full_component_name(&cluster, c))
                        .collect()
                } else {
                    vec![name.clone()]
                };
                for full in full_names {
                    let workload = generate_workload_name_pattern(&cluster, &full);
                    let old: BTreeSet<String> = generate_instance_names(&workload, from, &spec.offline_instances);
                    let new: BTreeSet<String> = generate_instance_names(&workload, to, &spec.offline_instances);

                    let mut pg = progress::ProgressResource::new("", spec.clone(), &full);
                    pg.check_role = check_role;
                    pg.created_pod_set = new.difference(&old).cloned().collect();
                    pg.deleted_pod_set = old.difference(&new).cloned().collect();
                    let (e, c) = progress::handle_component_progress_for_scaling_replicas(
                        cli,
                        res,
                        &mut pg,
                        &mut comp_status,
                    )
                    .await?;
                    expected += e;
                    completed += c;
                }
            }

            if let (Some(target), Some(previous)) = (h.shards, last.shards) {
                let mut pg = progress::ProgressResource::new("", spec.clone(), "");
                (pg.shards, pg.last_shards) = if cancelling { (previous, target) } else { (target, previous) };
                let (e, c) = progress::handle_component_progress_for_scaling_shards(
                    cli,
                    res,
                    &mut pg,
                    &mut comp_status,
                )
                .await?;
                expected += e;
                completed += c;
            }
            res.put_component_status(&name, comp_status);
        }

        progress::sync_progress_to_ops_request(cli, &before, &mut res.ops_request, completed, expected).await?;
        Ok(OpsOutcome::from_progress(res, expected, completed))
    }

    fn save_last_configuration(&self, res: &mut OpsResource) {
        for h in horizontal_scalings(res) {
            let replicas = res
                .cluster
                .component_spec(&h.component_name)
                .or_else(|| res.cluster.sharding(&h.component_name).map(|s| &s.template))
                .map(|s| s.replicas);
            let shards = res.cluster.sharding(&h.component_name).map(|s| s.shards);
            res.status_mut()
                .last_configuration
                .components
                .entry(h.component_name.clone())
                .or_insert(LastComponentConfiguration {
                    replicas: h.replicas.and(replicas),
                    shards: h.shards.and(shards),
                    ..Default::default()
                });
        }
    }

    async fn cancel(&self, cli: &S, res: &mut OpsResource) -> Result<()> {
        let mut cluster = res.cluster.clone();
        let last = res
            .ops_request
            .status
            .as_ref()
            .map(|s| s.last_configuration.components.clone())
            .unwrap_or_default();
        for (name, conf) in last {
            apply_scaling(&mut cluster, &name, conf.replicas, conf.shards)?;
        }
        update_cluster_spec(cli, &cluster).await?;
        info!(cluster = %cluster.name_any(), "rolled back scaling");
        res.cluster = cluster;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        fixtures::{ops_resource, FakeStore},
        operations::OpsManager,
        resources::{InstanceSet, InstanceSetSpec, InstanceSetStatus, OpsPhase, ProgressStatus},
    };

    fn its(pods: &[&str]) -> InstanceSet {
        let mut its = InstanceSet::new(
            "c-mysql",
            InstanceSetSpec {
                replicas: Some(pods.len() as i32),
                ..Default::default()
            },
        );
        its.metadata.namespace = Some("default".into());
        its.status = Some(InstanceSetStatus {
            current_revisions: pods
                .iter()
                .map(|p| (p.to_string(), "rev-1".to_string()))
                .collect(),
            ..Default::default()
        });
        its
    }

    fn scale_to(replicas: i32) -> (FakeStore, OpsResource) {
        let store = FakeStore::default();
        let mut res = ops_resource(crate::resources::OpsType::HorizontalScaling);
        res.ops_request.spec.horizontal_scaling = vec![HorizontalScaling {
            component_name: "mysql".into(),
            replicas: Some(replicas),
            shards: None,
        }];
        store.insert(&res.cluster);
        store.insert(&res.ops_request);
        (store, res)
    }

    #[tokio::test]
    async fn scale_out_succeeds_once_pods_run() {
        let (store, mut res) = scale_to(3);
        let manager = OpsManager::<FakeStore>::new();

        manager.reconcile(&store, &mut res).await.unwrap();
        let cluster: Cluster = store.get("default", "c").await.unwrap();
        assert_eq!(cluster.component_spec("mysql").map(|c| c.replicas), Some(3));
        let last = &res.ops_request.status.as_ref().unwrap().last_configuration;
        assert_eq!(last.components["mysql"].replicas, Some(1));

        store.insert(&its(&["c-mysql-0", "c-mysql-1"]));
        let outcome = manager.reconcile(&store, &mut res).await.unwrap();
        assert_eq!(outcome.phase, OpsPhase::Running);
        assert_eq!(res.ops_request.status.as_ref().unwrap().progress, "1/2");

        store.insert(&its(&["c-mysql-0", "c-mysql-1", "c-mysql-2"]));
        let outcome = manager.reconcile(&store, &mut res).await.unwrap();
        assert_eq!(outcome.phase, OpsPhase::Succeed);
        let rows: BTreeMap<String, ProgressStatus> = res.ops_request.status.as_ref().unwrap().components["mysql"]
            .progress_details
            .iter()
            .map(|d| (d.object_key.clone(), d.status))
            .collect();
        assert_eq!(
            rows,
            BTreeMap::from([
                ("Pod/c-mysql-1".to_string(), ProgressStatus::Succeed),
                ("Pod/c-mysql-2".to_string(), ProgressStatus::Succeed),
            ])
        );
    }

    #[tokio::test]
    async fn cancel_rolls_back_replicas() {
        let (store, mut res) = scale_to(3);
        let manager = OpsManager::<FakeStore>::new();
        manager.reconcile(&store, &mut res).await.unwrap();

        res.ops_request.spec.cancel = true;
        let outcome = manager.reconcile(&store, &mut res).await.unwrap();
        assert_eq!(outcome.phase, OpsPhase::Cancelling);
        let cluster: Cluster = store.get("default", "c").await.unwrap();
        assert_eq!(cluster.component_spec("mysql").map(|c| c.replicas), Some(1));

        // the scaled-out pod is still being removed
        store.insert(&its(&["c-mysql-0", "c-mysql-2"]));
        let outcome = manager.reconcile(&store, &mut res).await.unwrap();
        assert_eq!(outcome.phase, OpsPhase::Cancelling);

        store.insert(&its(&["c-mysql-0"]));
        let outcome = manager.reconcile(&store, &mut res).await.unwrap();
        assert_eq!(outcome.phase, OpsPhase::Cancelled);
        assert!(res.events.reasons().contains(&"Cancelled"));
    }

    #[test]
    fn sharding_shards_are_applied() {
        let mut res = ops_resource(crate::resources::OpsType::HorizontalScaling);
        res.cluster.spec.shardings = vec![crate::resources::ClusterSharding {
            name: "shard".into(),
            shards: 2,
            template: ClusterComponentSpec {
                name: "redis".into(),
                replicas: 2,
                ..Default::default()
            },
        }];
        apply_scaling(&mut res.cluster, "shard", Some(3), Some(4)).unwrap();
        let sharding = res.cluster.sharding("shard").unwrap();
        assert_eq!((sharding.shards, sharding.template.replicas), (4, 3));
        assert!(apply_scaling(&mut res.cluster, "mysql", None, Some(2)).is_err());
    }
}
