use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::debug;

use super::{
    config_revision,
    executor::{DynamicReloadTask, ReloadTask, RestartTask},
    ReconcileContext,
};
use crate::{
    configuration::ConfigPatch,
    constant::RESTART_ANNOTATION_PREFIX,
    resources::{ComponentFileTemplate, ParametersDefinition, ReloadPolicy},
    Result,
};

fn file_policy(defs: &[ParametersDefinition], file: &str) -> ReloadPolicy {
    defs.iter()
        .find(|d| d.spec.file_name == file)
        .and_then(|d| d.spec.reload_policy)
        .unwrap_or_default()
}

/// ConfigMap keys a pod sees through a volume of the ConfigMap
fn mounted_files(pod: &Pod, cm_name: &str, all_files: &BTreeSet<String>) -> BTreeSet<String> {
    let volumes = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .into_iter()
        .flatten();
    let mut files = BTreeSet::new();
    for source in volumes.filter_map(|v| v.config_map.as_ref()) {
        if source.name.as_deref() != Some(cm_name) {
            continue;
        }
        match source.items.as_ref().filter(|items| !items.is_empty()) {
            Some(items) => files.extend(items.iter().map(|i| i.key.clone())),
            None => files.extend(all_files.iter().cloned()),
        }
    }
    files
}

/// Plan the reload tasks that bring the component up to the patched configuration
///
/// Tasks are executed in the returned order.
pub fn gen_reconfigure_action_tasks<S>(
    config_spec: &ComponentFileTemplate,
    rctx: &ReconcileContext<'_, S>,
    patch: Option<&ConfigPatch>,
    force_restart: bool,
) -> Result<Vec<ReloadTask>> {
    let Some(patch) = patch else {
        return Ok(vec![]);
    };

    let changed = patch.changed_files();
    let policies: Vec<(String, ReloadPolicy)> = changed
        .iter()
        .map(|f| (f.clone(), file_policy(&rctx.parameters_defs, f)))
        .collect();
    let dynamic_files: BTreeSet<String> = policies
        .iter()
        .filter(|(_, p)| *p == ReloadPolicy::DynamicReload)
        .map(|(f, _)| f.clone())
        .collect();
    let has_reconfigure_action = rctx
        .component_def
        .spec
        .lifecycle_actions
        .reconfigure
        .as_ref()
        .map_or(false, |a| a.exec.is_some());

    let restart = force_restart
        || config_spec.restart_on_file_change.unwrap_or(false)
        || policies.iter().any(|(_, p)| *p == ReloadPolicy::Restart)
        || (!dynamic_files.is_empty() && !has_reconfigure_action);
    if restart {
        debug!(config = %config_spec.name, force_restart, "planned restart");
        return Ok(vec![ReloadTask::Restart(RestartTask {
            workloads: rctx.instance_sets.iter().map(|its| its.name_any()).collect(),
            annotation_key: format!("{RESTART_ANNOTATION_PREFIX}{}", rctx.config_map.name_any()),
            revision: config_revision(&rctx.config_map),
        })]);
    }

    if dynamic_files.is_empty() {
        return Ok(vec![ReloadTask::NoOp]);
    }

    let cm_name = rctx.config_map.name_any();
    let all_files: BTreeSet<String> = rctx
        .config_map
        .data
        .as_ref()
        .map(|d| d.keys().cloned().collect())
        .unwrap_or_default();

    let mut pods: Vec<&Pod> = rctx.pods.iter().collect();
    pods.sort_by_key(|p| p.name_any());

    let tasks: Vec<ReloadTask> = pods
        .into_iter()
        .filter_map(|pod| {
            let files: BTreeSet<String> = mounted_files(pod, &cm_name, &all_files)
                .intersection(&dynamic_files)
                .cloned()
                .collect();
            if files.is_empty() {
                return None;
            }
            Some(ReloadTask::Dynamic(DynamicReloadTask {
                pod: pod.clone(),
                patch: patch.slice(&files),
            }))
        })
        .collect();
    if tasks.is_empty() {
        debug!(configmap = %cm_name, "no pod mounts the changed files");
        return Ok(vec![ReloadTask::NoOp]);
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        fixtures::{
            agent_pod, config_map, mount_config_map, reconcile_context, FakeAgent, FakeStore,
        },
        resources::{
            Action, ComponentLifecycleActions, ExecAction, ParameterDescription,
            ParametersDefinitionSpec,
        },
    };

    fn definition(policy: Option<ReloadPolicy>, force: &[&str]) -> ParametersDefinition {
        ParametersDefinition::new(
            "mysql-params",
            ParametersDefinitionSpec {
                file_name: "my.cnf".into(),
                reload_policy: policy,
                parameters: force
                    .iter()
                    .map(|n| ParameterDescription {
                        name: n.to_string(),
                        force_restart: true,
                    })
                    .collect(),
                ..Default::default()
            },
        )
    }

    fn update(file: &str, key: &str, value: &str) -> ConfigPatch {
        ConfigPatch {
            is_modify: true,
            update_config: BTreeMap::from([(
                file.to_string(),
                BTreeMap::from([(key.to_string(), value.to_string())]),
            )]),
            ..Default::default()
        }
    }

    fn with_reconfigure_action<S>(rctx: &mut ReconcileContext<'_, S>) {
        rctx.component_def.spec.lifecycle_actions = ComponentLifecycleActions {
            reconfigure: Some(Action {
                exec: Some(ExecAction {
                    command: vec!["/scripts/reload.sh".into()],
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
    }

    #[test]
    fn no_patch_no_tasks() {
        let store = FakeStore::default();
        let rctx = reconcile_context(&store, &FakeAgent::default(), config_map("c-mysql-config", &[]));
        let tasks =
            gen_reconfigure_action_tasks(&rctx.config_spec, &rctx, None, false).unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn dynamic_reload_gets_one_task_per_mounting_pod() {
        let store = FakeStore::default();
        let mut rctx = reconcile_context(
            &store,
            &FakeAgent::default(),
            config_map("c-mysql-config", &[("my.cnf", "max_connections=200\n")]),
        );
        with_reconfigure_action(&mut rctx);
        rctx.parameters_defs = vec![definition(Some(ReloadPolicy::DynamicReload), &[])];
        rctx.pods = vec![
            mount_config_map(agent_pod("c-mysql-1", "10.0.0.2"), "c-mysql-config"),
            agent_pod("c-mysql-2", "10.0.0.3"),
            mount_config_map(agent_pod("c-mysql-0", "10.0.0.1"), "c-mysql-config"),
        ];

        let patch = update("my.cnf", "max_connections", "200");
        let tasks =
            gen_reconfigure_action_tasks(&rctx.config_spec, &rctx, Some(&patch), false).unwrap();
        let pods: Vec<String> = tasks
            .iter()
            .map(|t| match t {
                ReloadTask::Dynamic(d) => d.pod.name_any(),
                other => panic!("unexpected task {other:?}"),
            })
            .collect();
        assert_eq!(pods, vec!["c-mysql-0", "c-mysql-1"]);
        assert_eq!(tasks[0].reload_type(), "dynamicReload");
    }

    #[test]
    fn force_restart_plans_single_restart() {
        let store = FakeStore::default();
        let mut rctx = reconcile_context(
            &store,
            &FakeAgent::default(),
            config_map("c-mysql-config", &[("my.cnf", "max_connections=200\n")]),
        );
        with_reconfigure_action(&mut rctx);
        rctx.parameters_defs = vec![definition(
            Some(ReloadPolicy::DynamicReload),
            &["max_connections"],
        )];
        rctx.pods = vec![mount_config_map(agent_pod("c-mysql-0", "10.0.0.1"), "c-mysql-config")];

        let patch = update("my.cnf", "max_connections", "200");
        let tasks =
            gen_reconfigure_action_tasks(&rctx.config_spec, &rctx, Some(&patch), true).unwrap();
        assert_eq!(tasks.len(), 1);
        match &tasks[0] {
            ReloadTask::Restart(r) => {
                assert_eq!(r.workloads, vec!["c-mysql"]);
                assert_eq!(r.annotation_key, "config.kubeblocks.io/restart-c-mysql-config");
            }
            other => panic!("unexpected task {other:?}"),
        }
    }

    #[test]
    fn policy_decides_between_restart_and_noop() {
        let store = FakeStore::default();
        let mut rctx = reconcile_context(
            &store,
            &FakeAgent::default(),
            config_map("c-mysql-config", &[("my.cnf", "max_connections=200\n")]),
        );
        let patch = update("my.cnf", "max_connections", "200");

        // no definition for the file: restart
        let tasks =
            gen_reconfigure_action_tasks(&rctx.config_spec, &rctx, Some(&patch), false).unwrap();
        assert!(matches!(tasks[..], [ReloadTask::Restart(_)]));

        // dynamic reload without a reconfigure action: restart
        rctx.parameters_defs = vec![definition(Some(ReloadPolicy::DynamicReload), &[])];
        let tasks =
            gen_reconfigure_action_tasks(&rctx.config_spec, &rctx, Some(&patch), false).unwrap();
        assert!(matches!(tasks[..], [ReloadTask::Restart(_)]));

        rctx.parameters_defs = vec![definition(Some(ReloadPolicy::None), &[])];
        let tasks =
            gen_reconfigure_action_tasks(&rctx.config_spec, &rctx, Some(&patch), false).unwrap();
        assert!(matches!(tasks[..], [ReloadTask::NoOp]));

        rctx.config_spec.restart_on_file_change = Some(true);
        let tasks =
            gen_reconfigure_action_tasks(&rctx.config_spec, &rctx, Some(&patch), false).unwrap();
        assert!(matches!(tasks[..], [ReloadTask::Restart(_)]));
    }
}
