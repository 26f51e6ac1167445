use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{Context, Reconcile, Requeue};
use crate::{
    configuration::{create_config_patch, last_applied_data},
    constant::{
        generate_cluster_component_name, generate_component_parameter_name,
        APP_INSTANCE_LABEL_KEY, CM_CONFIGURATION_SPEC_PROVIDER_LABEL_KEY,
        CM_CONFIGURATION_TEMPLATE_NAME_LABEL_KEY, CM_CONFIGURATION_TYPE_LABEL_KEY,
        CONFIGURATION_REVISION_ANNOTATION_KEY, KB_APP_COMPONENT_LABEL_KEY,
        LAST_APPLIED_CONFIGURATION_ANNOTATION_KEY, RECONFIGURE_TYPE_ANNOTATION_KEY,
    },
    events::EventBuffer,
    operations::component_labels,
    reconfigure::{
        config_item_status, config_revision, gen_reconfigure_action_tasks, transition,
        update_config_phase, ExecStatus, ReconcileContext, ReturnedStatus,
    },
    resources::{
        Component, ComponentDefinition, ComponentParameter, InstanceSet, ParamConfigRenderer,
        ParameterPhase, ParametersDefinition,
    },
    store::ObjectStore,
    Error, Result,
};

const NOT_MODIFIED_MESSAGE: &str = "the configuration file has not been modified, skip reconfigure";
const NOTHING_CHANGED_MESSAGE: &str = "nothing changed, skip reconfigure";
const NO_CHANGE_RELOAD_TYPE: &str = "noChange";

/// Labels the rendering controller puts on every configuration ConfigMap
struct ConfigLabels {
    cluster: String,
    component: String,
    config_spec: String,
}

impl ConfigLabels {
    fn from_config_map(cm: &ConfigMap) -> Option<Self> {
        let labels = cm.labels();
        let required = [
            APP_INSTANCE_LABEL_KEY,
            KB_APP_COMPONENT_LABEL_KEY,
            CM_CONFIGURATION_TEMPLATE_NAME_LABEL_KEY,
            CM_CONFIGURATION_TYPE_LABEL_KEY,
            CM_CONFIGURATION_SPEC_PROVIDER_LABEL_KEY,
        ];
        if !required.iter().all(|k| labels.contains_key(*k)) {
            return None;
        }
        Some(Self {
            cluster: labels[APP_INSTANCE_LABEL_KEY].clone(),
            component: labels[KB_APP_COMPONENT_LABEL_KEY].clone(),
            config_spec: labels[CM_CONFIGURATION_SPEC_PROVIDER_LABEL_KEY].clone(),
        })
    }
}

/// Record a final phase without running any reload
async fn finish<S: ObjectStore>(
    cli: &S,
    parameter: &ComponentParameter,
    config_spec: &str,
    revision: &str,
    message: &str,
) -> Result<Requeue> {
    let item = config_item_status(
        config_spec,
        revision,
        ParameterPhase::Finished,
        Some(message.to_string()),
        "",
        None,
    );
    update_config_phase(cli, parameter, item).await?;
    Ok(Requeue::AwaitChange)
}

async fn parameters_definitions<S: ObjectStore>(
    cli: &S,
    renderer: Option<&ParamConfigRenderer>,
) -> Result<Vec<ParametersDefinition>> {
    let mut defs = vec![];
    for name in renderer.iter().flat_map(|r| r.spec.parameters_defs.iter()) {
        defs.push(cli.get_cluster::<ParametersDefinition>(name).await?);
    }
    Ok(defs)
}

/// Mark the current data as applied so the next pass sees no change
async fn mark_applied<S: ObjectStore>(
    cli: &S,
    cm: &ConfigMap,
    namespace: &str,
    revision: &str,
    reload_type: &str,
) -> Result<()> {
    let data = cm.data.clone().unwrap_or_default();
    let mut annotations = Map::new();
    annotations.insert(
        LAST_APPLIED_CONFIGURATION_ANNOTATION_KEY.into(),
        Value::from(serde_json::to_string(&data)?),
    );
    annotations.insert(RECONFIGURE_TYPE_ANNOTATION_KEY.into(), Value::from(reload_type));
    annotations.insert(CONFIGURATION_REVISION_ANNOTATION_KEY.into(), Value::from(revision));
    cli.merge_patch::<ConfigMap>(
        namespace,
        &cm.name_any(),
        &json!({ "metadata": { "annotations": annotations } }),
    )
    .await
}

#[async_trait]
impl<S: ObjectStore + 'static> Reconcile<S> for ConfigMap {
    async fn reconcile(&self, context: Arc<Context<S>>, events: &mut EventBuffer) -> Result<Requeue> {
        let cli = &context.client;
        let name = self.name_any();
        if self.metadata.deletion_timestamp.is_some() {
            return Ok(Requeue::AwaitChange);
        }
        let Some(labels) = ConfigLabels::from_config_map(self) else {
            debug!(configmap = %name, "not a configuration ConfigMap");
            return Ok(Requeue::AwaitChange);
        };
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::IllegalObject(name.clone(), "missing namespace".into()))?;
        let revision = config_revision(self);

        let parameter_name = generate_component_parameter_name(&labels.cluster, &labels.component);
        let Some(parameter) = cli.get_opt::<ComponentParameter>(&namespace, &parameter_name).await? else {
            warn!(configmap = %name, parameter = %parameter_name, "ComponentParameter not found, skipping");
            return Ok(Requeue::AwaitChange);
        };
        if let Some(item) = parameter.item_status(&labels.config_spec) {
            if item.phase == Some(ParameterPhase::FailedAndPause)
                && item.update_revision.as_deref() == Some(revision.as_str())
            {
                debug!(configmap = %name, %revision, "reconfigure paused after failure");
                return Ok(Requeue::AwaitChange);
            }
        }

        if last_applied_data(self)? == self.data.clone().unwrap_or_default() {
            return finish(cli, &parameter, &labels.config_spec, &revision, NOT_MODIFIED_MESSAGE).await;
        }

        let component_name = generate_cluster_component_name(&labels.cluster, &labels.component);
        let Some(component) = cli.get_opt::<Component>(&namespace, &component_name).await? else {
            debug!(component = %component_name, "component is gone");
            return Ok(Requeue::AwaitChange);
        };
        let component_def: ComponentDefinition = cli.get_cluster(&component.spec.comp_def).await?;
        let Some(config_spec) = component_def.config_template(&labels.config_spec).cloned() else {
            let message = format!(
                "config spec {} not found in component definition {}",
                labels.config_spec,
                component_def.name_any()
            );
            events.warning("ReconfigureFailed", message.clone());
            return finish(cli, &parameter, &labels.config_spec, &revision, &message).await;
        };

        let renderers: Vec<ParamConfigRenderer> = cli.list_cluster().await?;
        let renderer = renderers
            .into_iter()
            .find(|r| r.spec.component_def == component.spec.comp_def);
        let parameters_defs = parameters_definitions(cli, renderer.as_ref()).await?;

        let selector: BTreeMap<String, String> = component_labels(&labels.cluster, &labels.component);
        let instance_sets: Vec<InstanceSet> = cli.list(&namespace, &selector).await?;
        if instance_sets.is_empty() {
            let message = format!("configmap {name} is not used by any container");
            events.warning("ReconfigureFailed", message.clone());
            return finish(cli, &parameter, &labels.config_spec, &revision, &message).await;
        }
        let pods: Vec<Pod> = cli.list(&namespace, &selector).await?;

        let rctx = ReconcileContext {
            cli,
            agents: context.agents.clone(),
            namespace: namespace.clone(),
            cluster_name: labels.cluster.clone(),
            comp_name: labels.component.clone(),
            config_map: self.clone(),
            component_def,
            config_spec: config_spec.clone(),
            renderer: renderer.map(|r| r.spec),
            parameters_defs,
            instance_sets,
            pods,
            now: Utc::now(),
        };

        let (patch, force_restart) =
            create_config_patch(self, rctx.renderer.as_ref(), &rctx.parameters_defs)?;
        if patch.as_ref().map_or(false, |p| !p.is_modify) {
            events.normal("ReconfigureRunning", NOTHING_CHANGED_MESSAGE);
            let item = config_item_status(
                &config_spec.name,
                &revision,
                ParameterPhase::Finished,
                Some(NOTHING_CHANGED_MESSAGE.to_string()),
                NO_CHANGE_RELOAD_TYPE,
                None,
            );
            update_config_phase(cli, &parameter, item).await?;
            mark_applied(cli, self, &namespace, &revision, NO_CHANGE_RELOAD_TYPE).await?;
            return Ok(Requeue::AwaitChange);
        }
        let tasks = gen_reconfigure_action_tasks(&config_spec, &rctx, patch.as_ref(), force_restart)?;

        let mut reload_type = "none";
        let mut returned = ReturnedStatus::new(ExecStatus::None);
        let (mut succeed, mut expected) = (0, 0);
        for (i, task) in tasks.iter().enumerate() {
            reload_type = task.reload_type();
            returned = task.exec(&rctx).await;
            context.metrics.reload_task(reload_type, returned.status);
            succeed += returned.succeed_count;
            expected += returned.expected_count;
            if returned.status != ExecStatus::None {
                // tasks after the stopping one are still owed
                expected += (tasks.len() - i - 1) as i32;
                break;
            }
        }
        let returned = returned.with_counts(succeed, expected);

        let phase = transition(returned.status);
        let item = config_item_status(
            &config_spec.name,
            &revision,
            phase,
            returned.message.clone(),
            reload_type,
            Some(&returned),
        );
        update_config_phase(cli, &parameter, item).await?;

        match phase {
            ParameterPhase::Finished => {
                mark_applied(cli, self, &namespace, &revision, reload_type).await?;
                events.normal(
                    "ReconfigureSucceed",
                    format!("reconfigure of {name} succeeded with {reload_type}"),
                );
                info!(configmap = %name, %revision, reload_type, "reconfigure finished");
                Ok(Requeue::AwaitChange)
            }
            ParameterPhase::FailedAndPause => {
                events.warning(
                    "ReconfigureFailed",
                    format!(
                        "reconfigure of {name} failed: {}",
                        returned.message.unwrap_or_default()
                    ),
                );
                Ok(Requeue::AwaitChange)
            }
            ParameterPhase::Failed => {
                events.warning(
                    "ReconfigureFailed",
                    format!(
                        "reconfigure of {name} failed, retrying: {}",
                        returned.message.unwrap_or_default()
                    ),
                );
                Ok(Requeue::After(context.settings.config_reconcile_interval))
            }
            ParameterPhase::Upgrading => {
                debug!(
                    configmap = %name,
                    succeed = returned.succeed_count,
                    expected = returned.expected_count,
                    "reconfigure in progress"
                );
                Ok(Requeue::After(context.settings.config_reconcile_interval))
            }
        }
    }
}
