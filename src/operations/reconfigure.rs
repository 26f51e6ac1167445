use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use tracing::info;

use super::{progress, OpsHandler, OpsOutcome, OpsResource};
use crate::{
    configuration::{merge_parameters, ParameterUpdates},
    constant::{
        generate_cluster_component_name, generate_component_config_name,
        generate_component_parameter_name,
    },
    reconfigure::config_revision,
    resources::{
        Component, ComponentOps, ComponentParameter, FileFormatConfig, ParamConfigRenderer,
        ParameterPhase, ProgressStatus, ProgressStatusDetail, Reconfigure,
    },
    store::ObjectStore,
    Error, Result,
};

/// Writes requested parameters into rendered config files and follows the reconfiguration
pub struct ReconfigureHandler;

fn reconfigures(res: &OpsResource) -> Vec<Reconfigure> {
    res.component_ops()
        .into_values()
        .filter_map(|ops| match ops {
            ComponentOps::Reconfigure(r) => Some(r),
            ComponentOps::HorizontalScaling(_) | ComponentOps::VolumeExpansion(_) | ComponentOps::Restart(_) => None,
        })
        .collect()
}

async fn file_format<S: ObjectStore>(
    cli: &S,
    res: &OpsResource,
    r: &Reconfigure,
) -> Result<FileFormatConfig> {
    let comp: Component = cli
        .get(
            &res.namespace(),
            &generate_cluster_component_name(&res.cluster.name_any(), &r.component_name),
        )
        .await?;
    let renderers: Vec<ParamConfigRenderer> = cli.list_cluster().await?;
    renderers
        .iter()
        .filter(|pcr| pcr.spec.component_def == comp.spec.comp_def)
        .find_map(|pcr| pcr.spec.file_format(&r.file_name).cloned())
        .ok_or_else(|| {
            Error::IllegalObject(
                "OpsRequest".into(),
                format!("file {} of {} has no declared format", r.file_name, r.config_spec),
            )
        })
}

fn config_map_name(res: &OpsResource, r: &Reconfigure) -> String {
    generate_component_config_name(&res.cluster.name_any(), &r.component_name, &r.config_spec)
}

#[async_trait]
impl<S: ObjectStore> OpsHandler<S> for ReconfigureHandler {
    async fn action(&self, cli: &S, res: &mut OpsResource) -> Result<()> {
        for r in reconfigures(res) {
            let format = file_format(cli, res, &r).await?;
            let name = config_map_name(res, &r);
            let cm: ConfigMap = cli.get(&res.namespace(), &name).await?;
            let content = cm
                .data
                .as_ref()
                .and_then(|d| d.get(&r.file_name))
                .map(String::as_str)
                .unwrap_or_default();
            let updates: ParameterUpdates = r
                .parameters
                .iter()
                .map(|p| (p.key.clone(), p.value.clone()))
                .collect();
            let merged = merge_parameters(&r.file_name, content, &format, &updates)?;

            let mut data = Map::new();
            data.insert(r.file_name.clone(), Value::from(merged));
            cli.merge_patch::<ConfigMap>(&res.namespace(), &name, &json!({ "data": data }))
                .await?;
            info!(configmap = %name, file = %r.file_name, "updated parameters");
        }
        Ok(())
    }

    async fn reconcile_action(&self, cli: &S, res: &mut OpsResource) -> Result<OpsOutcome> {
        let before = res.ops_request.clone();
        let cluster = res.cluster.name_any();
        let (mut expected, mut completed) = (0, 0);

        for r in reconfigures(res) {
            let cm: ConfigMap = cli.get(&res.namespace(), &config_map_name(res, &r)).await?;
            let revision = config_revision(&cm);
            let parameter = cli
                .get_opt::<ComponentParameter>(
                    &res.namespace(),
                    &generate_component_parameter_name(&cluster, &r.component_name),
                )
                .await?;
            // an item of an older revision says nothing about this change
            let item = parameter
                .as_ref()
                .and_then(|p| p.item_status(&r.config_spec))
                .filter(|i| i.update_revision.as_deref() == Some(revision.as_str()));

            let (status, message) = match item.and_then(|i| i.phase) {
                Some(ParameterPhase::Finished) => (
                    ProgressStatus::Succeed,
                    format!("Successfully reconfigure {} in Component: {}", r.config_spec, r.component_name),
                ),
                Some(ParameterPhase::Failed | ParameterPhase::FailedAndPause) => (
                    ProgressStatus::Failed,
                    format!(
                        "Failed to reconfigure {} in Component: {}, message: {}",
                        r.config_spec,
                        r.component_name,
                        item.and_then(|i| i.message.clone()).unwrap_or_default()
                    ),
                ),
                Some(ParameterPhase::Upgrading) | None => (
                    ProgressStatus::Processing,
                    format!("Start to reconfigure {} in Component: {}", r.config_spec, r.component_name),
                ),
            };
            expected += 1;
            if status.is_completed() {
                completed += 1;
            }

            let mut comp_status = res.take_component_status(&r.component_name);
            let detail = ProgressStatusDetail {
                action_name: r.config_spec.clone(),
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
            res.put_component_status(&r.component_name, comp_status);
        }

        progress::sync_progress_to_ops_request(cli, &before, &mut res.ops_request, completed, expected).await?;
        Ok(OpsOutcome::from_progress(res, expected, completed))
    }

    fn save_last_configuration(&self, _res: &mut OpsResource) {}
}
