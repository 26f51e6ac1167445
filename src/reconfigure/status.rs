use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use super::ReturnedStatus;
use crate::{
    resources::{
        ComponentParameter, ConfigTemplateItemDetailStatus, ParameterPhase, ReconcileDetail,
    },
    store::ObjectStore,
    Result,
};

/// Status item of a config template after one reconcile pass
pub fn config_item_status(
    template: &str,
    revision: &str,
    phase: ParameterPhase,
    message: Option<String>,
    policy: &str,
    returned: Option<&ReturnedStatus>,
) -> ConfigTemplateItemDetailStatus {
    ConfigTemplateItemDetailStatus {
        name: template.to_string(),
        phase: Some(phase),
        message,
        update_revision: Some(revision.to_string()),
        reconcile_detail: returned.map(|r| ReconcileDetail {
            policy: policy.to_string(),
            exec_result: r.status.as_str().to_string(),
            current_revision: revision.to_string(),
            succeed_count: r.succeed_count,
            expected_count: r.expected_count,
            err_message: r.message.clone(),
        }),
    }
}

/// Write the status item into the ComponentParameter
///
/// `before` is the object as read at the start of the pass; nothing is written when the
/// item is unchanged. Returns whether a patch was issued.
pub async fn update_config_phase<S: ObjectStore>(
    cli: &S,
    before: &ComponentParameter,
    item: ConfigTemplateItemDetailStatus,
) -> Result<bool> {
    let mut status = before.status.clone().unwrap_or_default();
    match status
        .configuration_status
        .iter_mut()
        .find(|s| s.name == item.name)
    {
        Some(existing) => *existing = item,
        None => status.configuration_status.push(item),
    }
    if before.status.as_ref() == Some(&status) {
        debug!(name = %before.name_any(), "config status unchanged");
        return Ok(false);
    }

    let patch = json!({ "status": { "configurationStatus": status.configuration_status } });
    cli.merge_patch_status::<ComponentParameter>(
        &before.namespace().unwrap_or_default(),
        &before.name_any(),
        &patch,
    )
    .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;

    use super::*;
    use crate::{
        fixtures::FakeStore,
        reconfigure::ExecStatus,
        resources::ComponentParameterSpec,
    };

    fn component_parameter() -> ComponentParameter {
        let mut cp = ComponentParameter::new(
            "c-mysql",
            ComponentParameterSpec {
                cluster_name: "c".into(),
                component_name: "mysql".into(),
            },
        );
        cp.metadata.namespace = Some("default".into());
        cp
    }

    #[tokio::test]
    async fn patches_only_on_change() {
        let store = FakeStore::default();
        let before = component_parameter();
        store.insert(&before);

        let returned = ReturnedStatus::new(ExecStatus::Retry).with_counts(1, 3);
        let item = config_item_status(
            "mysql-config",
            "7",
            ParameterPhase::Upgrading,
            None,
            "restart",
            Some(&returned),
        );
        assert!(update_config_phase(&store, &before, item.clone()).await.unwrap());

        let patches = store.patches();
        assert_eq!(patches.len(), 1);
        assert!(patches[0].status);
        assert_json_eq!(
            patches[0].patch,
            json!({"status": {"configurationStatus": [{
                "name": "mysql-config",
                "phase": "Upgrading",
                "message": null,
                "updateRevision": "7",
                "reconcileDetail": {
                    "policy": "restart",
                    "execResult": "retry",
                    "currentRevision": "7",
                    "succeedCount": 1,
                    "expectedCount": 3,
                    "errMessage": null,
                },
            }]}})
        );

        let after = store
            .get::<ComponentParameter>("default", "c-mysql")
            .await
            .unwrap();
        assert!(!update_config_phase(&store, &after, item).await.unwrap());
        assert_eq!(store.patches().len(), 1);
    }
}
