use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info};

use super::{Context, Reconcile, Requeue};
use crate::{
    events::EventBuffer,
    operations::OpsResource,
    resources::{Cluster, OpsRequest},
    store::ObjectStore,
    Error, Result,
};

#[async_trait]
impl<S: ObjectStore + 'static> Reconcile<S> for OpsRequest {
    async fn reconcile(&self, context: Arc<Context<S>>, events: &mut EventBuffer) -> Result<Requeue> {
        let cli = &context.client;
        let name = self.name_any();
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::IllegalObject(name.clone(), "missing namespace".into()))?;
        if self.phase().is_terminal() {
            debug!(ops = %name, phase = ?self.phase(), "operation already finished");
            return Ok(Requeue::AwaitChange);
        }

        info!(
            r#"Reconciling {:?} OpsRequest "{namespace}/{name}" of cluster "{}""#,
            self.spec.type_, self.spec.cluster_name
        );
        let cluster = cli
            .get_opt::<Cluster>(&namespace, &self.spec.cluster_name)
            .await?;
        let mut res = OpsResource::new(
            cluster.clone().unwrap_or_default(),
            self.clone(),
            Utc::now(),
        );
        let outcome = match cluster {
            Some(_) => context.ops_manager.reconcile(cli, &mut res).await,
            None => {
                let message = format!("cluster {} not found", self.spec.cluster_name);
                context.ops_manager.reject(cli, &mut res, message).await
            }
        };
        events.append(&mut res.events);
        let outcome = outcome?;

        if outcome.phase.is_terminal() {
            return Ok(Requeue::AwaitChange);
        }
        Ok(Requeue::After(
            outcome.requeue_after.unwrap_or(context.settings.ops_requeue),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        fixtures::{ops_resource, FakeAgent, FakeStore},
        reconcilers::tests::context,
        resources::{ComponentOpsTarget, InstanceSet, InstanceSetSpec, OpsPhase, OpsType},
    };

    fn restart_ops() -> (FakeStore, OpsRequest) {
        let store = FakeStore::default();
        let mut res = ops_resource(OpsType::Restart);
        res.ops_request.spec.restart = vec![ComponentOpsTarget {
            component_name: "mysql".into(),
        }];
        store.insert(&res.ops_request);
        store.insert(&res.cluster);
        store.insert(&InstanceSet::new(
            "c-mysql",
            InstanceSetSpec {
                replicas: Some(1),
                ..Default::default()
            },
        ));
        (store, res.ops_request)
    }

    #[tokio::test]
    async fn pending_operation_starts() {
        let (store, ops) = restart_ops();
        let mut events = EventBuffer::default();

        let requeue = ops
            .reconcile(context(&store, &FakeAgent::default()), &mut events)
            .await
            .unwrap();
        assert_eq!(requeue, Requeue::After(Duration::from_secs(60)));
        assert_eq!(events.reasons(), vec!["Running"]);
        let stored: OpsRequest = store.get("default", "ops-1").await.unwrap();
        assert_eq!(stored.phase(), OpsPhase::Running);
        assert!(stored.start_time().is_some());
    }

    #[tokio::test]
    async fn missing_cluster_fails_the_operation() {
        let (store, mut ops) = restart_ops();
        ops.spec.cluster_name = "gone".into();
        let mut events = EventBuffer::default();

        let requeue = ops
            .reconcile(context(&store, &FakeAgent::default()), &mut events)
            .await
            .unwrap();
        assert_eq!(requeue, Requeue::AwaitChange);
        assert_eq!(events.reasons(), vec!["Failed"]);
        let stored: OpsRequest = store.get("default", "ops-1").await.unwrap();
        assert_eq!(stored.phase(), OpsPhase::Failed);
        assert_eq!(
            stored.status.unwrap().message.as_deref(),
            Some("cluster gone not found")
        );
    }

    #[tokio::test]
    async fn finished_operation_is_not_touched() {
        let (store, mut ops) = restart_ops();
        ops.status = Some(crate::resources::OpsRequestStatus {
            phase: Some(OpsPhase::Succeed),
            ..Default::default()
        });
        let mut events = EventBuffer::default();

        let requeue = ops
            .reconcile(context(&store, &FakeAgent::default()), &mut events)
            .await
            .unwrap();
        assert_eq!(requeue, Requeue::AwaitChange);
        assert!(events.is_empty());
        assert!(store.patches().is_empty());
    }
}
