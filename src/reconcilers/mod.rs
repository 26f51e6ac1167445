use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use kube::{runtime::controller::Action, ResourceExt};
use tokio::sync::RwLock;

use crate::{
    events::EventBuffer, lifecycle::AgentClientFactory, operations::OpsManager,
    operator::Diagnostics, settings::Settings, store::ObjectStore, Error, Metrics,
};

pub mod configmap;
pub mod ops_request;

/// The context passed around
pub struct Context<S> {
    /// Kubernetes client, or anything else that can read and patch objects
    pub client: S,

    /// Opens connections to the agents running next to the database containers
    pub agents: Arc<dyn AgentClientFactory>,

    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,

    /// Prometheus metrics
    pub metrics: Metrics,

    pub settings: Settings,

    /// The supported operation types
    pub ops_manager: Arc<OpsManager<S>>,
}

/// When the controller should look at the object again
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// Only when something changes
    AwaitChange,
    After(Duration),
}

impl From<Requeue> for Action {
    fn from(requeue: Requeue) -> Self {
        match requeue {
            Requeue::AwaitChange => Action::await_change(),
            Requeue::After(after) => Action::requeue(after),
        }
    }
}

/// A resource that can be reconciled by a controller
#[async_trait]
pub(crate) trait Reconcile<S: ObjectStore>
where
    Self: ResourceExt,
{
    /// Attempt to reconcile a resource
    ///
    /// Events to report about the object are left in `events`; the caller publishes them.
    async fn reconcile(
        &self,
        context: Arc<Context<S>>,
        events: &mut EventBuffer,
    ) -> Result<Requeue, Error>;
}
