use std::{fmt::Debug, sync::Arc, time::Duration};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::ListParams,
    runtime::{controller::Action, events::{Recorder, Reporter}, watcher::Config, Controller},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::{error, field, info, instrument, Span};

use crate::{
    constant::CM_CONFIGURATION_TYPE_LABEL_KEY,
    events::EventBuffer,
    lifecycle::DefaultAgentClientFactory,
    operations::OpsManager,
    reconcilers::{Context, Reconcile},
    resources::OpsRequest,
    settings::Settings,
    telemetry, Error, Metrics, Result,
};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    #[serde(deserialize_with = "from_ts")]
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "kubeblocks-operator".into(),
        }
    }
}
impl Diagnostics {
    pub fn recorder<K: Resource<DynamicType = ()>>(&self, client: Client, obj: &K) -> Recorder {
        Recorder::new(client, self.reporter.clone(), obj.object_ref(&()))
    }
}

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub(crate) async fn to_context(
        &self,
        client: Client,
        settings: Settings,
    ) -> anyhow::Result<Arc<Context<Client>>> {
        self.diagnostics.write().await.reporter = settings.reporter.as_str().into();
        Ok(Arc::new(Context {
            agents: Arc::new(DefaultAgentClientFactory::new(
                client.clone(),
                settings.port_forward,
            )),
            client,
            metrics: Metrics::default()
                .register(&self.registry)
                .context("failed to register metrics")?,
            diagnostics: self.diagnostics.clone(),
            settings,
            ops_manager: Arc::new(OpsManager::new()),
        }))
    }
}

/// Runs the ConfigMap (reconfiguration) and OpsRequest controllers
pub struct Operator {
    state: State,
}

impl Operator {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    /// Initialize the controllers and shared state (given the crds are installed)
    pub async fn run(self, settings: Settings) -> anyhow::Result<()> {
        // Get a k8s client for communicating with the cluster
        let client = Client::try_default()
            .await
            .context("failed to create kube Client")?;

        let config_maps = Api::<ConfigMap>::all(client.clone());
        let ops_requests = Api::<OpsRequest>::all(client.clone());

        // Test that we can actually query for our CRDs (a.k.a. they are installed)
        if let Err(e) = ops_requests.list(&ListParams::default().limit(1)).await {
            error!("CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            std::process::exit(1);
        }

        let context = self.state.to_context(client, settings).await?;
        let watching_config = Config::default().page_size(50).any_semantic();

        // Only ConfigMaps rendered from a config template take part in reconfiguration
        let reconfigure = Controller::new(
            config_maps,
            watching_config.clone().labels(CM_CONFIGURATION_TYPE_LABEL_KEY),
        )
        .shutdown_on_signal()
        .run(reconcile::<ConfigMap>, error_policy::<ConfigMap>, context.clone())
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

        let operations = Controller::new(ops_requests, watching_config)
            .shutdown_on_signal()
            .run(reconcile::<OpsRequest>, error_policy::<OpsRequest>, context)
            .filter_map(|x| async move { Result::ok(x) })
            .for_each(|_| futures::future::ready(()));

        tokio::join!(reconfigure, operations);
        Ok(())
    }
}

fn controller_name<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).to_lowercase()
}

// Error handler for failed reconciliations
fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<Context<Client>>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    error!(name = %obj.name_any(), "reconcile failed: {:?}", error);
    ctx.metrics
        .reconcile_failure(&controller_name::<K>(), &obj.name_any(), error);
    Action::requeue(Duration::from_secs(5))
}

/// Shared reconcile entry: metrics, tracing and event publishing around the resource's own logic
#[instrument(skip(ctx, obj), fields(trace_id))]
async fn reconcile<K>(obj: Arc<K>, ctx: Arc<Context<Client>>) -> Result<Action>
where
    K: Reconcile<Client> + Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    // Add some tracing for debugging's sake
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", &field::display(&trace_id));

    // Take some metrics to see the average reconcile time
    let _timer = ctx.metrics.count_and_measure(&controller_name::<K>());
    ctx.diagnostics.write().await.last_event = Utc::now();

    let mut events = EventBuffer::default();
    let result = obj.reconcile(ctx.clone(), &mut events).await;
    if !events.is_empty() {
        let recorder = ctx
            .diagnostics
            .read()
            .await
            .recorder(ctx.client.clone(), obj.as_ref());
        events.publish(&recorder).await;
    }
    result.map(Action::from)
}
