use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, instrument};

use super::{
    actions::{
        AccountProvision, ComponentRef, LifecycleAction, MemberJoin, MemberLeave, PostProvision,
        PreTerminate, Reconfigure, RoleProbe, Switchover, UserDefined,
    },
    agent::{AgentClientFactory, AgentError},
    proto::{format_error, ActionRequest},
    select_target_pods, Lifecycle, LifecycleError, LifecycleResult, Options,
};
use crate::{
    constant::{
        generate_cluster_component_name, generate_workload_name_pattern, KB_AGENT_CONTAINER_NAME,
        KB_AGENT_HTTP_PORT_NAME,
    },
    resources::{
        Action, Cluster, ClusterPhase, Component, ComponentLifecycleActions, ComponentPhase,
        InstanceSet, PreConditionType,
    },
    store::ObjectStore,
    workload::{get_port_by_name, pod_role},
};

/// Lifecycle actions of one component, executed through the agent sidecar of its pods
pub struct Kbagent {
    pub namespace: String,
    pub cluster_name: String,
    pub comp_name: String,
    pub lifecycle_actions: ComponentLifecycleActions,

    /// Rendered template variables, handed to every action and overriding system parameters
    pub template_vars: BTreeMap<String, String>,

    /// All pods of the component
    pub pods: Vec<Pod>,

    /// The pod actions without a target selector run on
    pub pod: Option<Pod>,

    agents: Arc<dyn AgentClientFactory>,
}

impl Kbagent {
    pub fn new(
        namespace: &str,
        cluster_name: &str,
        comp_name: &str,
        lifecycle_actions: ComponentLifecycleActions,
        agents: Arc<dyn AgentClientFactory>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            cluster_name: cluster_name.to_string(),
            comp_name: comp_name.to_string(),
            lifecycle_actions,
            template_vars: BTreeMap::new(),
            pods: vec![],
            pod: None,
            agents,
        }
    }

    pub fn with_pods(mut self, pods: Vec<Pod>) -> Self {
        self.pods = pods;
        self
    }

    pub fn with_pod(mut self, pod: Pod) -> Self {
        self.pod = Some(pod);
        self
    }

    pub fn with_template_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.template_vars = vars;
        self
    }

    fn component(&self) -> ComponentRef {
        ComponentRef {
            namespace: self.namespace.clone(),
            cluster_name: self.cluster_name.clone(),
            comp_name: self.comp_name.clone(),
        }
    }

    fn own_pod_name(&self) -> String {
        self.pod.as_ref().map(|p| p.name_any()).unwrap_or_default()
    }

    async fn checked_call_action<S: ObjectStore>(
        &self,
        cli: &S,
        spec: Option<&Action>,
        la: &dyn LifecycleAction,
        opts: Option<&Options>,
    ) -> LifecycleResult<Vec<u8>> {
        let Some(spec) = spec.filter(|s| s.exec.is_some()) else {
            return Err(LifecycleError::ActionNotDefined {
                action: la.name(),
                message: String::new(),
            });
        };
        self.precondition(cli, spec).await?;

        let req = self.build_request(la, opts);
        self.call_action(spec, &req).await
    }

    async fn precondition<S: ObjectStore>(&self, cli: &S, spec: &Action) -> LifecycleResult<()> {
        let (kind, ready) = match spec.pre_condition {
            None | Some(PreConditionType::Immediately) => return Ok(()),
            Some(PreConditionType::RuntimeReady) => {
                let name = generate_workload_name_pattern(&self.cluster_name, &self.comp_name);
                let ready = cli
                    .get::<InstanceSet>(&self.namespace, &name)
                    .await
                    .map(|its| its.is_instances_ready());
                ("runtime", ready)
            }
            Some(PreConditionType::ComponentReady) => {
                let name = generate_cluster_component_name(&self.cluster_name, &self.comp_name);
                let ready = cli
                    .get::<Component>(&self.namespace, &name)
                    .await
                    .map(|comp| {
                        comp.status.and_then(|s| s.phase) == Some(ComponentPhase::Running)
                    });
                ("component", ready)
            }
            Some(PreConditionType::ClusterReady) => {
                let ready = cli
                    .get::<Cluster>(&self.namespace, &self.cluster_name)
                    .await
                    .map(|cluster| {
                        cluster.status.and_then(|s| s.phase) == Some(ClusterPhase::Running)
                    });
                ("cluster", ready)
            }
        };
        match ready {
            Ok(true) => Ok(()),
            Ok(false) => Err(LifecycleError::Precondition(format!(
                "precondition check error, {kind} is not ready"
            ))),
            Err(e) => Err(LifecycleError::Precondition(format!(
                "precondition check error for {kind} ready: {e}"
            ))),
        }
    }

    fn build_request(&self, la: &dyn LifecycleAction, opts: Option<&Options>) -> ActionRequest {
        let mut parameters = la.parameters(&self.pods);
        parameters.extend(
            self.template_vars
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        let mut req = ActionRequest {
            action: la.name(),
            parameters,
            ..Default::default()
        };
        if let Some(opts) = opts {
            req.non_blocking = opts.non_blocking;
            req.timeout_seconds = opts.timeout_seconds;
            req.retry_policy = opts.retry_policy.clone();
        }
        req
    }

    /// Call the selected pods one after another; the first non-empty output is returned and
    /// any error response aborts the whole call
    #[instrument(skip_all, fields(action = %req.action, component = %self.comp_name))]
    async fn call_action(&self, spec: &Action, req: &ActionRequest) -> LifecycleResult<Vec<u8>> {
        let pods = select_target_pods(&self.pods, self.pod.as_ref(), spec)?;
        if pods.is_empty() {
            return Err(LifecycleError::NoAvailablePod(req.action.clone()));
        }

        let mut output = Vec::new();
        for pod in &pods {
            let Some(port) = get_port_by_name(pod, KB_AGENT_CONTAINER_NAME, KB_AGENT_HTTP_PORT_NAME)
            else {
                debug!(pod = %pod.name_any(), "no agent port, skipping");
                continue;
            };
            let unavailable = |reason: String| LifecycleError::PodUnavailable {
                pod: pod.name_any(),
                action: req.action.clone(),
                reason,
            };
            let Some(ip) = pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.clone())
                .filter(|ip| !ip.is_empty())
            else {
                return Err(unavailable("pod has no ip".into()));
            };
            let port = u16::try_from(port)
                .map_err(|_| unavailable(format!("invalid agent port {port}")))?;

            let transport = |e: AgentError| LifecycleError::Transport {
                action: req.action.clone(),
                pod: pod.name_any(),
                reason: e.to_string(),
            };
            let client = self.agents.client(pod, &ip, port).await.map_err(transport)?;
            let rsp = client.action(req).await.map_err(transport)?;
            if !rsp.error.is_empty() {
                return Err(format_error(&req.action, &rsp));
            }
            if output.is_empty() {
                if let Some(out) = rsp.output_bytes() {
                    output = out.to_vec();
                }
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl Lifecycle for Kbagent {
    async fn post_provision<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
    ) -> LifecycleResult<()> {
        let la = PostProvision(self.component());
        self.checked_call_action(cli, self.lifecycle_actions.post_provision.as_ref(), &la, opts)
            .await
            .map(|_| ())
    }

    async fn pre_terminate<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
    ) -> LifecycleResult<()> {
        let la = PreTerminate(self.component());
        self.checked_call_action(cli, self.lifecycle_actions.pre_terminate.as_ref(), &la, opts)
            .await
            .map(|_| ())
    }

    async fn role_probe<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
    ) -> LifecycleResult<Vec<u8>> {
        let spec = self.lifecycle_actions.role_probe.as_ref().map(|p| &p.action);
        self.checked_call_action(cli, spec, &RoleProbe, opts).await
    }

    async fn switchover<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
        candidate: &str,
    ) -> LifecycleResult<()> {
        let la = Switchover {
            component: self.component(),
            role: self
                .pod
                .as_ref()
                .and_then(pod_role)
                .unwrap_or_default()
                .to_string(),
            current_pod: self.own_pod_name(),
            candidate_pod: candidate.to_string(),
        };
        self.checked_call_action(cli, self.lifecycle_actions.switchover.as_ref(), &la, opts)
            .await
            .map(|_| ())
    }

    async fn member_join<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
    ) -> LifecycleResult<()> {
        let la = MemberJoin {
            component: self.component(),
            pod: self.own_pod_name(),
        };
        self.checked_call_action(cli, self.lifecycle_actions.member_join.as_ref(), &la, opts)
            .await
            .map(|_| ())
    }

    async fn member_leave<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
    ) -> LifecycleResult<()> {
        let la = MemberLeave {
            component: self.component(),
            pod: self.own_pod_name(),
        };
        self.checked_call_action(cli, self.lifecycle_actions.member_leave.as_ref(), &la, opts)
            .await
            .map(|_| ())
    }

    async fn reconfigure<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
        args: BTreeMap<String, String>,
    ) -> LifecycleResult<()> {
        let la = Reconfigure { args };
        self.checked_call_action(cli, self.lifecycle_actions.reconfigure.as_ref(), &la, opts)
            .await
            .map(|_| ())
    }

    async fn account_provision<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
        statement: &str,
        user: &str,
        password: &str,
    ) -> LifecycleResult<()> {
        let la = AccountProvision {
            statement: statement.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        };
        self.checked_call_action(
            cli,
            self.lifecycle_actions.account_provision.as_ref(),
            &la,
            opts,
        )
        .await
        .map(|_| ())
    }

    async fn user_defined<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
        name: &str,
        action: &Action,
        args: BTreeMap<String, String>,
    ) -> LifecycleResult<()> {
        let la = UserDefined {
            name: name.to_string(),
            args,
        };
        self.checked_call_action(cli, Some(action), &la, opts)
            .await
            .map(|_| ())
    }
}
