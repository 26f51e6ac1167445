//! Helper methods only available for tests
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::core::v1::{
        ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, Pod, PodCondition, PodSpec,
        PodStatus, Volume,
    },
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    constant::{
        KB_AGENT_CONTAINER_NAME, KB_AGENT_HTTP_PORT_NAME,
        LAST_APPLIED_CONFIGURATION_ANNOTATION_KEY, ROLE_LABEL_KEY,
    },
    lifecycle::{
        proto::{ActionRequest, ActionResponse},
        AgentClient, AgentClientFactory, AgentError,
    },
    operations::OpsResource,
    reconfigure::ReconcileContext,
    resources::{
        CfgFileFormat, Cluster, ClusterComponentSpec, ClusterSpec, ComponentConfigDescription,
        ComponentDefinition, ComponentFileTemplate, FileFormatConfig, IniConfig, InstanceSet,
        InstanceSetSpec, OpsRequest, OpsRequestSpec, OpsType, ParamConfigRendererSpec,
    },
    store::{ClusterObject, Object, ObjectStore},
    Error, Result,
};

pub const NAMESPACE: &str = "default";

pub fn pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".into(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A pod whose Ready condition turned true at `since`
pub fn ready_pod(name: &str, since: DateTime<Utc>) -> Pod {
    let mut pod = pod(name);
    pod.status = Some(PodStatus {
        conditions: Some(vec![PodCondition {
            type_: "Ready".into(),
            status: "True".into(),
            last_transition_time: Some(Time(since)),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

pub fn pod_with_ip(name: &str, ip: &str) -> Pod {
    let mut pod = pod(name);
    pod.status = Some(PodStatus {
        pod_ip: Some(ip.into()),
        ..Default::default()
    });
    pod
}

/// A pod running the agent sidecar
pub fn agent_pod(name: &str, ip: &str) -> Pod {
    let mut pod = pod_with_ip(name, ip);
    if let Some(spec) = pod.spec.as_mut() {
        spec.containers.push(Container {
            name: KB_AGENT_CONTAINER_NAME.into(),
            ports: Some(vec![ContainerPort {
                name: Some(KB_AGENT_HTTP_PORT_NAME.into()),
                container_port: 3501,
                ..Default::default()
            }]),
            ..Default::default()
        });
    }
    pod
}

pub fn with_role(mut pod: Pod, role: &str) -> Pod {
    pod.labels_mut().insert(ROLE_LABEL_KEY.into(), role.into());
    pod
}

pub fn with_labels(mut pod: Pod, labels: &BTreeMap<String, String>) -> Pod {
    pod.labels_mut().extend(labels.clone());
    pod
}

pub fn annotate(mut pod: Pod, key: &str, value: &str) -> Pod {
    pod.annotations_mut().insert(key.into(), value.into());
    pod
}

pub fn created_at(mut pod: Pod, at: DateTime<Utc>) -> Pod {
    pod.metadata.creation_timestamp = Some(Time(at));
    pod
}

pub fn mount_config_map(mut pod: Pod, cm_name: &str) -> Pod {
    if let Some(spec) = pod.spec.as_mut() {
        spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: cm_name.into(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(cm_name.into()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    pod
}

pub fn config_map(name: &str, data: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Mark `data` as the last applied content of the ConfigMap
pub fn applied(mut cm: ConfigMap, data: &[(&str, &str)]) -> ConfigMap {
    let data: BTreeMap<&str, &str> = data.iter().copied().collect();
    cm.annotations_mut().insert(
        LAST_APPLIED_CONFIGURATION_ANNOTATION_KEY.into(),
        serde_json::to_string(&data).unwrap(),
    );
    cm
}

/// An operation of cluster `c`, which has a single component `mysql` with one replica
pub fn ops_resource(ops_type: OpsType) -> OpsResource {
    let mut cluster = Cluster::new(
        "c",
        ClusterSpec {
            component_specs: vec![ClusterComponentSpec {
                name: "mysql".into(),
                replicas: 1,
                ..Default::default()
            }],
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some(NAMESPACE.into());
    let mut ops = OpsRequest::new(
        "ops-1",
        OpsRequestSpec {
            cluster_name: "c".into(),
            type_: ops_type,
            ..Default::default()
        },
    );
    ops.metadata.namespace = Some(NAMESPACE.into());
    OpsResource::new(cluster, ops, Utc::now())
}

/// Reconcile context of config template `mysql-config` of component `c-mysql`
pub fn reconcile_context<'a>(
    store: &'a FakeStore,
    agent: &FakeAgent,
    cm: ConfigMap,
) -> ReconcileContext<'a, FakeStore> {
    let mut its = InstanceSet::new(
        "c-mysql",
        InstanceSetSpec {
            replicas: Some(2),
            ..Default::default()
        },
    );
    its.metadata.namespace = Some(NAMESPACE.into());
    ReconcileContext {
        cli: store,
        agents: Arc::new(agent.clone()),
        namespace: NAMESPACE.into(),
        cluster_name: "c".into(),
        comp_name: "mysql".into(),
        config_map: cm,
        component_def: ComponentDefinition::default(),
        config_spec: ComponentFileTemplate {
            name: "mysql-config".into(),
            ..Default::default()
        },
        renderer: Some(ParamConfigRendererSpec {
            component_def: "mysql-8".into(),
            configs: vec![ComponentConfigDescription {
                name: "my.cnf".into(),
                template_name: Some("mysql-config".into()),
                file_format_config: Some(FileFormatConfig {
                    format: CfgFileFormat::Ini,
                    ini_config: Some(IniConfig {
                        section_name: Some("mysqld".into()),
                    }),
                }),
            }],
            ..Default::default()
        }),
        parameters_defs: vec![],
        instance_sets: vec![its],
        pods: vec![],
        now: Utc::now(),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedPatch {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub patch: Value,
    /// Whether the status subresource was patched
    pub status: bool,
}

#[derive(Default)]
struct StoreState {
    /// Keyed by kind, namespace (empty for cluster objects) and name
    objects: BTreeMap<(String, String, String), Value>,
    patches: Vec<RecordedPatch>,
}

/// In-memory object store applying json merge patches
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<StoreState>>,
}

fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target) = target else {
        return;
    };
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            merge(target.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).to_string()
}

fn not_found<K: Resource<DynamicType = ()>>(name: &str) -> Error {
    Error::NotFound {
        kind: kind_of::<K>(),
        name: name.to_string(),
    }
}

impl FakeStore {
    /// Store a namespaced object, replacing any previous version; no namespace means `default`
    pub fn insert<K: Object>(&self, obj: &K) {
        let namespace = obj.namespace().unwrap_or_else(|| NAMESPACE.into());
        let mut value = serde_json::to_value(obj).unwrap();
        value["metadata"]["namespace"] = Value::from(namespace.as_str());
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((kind_of::<K>(), namespace, obj.name_any()), value);
    }

    pub fn insert_cluster<K: ClusterObject + Serialize>(&self, obj: &K) {
        let value = serde_json::to_value(obj).unwrap();
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((kind_of::<K>(), String::new(), obj.name_any()), value);
    }

    pub fn patches(&self) -> Vec<RecordedPatch> {
        self.state.lock().unwrap().patches.clone()
    }

    fn patch<K: Object>(&self, namespace: &str, name: &str, patch: &Value, status: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        let object = state.objects.get_mut(&key).ok_or_else(|| not_found::<K>(name))?;
        merge(object, patch);
        state.patches.push(RecordedPatch {
            kind: key.0,
            namespace: key.1,
            name: key.2,
            patch: patch.clone(),
            status,
        });
        Ok(())
    }
}

fn labels_match(value: &Value, labels: &BTreeMap<String, String>) -> bool {
    labels
        .iter()
        .all(|(k, v)| value["metadata"]["labels"][k].as_str() == Some(v.as_str()))
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<K> {
        let state = self.state.lock().unwrap();
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        let value = state.objects.get(&key).ok_or_else(|| not_found::<K>(name))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    async fn list<K: Object>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let state = self.state.lock().unwrap();
        let kind = kind_of::<K>();
        state
            .objects
            .iter()
            .filter(|((k, ns, _), v)| *k == kind && ns == namespace && labels_match(v, labels))
            .map(|(_, v)| Ok(serde_json::from_value(v.clone())?))
            .collect()
    }

    async fn get_cluster<K: ClusterObject>(&self, name: &str) -> Result<K> {
        let state = self.state.lock().unwrap();
        let key = (kind_of::<K>(), String::new(), name.to_string());
        let value = state.objects.get(&key).ok_or_else(|| not_found::<K>(name))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    async fn list_cluster<K: ClusterObject>(&self) -> Result<Vec<K>> {
        let state = self.state.lock().unwrap();
        let kind = kind_of::<K>();
        state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns.is_empty())
            .map(|(_, v)| Ok(serde_json::from_value(v.clone())?))
            .collect()
    }

    async fn merge_patch<K: Object>(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        self.patch::<K>(namespace, name, patch, false)
    }

    async fn merge_patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        self.patch::<K>(namespace, name, patch, true)
    }
}

#[derive(Default)]
struct AgentState {
    responses: BTreeMap<String, Result<ActionResponse, String>>,
    calls: Vec<(String, ActionRequest)>,
}

/// Scripted agent sidecars; pods without a script answer with an empty success
#[derive(Clone, Default)]
pub struct FakeAgent {
    state: Arc<Mutex<AgentState>>,
}

impl FakeAgent {
    pub fn respond(&self, pod: &str, response: ActionResponse) {
        self.state
            .lock()
            .unwrap()
            .responses
            .insert(pod.into(), Ok(response));
    }

    /// Make calls to the pod fail in transport
    pub fn fail(&self, pod: &str, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .responses
            .insert(pod.into(), Err(reason.into()));
    }

    /// Requests received so far, with the pod they were sent to
    pub fn calls(&self) -> Vec<(String, ActionRequest)> {
        self.state.lock().unwrap().calls.clone()
    }
}

struct FakePodClient {
    pod: String,
    state: Arc<Mutex<AgentState>>,
}

#[async_trait]
impl AgentClient for FakePodClient {
    async fn action(&self, req: &ActionRequest) -> Result<ActionResponse, AgentError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((self.pod.clone(), req.clone()));
        match state.responses.get(&self.pod).cloned() {
            Some(Ok(rsp)) => Ok(rsp),
            Some(Err(reason)) => Err(AgentError::Status {
                status: http::StatusCode::BAD_GATEWAY,
                body: reason,
            }),
            None => Ok(ActionResponse::default()),
        }
    }
}

#[async_trait]
impl AgentClientFactory for FakeAgent {
    async fn client(
        &self,
        pod: &Pod,
        _host: &str,
        _port: u16,
    ) -> Result<Box<dyn AgentClient>, AgentError> {
        Ok(Box::new(FakePodClient {
            pod: pod.name_any(),
            state: self.state.clone(),
        }))
    }
}
