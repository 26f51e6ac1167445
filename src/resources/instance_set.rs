use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::{api::core::v1::PodTemplateSpec, apimachinery::pkg::apis::meta::v1::Condition};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ReplicaRole;

/// The workload that runs the pods of a component
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "InstanceSet",
    group = "workloads.kubeblocks.io",
    version = "v1",
    status = "InstanceSetStatus",
    derive = "Default",
    namespaced,
    shortname = "its"
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSetSpec {
    pub replicas: Option<i32>,

    #[serde(default)]
    pub min_ready_seconds: i32,

    #[serde(default)]
    pub template: PodTemplateSpec,

    #[serde(default)]
    pub roles: Vec<ReplicaRole>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSetStatus {
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub available_replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,

    /// Revision each pod currently runs, keyed by pod name.
    #[serde(default)]
    pub current_revisions: BTreeMap<String, String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub members_status: Vec<MemberStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    pub pod_name: String,
    pub role: Option<ReplicaRole>,
}

/// Condition types reported by the InstanceSet controller
pub const INSTANCE_READY_CONDITION: &str = "InstanceReady";
pub const INSTANCE_AVAILABLE_CONDITION: &str = "InstanceAvailable";
pub const INSTANCE_FAILURE_CONDITION: &str = "InstanceFailure";

impl InstanceSet {
    /// Whether the latest spec has rolled out to every replica and, for role-aware
    /// workloads, every replica has reported a role
    pub fn is_instances_ready(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        if status.ready_replicas == 0 {
            return false;
        }
        if status.observed_generation != self.metadata.generation {
            return false;
        }
        let Some(replicas) = self.spec.replicas else {
            return false;
        };
        if status.replicas != replicas
            || status.ready_replicas != replicas
            || status.available_replicas != replicas
            || status.updated_replicas != replicas
        {
            return false;
        }
        if self.spec.roles.is_empty() {
            return true;
        }
        if status.members_status.len() != replicas as usize {
            return false;
        }
        status.members_status.iter().all(|m| m.role.is_some())
    }

    /// Pod names listed in the message of a condition, which the workload controller
    /// writes as a json array while the condition is unhealthy
    pub fn pods_in_condition(&self, condition_type: &str) -> BTreeSet<String> {
        let unhealthy = if condition_type == INSTANCE_FAILURE_CONDITION {
            "True"
        } else {
            "False"
        };
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.type_ == condition_type))
            .filter(|c| c.status == unhealthy)
            .and_then(|c| serde_json::from_str::<Vec<String>>(&c.message).ok())
            .map(|pods| pods.into_iter().collect())
            .unwrap_or_default()
    }

    /// Revision the given pod runs, if the workload has observed it
    pub fn pod_revision(&self, pod_name: &str) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.current_revisions.get(pod_name))
            .map(String::as_str)
    }

    /// Role the given pod reported through the role probe
    pub fn member_role(&self, pod_name: &str) -> Option<&str> {
        self.status
            .as_ref()?
            .members_status
            .iter()
            .find(|m| m.pod_name == pod_name)
            .and_then(|m| m.role.as_ref())
            .map(|r| r.name.as_str())
    }

    pub fn template_annotation(&self, key: &str) -> Option<&str> {
        self.spec
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;

    fn its(replicas: i32, ready: i32, roles: Vec<ReplicaRole>) -> InstanceSet {
        let mut its = InstanceSet::new(
            "mycluster-mysql",
            InstanceSetSpec {
                replicas: Some(replicas),
                roles,
                ..Default::default()
            },
        );
        its.metadata.generation = Some(2);
        its.status = Some(InstanceSetStatus {
            observed_generation: Some(2),
            replicas,
            ready_replicas: ready,
            available_replicas: ready,
            updated_replicas: ready,
            ..Default::default()
        });
        its
    }

    #[test]
    fn instances_ready_requires_full_rollout() {
        assert!(its(3, 3, vec![]).is_instances_ready());
        assert!(!its(3, 2, vec![]).is_instances_ready());
        assert!(!its(3, 0, vec![]).is_instances_ready());

        let mut stale = its(3, 3, vec![]);
        stale.metadata.generation = Some(3);
        assert!(!stale.is_instances_ready());
    }

    #[test]
    fn instances_ready_waits_for_roles() {
        let leader = ReplicaRole {
            name: "leader".into(),
            ..Default::default()
        };
        let mut its = its(1, 1, vec![leader.clone()]);
        assert!(!its.is_instances_ready());

        its.status.as_mut().unwrap().members_status = vec![MemberStatus {
            pod_name: "mycluster-mysql-0".into(),
            role: Some(leader),
        }];
        assert!(its.is_instances_ready());
    }

    #[test]
    fn pods_in_failed_condition() {
        let mut its = its(2, 1, vec![]);
        its.status.as_mut().unwrap().conditions = vec![Condition {
            type_: INSTANCE_FAILURE_CONDITION.into(),
            status: "True".into(),
            message: r#"["mycluster-mysql-1"]"#.into(),
            reason: "InstanceFailure".into(),
            last_transition_time: Time(chrono::Utc::now()),
            observed_generation: None,
        }];
        assert!(its
            .pods_in_condition(INSTANCE_FAILURE_CONDITION)
            .contains("mycluster-mysql-1"));
        assert!(its.pods_in_condition(INSTANCE_READY_CONDITION).is_empty());
    }
}
