use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::constant::generate_cluster_component_name;

const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// An action the agent can run, with the system parameters it is handed
pub(super) trait LifecycleAction: Send + Sync {
    fn name(&self) -> String;

    fn parameters(&self, pods: &[Pod]) -> BTreeMap<String, String>;
}

/// Identity of the component an action runs for
#[derive(Clone, Debug)]
pub(super) struct ComponentRef {
    pub namespace: String,
    pub cluster_name: String,
    pub comp_name: String,
}

impl ComponentRef {
    fn parameters(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("KB_CLUSTER_NAME".to_string(), self.cluster_name.clone()),
            ("KB_COMP_NAME".to_string(), self.comp_name.clone()),
            (
                "KB_CLUSTER_COMP_NAME".to_string(),
                generate_cluster_component_name(&self.cluster_name, &self.comp_name),
            ),
        ])
    }

    fn pod_fqdn(&self, pod: &str) -> String {
        format!(
            "{pod}.{}-headless.{}.svc.{DEFAULT_CLUSTER_DOMAIN}",
            generate_cluster_component_name(&self.cluster_name, &self.comp_name),
            self.namespace
        )
    }

    /// Component parameters plus the pod name, ip and host name lists
    fn parameters_with_pods(&self, pods: &[Pod]) -> BTreeMap<String, String> {
        let mut names: Vec<&Pod> = pods.iter().collect();
        names.sort_by_key(|p| p.name_any());

        let join = |f: &dyn Fn(&Pod) -> String| -> String {
            names.iter().map(|p| f(p)).collect::<Vec<_>>().join(",")
        };
        let mut params = self.parameters();
        params.insert(
            "KB_CLUSTER_COMPONENT_POD_NAME_LIST".into(),
            join(&|p| p.name_any()),
        );
        params.insert(
            "KB_CLUSTER_COMPONENT_POD_IP_LIST".into(),
            join(&|p| {
                p.status
                    .as_ref()
                    .and_then(|s| s.pod_ip.clone())
                    .unwrap_or_default()
            }),
        );
        params.insert(
            "KB_CLUSTER_COMPONENT_POD_HOST_NAME_LIST".into(),
            join(&|p| {
                p.spec
                    .as_ref()
                    .and_then(|s| s.node_name.clone())
                    .unwrap_or_default()
            }),
        );
        params
    }
}

pub(super) struct PostProvision(pub ComponentRef);

impl LifecycleAction for PostProvision {
    fn name(&self) -> String {
        "postProvision".into()
    }

    fn parameters(&self, pods: &[Pod]) -> BTreeMap<String, String> {
        self.0.parameters_with_pods(pods)
    }
}

pub(super) struct PreTerminate(pub ComponentRef);

impl LifecycleAction for PreTerminate {
    fn name(&self) -> String {
        "preTerminate".into()
    }

    fn parameters(&self, pods: &[Pod]) -> BTreeMap<String, String> {
        self.0.parameters_with_pods(pods)
    }
}

pub(super) struct RoleProbe;

impl LifecycleAction for RoleProbe {
    fn name(&self) -> String {
        "roleProbe".into()
    }

    fn parameters(&self, _: &[Pod]) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

pub(super) struct Switchover {
    pub component: ComponentRef,
    pub role: String,
    pub current_pod: String,
    pub candidate_pod: String,
}

impl LifecycleAction for Switchover {
    fn name(&self) -> String {
        "switchover".into()
    }

    fn parameters(&self, _: &[Pod]) -> BTreeMap<String, String> {
        let mut params = self.component.parameters();
        params.insert("KB_SWITCHOVER_CURRENT_NAME".into(), self.current_pod.clone());
        params.insert(
            "KB_SWITCHOVER_CURRENT_FQDN".into(),
            self.component.pod_fqdn(&self.current_pod),
        );
        params.insert("KB_SWITCHOVER_ROLE".into(), self.role.clone());
        if !self.candidate_pod.is_empty() {
            params.insert(
                "KB_SWITCHOVER_CANDIDATE_NAME".into(),
                self.candidate_pod.clone(),
            );
            params.insert(
                "KB_SWITCHOVER_CANDIDATE_FQDN".into(),
                self.component.pod_fqdn(&self.candidate_pod),
            );
        }
        params
    }
}

pub(super) struct MemberJoin {
    pub component: ComponentRef,
    pub pod: String,
}

impl LifecycleAction for MemberJoin {
    fn name(&self) -> String {
        "memberJoin".into()
    }

    fn parameters(&self, _: &[Pod]) -> BTreeMap<String, String> {
        let mut params = self.component.parameters();
        params.insert("KB_JOIN_MEMBER_POD_NAME".into(), self.pod.clone());
        params.insert(
            "KB_JOIN_MEMBER_POD_FQDN".into(),
            self.component.pod_fqdn(&self.pod),
        );
        params
    }
}

pub(super) struct MemberLeave {
    pub component: ComponentRef,
    pub pod: String,
}

impl LifecycleAction for MemberLeave {
    fn name(&self) -> String {
        "memberLeave".into()
    }

    fn parameters(&self, _: &[Pod]) -> BTreeMap<String, String> {
        let mut params = self.component.parameters();
        params.insert("KB_LEAVE_MEMBER_POD_NAME".into(), self.pod.clone());
        params.insert(
            "KB_LEAVE_MEMBER_POD_FQDN".into(),
            self.component.pod_fqdn(&self.pod),
        );
        params
    }
}

pub(super) struct Reconfigure {
    pub args: BTreeMap<String, String>,
}

impl LifecycleAction for Reconfigure {
    fn name(&self) -> String {
        "reconfigure".into()
    }

    fn parameters(&self, _: &[Pod]) -> BTreeMap<String, String> {
        self.args.clone()
    }
}

pub(super) struct AccountProvision {
    pub statement: String,
    pub user: String,
    pub password: String,
}

impl LifecycleAction for AccountProvision {
    fn name(&self) -> String {
        "accountProvision".into()
    }

    fn parameters(&self, _: &[Pod]) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("KB_ACCOUNT_STATEMENT".to_string(), self.statement.clone()),
            ("KB_ACCOUNT_NAME".to_string(), self.user.clone()),
            ("KB_ACCOUNT_PASSWORD".to_string(), self.password.clone()),
        ])
    }
}

pub(super) struct UserDefined {
    pub name: String,
    pub args: BTreeMap<String, String>,
}

impl LifecycleAction for UserDefined {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn parameters(&self, _: &[Pod]) -> BTreeMap<String, String> {
        self.args.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::pod_with_ip;

    fn component() -> ComponentRef {
        ComponentRef {
            namespace: "default".into(),
            cluster_name: "mycluster".into(),
            comp_name: "mysql".into(),
        }
    }

    #[test]
    fn post_provision_lists_pods_in_order() {
        let pods = vec![
            pod_with_ip("mycluster-mysql-1", "10.0.0.2"),
            pod_with_ip("mycluster-mysql-0", "10.0.0.1"),
        ];
        let params = PostProvision(component()).parameters(&pods);
        assert_eq!(params["KB_CLUSTER_COMP_NAME"], "mycluster-mysql");
        assert_eq!(
            params["KB_CLUSTER_COMPONENT_POD_NAME_LIST"],
            "mycluster-mysql-0,mycluster-mysql-1"
        );
        assert_eq!(params["KB_CLUSTER_COMPONENT_POD_IP_LIST"], "10.0.0.1,10.0.0.2");
    }

    #[test]
    fn switchover_names_both_pods() {
        let params = Switchover {
            component: component(),
            role: "leader".into(),
            current_pod: "mycluster-mysql-0".into(),
            candidate_pod: "mycluster-mysql-1".into(),
        }
        .parameters(&[]);
        assert_eq!(params["KB_SWITCHOVER_ROLE"], "leader");
        assert_eq!(
            params["KB_SWITCHOVER_CANDIDATE_FQDN"],
            "mycluster-mysql-1.mycluster-mysql-headless.default.svc.cluster.local"
        );
    }
}
