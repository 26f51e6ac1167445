//! Well-known label and annotation keys, object kinds and name generators.

pub const APP_INSTANCE_LABEL_KEY: &str = "app.kubernetes.io/instance";
pub const APP_MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";
pub const KB_APP_COMPONENT_LABEL_KEY: &str = "apps.kubeblocks.io/component-name";
pub const KB_APP_SHARDING_NAME_LABEL_KEY: &str = "apps.kubeblocks.io/sharding-name";
pub const VOLUME_CLAIM_TEMPLATE_NAME_LABEL_KEY: &str = "apps.kubeblocks.io/vct-name";
pub const ROLE_LABEL_KEY: &str = "kubeblocks.io/role";

pub const CM_CONFIGURATION_TEMPLATE_NAME_LABEL_KEY: &str = "config.kubeblocks.io/config-template-name";
pub const CM_CONFIGURATION_TYPE_LABEL_KEY: &str = "config.kubeblocks.io/config-type";
pub const CM_CONFIGURATION_SPEC_PROVIDER_LABEL_KEY: &str = "config.kubeblocks.io/config-spec";

pub const LAST_APPLIED_CONFIGURATION_ANNOTATION_KEY: &str =
    "config.kubeblocks.io/last-applied-configuration";
pub const RECONFIGURE_TYPE_ANNOTATION_KEY: &str = "config.kubeblocks.io/reconfigure-type";
pub const CONFIGURATION_REVISION_ANNOTATION_KEY: &str = "config.kubeblocks.io/configuration-revision";
pub const RESTART_ANNOTATION_PREFIX: &str = "config.kubeblocks.io/restart-";
pub const RESTART_ANNOTATION_KEY: &str = "kubeblocks.io/restart";

pub const POD_KIND: &str = "Pod";
pub const COMPONENT_KIND: &str = "Component";
pub const PVC_KIND: &str = "PVC";

pub const KB_AGENT_CONTAINER_NAME: &str = "kbagent";
pub const KB_AGENT_HTTP_PORT_NAME: &str = "http";

/// Name of the component object owned by a cluster
pub fn generate_cluster_component_name(cluster: &str, component: &str) -> String {
    format!("{cluster}-{component}")
}

/// Name of the workload (InstanceSet) backing a component
pub fn generate_workload_name_pattern(cluster: &str, component: &str) -> String {
    format!("{cluster}-{component}")
}

/// Name of the ComponentParameter tracking a component's configuration
pub fn generate_component_parameter_name(cluster: &str, component: &str) -> String {
    format!("{cluster}-{component}")
}

/// Key of a progress detail row
pub fn progress_object_key(kind: &str, name: &str) -> String {
    format!("{kind}/{name}")
}

/// Name of the ConfigMap a config template of a component is rendered into
pub fn generate_component_config_name(cluster: &str, component: &str, config_spec: &str) -> String {
    format!("{cluster}-{component}-{config_spec}")
}
