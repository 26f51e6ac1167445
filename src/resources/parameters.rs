use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Describes the parameters of one config file and how changes to them are applied
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "ParametersDefinition",
    group = "parameters.kubeblocks.io",
    version = "v1alpha1",
    derive = "Default",
    shortname = "paramsdef"
)]
#[serde(rename_all = "camelCase")]
pub struct ParametersDefinitionSpec {
    /// The config file (ConfigMap key) the definition applies to.
    pub file_name: String,

    pub reload_policy: Option<ReloadPolicy>,

    #[serde(default)]
    pub parameters: Vec<ParameterDescription>,

    /// Parameters that only take effect after a restart.
    #[serde(default)]
    pub static_parameters: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDescription {
    pub name: String,
    #[serde(default)]
    pub force_restart: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReloadPolicy {
    None,
    DynamicReload,
    #[default]
    Restart,
}

impl ParametersDefinition {
    /// Whether changing the parameter requires a restart
    pub fn requires_restart(&self, key: &str) -> bool {
        self.spec
            .static_parameters
            .iter()
            .any(|p| p == key)
            || self
                .spec
                .parameters
                .iter()
                .any(|p| p.force_restart && p.name == key)
    }
}

/// Binds a component definition to its parameters definitions and file formats
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "ParamConfigRenderer",
    group = "parameters.kubeblocks.io",
    version = "v1alpha1",
    derive = "Default",
    shortname = "pcr"
)]
#[serde(rename_all = "camelCase")]
pub struct ParamConfigRendererSpec {
    pub component_def: String,

    #[serde(default)]
    pub parameters_defs: Vec<String>,

    #[serde(default)]
    pub configs: Vec<ComponentConfigDescription>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfigDescription {
    /// Config file name, the key inside the rendered ConfigMap.
    pub name: String,
    pub template_name: Option<String>,
    pub file_format_config: Option<FileFormatConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileFormatConfig {
    pub format: CfgFileFormat,
    pub ini_config: Option<IniConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IniConfig {
    /// Only keys of this section are considered, without a section prefix.
    pub section_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CfgFileFormat {
    #[default]
    Ini,
    Yaml,
    Json,
    Toml,
    Properties,
    Dotenv,
    Redis,
}

impl fmt::Display for CfgFileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CfgFileFormat::Ini => "ini",
            CfgFileFormat::Yaml => "yaml",
            CfgFileFormat::Json => "json",
            CfgFileFormat::Toml => "toml",
            CfgFileFormat::Properties => "properties",
            CfgFileFormat::Dotenv => "dotenv",
            CfgFileFormat::Redis => "redis",
        };
        f.write_str(name)
    }
}

impl ParamConfigRendererSpec {
    pub fn file_format(&self, file: &str) -> Option<&FileFormatConfig> {
        self.configs
            .iter()
            .find(|c| c.name == file)
            .and_then(|c| c.file_format_config.as_ref())
    }
}

/// Tracks how each config template of a component has been applied
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "ComponentParameter",
    group = "parameters.kubeblocks.io",
    version = "v1alpha1",
    status = "ComponentParameterStatus",
    derive = "Default",
    namespaced,
    shortname = "compparam"
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentParameterSpec {
    pub cluster_name: String,
    pub component_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentParameterStatus {
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub configuration_status: Vec<ConfigTemplateItemDetailStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigTemplateItemDetailStatus {
    /// Config template name.
    pub name: String,
    pub phase: Option<ParameterPhase>,
    pub message: Option<String>,

    /// Revision of the ConfigMap this status refers to.
    pub update_revision: Option<String>,
    pub reconcile_detail: Option<ReconcileDetail>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileDetail {
    pub policy: String,
    pub exec_result: String,
    pub current_revision: String,
    pub succeed_count: i32,
    pub expected_count: i32,
    pub err_message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ParameterPhase {
    Upgrading,
    Finished,
    Failed,
    FailedAndPause,
}

impl ComponentParameter {
    pub fn item_status(&self, template: &str) -> Option<&ConfigTemplateItemDetailStatus> {
        self.status
            .as_ref()?
            .configuration_status
            .iter()
            .find(|s| s.name == template)
    }
}
