use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::ConfigMap;
use serde::Serialize;
use tracing::debug;

use super::format::{self, Parameters};
use crate::{
    constant::LAST_APPLIED_CONFIGURATION_ANNOTATION_KEY,
    resources::{CfgFileFormat, ParamConfigRendererSpec, ParametersDefinition},
    Result,
};

/// Key-level changes of a ConfigMap, grouped by file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub is_modify: bool,
    pub add_config: BTreeMap<String, Parameters>,
    pub delete_config: BTreeMap<String, Parameters>,
    pub update_config: BTreeMap<String, Parameters>,
}

impl ConfigPatch {
    /// Files with at least one key-level delta
    pub fn changed_files(&self) -> BTreeSet<String> {
        self.add_config
            .keys()
            .chain(self.delete_config.keys())
            .chain(self.update_config.keys())
            .cloned()
            .collect()
    }

    /// The part of the patch that touches the given files
    pub fn slice(&self, files: &BTreeSet<String>) -> ConfigPatch {
        let pick = |m: &BTreeMap<String, Parameters>| -> BTreeMap<String, Parameters> {
            m.iter()
                .filter(|(f, _)| files.contains(*f))
                .map(|(f, p)| (f.clone(), p.clone()))
                .collect()
        };
        let mut slice = ConfigPatch {
            is_modify: false,
            add_config: pick(&self.add_config),
            delete_config: pick(&self.delete_config),
            update_config: pick(&self.update_config),
        };
        slice.is_modify = !slice.changed_files().is_empty();
        slice
    }

    /// Parameters to hand to a dynamic reload, per file: new values for added and updated
    /// keys, an empty value for deleted ones
    pub fn reload_parameters(&self) -> BTreeMap<String, Parameters> {
        let mut files: BTreeMap<String, Parameters> = BTreeMap::new();
        for (file, params) in &self.delete_config {
            let entry = files.entry(file.clone()).or_default();
            entry.extend(params.keys().map(|k| (k.clone(), String::new())));
        }
        for source in [&self.add_config, &self.update_config] {
            for (file, params) in source {
                files
                    .entry(file.clone())
                    .or_default()
                    .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        files
    }

    fn record(
        target: &mut BTreeMap<String, Parameters>,
        file: &str,
        key: &str,
        value: &str,
    ) {
        target
            .entry(file.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
}

/// The data a ConfigMap was last reconciled with
pub fn last_applied_data(cm: &ConfigMap) -> Result<BTreeMap<String, String>> {
    let annotation = cm
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(LAST_APPLIED_CONFIGURATION_ANNOTATION_KEY));
    match annotation {
        Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(raw)?),
        _ => Ok(BTreeMap::new()),
    }
}

fn requires_restart(
    param_defs: &[ParametersDefinition],
    file: &str,
    format: CfgFileFormat,
    key: &str,
) -> bool {
    param_defs
        .iter()
        .filter(|d| d.spec.file_name == file)
        .any(|d| {
            d.requires_restart(key)
                || (format == CfgFileFormat::Ini
                    && key
                        .split_once('.')
                        .map_or(false, |(_, bare)| d.requires_restart(bare)))
        })
}

/// Diff the ConfigMap data against its last-applied version
///
/// Returns the key-level patch (`None` when every file is unchanged) and whether the
/// change can only be applied by restarting the component.
pub fn create_config_patch(
    current: &ConfigMap,
    renderer: Option<&ParamConfigRendererSpec>,
    param_defs: &[ParametersDefinition],
) -> Result<(Option<ConfigPatch>, bool)> {
    let previous = last_applied_data(current)?;
    let empty = BTreeMap::new();
    let data = current.data.as_ref().unwrap_or(&empty);

    let files: BTreeSet<&String> = previous.keys().chain(data.keys()).collect();
    let mut patch = ConfigPatch::default();
    let mut force_restart = false;
    let mut any_changed = false;

    for file in files {
        let old = previous.get(file);
        let new = data.get(file);
        if old == new {
            continue;
        }
        any_changed = true;

        let Some(file_format) = renderer.and_then(|r| r.file_format(file)) else {
            debug!(file, "changed file has no declared format, restart required");
            force_restart = true;
            ConfigPatch::record(
                &mut patch.update_config,
                file,
                file,
                new.map(String::as_str).unwrap_or_default(),
            );
            continue;
        };

        let old_params = match old {
            Some(content) => format::parse(file, content, file_format)?,
            None => Parameters::new(),
        };
        let new_params = match new {
            Some(content) => format::parse(file, content, file_format)?,
            None => Parameters::new(),
        };

        for (key, value) in &new_params {
            match old_params.get(key) {
                None => ConfigPatch::record(&mut patch.add_config, file, key, value),
                Some(before) if before != value => {
                    ConfigPatch::record(&mut patch.update_config, file, key, value)
                }
                Some(_) => continue,
            }
            force_restart |= requires_restart(param_defs, file, file_format.format, key);
        }
        for (key, value) in &old_params {
            if !new_params.contains_key(key) {
                ConfigPatch::record(&mut patch.delete_config, file, key, value);
                force_restart |= requires_restart(param_defs, file, file_format.format, key);
            }
        }
    }

    if !any_changed {
        return Ok((None, false));
    }
    patch.is_modify = !patch.changed_files().is_empty();
    Ok((Some(patch), force_restart))
}
