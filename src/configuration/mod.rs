//! Config file diffing: what changed between the applied and the current version of a
//! component's ConfigMap, and writing parameter updates back into file content.

mod format;
mod merge;
mod patch;

pub use format::{parse, Parameters};
pub use merge::{merge_parameters, ParameterUpdates};
pub use patch::{create_config_patch, last_applied_data, ConfigPatch};
