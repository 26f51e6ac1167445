use thiserror::Error;

/// Expose all controller components used by main
pub mod operator;
pub mod resources;

/// Config file diffing and parameter merging
pub mod configuration;
/// Remote agent (kbagent) action client
pub mod lifecycle;
/// Operation handlers and the progress tracker
pub mod operations;
/// Reload planning and execution for changed configuration
pub mod reconfigure;

pub mod constant;
pub mod events;
pub mod settings;
pub mod store;
pub mod workload;

mod reconcilers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub(crate) mod fixtures;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("failed to parse {file} as {format}: {reason}")]
    ConfigParse {
        file: String,
        format: String,
        reason: String,
    },

    #[error("Lifecycle action error: {0}")]
    Lifecycle(#[from] lifecycle::LifecycleError),

    #[error("Illegal {0}: {1}")]
    IllegalObject(String, String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::SerializationError(_) => "serializationerror".into(),
            Error::KubeError(_) => "kubeerror".into(),
            Error::NotFound { .. } => "notfound".into(),
            Error::ConfigParse { .. } => "configparse".into(),
            Error::Lifecycle(e) => format!("lifecycle_{}", e.code()),
            Error::IllegalObject(..) => "illegalobject".into(),
            Error::Timeout(_) => "timeout".into(),
            Error::Transport(_) => "transport".into(),
        }
    }

    /// Whether the error only means the object has not been created yet
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }
}
