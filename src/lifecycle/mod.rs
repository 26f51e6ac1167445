use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    resources::{Action, RetryPolicy},
    store::ObjectStore,
};

mod actions;
pub mod agent;
mod kbagent;
pub mod proto;
mod selector;

pub use agent::{AgentClient, AgentClientFactory, AgentError, DefaultAgentClientFactory};
pub use kbagent::Kbagent;
pub use selector::select_target_pods;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("action {action} is not defined{}", detail(.message))]
    ActionNotDefined { action: String, message: String },

    #[error("action {action} is not implemented{}", detail(.message))]
    ActionNotImplemented { action: String, message: String },

    #[error("action {action} precondition failed{}", detail(.message))]
    PreconditionFailed { action: String, message: String },

    #[error("action {action} is in progress{}", detail(.message))]
    ActionInProgress { action: String, message: String },

    #[error("action {action} is busy{}", detail(.message))]
    ActionBusy { action: String, message: String },

    #[error("action {action} timed out{}", detail(.message))]
    ActionTimedOut { action: String, message: String },

    #[error("action {action} failed{}", detail(.message))]
    ActionFailed { action: String, message: String },

    #[error("action {action} internal error{}", detail(.message))]
    ActionInternalError { action: String, message: String },

    /// A dependency of the action (workload, component or cluster) is not ready yet
    #[error("{0}")]
    Precondition(String),

    #[error("no available pod to execute action {0}")]
    NoAvailablePod(String),

    #[error("{0}")]
    UnsupportedSelector(String),

    #[error("pod {pod} is unavailable to execute action {action}: {reason}")]
    PodUnavailable {
        pod: String,
        action: String,
        reason: String,
    },

    #[error("http error occurred when executing action {action} at pod {pod}: {reason}")]
    Transport {
        action: String,
        pod: String,
        reason: String,
    },
}

fn detail(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!(", error: {message}")
    }
}

impl LifecycleError {
    /// A short stable code, used as a metric label
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::ActionNotDefined { .. } => "notdefined",
            LifecycleError::ActionNotImplemented { .. } => "notimplemented",
            LifecycleError::PreconditionFailed { .. } => "preconditionfailed",
            LifecycleError::ActionInProgress { .. } => "inprogress",
            LifecycleError::ActionBusy { .. } => "busy",
            LifecycleError::ActionTimedOut { .. } => "timedout",
            LifecycleError::ActionFailed { .. } => "failed",
            LifecycleError::ActionInternalError { .. } => "internalerror",
            LifecycleError::Precondition(_) => "precondition",
            LifecycleError::NoAvailablePod(_) => "noavailablepod",
            LifecycleError::UnsupportedSelector(_) => "unsupportedselector",
            LifecycleError::PodUnavailable { .. } => "podunavailable",
            LifecycleError::Transport { .. } => "transport",
        }
    }

    /// The remote side or a dependency is not ready, try again later without counting a failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::PreconditionFailed { .. }
                | LifecycleError::Precondition(_)
                | LifecycleError::ActionInProgress { .. }
                | LifecycleError::ActionBusy { .. }
        )
    }

    /// Retrying cannot help, a human has to fix the definition or the request
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LifecycleError::ActionNotDefined { .. }
                | LifecycleError::ActionNotImplemented { .. }
                | LifecycleError::ActionInternalError { .. }
                | LifecycleError::UnsupportedSelector(_)
        )
    }
}

/// Per-call overrides of the action request
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub non_blocking: Option<bool>,
    pub timeout_seconds: Option<i32>,
    pub retry_policy: Option<RetryPolicy>,
}

pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

/// Lifecycle actions of a component, executed by the agent running next to each replica
#[async_trait]
pub trait Lifecycle {
    async fn post_provision<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
    ) -> LifecycleResult<()>;

    async fn pre_terminate<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
    ) -> LifecycleResult<()>;

    /// Returns the raw output of the probe, empty if no replica produced any
    async fn role_probe<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
    ) -> LifecycleResult<Vec<u8>>;

    async fn switchover<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
        candidate: &str,
    ) -> LifecycleResult<()>;

    async fn member_join<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
    ) -> LifecycleResult<()>;

    async fn member_leave<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
    ) -> LifecycleResult<()>;

    async fn reconfigure<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
        args: BTreeMap<String, String>,
    ) -> LifecycleResult<()>;

    async fn account_provision<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
        statement: &str,
        user: &str,
        password: &str,
    ) -> LifecycleResult<()>;

    async fn user_defined<S: ObjectStore>(
        &self,
        cli: &S,
        opts: Option<&Options>,
        name: &str,
        action: &Action,
        args: BTreeMap<String, String>,
    ) -> LifecycleResult<()>;
}
