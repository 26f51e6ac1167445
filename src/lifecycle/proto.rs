//! Wire types of the agent's action endpoint.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};

use super::LifecycleError;
use crate::resources::RetryPolicy;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub non_blocking: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Base64 encoded on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ByteString>,
}

impl ActionResponse {
    pub fn output_bytes(&self) -> Option<&[u8]> {
        self.output
            .as_ref()
            .map(|o| o.0.as_slice())
            .filter(|o| !o.is_empty())
    }
}

/// Error codes the agent reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined,
    NotImplemented,
    PreconditionFailed,
    BadRequest,
    InProgress,
    Busy,
    TimedOut,
    Failed,
    InternalError,
}

impl ErrorCode {
    /// Codes are matched ignoring case and `-`/`_` separators
    pub fn parse(code: &str) -> Option<Self> {
        let normalized: String = code
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Some(match normalized.as_str() {
            "notdefined" => ErrorCode::NotDefined,
            "notimplemented" => ErrorCode::NotImplemented,
            "preconditionfailed" => ErrorCode::PreconditionFailed,
            "badrequest" => ErrorCode::BadRequest,
            "inprogress" => ErrorCode::InProgress,
            "busy" => ErrorCode::Busy,
            "timedout" => ErrorCode::TimedOut,
            "failed" => ErrorCode::Failed,
            "internalerror" => ErrorCode::InternalError,
            _ => return None,
        })
    }
}

/// Map an error response of the agent to the lifecycle error taxonomy
pub fn format_error(action: &str, rsp: &ActionResponse) -> LifecycleError {
    let action = action.to_string();
    let message = rsp.message.clone();
    match ErrorCode::parse(&rsp.error) {
        Some(ErrorCode::NotDefined) => LifecycleError::ActionNotDefined { action, message },
        Some(ErrorCode::NotImplemented) => LifecycleError::ActionNotImplemented { action, message },
        Some(ErrorCode::PreconditionFailed) => LifecycleError::PreconditionFailed { action, message },
        Some(ErrorCode::BadRequest) | Some(ErrorCode::InternalError) => {
            LifecycleError::ActionInternalError { action, message }
        }
        Some(ErrorCode::InProgress) => LifecycleError::ActionInProgress { action, message },
        Some(ErrorCode::Busy) => LifecycleError::ActionBusy { action, message },
        Some(ErrorCode::TimedOut) => LifecycleError::ActionTimedOut { action, message },
        Some(ErrorCode::Failed) => LifecycleError::ActionFailed { action, message },
        None => LifecycleError::ActionFailed {
            action,
            message: format!("{}: {}", rsp.error, rsp.message),
        },
    }
}
