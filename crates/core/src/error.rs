use serde::{Deserialize, Serialize};

/// Failure taxonomy shared by every stage of a run.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "message")]
pub enum KeelError {
    #[error("not_found: {0}")]
    NotFound(String),
    /// Concurrent modification detected by the control plane.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The desired object is malformed; retrying cannot help.
    #[error("validation: {0}")]
    Validation(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Transport or control-plane availability problem.
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("timeout: {0}")]
    Timeout(String),
    /// Resources are healthy but the application call failed.
    #[error("verification: {0}")]
    Verification(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type KeelResult<T> = Result<T, KeelError>;

impl KeelError {
    /// Errors worth handing back to a caller that may re-run the whole deploy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeelError::Conflict(_) | KeelError::Unavailable(_) | KeelError::Timeout(_))
    }

    /// Errors the reconciler and waiter absorb locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, KeelError::Conflict(_) | KeelError::Unavailable(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            KeelError::NotFound(_) => "not_found",
            KeelError::Conflict(_) => "conflict",
            KeelError::Validation(_) => "validation",
            KeelError::Forbidden(_) => "forbidden",
            KeelError::Unavailable(_) => "unavailable",
            KeelError::Timeout(_) => "timeout",
            KeelError::Verification(_) => "verification",
            KeelError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for KeelError {
    fn from(e: serde_json::Error) -> Self { KeelError::Validation(format!("json: {}", e)) }
}
