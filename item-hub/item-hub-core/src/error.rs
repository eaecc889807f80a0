use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::acl::PermissionLevel;
use crate::limits::LimitKind;

/// Typed failure taxonomy for hierarchy operations.
///
/// Bulk operations report one of these per root item, so the variants are
/// serializable and travel inside operation-feedback events. `Integrity` and
/// `Unavailable` are retryable; everything else is terminal for the request
/// that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum HubError {
    #[error("item {0} not found")]
    NotFound(Uuid),

    #[error("requires {required} permission")]
    Forbidden { required: PermissionLevel },

    #[error("{limit} limit exceeded: {actual} > {max}")]
    LimitExceeded {
        limit: LimitKind,
        actual: usize,
        max: usize,
    },

    #[error("destination lies inside the subtree being moved")]
    Cycle,

    #[error("malformed path token: {0}")]
    MalformedPath(String),

    #[error("path already occupied: {0}")]
    DuplicatePath(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl HubError {
    /// Whether the coordinator may retry the operation once before
    /// surfacing a terminal failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HubError::Integrity(_) | HubError::Unavailable(_))
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Unavailable(err.to_string())
    }
}
