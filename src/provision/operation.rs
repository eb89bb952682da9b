//! Long-running operation handles and outcomes

use super::descriptor::{ResourceKind, ResourceRef, Scope};
use super::error::ProvisionError;
use crate::gcp::error::ApiError;
use serde_json::Value;
use std::fmt;

/// Handle to a submitted Compute operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    pub name: String,
    pub scope: Scope,
    pub kind: ResourceKind,
    /// Resource the operation acts on
    pub target: String,
}

impl OperationHandle {
    /// Extract the handle from a submit response.
    /// Compute operations live in the same scope as the resource they act on.
    pub fn from_response(resource: &ResourceRef, response: &Value) -> Result<Self, ProvisionError> {
        let name = response
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProvisionError::MalformedOperation {
                resource: resource.clone(),
                message: "response carries no operation name".to_string(),
            })?;

        Ok(Self {
            name: name.to_string(),
            scope: resource.scope.clone(),
            kind: resource.kind,
            target: resource.name.clone(),
        })
    }
}

/// Status reported by an operation status query
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    Pending,
    Running,
    Done { error: Option<Value> },
    Unknown(String),
}

impl OperationStatus {
    pub fn from_json(operation: &Value) -> Self {
        let status = operation
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        match status {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "DONE" => {
                let error = operation
                    .get("error")
                    .filter(|e| !e.is_null())
                    .filter(|e| e.as_object().map(|m| !m.is_empty()).unwrap_or(true))
                    .cloned();
                Self::Done { error }
            }
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Why polling stopped before a terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token fired
    Signal,
    /// The per-operation deadline passed
    Deadline,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal => f.write_str("cancelled by caller"),
            Self::Deadline => f.write_str("deadline exceeded"),
        }
    }
}

/// Terminal result of waiting on an operation
#[derive(Debug, Clone)]
pub enum OperationOutcome {
    Succeeded,
    /// Remote `error` payload, verbatim
    Failed(Value),
    PollError(ApiError),
    Cancelled(CancelReason),
}

impl OperationOutcome {
    pub fn into_result(self, resource: &ResourceRef, handle: &OperationHandle) -> Result<(), ProvisionError> {
        let operation = handle.name.clone();
        match self {
            Self::Succeeded => Ok(()),
            Self::Failed(detail) => Err(ProvisionError::OperationFailed {
                resource: resource.clone(),
                operation,
                detail,
            }),
            Self::PollError(source) => Err(ProvisionError::PollFailed {
                resource: resource.clone(),
                operation,
                source,
            }),
            Self::Cancelled(reason) => Err(ProvisionError::Cancelled {
                resource: resource.clone(),
                operation,
                reason,
            }),
        }
    }
}
