//! Provisioning errors
//!
//! Every variant names the resource it concerns so the driver can report
//! the aborting step together with the remote detail.

use super::descriptor::ResourceRef;
use super::operation::CancelReason;
use crate::gcp::error::ApiError;
use serde_json::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProvisionError>;

#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    #[error("invalid {resource}: {reason}")]
    InvalidDescriptor { resource: String, reason: String },

    /// The existence query failed with something other than not-found
    #[error("could not determine whether {resource} exists: {source}")]
    AmbiguousExists {
        resource: ResourceRef,
        #[source]
        source: ApiError,
    },

    #[error("{resource} does not exist")]
    NotFound { resource: ResourceRef },

    /// The API rejected the request outright
    #[error("{action} request for {resource} was rejected: {source}")]
    Submit {
        resource: ResourceRef,
        action: String,
        #[source]
        source: ApiError,
    },

    /// The operation was accepted and then reported an error
    #[error("operation {operation} for {resource} failed: {detail}")]
    OperationFailed {
        resource: ResourceRef,
        operation: String,
        detail: Value,
    },

    /// The status query failed; the resource may or may not exist now
    #[error("lost track of operation {operation} for {resource} (re-run to re-check existence): {source}")]
    PollFailed {
        resource: ResourceRef,
        operation: String,
        #[source]
        source: ApiError,
    },

    #[error("waiting on {operation} for {resource} was cancelled ({reason})")]
    Cancelled {
        resource: ResourceRef,
        operation: String,
        reason: CancelReason,
    },

    #[error("unexpected operation response for {resource}: {message}")]
    MalformedOperation { resource: ResourceRef, message: String },

    #[error("step '{step}' requires {missing}, which no earlier step provides")]
    UnresolvedDependency { step: String, missing: ResourceRef },
}

impl ProvisionError {
    /// Raw remote payload behind this error, if the API sent one
    pub fn remote_detail(&self) -> Option<&Value> {
        match self {
            Self::OperationFailed { detail, .. } => Some(detail),
            Self::AmbiguousExists { source, .. }
            | Self::Submit { source, .. }
            | Self::PollFailed { source, .. } => source.body(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
