//! The remote Compute API as seen by the provisioning core

use super::descriptor::{ResourceKind, ResourceRef, Scope};
use crate::gcp::error::ApiError;
use async_trait::async_trait;
use serde_json::Value;

/// The subset of the Compute REST API the provisioning core consumes.
///
/// Mutating calls return the raw Operation resource; callers turn it into an
/// [`OperationHandle`](super::operation::OperationHandle) and poll it.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Project every call is scoped to
    fn project(&self) -> &str;

    /// `GET {scope}/{collection}/{name}`
    async fn get(&self, resource: &ResourceRef) -> Result<Value, ApiError>;

    /// `POST {scope}/{collection}`
    async fn insert(&self, kind: ResourceKind, scope: &Scope, body: &Value) -> Result<Value, ApiError>;

    /// `DELETE {scope}/{collection}/{name}`
    async fn delete(&self, resource: &ResourceRef) -> Result<Value, ApiError>;

    /// `POST {scope}/{collection}/{name}/{verb}`
    async fn invoke(&self, resource: &ResourceRef, verb: &str, body: &Value) -> Result<Value, ApiError>;

    /// `PATCH {scope}/{collection}/{name}`
    async fn patch(&self, resource: &ResourceRef, body: &Value) -> Result<Value, ApiError>;

    /// `GET {scope}/operations/{name}`
    async fn get_operation(&self, scope: &Scope, name: &str) -> Result<Value, ApiError>;
}
