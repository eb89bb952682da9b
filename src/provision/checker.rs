//! Resource existence checks

use super::api::ComputeApi;
use super::descriptor::ResourceRef;
use super::error::ProvisionError;
use serde_json::Value;

/// Answer of an existence check
#[derive(Debug, Clone, PartialEq)]
pub enum Presence {
    /// The resource exists; carries its current representation
    Present(Value),
    Absent,
}

impl Presence {
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }
}

/// Look up a resource by name.
///
/// Only a structured not-found answer maps to [`Presence::Absent`]. Any other
/// failure is [`ProvisionError::AmbiguousExists`] and must never be read as
/// absence.
pub async fn exists(api: &dyn ComputeApi, resource: &ResourceRef) -> Result<Presence, ProvisionError> {
    resource.validate()?;

    match api.get(resource).await {
        Ok(value) => Ok(Presence::Present(value)),
        Err(e) if e.is_not_found() => {
            tracing::debug!("{} not found in {}", resource, resource.scope);
            Ok(Presence::Absent)
        }
        Err(source) => {
            tracing::warn!("Existence check for {} failed: {}", resource, source);
            Err(ProvisionError::AmbiguousExists {
                resource: resource.clone(),
                source,
            })
        }
    }
}
