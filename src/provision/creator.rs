//! Idempotent resource creation
//!
//! [`Provisioner`] composes the existence check, the submit call and the
//! operation poller into "ensure present", "ensure absent" and "reconcile".
//! Same-resource calls are serialized by a per-resource gate, and an insert
//! rejected as already existing counts as present.

use super::api::ComputeApi;
use super::checker::{self, Presence};
use super::descriptor::{ResourceDescriptor, ResourceRef};
use super::error::{ProvisionError, Result};
use super::operation::{CancelReason, OperationHandle};
use super::poller::Poller;
use super::reconcile::{Change, Probe, Reconcile};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

/// Result of [`Provisioner::ensure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    AlreadyPresent,
}

/// Result of [`Provisioner::ensure_absent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    Deleted,
    AlreadyAbsent,
}

/// Result of [`Provisioner::reconcile`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Updated,
    Unchanged,
}

type Slots = Mutex<HashMap<ResourceRef, Arc<tokio::sync::Mutex<()>>>>;

/// Name-keyed async mutex; one in-flight call per resource
#[derive(Default)]
struct SingleFlight {
    slots: Slots,
}

impl SingleFlight {
    async fn acquire(&self, key: &ResourceRef) -> Flight<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.clone()).or_default().clone()
        };
        Flight {
            slots: &self.slots,
            key: key.clone(),
            guard: Some(slot.lock_owned().await),
        }
    }
}

/// Held for the duration of one call; the slot is dropped with its last user
struct Flight<'a> {
    slots: &'a Slots,
    key: ResourceRef,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // release while holding the map so no caller can clone the slot in between
        drop(self.guard.take());
        if slots.get(&self.key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(&self.key);
        }
    }
}

pub struct Provisioner {
    api: Arc<dyn ComputeApi>,
    poller: Poller,
    gate: SingleFlight,
    cancel: CancellationToken,
}

impl Provisioner {
    pub fn new(api: Arc<dyn ComputeApi>) -> Self {
        Self {
            api,
            poller: Poller::default(),
            gate: SingleFlight::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_poller(mut self, poller: Poller) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn api(&self) -> &dyn ComputeApi {
        self.api.as_ref()
    }

    pub fn project(&self) -> &str {
        self.api.project()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn exists(&self, resource: &ResourceRef) -> Result<Presence> {
        checker::exists(self.api.as_ref(), resource).await
    }

    /// Create the resource unless it already exists
    pub async fn ensure(&self, descriptor: &ResourceDescriptor) -> Result<EnsureOutcome> {
        descriptor.validate()?;
        let id = &descriptor.id;
        let _flight = self.gate.acquire(id).await;

        if self.exists(id).await?.is_present() {
            tracing::info!("{} already exists", id);
            return Ok(EnsureOutcome::AlreadyPresent);
        }
        self.check_cancelled(id, "insert")?;

        tracing::info!("Creating {} in {}", id, id.scope);
        let response = match self.api.insert(id.kind, &id.scope, &descriptor.body).await {
            Ok(response) => response,
            Err(e) if e.is_already_exists() => {
                tracing::info!("{} was created concurrently, treating as present", id);
                return Ok(EnsureOutcome::AlreadyPresent);
            }
            Err(source) => {
                return Err(ProvisionError::Submit {
                    resource: id.clone(),
                    action: "insert".to_string(),
                    source,
                })
            }
        };

        match self.complete(id, &response).await {
            Ok(()) => {
                tracing::info!("Created {}", id);
                Ok(EnsureOutcome::Created)
            }
            Err(ProvisionError::OperationFailed { ref detail, .. }) if reports_already_exists(detail) => {
                tracing::info!("{} was created concurrently, treating as present", id);
                Ok(EnsureOutcome::AlreadyPresent)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the resource if it exists
    pub async fn ensure_absent(&self, resource: &ResourceRef) -> Result<RemovalOutcome> {
        resource.validate()?;
        let _flight = self.gate.acquire(resource).await;

        if !self.exists(resource).await?.is_present() {
            tracing::info!("{} already absent", resource);
            return Ok(RemovalOutcome::AlreadyAbsent);
        }
        self.check_cancelled(resource, "delete")?;

        tracing::info!("Deleting {} in {}", resource, resource.scope);
        let response = match self.api.delete(resource).await {
            Ok(response) => response,
            Err(e) if e.is_not_found() => return Ok(RemovalOutcome::AlreadyAbsent),
            Err(source) => {
                return Err(ProvisionError::Submit {
                    resource: resource.clone(),
                    action: "delete".to_string(),
                    source,
                })
            }
        };

        self.complete(resource, &response).await?;
        tracing::info!("Deleted {}", resource);
        Ok(RemovalOutcome::Deleted)
    }

    /// Apply a mutation to an existing resource unless already in effect
    pub async fn reconcile(&self, step: &Reconcile) -> Result<ReconcileOutcome> {
        let target = &step.target;
        target.validate()?;
        let _flight = self.gate.acquire(target).await;

        let current = self.probe(step).await?;
        if (step.is_satisfied)(&current) {
            tracing::info!("{} already up to date ({})", target, step.change.action());
            return Ok(ReconcileOutcome::Unchanged);
        }

        self.check_cancelled(target, step.change.action())?;

        let body = (step.build)(&current);
        tracing::info!("Applying {} to {}", step.change.action(), target);
        let submitted = match &step.change {
            Change::Invoke(verb) => self.api.invoke(target, verb, &body).await,
            Change::Patch => self.api.patch(target, &body).await,
        };
        let response = submitted.map_err(|source| ProvisionError::Submit {
            resource: target.clone(),
            action: step.change.action().to_string(),
            source,
        })?;

        self.complete(target, &response).await?;
        Ok(ReconcileOutcome::Updated)
    }

    async fn probe(&self, step: &Reconcile) -> Result<Value> {
        let target = &step.target;
        match &step.probe {
            Probe::Get => match self.exists(target).await? {
                Presence::Present(current) => Ok(current),
                Presence::Absent => Err(ProvisionError::NotFound {
                    resource: target.clone(),
                }),
            },
            Probe::Invoke { verb, body } => {
                self.api
                    .invoke(target, verb, body)
                    .await
                    .map_err(|source| {
                        if source.is_not_found() {
                            ProvisionError::NotFound {
                                resource: target.clone(),
                            }
                        } else {
                            ProvisionError::AmbiguousExists {
                                resource: target.clone(),
                                source,
                            }
                        }
                    })
            }
        }
    }

    /// Nothing is submitted once cancellation was requested
    fn check_cancelled(&self, resource: &ResourceRef, action: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::info!("Not submitting {} for {}: cancelled", action, resource);
            return Err(ProvisionError::Cancelled {
                resource: resource.clone(),
                operation: action.to_string(),
                reason: CancelReason::Signal,
            });
        }
        Ok(())
    }

    async fn complete(&self, resource: &ResourceRef, response: &Value) -> Result<()> {
        let handle = OperationHandle::from_response(resource, response)?;
        tracing::debug!("Waiting on operation {} for {}", handle.name, resource);
        self.poller
            .wait(self.api.as_ref(), &handle, &self.cancel)
            .await
            .into_result(resource, &handle)
    }
}

/// `RESOURCE_ALREADY_EXISTS` in an operation's error list
fn reports_already_exists(detail: &Value) -> bool {
    detail
        .get("errors")
        .and_then(|v| v.as_array())
        .is_some_and(|errors| {
            errors
                .iter()
                .any(|e| e.get("code").and_then(|c| c.as_str()) == Some("RESOURCE_ALREADY_EXISTS"))
        })
}
