//! Idempotent provisioning core
//!
//! # Module Structure
//!
//! - [`api`] - The Compute API seam consumed by everything below
//! - [`descriptor`] - Resource identity, scope and insert bodies
//! - [`checker`] - Existence checks
//! - [`operation`] - Operation handles, statuses and outcomes
//! - [`poller`] - Backoff polling with deadline and cancellation
//! - [`creator`] - Ensure present / ensure absent / reconcile
//! - [`reconcile`] - Mutations of existing resources
//! - [`pipeline`] - Fail-fast pipelines, concurrent phases, validated plans
//! - [`memory`] - In-process API for dry runs and tests

pub mod api;
pub mod checker;
pub mod creator;
pub mod descriptor;
pub mod error;
pub mod memory;
pub mod operation;
pub mod pipeline;
pub mod poller;
pub mod reconcile;

pub use api::ComputeApi;
pub use creator::{EnsureOutcome, Provisioner, ReconcileOutcome, RemovalOutcome};
pub use descriptor::{ResourceDescriptor, ResourceKind, ResourceRef, Scope};
pub use error::ProvisionError;
pub use pipeline::{Phase, Pipeline, Plan, PlanRun, Step};
pub use poller::{BackoffPolicy, Poller};
