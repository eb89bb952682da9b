//! Resource managers for the demo topology
//!
//! Each manager turns the [`Config`](crate::config::Config) into descriptors,
//! reconcile steps and pipelines for one layer of the demo:
//!
//! - [`network`] - VPCs, subnets and firewall rules
//! - [`vm`] - Service and client instances, readiness wait
//! - [`connectivity`] - The Private Service Connect chain
//! - [`verify`] - Read-only checks on the result
//! - [`teardown`] - Removal in reverse order

pub mod connectivity;
pub mod network;
pub mod teardown;
pub mod verify;
pub mod vm;

pub use connectivity::PscManager;
pub use network::NetworkManager;
pub use teardown::TeardownManager;
pub use verify::{VerificationReport, VerifyManager};
pub use vm::{Readiness, VmManager};
