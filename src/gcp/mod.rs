//! GCP API interaction module
//!
//! # Module Structure
//!
//! - [`auth`] - Access tokens (ADC or pre-issued) and gcloud defaults
//! - [`client`] - Compute Engine client implementing the provisioning API
//! - [`error`] - Structured API errors and their categories
//! - [`http`] - HTTP utilities for REST API calls
//!
//! # Example
//!
//! ```ignore
//! use crate::gcp::client::GcpClient;
//! use crate::provision::api::ComputeApi;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let client = GcpClient::new("my-project").await?;
//!     let network = client.get(&ResourceRef::global(ResourceKind::Network, "default")).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod http;
