//! Idempotent provisioning of a two-VPC Private Service Connect demo on
//! Google Compute Engine.

pub mod config;
pub mod driver;
pub mod gcp;
pub mod manager;
pub mod provision;
pub mod report;

/// Version injected at compile time via PSC_DEMO_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("PSC_DEMO_VERSION") {
    Some(v) => v,
    None => "dev",
};
