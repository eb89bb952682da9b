//! Top-level orchestration for the `up`, `verify` and `down` commands

use crate::config::Config;
use crate::manager::{NetworkManager, PscManager, Readiness, TeardownManager, VerificationReport, VerifyManager, VmManager};
use crate::provision::api::ComputeApi;
use crate::provision::creator::Provisioner;
use crate::provision::error::ProvisionError;
use crate::provision::pipeline::Plan;
use crate::provision::poller::{BackoffPolicy, Poller};
use crate::report::RunReport;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What `up` did
#[derive(Debug, Default)]
pub struct UpReport {
    pub run: RunReport,
    /// Set once the VM phase completed
    pub readiness: Option<Readiness>,
    /// Set when every provisioning phase succeeded and verification passed
    pub verification: Option<VerificationReport>,
    /// Set when every provisioning phase succeeded but verification did not
    pub verification_error: Option<ProvisionError>,
}

impl UpReport {
    pub fn is_success(&self) -> bool {
        self.run.is_success()
            && self.readiness != Some(Readiness::Cancelled)
            && self.verification_error.is_none()
    }
}

pub struct Driver {
    provisioner: Provisioner,
    networks: NetworkManager,
    vms: VmManager,
    psc: PscManager,
    verifier: VerifyManager,
    teardown: TeardownManager,
}

impl Driver {
    pub fn new(config: Arc<Config>, api: Arc<dyn ComputeApi>, cancel: CancellationToken) -> Self {
        let polling = &config.polling;
        let mut poller = Poller::new(BackoffPolicy {
            initial: Duration::from_secs(polling.initial_interval_secs),
            max: Duration::from_secs(polling.max_interval_secs),
            multiplier: 2,
        });
        if let Some(deadline) = polling.operation_timeout() {
            poller = poller.with_deadline(deadline);
        }

        Self {
            provisioner: Provisioner::new(api).with_poller(poller).with_cancellation(cancel),
            networks: NetworkManager::new(config.clone()),
            vms: VmManager::new(config.clone()),
            psc: PscManager::new(config.clone()),
            verifier: VerifyManager::new(config.clone()),
            teardown: TeardownManager::new(config),
        }
    }

    /// Networks, then VMs, then the PSC chain
    pub fn provisioning_plan(&self) -> Plan {
        Plan::new()
            .phase(self.networks.phase())
            .phase(self.vms.phase())
            .phase(self.psc.phase())
    }

    /// Provision everything, wait for the VMs, then verify
    pub async fn up(&self) -> Result<UpReport> {
        let plan = self.provisioning_plan();
        let mut run = plan.start().context("Provisioning plan is inconsistent")?;
        let mut report = UpReport::default();

        while let Some(phase) = run.next_phase(&self.provisioner).await {
            if phase.name != crate::manager::vm::PHASE {
                continue;
            }
            let readiness = self
                .vms
                .wait_until_ready(self.provisioner.api(), self.provisioner.cancel_token())
                .await
                .context("Failed to check instance status")?;
            let cancelled = readiness == Readiness::Cancelled;
            report.readiness = Some(readiness);
            if cancelled {
                run.stop();
            }
        }

        report.run = run.finish();
        if !report.is_success() {
            return Ok(report);
        }

        tracing::info!("Provisioning complete, verifying connectivity");
        match self.verifier.verify(self.provisioner.api()).await {
            Ok(verification) => report.verification = Some(verification),
            Err(e) => {
                tracing::warn!("Verification failed: {}", e);
                report.verification_error = Some(e);
            }
        }
        Ok(report)
    }

    pub async fn verify(&self) -> Result<VerificationReport> {
        self.verifier
            .verify(self.provisioner.api())
            .await
            .context("Verification failed")
    }

    /// Remove everything in reverse order
    pub async fn down(&self) -> Result<RunReport> {
        let report = self
            .teardown
            .plan()
            .run(&self.provisioner)
            .await
            .context("Teardown plan is inconsistent")?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::memory::InMemoryCompute;

    fn config() -> Arc<Config> {
        Arc::new(Config {
            project_id: Some("demo-project".to_string()),
            ..Config::default()
        })
    }

    fn driver(api: Arc<InMemoryCompute>) -> Driver {
        Driver::new(config(), api, CancellationToken::new())
    }

    #[test]
    fn test_provisioning_plan_is_consistent() {
        let api = Arc::new(InMemoryCompute::new("demo-project"));
        let plan = driver(api).provisioning_plan();
        assert!(plan.validate().is_ok());
        let names: Vec<&str> = plan.phases().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["networks", "vms", "connectivity"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_up_then_down() {
        let api = Arc::new(InMemoryCompute::new("demo-project"));
        let d = driver(api.clone());

        let up = d.up().await.unwrap();
        assert!(up.is_success());
        assert_eq!(up.readiness, Some(Readiness::Ready));
        let verification = up.verification.unwrap();
        assert!(verification.is_connected());

        let down = d.down().await.unwrap();
        assert!(down.is_success());
        assert!(api.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let api = Arc::new(InMemoryCompute::new("demo-project"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let d = Driver::new(config(), api.clone(), cancel);

        let up = d.up().await.unwrap();
        assert!(!up.is_success());
        assert!(up.verification.is_none());
        assert_eq!(api.calls().inserts, 0);
        assert_eq!(up.run.skipped_phases, vec!["vms".to_string(), "connectivity".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_failure_keeps_run_report() {
        let api = Arc::new(InMemoryCompute::new("demo-project"));
        let d = driver(api.clone());
        // created normally, then invisible to the read-only checks
        let endpoint = PscManager::new(config()).endpoint_ref();
        api.hide_from_lookup(&endpoint);

        let up = d.up().await.unwrap();

        assert!(up.run.is_success());
        assert_eq!(up.run.count("created"), api.calls().inserts);
        assert!(up.verification.is_none());
        assert!(matches!(
            up.verification_error,
            Some(ProvisionError::NotFound { ref resource }) if *resource == endpoint
        ));
        assert!(!up.is_success());
    }
}
