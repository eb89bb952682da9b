//! Service and client VMs
//!
//! One VM per network, no external IP, configured by cloud-init through
//! `user-data` metadata. After creation the driver waits for both to report
//! `RUNNING` before building the connectivity chain.

use crate::config::{Config, NetworkConfig, VmConfig};
use crate::provision::api::ComputeApi;
use crate::provision::checker::{self, Presence};
use crate::provision::descriptor::{ResourceDescriptor, ResourceKind, ResourceRef};
use crate::provision::error::ProvisionError;
use crate::provision::pipeline::{Phase, Pipeline, Step};
use crate::provision::reconcile::self_link;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const PHASE: &str = "vms";

const SERVICE_CLOUD_INIT: &str = include_str!("cloud-init/service.yaml");
const CLIENT_CLOUD_INIT: &str = include_str!("cloud-init/client.yaml");

/// Result of waiting for instances to boot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Instances still not RUNNING when the wait gave up
    TimedOut(Vec<String>),
    Cancelled,
}

pub struct VmManager {
    config: Arc<Config>,
}

impl VmManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn instance_ref(&self, vm: &VmConfig) -> ResourceRef {
        ResourceRef::zonal(ResourceKind::Instance, &vm.name, self.config.zone())
    }

    pub fn service_ref(&self) -> ResourceRef {
        self.instance_ref(&self.config.vms.service)
    }

    pub fn client_ref(&self) -> ResourceRef {
        self.instance_ref(&self.config.vms.client)
    }

    fn cloud_init(&self, template: &str) -> String {
        template.replace("{{SERVICE_PORT}}", &self.config.psc.service_port.to_string())
    }

    fn descriptor(&self, vm: &VmConfig, network: &NetworkConfig, cloud_init: String) -> ResourceDescriptor {
        let project = self.config.project();
        let zone = self.config.zone();
        let vms = &self.config.vms;
        let subnet = ResourceRef::regional(ResourceKind::Subnetwork, &network.subnet.name, self.config.region());

        ResourceDescriptor::new(
            self.instance_ref(vm),
            json!({
                "machineType": format!("zones/{}/machineTypes/{}", zone, vms.machine_type),
                "networkInterfaces": [{
                    "subnetwork": self_link(project, &subnet),
                    "accessConfigs": []
                }],
                "disks": [{
                    "boot": true,
                    "autoDelete": true,
                    "initializeParams": {
                        "sourceImage": vms.image,
                        "diskSizeGb": vms.disk_size_gb.to_string()
                    }
                }],
                "metadata": {
                    "items": [{ "key": "user-data", "value": cloud_init }]
                },
                "tags": { "items": [vm.tag] },
                "labels": { "app": "psc-demo" }
            }),
        )
        .requires(subnet)
    }

    pub fn service_descriptor(&self) -> ResourceDescriptor {
        self.descriptor(
            &self.config.vms.service,
            &self.config.provider,
            self.cloud_init(SERVICE_CLOUD_INIT),
        )
    }

    pub fn client_descriptor(&self) -> ResourceDescriptor {
        self.descriptor(
            &self.config.vms.client,
            &self.config.consumer,
            self.cloud_init(CLIENT_CLOUD_INIT),
        )
    }

    pub fn phase(&self) -> Phase {
        Phase::new(PHASE)
            .pipeline(Pipeline::new("service-vm").step(Step::ensure("create-service-vm", self.service_descriptor())))
            .pipeline(Pipeline::new("client-vm").step(Step::ensure("create-client-vm", self.client_descriptor())))
    }

    pub fn teardown_steps(&self) -> Vec<Step> {
        vec![
            Step::remove("delete-service-vm", self.service_ref()),
            Step::remove("delete-client-vm", self.client_ref()),
        ]
    }

    /// Poll both instances until they report RUNNING or the wait gives up.
    /// A timeout is not an error; the caller decides whether to go on.
    pub async fn wait_until_ready(
        &self,
        api: &dyn ComputeApi,
        cancel: &CancellationToken,
    ) -> Result<Readiness, ProvisionError> {
        let polling = &self.config.polling;
        let interval = Duration::from_secs(polling.readiness_interval_secs.max(1));
        let deadline = Instant::now() + Duration::from_secs(polling.readiness_timeout_secs);
        let instances = [self.service_ref(), self.client_ref()];

        loop {
            let mut pending = Vec::new();
            for instance in &instances {
                let status = match checker::exists(api, instance).await? {
                    Presence::Present(value) => value
                        .get("status")
                        .and_then(|s| s.as_str())
                        .unwrap_or("UNKNOWN")
                        .to_string(),
                    Presence::Absent => {
                        return Err(ProvisionError::NotFound {
                            resource: instance.clone(),
                        })
                    }
                };
                tracing::debug!("{} status: {}", instance, status);
                if status != "RUNNING" {
                    pending.push(instance.name.clone());
                }
            }

            if pending.is_empty() {
                tracing::info!("All instances are RUNNING");
                return Ok(Readiness::Ready);
            }
            if Instant::now() + interval > deadline {
                tracing::warn!(
                    "Instances not RUNNING after {}s: {}; continuing",
                    polling.readiness_timeout_secs,
                    pending.join(", ")
                );
                return Ok(Readiness::TimedOut(pending));
            }

            tracing::info!("Waiting for {} to reach RUNNING", pending.join(", "));
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Readiness::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::memory::InMemoryCompute;

    fn manager() -> VmManager {
        VmManager::new(Arc::new(Config {
            project_id: Some("demo-project".to_string()),
            ..Config::default()
        }))
    }

    #[test]
    fn test_service_vm_body() {
        let d = manager().service_descriptor();
        assert_eq!(d.id.name, "redhat-service-vm");
        assert_eq!(d.body["machineType"], "zones/us-central1-a/machineTypes/e2-micro");
        assert_eq!(d.body["networkInterfaces"][0]["accessConfigs"], json!([]));
        assert!(d.body["networkInterfaces"][0]["subnetwork"]
            .as_str()
            .unwrap()
            .ends_with("regions/us-central1/subnetworks/hypershift-redhat-subnet"));
        assert_eq!(d.body["tags"]["items"], json!(["service-vm"]));
        assert_eq!(d.body["disks"][0]["initializeParams"]["diskSizeGb"], "20");

        let user_data = d.body["metadata"]["items"][0]["value"].as_str().unwrap();
        assert!(user_data.starts_with("#cloud-config"));
        assert!(user_data.contains("(\"0.0.0.0\", 8080)"));
        assert!(!user_data.contains("{{SERVICE_PORT}}"));
    }

    #[test]
    fn test_client_vm_lives_in_consumer_subnet() {
        let m = manager();
        let d = m.client_descriptor();
        assert_eq!(d.requires[0].name, "hypershift-customer-subnet");
        assert_eq!(d.body["tags"]["items"], json!(["client-vm"]));
        let user_data = d.body["metadata"]["items"][0]["value"].as_str().unwrap();
        assert!(user_data.contains("netcat-openbsd"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_when_running() {
        let m = manager();
        let api = InMemoryCompute::new("demo-project");
        api.seed(&m.service_ref(), json!({}));
        api.seed(&m.client_ref(), json!({}));

        let readiness = m.wait_until_ready(&api, &CancellationToken::new()).await.unwrap();
        assert_eq!(readiness, Readiness::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_error() {
        let m = manager();
        let api = InMemoryCompute::new("demo-project");
        api.seed(&m.service_ref(), json!({}));
        api.seed(&m.client_ref(), json!({}));
        // seeding materializes RUNNING; overwrite to simulate a slow boot
        let mut staging = api.resource(&m.client_ref()).unwrap();
        staging["status"] = json!("STAGING");
        api.replace(&m.client_ref(), staging);

        let started = Instant::now();
        let readiness = m.wait_until_ready(&api, &CancellationToken::new()).await.unwrap();

        assert_eq!(readiness, Readiness::TimedOut(vec!["customer-client-vm".to_string()]));
        assert!(started.elapsed() <= Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_instance_is_an_error() {
        let m = manager();
        let api = InMemoryCompute::new("demo-project");
        api.seed(&m.service_ref(), json!({}));

        let err = m.wait_until_ready(&api, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound { .. }));
    }
}
