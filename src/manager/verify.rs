//! Read-only checks on a provisioned demo

use super::connectivity::PscManager;
use crate::config::Config;
use crate::gcp::error::ApiError;
use crate::provision::api::ComputeApi;
use crate::provision::checker::{self, Presence};
use crate::provision::descriptor::ResourceRef;
use crate::provision::error::ProvisionError;
use crate::provision::reconcile::self_link;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHealth {
    pub instance: String,
    pub state: String,
}

impl BackendHealth {
    pub fn is_healthy(&self) -> bool {
        self.state == "HEALTHY"
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub endpoint_ip: Option<String>,
    pub psc_connection_status: Option<String>,
    pub load_balancer_ip: Option<String>,
    pub connection_preference: Option<String>,
    pub connected_endpoints: usize,
    pub backends: Vec<BackendHealth>,
    pub service_port: u16,
    pub warnings: Vec<String>,
}

impl VerificationReport {
    pub fn is_connected(&self) -> bool {
        self.psc_connection_status.as_deref() == Some("ACCEPTED")
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());

        writeln!(f, "PSC endpoint IP:        {}", show(&self.endpoint_ip))?;
        writeln!(f, "PSC connection status:  {}", show(&self.psc_connection_status))?;
        writeln!(f, "Internal LB IP:         {}", show(&self.load_balancer_ip))?;
        writeln!(f, "Connection preference:  {}", show(&self.connection_preference))?;
        writeln!(f, "Connected endpoints:    {}", self.connected_endpoints)?;
        for backend in &self.backends {
            let icon = if backend.is_healthy() { "✓" } else { "✗" };
            writeln!(f, "  {} {} {}", icon, backend.instance, backend.state)?;
        }
        for warning in &self.warnings {
            writeln!(f, "warning: {}", warning)?;
        }
        if let Some(ip) = &self.endpoint_ip {
            write!(
                f,
                "Test from the client VM: curl http://{}:{}/health",
                ip, self.service_port
            )?;
        }
        Ok(())
    }
}

pub struct VerifyManager {
    config: Arc<Config>,
    psc: PscManager,
}

impl VerifyManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            psc: PscManager::new(config.clone()),
            config,
        }
    }

    async fn fetch(&self, api: &dyn ComputeApi, resource: &ResourceRef) -> Result<Value, ProvisionError> {
        match checker::exists(api, resource).await? {
            Presence::Present(value) => Ok(value),
            Presence::Absent => Err(ProvisionError::NotFound {
                resource: resource.clone(),
            }),
        }
    }

    async fn backend_health(&self, api: &dyn ComputeApi) -> Result<Vec<BackendHealth>, ProvisionError> {
        let backend = self.psc.backend_service_ref();
        let group = self_link(self.config.project(), &self.psc.instance_group_ref());

        let response = api
            .invoke(&backend, "getHealth", &json!({ "group": group }))
            .await
            .map_err(|source| health_error(&backend, source))?;

        Ok(response
            .get("healthStatus")
            .and_then(|v| v.as_array())
            .map(|statuses| {
                statuses
                    .iter()
                    .map(|s| BackendHealth {
                        instance: s
                            .get("instance")
                            .and_then(|v| v.as_str())
                            .and_then(|link| link.rsplit('/').next())
                            .unwrap_or_default()
                            .to_string(),
                        state: s
                            .get("healthState")
                            .and_then(|v| v.as_str())
                            .unwrap_or("UNKNOWN")
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Run every check concurrently; the first missing resource aborts
    pub async fn verify(&self, api: &dyn ComputeApi) -> Result<VerificationReport, ProvisionError> {
        let endpoint = self.psc.endpoint_ref();
        let load_balancer = self.psc.forwarding_rule_ref();
        let attachment = self.psc.service_attachment_ref();

        let (endpoint, load_balancer, attachment, backends) = futures::try_join!(
            self.fetch(api, &endpoint),
            self.fetch(api, &load_balancer),
            self.fetch(api, &attachment),
            self.backend_health(api),
        )?;

        let text = |value: &Value, key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let mut report = VerificationReport {
            endpoint_ip: text(&endpoint, "IPAddress"),
            psc_connection_status: text(&endpoint, "pscConnectionStatus"),
            load_balancer_ip: text(&load_balancer, "IPAddress"),
            connection_preference: text(&attachment, "connectionPreference"),
            connected_endpoints: attachment
                .get("connectedEndpoints")
                .and_then(|v| v.as_array())
                .map_or(0, Vec::len),
            backends,
            service_port: self.config.psc.service_port,
            warnings: Vec::new(),
        };

        if !report.is_connected() {
            report.warnings.push(format!(
                "PSC connection status is {}",
                report.psc_connection_status.as_deref().unwrap_or("unset")
            ));
        }
        if report.backends.is_empty() {
            report.warnings.push("no backend health reported yet".to_string());
        }
        for backend in report.backends.iter().filter(|b| !b.is_healthy()) {
            report
                .warnings
                .push(format!("backend {} is {}", backend.instance, backend.state));
        }
        for warning in &report.warnings {
            tracing::warn!("{}", warning);
        }

        Ok(report)
    }
}

fn health_error(backend: &ResourceRef, source: ApiError) -> ProvisionError {
    if source.is_not_found() {
        ProvisionError::NotFound {
            resource: backend.clone(),
        }
    } else {
        ProvisionError::AmbiguousExists {
            resource: backend.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::vm::VmManager;
    use crate::provision::memory::InMemoryCompute;

    fn config() -> Arc<Config> {
        Arc::new(Config {
            project_id: Some("demo-project".to_string()),
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_an_error() {
        let api = InMemoryCompute::new("demo-project");
        let err = VerifyManager::new(config()).verify(&api).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_reports_connection_and_health() {
        let config = config();
        let psc = PscManager::new(config.clone());
        let vms = VmManager::new(config.clone());
        let api = InMemoryCompute::new("demo-project");

        api.seed(&vms.service_ref(), json!({}));
        api.seed(&psc.instance_group_ref(), json!({}));
        api.invoke(
            &psc.instance_group_ref(),
            "addInstances",
            &json!({ "instances": [{ "instance": self_link("demo-project", &vms.service_ref()) }] }),
        )
        .await
        .unwrap();
        api.seed(&psc.backend_service_ref(), json!({}));
        api.seed(&psc.forwarding_rule_ref(), json!({}));
        api.seed(&psc.service_attachment_ref(), json!({ "connectionPreference": "ACCEPT_AUTOMATIC" }));
        api.seed(&psc.endpoint_address_ref(), json!({}));
        api.seed(
            &psc.endpoint_ref(),
            json!({
                "IPAddress": self_link("demo-project", &psc.endpoint_address_ref()),
                "target": self_link("demo-project", &psc.service_attachment_ref()),
            }),
        );

        let report = VerifyManager::new(config).verify(&api).await.unwrap();

        assert!(report.is_connected());
        assert_eq!(report.connected_endpoints, 1);
        assert_eq!(report.connection_preference.as_deref(), Some("ACCEPT_AUTOMATIC"));
        assert_eq!(
            report.backends,
            vec![BackendHealth {
                instance: "redhat-service-vm".to_string(),
                state: "HEALTHY".to_string()
            }]
        );
        assert!(report.warnings.is_empty());
        assert!(report.to_string().contains(":8080/health"));
    }
}
