//! Configuration Management
//!
//! The demo topology with its defaults, loaded once at startup from
//! `~/.config/psc-demo/config.json` (or `--config`, JSON or YAML), then
//! overridden by environment variables and CLI flags.

use crate::gcp::auth;
use crate::provision::descriptor::is_valid_name;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_REGION: &str = "us-central1";
pub const DEFAULT_ZONE: &str = "us-central1-a";

/// A subnet and its primary range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub name: String,
    pub cidr: String,
}

impl SubnetConfig {
    fn new(name: &str, cidr: &str) -> Self {
        Self {
            name: name.to_string(),
            cidr: cidr.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub subnet: SubnetConfig,
    /// NAT subnet for Private Service Connect (provider side only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psc_nat_subnet: Option<SubnetConfig>,
}

impl NetworkConfig {
    pub fn provider() -> Self {
        Self {
            name: "hypershift-redhat".to_string(),
            subnet: SubnetConfig::new("hypershift-redhat-subnet", "10.1.0.0/24"),
            psc_nat_subnet: Some(SubnetConfig::new("hypershift-redhat-psc-nat", "10.1.1.0/24")),
        }
    }

    pub fn consumer() -> Self {
        Self {
            name: "hypershift-customer".to_string(),
            subnet: SubnetConfig::new("hypershift-customer-subnet", "10.2.0.0/24"),
            psc_nat_subnet: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    /// Network tag used by firewall targeting
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmsConfig {
    pub machine_type: String,
    /// Image or image family link
    pub image: String,
    pub disk_size_gb: u32,
    pub service: VmConfig,
    pub client: VmConfig,
}

impl Default for VmsConfig {
    fn default() -> Self {
        Self {
            machine_type: "e2-micro".to_string(),
            image: "projects/ubuntu-os-cloud/global/images/family/ubuntu-2404-lts-amd64".to_string(),
            disk_size_gb: 20,
            service: VmConfig {
                name: "redhat-service-vm".to_string(),
                tag: "service-vm".to_string(),
            },
            client: VmConfig {
                name: "customer-client-vm".to_string(),
                tag: "client-vm".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PscConfig {
    pub health_check: String,
    pub instance_group: String,
    pub backend_service: String,
    pub forwarding_rule: String,
    pub service_attachment: String,
    pub endpoint_address: String,
    pub endpoint_forwarding_rule: String,
    pub service_port: u16,
}

impl Default for PscConfig {
    fn default() -> Self {
        Self {
            health_check: "redhat-service-health-check".to_string(),
            instance_group: "redhat-service-group".to_string(),
            backend_service: "redhat-backend-service".to_string(),
            forwarding_rule: "redhat-forwarding-rule".to_string(),
            service_attachment: "redhat-service-attachment".to_string(),
            endpoint_address: "customer-psc-endpoint-ip".to_string(),
            endpoint_forwarding_rule: "customer-psc-forwarding-rule".to_string(),
            service_port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub initial_interval_secs: u64,
    pub max_interval_secs: u64,
    /// Upper bound on one operation; unbounded when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_timeout_secs: Option<u64>,
    pub readiness_interval_secs: u64,
    pub readiness_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_interval_secs: 1,
            max_interval_secs: 10,
            operation_timeout_secs: None,
            readiness_interval_secs: 10,
            readiness_timeout_secs: 300,
        }
    }
}

impl PollingConfig {
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }
}

/// Demo configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project_id: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub provider: NetworkConfig,
    pub consumer: NetworkConfig,
    pub vms: VmsConfig,
    pub psc: PscConfig,
    pub polling: PollingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_id: None,
            region: None,
            zone: None,
            provider: NetworkConfig::provider(),
            consumer: NetworkConfig::consumer(),
            vms: VmsConfig::default(),
            psc: PscConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub project: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub operation_timeout_secs: Option<u64>,
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("psc-demo").join("config.json"))
    }

    /// Load configuration from `path`, or from the default path when it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::parse(&content, is_yaml(&path))
            .with_context(|| format!("Invalid config file {}", path.display()))?;

        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str, yaml: bool) -> Result<Self> {
        if yaml {
            Ok(serde_yaml::from_str(content)?)
        } else {
            Ok(serde_json::from_str(content)?)
        }
    }

    /// Apply `PROJECT_ID`, `REGION` and `ZONE`
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(project) = get("PROJECT_ID") {
            self.project_id = Some(project);
        }
        if let Some(region) = get("REGION") {
            self.region = Some(region);
        }
        if let Some(zone) = get("ZONE") {
            self.zone = Some(zone);
        }
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(project) = overrides.project {
            self.project_id = Some(project);
        }
        if let Some(region) = overrides.region {
            self.region = Some(region);
        }
        if let Some(zone) = overrides.zone {
            self.zone = Some(zone);
        }
        if let Some(timeout) = overrides.operation_timeout_secs {
            self.polling.operation_timeout_secs = Some(timeout);
        }
    }

    /// Get effective project (flags > env > config > gcloud default)
    pub fn effective_project(&self) -> Option<String> {
        self.project_id.clone().or_else(auth::get_default_project)
    }

    /// Get effective zone (flags > env > config > gcloud default)
    pub fn effective_zone(&self) -> String {
        self.zone
            .clone()
            .or_else(auth::get_default_zone)
            .unwrap_or_else(|| DEFAULT_ZONE.to_string())
    }

    /// Get effective region; falls back to the zone's region
    pub fn effective_region(&self) -> String {
        self.region
            .clone()
            .or_else(auth::get_default_region)
            .unwrap_or_else(|| match &self.zone {
                Some(zone) => auth::region_of_zone(zone),
                None => DEFAULT_REGION.to_string(),
            })
    }

    /// Fill in project, region and zone, then validate
    pub fn resolve(mut self) -> Result<Self> {
        self.project_id = self.effective_project();
        self.zone = Some(self.effective_zone());
        self.region = Some(self.effective_region());
        self.validate()?;
        Ok(self)
    }

    pub fn project(&self) -> &str {
        self.project_id.as_deref().unwrap_or_default()
    }

    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_REGION)
    }

    pub fn zone(&self) -> &str {
        self.zone.as_deref().unwrap_or(DEFAULT_ZONE)
    }

    pub fn validate(&self) -> Result<()> {
        let Some(project) = self.project_id.as_deref() else {
            bail!("No project configured. Use --project, PROJECT_ID or 'gcloud config set project'");
        };
        if !auth::validate_project_id(project) {
            bail!("'{}' is not a valid project ID", project);
        }
        if !self.zone().starts_with(&format!("{}-", self.region())) {
            bail!("Zone '{}' is not in region '{}'", self.zone(), self.region());
        }

        for network in [&self.provider, &self.consumer] {
            check_name(&network.name)?;
            check_subnet(&network.subnet)?;
            if let Some(nat) = &network.psc_nat_subnet {
                check_subnet(nat)?;
            }
        }
        if self.provider.psc_nat_subnet.is_none() {
            bail!("The provider network needs a psc_nat_subnet for the service attachment");
        }
        if self.provider.name == self.consumer.name {
            bail!("Provider and consumer networks must have different names");
        }

        for name in [
            &self.vms.service.name,
            &self.vms.client.name,
            &self.psc.health_check,
            &self.psc.instance_group,
            &self.psc.backend_service,
            &self.psc.forwarding_rule,
            &self.psc.service_attachment,
            &self.psc.endpoint_address,
            &self.psc.endpoint_forwarding_rule,
        ] {
            check_name(name)?;
        }
        if self.psc.service_port == 0 {
            bail!("psc.service_port must be non-zero");
        }
        if self.polling.initial_interval_secs == 0
            || self.polling.max_interval_secs < self.polling.initial_interval_secs
        {
            bail!("polling intervals must satisfy 0 < initial_interval_secs <= max_interval_secs");
        }
        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}

fn check_name(name: &str) -> Result<()> {
    if !is_valid_name(name) {
        bail!("'{}' is not a valid resource name", name);
    }
    Ok(())
}

fn check_subnet(subnet: &SubnetConfig) -> Result<()> {
    check_name(&subnet.name)?;
    if !is_valid_cidr(&subnet.cidr) {
        bail!("Subnet '{}' has invalid range '{}'", subnet.name, subnet.cidr);
    }
    Ok(())
}

/// IPv4 `a.b.c.d/n` with `n <= 32`
pub fn is_valid_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    addr.parse::<std::net::Ipv4Addr>().is_ok() && prefix.parse::<u8>().is_ok_and(|p| p <= 32)
}
