//! Private Service Connect chain
//!
//! health check -> instance group (+ membership, named port) -> internal
//! backend service (+ backend) -> internal forwarding rule -> service
//! attachment -> consumer address -> consumer endpoint.
//!
//! Each link references the previous one by name, so the chain is a single
//! sequential pipeline.

use super::network::NetworkManager;
use super::vm::VmManager;
use crate::config::Config;
use crate::provision::descriptor::{ResourceDescriptor, ResourceKind, ResourceRef};
use crate::provision::pipeline::{Phase, Pipeline, Step};
use crate::provision::reconcile::{same_resource, self_link, Change, Probe, Reconcile};
use serde_json::{json, Value};
use std::sync::Arc;

pub const PHASE: &str = "connectivity";

/// Named port the backend service targets
pub const NAMED_PORT: &str = "http";

pub struct PscManager {
    config: Arc<Config>,
    vms: VmManager,
}

impl PscManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            vms: VmManager::new(config.clone()),
            config,
        }
    }

    fn project(&self) -> &str {
        self.config.project()
    }

    fn regional(&self, kind: ResourceKind, name: &str) -> ResourceRef {
        ResourceRef::regional(kind, name, self.config.region())
    }

    fn link(&self, resource: &ResourceRef) -> String {
        self_link(self.project(), resource)
    }

    pub fn health_check_ref(&self) -> ResourceRef {
        ResourceRef::global(ResourceKind::HealthCheck, &self.config.psc.health_check)
    }

    pub fn instance_group_ref(&self) -> ResourceRef {
        ResourceRef::zonal(ResourceKind::InstanceGroup, &self.config.psc.instance_group, self.config.zone())
    }

    pub fn backend_service_ref(&self) -> ResourceRef {
        self.regional(ResourceKind::BackendService, &self.config.psc.backend_service)
    }

    pub fn forwarding_rule_ref(&self) -> ResourceRef {
        self.regional(ResourceKind::ForwardingRule, &self.config.psc.forwarding_rule)
    }

    pub fn service_attachment_ref(&self) -> ResourceRef {
        self.regional(ResourceKind::ServiceAttachment, &self.config.psc.service_attachment)
    }

    pub fn endpoint_address_ref(&self) -> ResourceRef {
        self.regional(ResourceKind::Address, &self.config.psc.endpoint_address)
    }

    pub fn endpoint_ref(&self) -> ResourceRef {
        self.regional(ResourceKind::ForwardingRule, &self.config.psc.endpoint_forwarding_rule)
    }

    fn subnet_ref(&self, name: &str) -> ResourceRef {
        self.regional(ResourceKind::Subnetwork, name)
    }

    fn nat_subnet_ref(&self) -> Option<ResourceRef> {
        self.config
            .provider
            .psc_nat_subnet
            .as_ref()
            .map(|nat| self.subnet_ref(&nat.name))
    }

    pub fn health_check(&self) -> ResourceDescriptor {
        ResourceDescriptor::new(
            self.health_check_ref(),
            json!({
                "description": "TCP health check for the PSC demo service",
                "type": "TCP",
                "tcpHealthCheck": { "port": self.config.psc.service_port },
                "checkIntervalSec": 10,
                "timeoutSec": 5,
                "healthyThreshold": 2,
                "unhealthyThreshold": 3
            }),
        )
    }

    pub fn instance_group(&self) -> ResourceDescriptor {
        let network = NetworkManager::network_ref(&self.config.provider);
        ResourceDescriptor::new(
            self.instance_group_ref(),
            json!({
                "description": "Unmanaged group holding the service VM",
                "network": self.link(&network),
            }),
        )
        .requires(network)
    }

    /// Service VM membership, probed with `listInstances`
    pub fn group_membership(&self) -> Reconcile {
        let instance = self.vms.service_ref();
        let instance_link = self.link(&instance);
        let wanted = instance_link.clone();

        Reconcile::new(
            self.instance_group_ref(),
            Probe::Invoke {
                verb: "listInstances".to_string(),
                body: json!({ "instanceState": "ALL" }),
            },
            Change::Invoke("addInstances".to_string()),
            move |current| {
                current
                    .get("items")
                    .and_then(|v| v.as_array())
                    .is_some_and(|items| {
                        items.iter().any(|item| {
                            item.get("instance")
                                .and_then(|v| v.as_str())
                                .is_some_and(|link| same_resource(link, &wanted))
                        })
                    })
            },
            move |_| json!({ "instances": [{ "instance": instance_link }] }),
        )
        .requires(instance)
    }

    pub fn named_ports(&self) -> Reconcile {
        let port = self.config.psc.service_port;

        Reconcile::new(
            self.instance_group_ref(),
            Probe::Get,
            Change::Invoke("setNamedPorts".to_string()),
            move |current| {
                current
                    .get("namedPorts")
                    .and_then(|v| v.as_array())
                    .is_some_and(|ports| {
                        ports.iter().any(|p| {
                            p.get("name").and_then(|v| v.as_str()) == Some(NAMED_PORT)
                                && p.get("port").and_then(|v| v.as_u64()) == Some(u64::from(port))
                        })
                    })
            },
            move |current| {
                let mut body = json!({ "namedPorts": [{ "name": NAMED_PORT, "port": port }] });
                if let Some(fingerprint) = current.get("fingerprint") {
                    body["fingerprint"] = fingerprint.clone();
                }
                body
            },
        )
    }

    pub fn backend_service(&self) -> ResourceDescriptor {
        let health_check = self.health_check_ref();
        ResourceDescriptor::new(
            self.backend_service_ref(),
            json!({
                "description": "Internal TCP backend for the PSC demo service",
                "loadBalancingScheme": "INTERNAL",
                "protocol": "TCP",
                "healthChecks": [self.link(&health_check)],
            }),
        )
        .requires(health_check)
    }

    /// Instance group as a backend, applied by PATCH with the fingerprint
    pub fn backend_attachment(&self) -> Reconcile {
        let group = self.instance_group_ref();
        let group_link = self.link(&group);
        let wanted = group_link.clone();

        Reconcile::new(
            self.backend_service_ref(),
            Probe::Get,
            Change::Patch,
            move |current| {
                backends_of(current)
                    .iter()
                    .any(|b| b.get("group").and_then(|v| v.as_str()).is_some_and(|g| same_resource(g, &wanted)))
            },
            move |current| {
                let mut backends = backends_of(current);
                backends.push(json!({ "group": group_link, "balancingMode": "CONNECTION" }));
                let mut body = json!({ "backends": backends });
                if let Some(fingerprint) = current.get("fingerprint") {
                    body["fingerprint"] = fingerprint.clone();
                }
                body
            },
        )
        .requires(group)
    }

    pub fn forwarding_rule(&self) -> ResourceDescriptor {
        let backend = self.backend_service_ref();
        let network = NetworkManager::network_ref(&self.config.provider);
        let subnet = self.subnet_ref(&self.config.provider.subnet.name);

        ResourceDescriptor::new(
            self.forwarding_rule_ref(),
            json!({
                "description": "Internal load balancer in front of the service VM",
                "loadBalancingScheme": "INTERNAL",
                "IPProtocol": "TCP",
                "ports": [self.config.psc.service_port.to_string()],
                "backendService": self.link(&backend),
                "network": self.link(&network),
                "subnetwork": self.link(&subnet),
            }),
        )
        .requires(backend)
        .requires(subnet)
    }

    pub fn service_attachment(&self) -> ResourceDescriptor {
        let rule = self.forwarding_rule_ref();
        let nat_links: Vec<String> = self.nat_subnet_ref().iter().map(|nat| self.link(nat)).collect();

        let mut descriptor = ResourceDescriptor::new(
            self.service_attachment_ref(),
            json!({
                "description": "Publishes the demo service to consumers",
                "producerForwardingRule": self.link(&rule),
                "connectionPreference": "ACCEPT_AUTOMATIC",
                "natSubnets": nat_links,
                "enableProxyProtocol": false,
            }),
        )
        .requires(rule);
        if let Some(nat) = self.nat_subnet_ref() {
            descriptor = descriptor.requires(nat);
        }
        descriptor
    }

    pub fn endpoint_address(&self) -> ResourceDescriptor {
        let subnet = self.subnet_ref(&self.config.consumer.subnet.name);
        ResourceDescriptor::new(
            self.endpoint_address_ref(),
            json!({
                "description": "Consumer-side IP of the PSC endpoint",
                "addressType": "INTERNAL",
                "subnetwork": self.link(&subnet),
            }),
        )
        .requires(subnet)
    }

    pub fn endpoint(&self) -> ResourceDescriptor {
        let address = self.endpoint_address_ref();
        let attachment = self.service_attachment_ref();
        let network = NetworkManager::network_ref(&self.config.consumer);
        let subnet = self.subnet_ref(&self.config.consumer.subnet.name);

        ResourceDescriptor::new(
            self.endpoint_ref(),
            json!({
                "description": "PSC endpoint for the demo service",
                "IPAddress": self.link(&address),
                "target": self.link(&attachment),
                "network": self.link(&network),
                "subnetwork": self.link(&subnet),
            }),
        )
        .requires(address)
        .requires(attachment)
        .requires(network)
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new("psc")
            .step(Step::ensure("create-health-check", self.health_check()))
            .step(Step::ensure("create-instance-group", self.instance_group()))
            .step(Step::reconcile("add-service-vm-to-group", self.group_membership()))
            .step(Step::reconcile("set-named-ports", self.named_ports()))
            .step(Step::ensure("create-backend-service", self.backend_service()))
            .step(Step::reconcile("attach-backend", self.backend_attachment()))
            .step(Step::ensure("create-forwarding-rule", self.forwarding_rule()))
            .step(Step::ensure("create-service-attachment", self.service_attachment()))
            .step(Step::ensure("reserve-endpoint-address", self.endpoint_address()))
            .step(Step::ensure("create-psc-endpoint", self.endpoint()))
    }

    pub fn phase(&self) -> Phase {
        Phase::new(PHASE).pipeline(self.pipeline())
    }

    /// Consumer side first, health check last
    pub fn teardown_steps(&self) -> Vec<Step> {
        vec![
            Step::remove("delete-psc-endpoint", self.endpoint_ref()),
            Step::remove("release-endpoint-address", self.endpoint_address_ref()),
            Step::remove("delete-service-attachment", self.service_attachment_ref()),
            Step::remove("delete-forwarding-rule", self.forwarding_rule_ref()),
            Step::remove("delete-backend-service", self.backend_service_ref()),
            Step::remove("delete-instance-group", self.instance_group_ref()),
            Step::remove("delete-health-check", self.health_check_ref()),
        ]
    }
}

fn backends_of(service: &Value) -> Vec<Value> {
    service
        .get("backends")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}
