//! Networks, subnets and firewall rules
//!
//! One pipeline per network: network, subnets, then the firewall group.
//! The provider and consumer pipelines share no names and run concurrently.

use crate::config::{Config, NetworkConfig, SubnetConfig};
use crate::provision::descriptor::{ResourceDescriptor, ResourceKind, ResourceRef};
use crate::provision::pipeline::{Phase, Pipeline, Step};
use crate::provision::reconcile::self_link;
use serde_json::{json, Value};
use std::sync::Arc;

/// Google health check probe ranges
pub const HEALTH_CHECK_RANGES: &[&str] = &["130.211.0.0/22", "35.191.0.0/16"];
const ANYWHERE: &str = "0.0.0.0/0";

pub const PHASE: &str = "networks";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub fn as_api(&self) -> &'static str {
        match self {
            Self::Ingress => "INGRESS",
            Self::Egress => "EGRESS",
        }
    }
}

/// One protocol entry of a rule's `allowed` list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowed {
    pub protocol: String,
    pub ports: Vec<String>,
}

impl Allowed {
    pub fn all() -> Self {
        Self {
            protocol: "all".to_string(),
            ports: Vec::new(),
        }
    }

    pub fn tcp(ports: &[&str]) -> Self {
        Self {
            protocol: "tcp".to_string(),
            ports: ports.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub name: String,
    pub description: String,
    pub network: String,
    pub direction: Direction,
    pub allowed: Vec<Allowed>,
    /// Source ranges for ingress, destination ranges for egress
    pub ranges: Vec<String>,
    pub target_tags: Vec<String>,
}

impl FirewallRule {
    pub fn ingress(network: &str, suffix: &str, description: &str, ranges: &[&str], allowed: Vec<Allowed>) -> Self {
        Self {
            name: format!("{}-{}", network, suffix),
            description: description.to_string(),
            network: network.to_string(),
            direction: Direction::Ingress,
            allowed,
            ranges: ranges.iter().map(|r| r.to_string()).collect(),
            target_tags: Vec::new(),
        }
    }

    pub fn egress(network: &str, suffix: &str, description: &str, ranges: &[&str], allowed: Vec<Allowed>) -> Self {
        Self {
            direction: Direction::Egress,
            ..Self::ingress(network, suffix, description, ranges, allowed)
        }
    }

    pub fn network_ref(&self) -> ResourceRef {
        ResourceRef::global(ResourceKind::Network, &self.network)
    }

    /// Insert body; the range field depends on direction
    pub fn to_body(&self, project: &str) -> Value {
        let allowed: Vec<Value> = self
            .allowed
            .iter()
            .map(|a| {
                if a.ports.is_empty() {
                    json!({ "IPProtocol": a.protocol })
                } else {
                    json!({ "IPProtocol": a.protocol, "ports": a.ports })
                }
            })
            .collect();

        let mut body = json!({
            "name": self.name,
            "description": self.description,
            "network": self_link(project, &self.network_ref()),
            "direction": self.direction.as_api(),
            "allowed": allowed,
        });

        let range_field = match self.direction {
            Direction::Ingress => "sourceRanges",
            Direction::Egress => "destinationRanges",
        };
        body[range_field] = json!(self.ranges);

        if !self.target_tags.is_empty() {
            body["targetTags"] = json!(self.target_tags);
        }
        body
    }

    pub fn descriptor(&self, project: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(
            ResourceRef::global(ResourceKind::Firewall, &self.name),
            self.to_body(project),
        )
        .requires(self.network_ref())
    }
}

pub struct NetworkManager {
    config: Arc<Config>,
}

impl NetworkManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn network_ref(network: &NetworkConfig) -> ResourceRef {
        ResourceRef::global(ResourceKind::Network, &network.name)
    }

    pub fn subnet_ref(&self, subnet: &SubnetConfig) -> ResourceRef {
        ResourceRef::regional(ResourceKind::Subnetwork, &subnet.name, self.config.region())
    }

    fn network_descriptor(&self, network: &NetworkConfig) -> ResourceDescriptor {
        ResourceDescriptor::new(
            Self::network_ref(network),
            json!({
                "description": format!("PSC demo network {}", network.name),
                "autoCreateSubnetworks": false,
                "routingConfig": { "routingMode": "REGIONAL" },
            }),
        )
    }

    fn subnet_descriptor(&self, network: &NetworkConfig, subnet: &SubnetConfig, purpose: Option<&str>) -> ResourceDescriptor {
        let project = self.config.project();
        let net = Self::network_ref(network);

        let mut body = json!({
            "network": self_link(project, &net),
            "ipCidrRange": subnet.cidr,
            "region": self.config.region(),
        });
        match purpose {
            Some(purpose) => body["purpose"] = json!(purpose),
            None => body["privateIpGoogleAccess"] = json!(true),
        }

        ResourceDescriptor::new(self.subnet_ref(subnet), body).requires(net)
    }

    pub fn provider_rules(&self) -> Vec<FirewallRule> {
        let provider = &self.config.provider;
        let name = provider.name.as_str();
        let port = self.config.psc.service_port.to_string();

        let mut rules = vec![
            FirewallRule::ingress(
                name,
                "allow-health-checks",
                "Allow Google health check probes",
                HEALTH_CHECK_RANGES,
                vec![Allowed::tcp(&[])],
            ),
            FirewallRule::ingress(
                name,
                "allow-http",
                "Allow HTTP to the demo service",
                &[provider.subnet.cidr.as_str()],
                vec![Allowed::tcp(&["80", port.as_str()])],
            ),
            FirewallRule::ingress(name, "allow-ssh", "Allow SSH", &[ANYWHERE], vec![Allowed::tcp(&["22"])]),
        ];
        if let Some(nat) = &provider.psc_nat_subnet {
            rules.push(FirewallRule::ingress(
                name,
                "allow-psc-nat",
                "Allow PSC NAT traffic to the service",
                &[nat.cidr.as_str()],
                vec![Allowed::tcp(&[port.as_str()])],
            ));
        }
        rules.push(FirewallRule::egress(
            name,
            "allow-egress",
            "Allow all egress",
            &[ANYWHERE],
            vec![Allowed::all()],
        ));
        rules
    }

    pub fn consumer_rules(&self) -> Vec<FirewallRule> {
        let consumer = &self.config.consumer;
        let name = consumer.name.as_str();
        vec![
            FirewallRule::ingress(
                name,
                "allow-internal",
                "Allow traffic within the consumer subnet",
                &[consumer.subnet.cidr.as_str()],
                vec![Allowed::all()],
            ),
            FirewallRule::ingress(name, "allow-ssh", "Allow SSH", &[ANYWHERE], vec![Allowed::tcp(&["22"])]),
            FirewallRule::egress(name, "allow-egress", "Allow all egress", &[ANYWHERE], vec![Allowed::all()]),
        ]
    }

    fn pipeline(&self, label: &str, network: &NetworkConfig, rules: Vec<FirewallRule>) -> Pipeline {
        let project = self.config.project();
        let mut pipeline = Pipeline::new(label)
            .step(Step::ensure("create-network", self.network_descriptor(network)))
            .step(Step::ensure("create-subnet", self.subnet_descriptor(network, &network.subnet, None)));

        if let Some(nat) = &network.psc_nat_subnet {
            pipeline.push(Step::ensure(
                "create-psc-nat-subnet",
                self.subnet_descriptor(network, nat, Some("PRIVATE_SERVICE_CONNECT")),
            ));
        }
        for rule in rules {
            pipeline.push(Step::ensure(format!("create-firewall {}", rule.name), rule.descriptor(project)));
        }
        pipeline
    }

    pub fn provider_pipeline(&self) -> Pipeline {
        self.pipeline("provider", &self.config.provider, self.provider_rules())
    }

    pub fn consumer_pipeline(&self) -> Pipeline {
        self.pipeline("consumer", &self.config.consumer, self.consumer_rules())
    }

    pub fn phase(&self) -> Phase {
        Phase::new(PHASE)
            .pipeline(self.provider_pipeline())
            .pipeline(self.consumer_pipeline())
    }

    /// Firewall rules, subnets, then networks
    pub fn teardown_steps(&self) -> Vec<Step> {
        let mut steps: Vec<Step> = self
            .provider_rules()
            .into_iter()
            .chain(self.consumer_rules())
            .map(|rule| {
                Step::remove(
                    format!("delete-firewall {}", rule.name),
                    ResourceRef::global(ResourceKind::Firewall, &rule.name),
                )
            })
            .collect();

        for network in [&self.config.provider, &self.config.consumer] {
            steps.push(Step::remove("delete-subnet", self.subnet_ref(&network.subnet)));
            if let Some(nat) = &network.psc_nat_subnet {
                steps.push(Step::remove("delete-psc-nat-subnet", self.subnet_ref(nat)));
            }
        }
        for network in [&self.config.provider, &self.config.consumer] {
            steps.push(Step::remove("delete-network", Self::network_ref(network)));
        }
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::pipeline::StepAction;

    fn manager() -> NetworkManager {
        NetworkManager::new(Arc::new(Config {
            project_id: Some("demo-project".to_string()),
            ..Config::default()
        }))
    }

    #[test]
    fn test_egress_rule_populates_destination_ranges_only() {
        let rule = FirewallRule::egress("net", "fw-x", "egress", &["0.0.0.0/0"], vec![Allowed::all()]);
        let body = rule.to_body("demo-project");

        assert_eq!(body["direction"], "EGRESS");
        assert_eq!(body["destinationRanges"], json!(["0.0.0.0/0"]));
        assert!(body.get("sourceRanges").is_none());
        assert_eq!(body["allowed"], json!([{ "IPProtocol": "all" }]));
    }

    #[test]
    fn test_ingress_rule_populates_source_ranges_only() {
        let rule = FirewallRule::ingress("net", "ssh", "ssh", &["0.0.0.0/0"], vec![Allowed::tcp(&["22"])]);
        let body = rule.to_body("demo-project");

        assert_eq!(body["direction"], "INGRESS");
        assert_eq!(body["sourceRanges"], json!(["0.0.0.0/0"]));
        assert!(body.get("destinationRanges").is_none());
        assert_eq!(body["allowed"], json!([{ "IPProtocol": "tcp", "ports": ["22"] }]));
        assert_eq!(
            body["network"],
            "https://www.googleapis.com/compute/v1/projects/demo-project/global/networks/net"
        );
    }

    #[test]
    fn test_provider_rules_have_single_egress() {
        let rules = manager().provider_rules();
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "hypershift-redhat-allow-health-checks",
                "hypershift-redhat-allow-http",
                "hypershift-redhat-allow-ssh",
                "hypershift-redhat-allow-psc-nat",
                "hypershift-redhat-allow-egress",
            ]
        );
        assert_eq!(rules.iter().filter(|r| r.direction == Direction::Egress).count(), 1);
    }

    #[test]
    fn test_provider_pipeline_order() {
        let pipeline = manager().provider_pipeline();
        let kinds: Vec<ResourceKind> = pipeline.steps().iter().map(|s| s.resource().kind).collect();
        assert_eq!(kinds[0], ResourceKind::Network);
        assert_eq!(kinds[1], ResourceKind::Subnetwork);
        assert_eq!(kinds[2], ResourceKind::Subnetwork);
        assert!(kinds[3..].iter().all(|k| *k == ResourceKind::Firewall));

        let StepAction::Ensure(nat) = &pipeline.steps()[2].action else {
            panic!("expected an ensure step");
        };
        assert_eq!(nat.body["purpose"], "PRIVATE_SERVICE_CONNECT");
        assert_eq!(nat.body["ipCidrRange"], "10.1.1.0/24");
    }

    #[test]
    fn test_teardown_removes_networks_last() {
        let steps = manager().teardown_steps();
        let last_two: Vec<ResourceKind> = steps[steps.len() - 2..].iter().map(|s| s.resource().kind).collect();
        assert_eq!(last_two, vec![ResourceKind::Network, ResourceKind::Network]);
        assert_eq!(steps[0].resource().kind, ResourceKind::Firewall);
    }
}
