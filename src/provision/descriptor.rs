//! Resource descriptors
//!
//! A [`ResourceRef`] names one Compute resource; its kind, name and scope
//! together are the idempotency key. A [`ResourceDescriptor`] adds the insert
//! body and the resources that must already exist before it is created.

use super::error::ProvisionError;
use serde_json::Value;
use std::fmt;

/// Compute resource kinds this tool provisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Network,
    Subnetwork,
    Firewall,
    Instance,
    InstanceGroup,
    HealthCheck,
    BackendService,
    ForwardingRule,
    ServiceAttachment,
    Address,
}

/// Addressing domain family of a kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeFamily {
    Global,
    Regional,
    Zonal,
}

impl ResourceKind {
    /// REST collection name
    pub fn collection(self) -> &'static str {
        match self {
            Self::Network => "networks",
            Self::Subnetwork => "subnetworks",
            Self::Firewall => "firewalls",
            Self::Instance => "instances",
            Self::InstanceGroup => "instanceGroups",
            Self::HealthCheck => "healthChecks",
            Self::BackendService => "backendServices",
            Self::ForwardingRule => "forwardingRules",
            Self::ServiceAttachment => "serviceAttachments",
            Self::Address => "addresses",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Subnetwork => "subnet",
            Self::Firewall => "firewall-rule",
            Self::Instance => "instance",
            Self::InstanceGroup => "instance-group",
            Self::HealthCheck => "health-check",
            Self::BackendService => "backend-service",
            Self::ForwardingRule => "forwarding-rule",
            Self::ServiceAttachment => "service-attachment",
            Self::Address => "address",
        }
    }

    pub fn scope_family(self) -> ScopeFamily {
        match self {
            Self::Network | Self::Firewall | Self::HealthCheck => ScopeFamily::Global,
            Self::Instance | Self::InstanceGroup => ScopeFamily::Zonal,
            Self::Subnetwork
            | Self::BackendService
            | Self::ForwardingRule
            | Self::ServiceAttachment
            | Self::Address => ScopeFamily::Regional,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a resource (and its operations) live
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Regional(String),
    Zonal(String),
}

impl Scope {
    pub fn family(&self) -> ScopeFamily {
        match self {
            Self::Global => ScopeFamily::Global,
            Self::Regional(_) => ScopeFamily::Regional,
            Self::Zonal(_) => ScopeFamily::Zonal,
        }
    }

    /// Path segment under `projects/{project}/`
    pub fn path(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Regional(region) => format!("regions/{}", region),
            Self::Zonal(zone) => format!("zones/{}", zone),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Regional(region) => write!(f, "region {}", region),
            Self::Zonal(zone) => write!(f, "zone {}", zone),
        }
    }
}

/// Identity of one Compute resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
    pub scope: Scope,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>, scope: Scope) -> Self {
        Self {
            kind,
            name: name.into(),
            scope,
        }
    }

    pub fn global(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::new(kind, name, Scope::Global)
    }

    pub fn regional(kind: ResourceKind, name: impl Into<String>, region: impl Into<String>) -> Self {
        Self::new(kind, name, Scope::Regional(region.into()))
    }

    pub fn zonal(kind: ResourceKind, name: impl Into<String>, zone: impl Into<String>) -> Self {
        Self::new(kind, name, Scope::Zonal(zone.into()))
    }

    /// Relative resource link, e.g. `projects/p/regions/r/subnetworks/s`
    pub fn link(&self, project: &str) -> String {
        format!(
            "projects/{}/{}/{}/{}",
            project,
            self.scope.path(),
            self.kind.collection(),
            self.name
        )
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        let invalid = |reason: String| ProvisionError::InvalidDescriptor {
            resource: self.to_string(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if !is_valid_name(&self.name) {
            return Err(invalid(format!(
                "'{}' is not a valid resource name (lowercase letters, digits and hyphens, at most 63 characters)",
                self.name
            )));
        }
        if self.scope.family() != self.kind.scope_family() {
            return Err(invalid(format!(
                "a {} cannot live in scope '{}'",
                self.kind, self.scope
            )));
        }
        match &self.scope {
            Scope::Regional(location) | Scope::Zonal(location) if location.is_empty() => {
                Err(invalid("scope location must not be empty".to_string()))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// RFC1035 label as accepted by Compute: `[a-z]([-a-z0-9]{0,61}[a-z0-9])?`
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    let bytes = name.as_bytes();
    if !bytes[0].is_ascii_lowercase() || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

/// Everything needed to create one resource
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub id: ResourceRef,
    /// Insert request body
    pub body: Value,
    /// Resources referenced by `body` that must exist first
    pub requires: Vec<ResourceRef>,
}

impl ResourceDescriptor {
    /// The body's `name` is always set from `id`
    pub fn new(id: ResourceRef, mut body: Value) -> Self {
        if let Value::Object(ref mut map) = body {
            map.insert("name".to_string(), Value::String(id.name.clone()));
        }
        Self {
            id,
            body,
            requires: Vec::new(),
        }
    }

    pub fn requires(mut self, dependency: ResourceRef) -> Self {
        self.requires.push(dependency);
        self
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        self.id.validate()?;
        if !self.body.is_object() {
            return Err(ProvisionError::InvalidDescriptor {
                resource: self.id.to_string(),
                reason: "insert body must be a JSON object".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_link_per_scope() {
        let net = ResourceRef::global(ResourceKind::Network, "net-a");
        assert_eq!(net.link("p"), "projects/p/global/networks/net-a");

        let subnet = ResourceRef::regional(ResourceKind::Subnetwork, "sub-a", "us-central1");
        assert_eq!(subnet.link("p"), "projects/p/regions/us-central1/subnetworks/sub-a");

        let vm = ResourceRef::zonal(ResourceKind::Instance, "vm-a", "us-central1-a");
        assert_eq!(vm.link("p"), "projects/p/zones/us-central1-a/instances/vm-a");
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let r = ResourceRef::global(ResourceKind::Network, "");
        assert!(matches!(r.validate(), Err(ProvisionError::InvalidDescriptor { .. })));
    }

    #[test]
    fn test_validate_rejects_scope_mismatch() {
        let r = ResourceRef::regional(ResourceKind::Network, "net-a", "us-central1");
        assert!(r.validate().is_err());

        let r = ResourceRef::global(ResourceKind::Instance, "vm-a");
        assert!(r.validate().is_err());

        let r = ResourceRef::zonal(ResourceKind::Instance, "vm-a", "");
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_name_rules() {
        assert!(is_valid_name("net-a"));
        assert!(is_valid_name("a"));
        assert!(!is_valid_name("Net"));
        assert!(!is_valid_name("1net"));
        assert!(!is_valid_name("net-"));
        assert!(!is_valid_name(&"a".repeat(64)));
    }

    #[test]
    fn test_descriptor_sets_body_name() {
        let d = ResourceDescriptor::new(
            ResourceRef::global(ResourceKind::Network, "net-a"),
            json!({ "name": "other", "autoCreateSubnetworks": false }),
        );
        assert_eq!(d.body["name"], "net-a");
        assert!(d.validate().is_ok());

        let d = ResourceDescriptor::new(ResourceRef::global(ResourceKind::Network, "net-a"), json!([]));
        assert!(d.validate().is_err());
    }
}
