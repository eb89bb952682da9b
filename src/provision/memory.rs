//! In-process Compute API
//!
//! Backs `--dry-run` and the test suite. Enforces per-scope name uniqueness,
//! runs inserts and deletes through pollable operations, and synthesizes the
//! read-only fields the demo inspects (instance status, allocated IPs, PSC
//! connection state, backend health). Faults can be injected per resource.

use super::api::ComputeApi;
use super::descriptor::{ResourceKind, ResourceRef, Scope};
use super::reconcile::{same_resource, self_link};
use crate::gcp::error::ApiError;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Number of calls made per endpoint family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub gets: usize,
    pub inserts: usize,
    pub deletes: usize,
    pub invokes: usize,
    pub patches: usize,
    pub operation_polls: usize,
}

#[derive(Debug, Clone)]
struct StoredOperation {
    scope: Scope,
    target_link: String,
    operation_type: String,
    /// Non-terminal observations left before DONE
    remaining: u32,
    error: Option<Value>,
}

#[derive(Default)]
struct State {
    resources: HashMap<ResourceRef, Value>,
    members: HashMap<ResourceRef, Vec<String>>,
    operations: HashMap<String, StoredOperation>,
    lookup_failures: HashMap<ResourceRef, ApiError>,
    submit_failures: HashMap<ResourceRef, ApiError>,
    operation_failures: HashMap<ResourceRef, Value>,
    hidden: HashSet<ResourceRef>,
    poll_failure: Option<ApiError>,
    hung_polls: bool,
    stalled: bool,
    next_host: u32,
    next_psc_id: u64,
    calls: CallCounts,
}

pub struct InMemoryCompute {
    project: String,
    operation_polls: u32,
    state: Mutex<State>,
}

impl InMemoryCompute {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            operation_polls: 0,
            state: Mutex::new(State::default()),
        }
    }

    /// Operations report RUNNING this many times before DONE
    pub fn with_operation_polls(mut self, polls: u32) -> Self {
        self.operation_polls = polls;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Existence checks and read probes of `resource` fail with `error`
    pub fn fail_lookup(&self, resource: &ResourceRef, error: ApiError) {
        self.state().lookup_failures.insert(resource.clone(), error);
    }

    /// Mutating requests on `resource` are rejected with `error`
    pub fn fail_submit(&self, resource: &ResourceRef, error: ApiError) {
        self.state().submit_failures.insert(resource.clone(), error);
    }

    /// The next operation on `resource` ends DONE with `detail` as its error
    pub fn fail_operation(&self, resource: &ResourceRef, detail: Value) {
        self.state().operation_failures.insert(resource.clone(), detail);
    }

    /// Every operation status query fails with `error`
    pub fn fail_polls(&self, error: ApiError) {
        self.state().poll_failure = Some(error);
    }

    /// Operation status queries never answer
    pub fn hang_polls(&self) {
        self.state().hung_polls = true;
    }

    /// Operations never leave RUNNING
    pub fn stall_operations(&self) {
        self.state().stalled = true;
    }

    /// `get` answers not-found even though the name is taken
    pub fn hide_from_lookup(&self, resource: &ResourceRef) {
        self.state().hidden.insert(resource.clone());
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.lookup_failures.clear();
        state.submit_failures.clear();
        state.operation_failures.clear();
        state.hidden.clear();
        state.poll_failure = None;
        state.hung_polls = false;
        state.stalled = false;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Store a resource directly, as if created out of band
    pub fn seed(&self, resource: &ResourceRef, body: Value) {
        let mut state = self.state();
        let stored = state.materialize(&self.project, resource, body);
        state.resources.insert(resource.clone(), stored);
    }

    /// Overwrite a stored resource verbatim
    pub fn replace(&self, resource: &ResourceRef, value: Value) {
        self.state().resources.insert(resource.clone(), value);
    }

    pub fn contains(&self, resource: &ResourceRef) -> bool {
        self.state().resources.contains_key(resource)
    }

    pub fn resource(&self, resource: &ResourceRef) -> Option<Value> {
        self.state().resources.get(resource).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    /// Instance links in an instance group
    pub fn members(&self, group: &ResourceRef) -> Vec<String> {
        self.state().members.get(group).cloned().unwrap_or_default()
    }

    fn start_operation(&self, state: &mut State, resource: &ResourceRef, operation_type: &str) -> Value {
        let name = format!("operation-{}", Uuid::new_v4());
        let error = state.operation_failures.remove(resource);
        let target_link = self_link(&self.project, resource);

        state.operations.insert(
            name.clone(),
            StoredOperation {
                scope: resource.scope.clone(),
                target_link: target_link.clone(),
                operation_type: operation_type.to_string(),
                remaining: self.operation_polls,
                error,
            },
        );

        operation_json(&name, &resource.scope, &target_link, operation_type, "PENDING", None)
    }
}

impl State {
    /// Fill in the fields the API would compute
    fn materialize(&mut self, project: &str, resource: &ResourceRef, body: Value) -> Value {
        let mut map = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        map.insert("name".into(), json!(resource.name));
        map.insert("selfLink".into(), json!(self_link(project, resource)));
        map.insert("id".into(), json!(Uuid::new_v4().as_u128().to_string()));
        map.insert(
            "creationTimestamp".into(),
            json!(chrono::Utc::now().to_rfc3339()),
        );
        map.insert("fingerprint".into(), json!(new_fingerprint()));

        match resource.kind {
            ResourceKind::Instance => {
                map.insert("status".into(), json!("RUNNING"));
                if let Some(nic) = map
                    .get_mut("networkInterfaces")
                    .and_then(|v| v.as_array_mut())
                    .and_then(|nics| nics.first_mut())
                    .and_then(|nic| nic.as_object_mut())
                {
                    if !nic.contains_key("networkIP") {
                        let subnet = nic.get("subnetwork").and_then(|v| v.as_str()).map(str::to_string);
                        let ip = self.allocate_ip(subnet.as_deref());
                        nic.insert("networkIP".into(), json!(ip));
                    }
                }
            }
            ResourceKind::Address => {
                if !map.contains_key("address") {
                    let subnet = map.get("subnetwork").and_then(|v| v.as_str()).map(str::to_string);
                    let ip = self.allocate_ip(subnet.as_deref());
                    map.insert("address".into(), json!(ip));
                }
                map.insert("status".into(), json!("RESERVED"));
            }
            ResourceKind::ForwardingRule => {
                let requested = map.get("IPAddress").and_then(|v| v.as_str()).map(str::to_string);
                let ip = match requested {
                    Some(link) if link.contains("/addresses/") => self.address_ip(&link),
                    Some(ip) => Some(ip),
                    None => None,
                };
                let ip = match ip {
                    Some(ip) => ip,
                    None => {
                        let subnet = map.get("subnetwork").and_then(|v| v.as_str()).map(str::to_string);
                        self.allocate_ip(subnet.as_deref())
                    }
                };
                map.insert("IPAddress".into(), json!(ip));

                let attachment = map
                    .get("target")
                    .and_then(|v| v.as_str())
                    .filter(|t| t.contains("/serviceAttachments/"))
                    .map(str::to_string);
                if let Some(attachment) = attachment {
                    self.next_psc_id += 1;
                    let psc_id = self.next_psc_id;
                    map.insert("pscConnectionId".into(), json!(psc_id.to_string()));
                    map.insert("pscConnectionStatus".into(), json!("ACCEPTED"));
                    let endpoint = self_link(project, resource);
                    self.connect_endpoint(&attachment, &endpoint, psc_id);
                }
            }
            ResourceKind::ServiceAttachment => {
                map.entry("connectedEndpoints").or_insert_with(|| json!([]));
            }
            ResourceKind::BackendService => {
                map.entry("backends").or_insert_with(|| json!([]));
            }
            _ => {}
        }

        Value::Object(map)
    }

    fn allocate_ip(&mut self, subnetwork: Option<&str>) -> String {
        self.next_host += 1;
        let host = 10 + self.next_host;
        let prefix = subnetwork
            .and_then(|link| {
                self.resources
                    .iter()
                    .find(|(id, _)| id.kind == ResourceKind::Subnetwork && link.ends_with(&format!("/subnetworks/{}", id.name)))
                    .and_then(|(_, subnet)| subnet.get("ipCidrRange").and_then(|v| v.as_str()))
                    .and_then(|range| range.split('/').next())
                    .and_then(|base| base.rsplit_once('.').map(|(prefix, _)| prefix.to_string()))
            })
            .unwrap_or_else(|| "10.128.0".to_string());
        format!("{}.{}", prefix, host)
    }

    fn address_ip(&self, link: &str) -> Option<String> {
        self.resources
            .iter()
            .find(|(id, value)| {
                id.kind == ResourceKind::Address
                    && value
                        .get("selfLink")
                        .and_then(|v| v.as_str())
                        .is_some_and(|own| same_resource(own, link))
            })
            .and_then(|(_, value)| value.get("address").and_then(|v| v.as_str()).map(str::to_string))
    }

    fn connect_endpoint(&mut self, attachment: &str, endpoint: &str, psc_id: u64) {
        let found = self.resources.iter_mut().find(|(id, value)| {
            id.kind == ResourceKind::ServiceAttachment
                && value
                    .get("selfLink")
                    .and_then(|v| v.as_str())
                    .is_some_and(|own| same_resource(own, attachment))
        });
        if let Some((_, value)) = found {
            if let Some(endpoints) = value.get_mut("connectedEndpoints").and_then(|v| v.as_array_mut()) {
                endpoints.push(json!({
                    "endpoint": endpoint,
                    "pscConnectionId": psc_id.to_string(),
                    "status": "ACCEPTED"
                }));
            }
        }
    }
}

fn new_fingerprint() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn operation_json(
    name: &str,
    scope: &Scope,
    target_link: &str,
    operation_type: &str,
    status: &str,
    error: Option<&Value>,
) -> Value {
    let mut op = json!({
        "kind": "compute#operation",
        "name": name,
        "operationType": operation_type,
        "targetLink": target_link,
        "status": status,
    });
    match scope {
        Scope::Regional(region) => op["region"] = json!(region),
        Scope::Zonal(zone) => op["zone"] = json!(zone),
        Scope::Global => {}
    }
    if let Some(error) = error {
        op["error"] = error.clone();
    }
    op
}

fn not_found(project: &str, resource: &ResourceRef) -> ApiError {
    ApiError::not_found(&format!(
        "The resource '{}' was not found",
        resource.link(project)
    ))
}

#[async_trait]
impl ComputeApi for InMemoryCompute {
    fn project(&self) -> &str {
        &self.project
    }

    async fn get(&self, resource: &ResourceRef) -> Result<Value, ApiError> {
        let mut state = self.state();
        state.calls.gets += 1;

        if let Some(error) = state.lookup_failures.get(resource) {
            return Err(error.clone());
        }
        if state.hidden.contains(resource) {
            return Err(not_found(&self.project, resource));
        }
        state
            .resources
            .get(resource)
            .cloned()
            .ok_or_else(|| not_found(&self.project, resource))
    }

    async fn insert(&self, kind: ResourceKind, scope: &Scope, body: &Value) -> Result<Value, ApiError> {
        let mut state = self.state();
        state.calls.inserts += 1;

        let name = body
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::status(400, "required", "Required field 'resource.name' not specified"))?;
        let resource = ResourceRef::new(kind, name, scope.clone());

        if let Some(error) = state.submit_failures.get(&resource) {
            return Err(error.clone());
        }
        if state.resources.contains_key(&resource) {
            return Err(ApiError::already_exists(&format!(
                "The resource '{}' already exists",
                resource.link(&self.project)
            )));
        }

        let operation = self.start_operation(&mut state, &resource, "insert");
        let failed = operation["name"]
            .as_str()
            .and_then(|name| state.operations.get(name))
            .is_some_and(|op| op.error.is_some());
        if !failed {
            let stored = state.materialize(&self.project, &resource, body.clone());
            state.resources.insert(resource, stored);
        }
        Ok(operation)
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<Value, ApiError> {
        let mut state = self.state();
        state.calls.deletes += 1;

        if let Some(error) = state.submit_failures.get(resource) {
            return Err(error.clone());
        }
        if state.resources.remove(resource).is_none() {
            return Err(not_found(&self.project, resource));
        }
        state.members.remove(resource);
        Ok(self.start_operation(&mut state, resource, "delete"))
    }

    async fn invoke(&self, resource: &ResourceRef, verb: &str, body: &Value) -> Result<Value, ApiError> {
        let mut state = self.state();
        state.calls.invokes += 1;

        if !state.resources.contains_key(resource) {
            return Err(not_found(&self.project, resource));
        }

        match (resource.kind, verb) {
            (ResourceKind::InstanceGroup, "listInstances") => {
                if let Some(error) = state.lookup_failures.get(resource) {
                    return Err(error.clone());
                }
                let items: Vec<Value> = state
                    .members
                    .get(resource)
                    .map(|links| {
                        links
                            .iter()
                            .map(|link| json!({ "instance": link, "status": "RUNNING" }))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(json!({ "kind": "compute#instanceGroupsListInstances", "items": items }))
            }
            (ResourceKind::BackendService, "getHealth") => {
                if let Some(error) = state.lookup_failures.get(resource) {
                    return Err(error.clone());
                }
                let group = body.get("group").and_then(|v| v.as_str()).unwrap_or_default();
                let members = state
                    .members
                    .iter()
                    .find(|(id, _)| {
                        group.ends_with(&format!("/instanceGroups/{}", id.name))
                    })
                    .map(|(_, links)| links.clone())
                    .unwrap_or_default();
                let health: Vec<Value> = members
                    .iter()
                    .map(|link| json!({ "instance": link, "healthState": "HEALTHY" }))
                    .collect();
                Ok(json!({ "kind": "compute#backendServiceGroupHealth", "healthStatus": health }))
            }
            (ResourceKind::InstanceGroup, "addInstances") => {
                if let Some(error) = state.submit_failures.get(resource) {
                    return Err(error.clone());
                }
                let requested: Vec<String> = body
                    .get("instances")
                    .and_then(|v| v.as_array())
                    .map(|list| {
                        list.iter()
                            .filter_map(|i| i.get("instance").and_then(|v| v.as_str()))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let members = state.members.entry(resource.clone()).or_default();
                if let Some(dup) = requested
                    .iter()
                    .find(|link| members.iter().any(|m| same_resource(m, link)))
                {
                    return Err(ApiError::status(
                        400,
                        "memberAlreadyExists",
                        &format!("The instance '{}' is already a member of the group", dup),
                    ));
                }
                members.extend(requested);
                Ok(self.start_operation(&mut state, resource, "addInstances"))
            }
            (ResourceKind::InstanceGroup, "setNamedPorts") => {
                if let Some(error) = state.submit_failures.get(resource) {
                    return Err(error.clone());
                }
                let ports = body.get("namedPorts").cloned().unwrap_or_else(|| json!([]));
                if let Some(group) = state.resources.get_mut(resource) {
                    group["namedPorts"] = ports;
                    group["fingerprint"] = json!(new_fingerprint());
                }
                Ok(self.start_operation(&mut state, resource, "setNamedPorts"))
            }
            _ => Err(ApiError::status(
                400,
                "invalid",
                &format!("Unsupported method '{}' on {}", verb, resource),
            )),
        }
    }

    async fn patch(&self, resource: &ResourceRef, body: &Value) -> Result<Value, ApiError> {
        let mut state = self.state();
        state.calls.patches += 1;

        if let Some(error) = state.submit_failures.get(resource) {
            return Err(error.clone());
        }
        let Some(current) = state.resources.get_mut(resource) else {
            return Err(not_found(&self.project, resource));
        };

        if let (Some(sent), Some(held)) = (
            body.get("fingerprint").and_then(|v| v.as_str()),
            current.get("fingerprint").and_then(|v| v.as_str()),
        ) {
            if sent != held {
                return Err(ApiError::status(
                    412,
                    "conditionNotMet",
                    "Invalid fingerprint. The resource was modified concurrently.",
                ));
            }
        }

        if let (Some(target), Some(changes)) = (current.as_object_mut(), body.as_object()) {
            for (key, value) in changes {
                target.insert(key.clone(), value.clone());
            }
            target.insert("fingerprint".into(), json!(new_fingerprint()));
        }
        Ok(self.start_operation(&mut state, resource, "patch"))
    }

    async fn get_operation(&self, scope: &Scope, name: &str) -> Result<Value, ApiError> {
        let hung = {
            let mut state = self.state();
            state.calls.operation_polls += 1;
            state.hung_polls
        };
        if hung {
            return std::future::pending().await;
        }

        let mut state = self.state();

        if let Some(error) = &state.poll_failure {
            return Err(error.clone());
        }

        let stalled = state.stalled;
        let operation = state
            .operations
            .get_mut(name)
            .filter(|op| &op.scope == scope)
            .ok_or_else(|| {
                ApiError::not_found(&format!("The resource '{}/operations/{}' was not found", scope.path(), name))
            })?;

        let (status, error) = if stalled {
            ("RUNNING", None)
        } else if operation.remaining > 0 {
            operation.remaining -= 1;
            ("RUNNING", None)
        } else {
            ("DONE", operation.error.as_ref())
        };

        Ok(operation_json(
            name,
            &operation.scope,
            &operation.target_link,
            &operation.operation_type,
            status,
            error,
        ))
    }
}
