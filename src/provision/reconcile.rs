//! Idempotent mutations of existing resources
//!
//! Instance group membership, named ports and backend attachment are not
//! inserts. A [`Reconcile`] probes the current state, checks it against a
//! predicate and only submits the change when the predicate does not hold.

use super::descriptor::ResourceRef;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type BodyBuilder = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// How the current state is read
#[derive(Debug, Clone)]
pub enum Probe {
    /// `GET` the target
    Get,
    /// `POST {target}/{verb}` with a body, e.g. `listInstances`
    Invoke { verb: String, body: Value },
}

/// How the change is submitted
#[derive(Debug, Clone)]
pub enum Change {
    /// `POST {target}/{verb}`, e.g. `addInstances`
    Invoke(String),
    /// `PATCH {target}`
    Patch,
}

impl Change {
    pub fn action(&self) -> &str {
        match self {
            Self::Invoke(verb) => verb,
            Self::Patch => "patch",
        }
    }
}

#[derive(Clone)]
pub struct Reconcile {
    pub target: ResourceRef,
    pub probe: Probe,
    pub change: Change,
    /// True when the probed state already has the change applied
    pub is_satisfied: Predicate,
    /// Request body for the change, derived from the probed state
    pub build: BodyBuilder,
    pub requires: Vec<ResourceRef>,
}

impl Reconcile {
    pub fn new(
        target: ResourceRef,
        probe: Probe,
        change: Change,
        is_satisfied: impl Fn(&Value) -> bool + Send + Sync + 'static,
        build: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            requires: vec![target.clone()],
            target,
            probe,
            change,
            is_satisfied: Arc::new(is_satisfied),
            build: Arc::new(build),
        }
    }

    pub fn requires(mut self, dependency: ResourceRef) -> Self {
        self.requires.push(dependency);
        self
    }
}

impl fmt::Debug for Reconcile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconcile")
            .field("target", &self.target)
            .field("probe", &self.probe)
            .field("change", &self.change)
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}

/// Link of a resource as it appears in API payloads
pub fn self_link(project: &str, resource: &ResourceRef) -> String {
    format!(
        "https://www.googleapis.com/compute/v1/{}",
        resource.link(project)
    )
}

/// Compare two resource links by their `projects/...` suffix
pub fn same_resource(a: &str, b: &str) -> bool {
    fn suffix(link: &str) -> &str {
        link.find("projects/").map(|i| &link[i..]).unwrap_or(link)
    }
    suffix(a) == suffix(b)
}
