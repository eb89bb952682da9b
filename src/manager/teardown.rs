//! Removal of the whole demo in reverse dependency order

use super::connectivity::PscManager;
use super::network::NetworkManager;
use super::vm::VmManager;
use crate::config::Config;
use crate::provision::pipeline::{Phase, Pipeline, Plan, Step};
use std::sync::Arc;

pub struct TeardownManager {
    psc: PscManager,
    vms: VmManager,
    networks: NetworkManager,
}

impl TeardownManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            psc: PscManager::new(config.clone()),
            vms: VmManager::new(config.clone()),
            networks: NetworkManager::new(config),
        }
    }

    fn phase(name: &str, steps: Vec<Step>) -> Phase {
        let mut pipeline = Pipeline::new(name);
        for step in steps {
            pipeline.push(step);
        }
        Phase::new(name).pipeline(pipeline)
    }

    /// One fail-fast pipeline per layer; a failed layer skips the ones below
    pub fn plan(&self) -> Plan {
        Plan::new()
            .phase(Self::phase("remove-connectivity", self.psc.teardown_steps()))
            .phase(Self::phase("remove-vms", self.vms.teardown_steps()))
            .phase(Self::phase("remove-networks", self.networks.teardown_steps()))
    }
}
