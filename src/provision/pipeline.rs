//! Dependency-ordered provisioning pipelines
//!
//! A [`Pipeline`] runs its steps strictly in order and stops at the first
//! failure. A [`Phase`] runs independent pipelines concurrently on the calling
//! task. A [`Plan`] is an ordered list of phases whose declared dependencies
//! are checked before anything is submitted.

use super::creator::{EnsureOutcome, Provisioner, ReconcileOutcome, RemovalOutcome};
use super::descriptor::{ResourceDescriptor, ResourceRef};
use super::error::{ProvisionError, Result};
use super::reconcile::Reconcile;
use crate::report::{PhaseReport, PipelineReport, RunReport, StepRecord, StepStatus};
use chrono::Local;
use futures::future::join_all;
use std::collections::HashSet;
use std::time::Instant;

#[derive(Debug, Clone)]
pub enum StepAction {
    Ensure(ResourceDescriptor),
    Reconcile(Reconcile),
    Remove(ResourceRef),
}

/// One named unit of work
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
}

impl Step {
    pub fn ensure(name: impl Into<String>, descriptor: ResourceDescriptor) -> Self {
        Self {
            name: name.into(),
            action: StepAction::Ensure(descriptor),
        }
    }

    pub fn reconcile(name: impl Into<String>, reconcile: Reconcile) -> Self {
        Self {
            name: name.into(),
            action: StepAction::Reconcile(reconcile),
        }
    }

    pub fn remove(name: impl Into<String>, resource: ResourceRef) -> Self {
        Self {
            name: name.into(),
            action: StepAction::Remove(resource),
        }
    }

    /// Resource the step acts on
    pub fn resource(&self) -> &ResourceRef {
        match &self.action {
            StepAction::Ensure(descriptor) => &descriptor.id,
            StepAction::Reconcile(reconcile) => &reconcile.target,
            StepAction::Remove(resource) => resource,
        }
    }

    /// Resources that must exist before the step runs
    pub fn requires(&self) -> &[ResourceRef] {
        match &self.action {
            StepAction::Ensure(descriptor) => &descriptor.requires,
            StepAction::Reconcile(reconcile) => &reconcile.requires,
            StepAction::Remove(_) => &[],
        }
    }

    /// Resource guaranteed present once the step succeeds
    pub fn provides(&self) -> Option<&ResourceRef> {
        match &self.action {
            StepAction::Ensure(descriptor) => Some(&descriptor.id),
            StepAction::Reconcile(_) | StepAction::Remove(_) => None,
        }
    }

    fn validate(&self) -> Result<()> {
        match &self.action {
            StepAction::Ensure(descriptor) => descriptor.validate(),
            StepAction::Reconcile(reconcile) => reconcile.target.validate(),
            StepAction::Remove(resource) => resource.validate(),
        }
    }

    pub async fn execute(&self, provisioner: &Provisioner) -> Result<StepStatus> {
        let status = match &self.action {
            StepAction::Ensure(descriptor) => match provisioner.ensure(descriptor).await? {
                EnsureOutcome::Created => StepStatus::Created,
                EnsureOutcome::AlreadyPresent => StepStatus::AlreadyPresent,
            },
            StepAction::Reconcile(reconcile) => match provisioner.reconcile(reconcile).await? {
                ReconcileOutcome::Updated => StepStatus::Updated,
                ReconcileOutcome::Unchanged => StepStatus::Unchanged,
            },
            StepAction::Remove(resource) => match provisioner.ensure_absent(resource).await? {
                RemovalOutcome::Deleted => StepStatus::Deleted,
                RemovalOutcome::AlreadyAbsent => StepStatus::AlreadyAbsent,
            },
        };
        Ok(status)
    }
}

/// Strictly sequential, fail-fast list of steps
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub async fn run(&self, provisioner: &Provisioner) -> PipelineReport {
        let mut report = PipelineReport::new(&self.name);

        for (index, step) in self.steps.iter().enumerate() {
            let started_at = Local::now();
            let started = Instant::now();

            let status = match step.execute(provisioner).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!("[{}] step '{}' failed: {}", self.name, step.name, e);
                    StepStatus::Failed(e)
                }
            };
            let failed = !status.is_success();

            report.records.push(StepRecord {
                step: step.name.clone(),
                resource: step.resource().clone(),
                status,
                started_at,
                elapsed: started.elapsed(),
            });

            if failed {
                report.not_attempted = self.steps[index + 1..]
                    .iter()
                    .map(|s| s.name.clone())
                    .collect();
                break;
            }
        }

        report
    }
}

/// Pipelines with no dependency on each other
#[derive(Debug, Clone)]
pub struct Phase {
    pub name: String,
    pipelines: Vec<Pipeline>,
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipelines: Vec::new(),
        }
    }

    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    pub async fn run(&self, provisioner: &Provisioner) -> PhaseReport {
        tracing::info!("Starting phase '{}' ({} pipeline(s))", self.name, self.pipelines.len());

        let pipelines = join_all(self.pipelines.iter().map(|p| p.run(provisioner))).await;
        let report = PhaseReport {
            phase: self.name.clone(),
            pipelines,
        };

        if report.is_success() {
            tracing::info!("Phase '{}' complete", self.name);
        } else {
            tracing::error!("Phase '{}' failed", self.name);
        }
        report
    }
}

/// Ordered phases
#[derive(Debug, Clone, Default)]
pub struct Plan {
    phases: Vec<Phase>,
    /// Resources assumed to exist before the plan starts
    assumed: HashSet<ResourceRef>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn assume_present(mut self, resource: ResourceRef) -> Self {
        self.assumed.insert(resource);
        self
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Check that every step's requirements are provided by an earlier phase
    /// or an earlier step of the same pipeline
    pub fn validate(&self) -> Result<()> {
        let mut available = self.assumed.clone();

        for phase in &self.phases {
            let mut provided_by_phase = Vec::new();

            for pipeline in &phase.pipelines {
                let mut local: HashSet<&ResourceRef> = HashSet::new();

                for step in &pipeline.steps {
                    step.validate()?;
                    for required in step.requires() {
                        if !available.contains(required) && !local.contains(required) {
                            return Err(ProvisionError::UnresolvedDependency {
                                step: step.name.clone(),
                                missing: required.clone(),
                            });
                        }
                    }
                    if let Some(provided) = step.provides() {
                        local.insert(provided);
                        provided_by_phase.push(provided.clone());
                    }
                }
            }

            available.extend(provided_by_phase);
        }

        Ok(())
    }

    /// Validate, then start a phase-at-a-time run
    pub fn start(&self) -> Result<PlanRun<'_>> {
        self.validate()?;
        Ok(PlanRun {
            phases: &self.phases,
            next: 0,
            report: RunReport::default(),
        })
    }

    /// Validate, then run phases in order until one fails
    pub async fn run(&self, provisioner: &Provisioner) -> Result<RunReport> {
        let mut run = self.start()?;
        while run.next_phase(provisioner).await.is_some() {}
        Ok(run.finish())
    }
}

/// An in-progress [`Plan`] run; callers may act between phases
#[derive(Debug)]
pub struct PlanRun<'a> {
    phases: &'a [Phase],
    next: usize,
    report: RunReport,
}

impl<'a> PlanRun<'a> {
    /// Run the next phase and return it if it succeeded
    ///
    /// `None` once every phase ran, after a failed phase, or after [`stop`](Self::stop).
    /// A failure marks the remaining phases skipped.
    pub async fn next_phase(&mut self, provisioner: &Provisioner) -> Option<&'a Phase> {
        let phases = self.phases;
        let phase = phases.get(self.next)?;
        self.next += 1;

        let phase_report = phase.run(provisioner).await;
        let failed = !phase_report.is_success();
        self.report.push(phase_report);

        if failed {
            self.stop();
            return None;
        }
        Some(phase)
    }

    /// Skip every phase not yet run
    pub fn stop(&mut self) {
        let remaining = &self.phases[self.next.min(self.phases.len())..];
        self.report
            .skipped_phases
            .extend(remaining.iter().map(|p| p.name.clone()));
        self.next = self.phases.len();
    }

    pub fn finish(self) -> RunReport {
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcp::error::ApiError;
    use crate::provision::descriptor::ResourceKind;
    use crate::provision::memory::InMemoryCompute;
    use serde_json::json;
    use std::sync::Arc;

    const REGION: &str = "us-central1";

    fn net(name: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(
            ResourceRef::global(ResourceKind::Network, name),
            json!({ "autoCreateSubnetworks": false }),
        )
    }

    fn subnet(name: &str, network: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(
            ResourceRef::regional(ResourceKind::Subnetwork, name, REGION),
            json!({ "ipCidrRange": "10.1.0.0/24" }),
        )
        .requires(ResourceRef::global(ResourceKind::Network, network))
    }

    fn firewall(name: &str, network: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(ResourceRef::global(ResourceKind::Firewall, name), json!({}))
            .requires(ResourceRef::global(ResourceKind::Network, network))
    }

    fn chain(prefix: &str) -> Pipeline {
        Pipeline::new(prefix)
            .step(Step::ensure("network", net(&format!("{prefix}-net"))))
            .step(Step::ensure("subnet", subnet(&format!("{prefix}-subnet"), &format!("{prefix}-net"))))
            .step(Step::ensure("firewall", firewall(&format!("{prefix}-fw"), &format!("{prefix}-net"))))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_stops_pipeline() {
        let api = Arc::new(InMemoryCompute::new("demo-project"));
        let subnet_id = ResourceRef::regional(ResourceKind::Subnetwork, "a-subnet", REGION);
        api.fail_operation(&subnet_id, json!({ "errors": [{ "code": "INVALID_USAGE" }] }));
        let p = Provisioner::new(api.clone());

        let report = chain("a").run(&p).await;

        assert_eq!(report.records.len(), 2);
        assert!(matches!(report.records[0].status, StepStatus::Created));
        assert!(matches!(report.records[1].status, StepStatus::Failed(_)));
        assert_eq!(report.not_attempted, vec!["firewall".to_string()]);
        assert!(api.contains(&ResourceRef::global(ResourceKind::Network, "a-net")));
        assert!(!api.contains(&ResourceRef::global(ResourceKind::Firewall, "a-fw")));
        assert_eq!(api.calls().inserts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_resumes_after_failure() {
        let api = Arc::new(InMemoryCompute::new("demo-project"));
        let subnet_id = ResourceRef::regional(ResourceKind::Subnetwork, "a-subnet", REGION);
        api.fail_submit(&subnet_id, ApiError::status(403, "forbidden", "denied"));
        let p = Provisioner::new(api.clone());

        assert!(!chain("a").run(&p).await.is_success());
        api.clear_faults();

        let report = chain("a").run(&p).await;
        let statuses: Vec<&str> = report.records.iter().map(|r| r.status.label()).collect();
        assert_eq!(statuses, vec!["already-present", "created", "created"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_runs_pipelines_concurrently() {
        let api = Arc::new(InMemoryCompute::new("demo-project").with_operation_polls(2));
        let p = Provisioner::new(api.clone());
        let phase = Phase::new("networks").pipeline(chain("a")).pipeline(chain("b"));

        let started = tokio::time::Instant::now();
        let report = phase.run(&p).await;

        assert!(report.is_success());
        assert_eq!(report.records().count(), 6);
        // each step waits 1s + 2s; two pipelines of three steps overlap fully
        assert_eq!(started.elapsed(), std::time::Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_pipeline_failure_does_not_cancel_sibling() {
        let api = Arc::new(InMemoryCompute::new("demo-project"));
        api.fail_submit(
            &ResourceRef::global(ResourceKind::Network, "a-net"),
            ApiError::status(400, "invalid", "bad"),
        );
        let p = Provisioner::new(api.clone());
        let phase = Phase::new("networks").pipeline(chain("a")).pipeline(chain("b"));

        let report = phase.run(&p).await;
        assert!(!report.is_success());
        assert!(report.pipelines[1].is_success());
        assert_eq!(report.failure().map(|r| r.step.as_str()), Some("network"));
    }

    #[test]
    fn test_validate_accepts_ordered_plan() {
        let plan = Plan::new()
            .phase(Phase::new("networks").pipeline(chain("a")).pipeline(chain("b")))
            .phase(
                Phase::new("later").pipeline(
                    Pipeline::new("cross")
                        .step(Step::ensure("fw", firewall("cross-fw", "a-net"))),
                ),
            );
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_order_step() {
        let pipeline = Pipeline::new("a")
            .step(Step::ensure("subnet", subnet("a-subnet", "a-net")))
            .step(Step::ensure("network", net("a-net")));
        let err = Plan::new().phase(Phase::new("networks").pipeline(pipeline)).validate().unwrap_err();

        match err {
            ProvisionError::UnresolvedDependency { step, missing } => {
                assert_eq!(step, "subnet");
                assert_eq!(missing.name, "a-net");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_sibling_dependency() {
        let sibling = Pipeline::new("b").step(Step::ensure("fw", firewall("b-fw", "a-net")));
        let plan = Plan::new().phase(Phase::new("networks").pipeline(chain("a")).pipeline(sibling));
        assert!(matches!(plan.validate(), Err(ProvisionError::UnresolvedDependency { .. })));
    }

    #[test]
    fn test_validate_honours_assumed_resources() {
        let pipeline = Pipeline::new("b").step(Step::ensure("fw", firewall("b-fw", "default")));
        let plan = Plan::new().phase(Phase::new("fw").pipeline(pipeline));
        assert!(plan.validate().is_err());

        let plan = plan.assume_present(ResourceRef::global(ResourceKind::Network, "default"));
        assert!(plan.validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_skips_phases_after_failure() {
        let api = Arc::new(InMemoryCompute::new("demo-project"));
        api.fail_submit(
            &ResourceRef::global(ResourceKind::Network, "a-net"),
            ApiError::status(400, "invalid", "bad"),
        );
        let p = Provisioner::new(api.clone());
        let plan = Plan::new()
            .phase(Phase::new("networks").pipeline(chain("a")))
            .phase(Phase::new("other").pipeline(chain("c")));

        let report = plan.run(&p).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.skipped_phases, vec!["other".to_string()]);
        assert!(!api.contains(&ResourceRef::global(ResourceKind::Network, "c-net")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_run_skips_remaining_phases() {
        let api = Arc::new(InMemoryCompute::new("demo-project"));
        let p = Provisioner::new(api.clone());
        let plan = Plan::new()
            .phase(Phase::new("first").pipeline(chain("a")))
            .phase(Phase::new("second").pipeline(chain("b")))
            .phase(Phase::new("third").pipeline(chain("c")));

        let mut run = plan.start().unwrap();
        let ran = run.next_phase(&p).await.map(|phase| phase.name.clone());
        assert_eq!(ran.as_deref(), Some("first"));
        run.stop();
        run.stop();
        assert!(run.next_phase(&p).await.is_none());

        let report = run.finish();
        assert!(report.is_success());
        assert_eq!(report.phases.len(), 1);
        assert_eq!(report.skipped_phases, vec!["second".to_string(), "third".to_string()]);
        assert!(!api.contains(&ResourceRef::global(ResourceKind::Network, "b-net")));
    }

    #[test]
    fn test_start_rejects_invalid_plan() {
        let plan = Plan::new().phase(Phase::new("subnets").pipeline(
            Pipeline::new("orphan").step(Step::ensure("subnet", subnet("s", "missing-net"))),
        ));
        assert!(matches!(
            plan.start().unwrap_err(),
            ProvisionError::UnresolvedDependency { .. }
        ));
    }
}
