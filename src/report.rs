//! Run Reports
//!
//! Per-step records accumulated while phases run, and their rendering for
//! the terminal.

use crate::provision::descriptor::ResourceRef;
use crate::provision::error::ProvisionError;
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::time::Duration;

/// Level of detail when rendering a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetailLevel {
    /// Minimal: status icon + step
    Minimal,
    /// Detailed: status + resource + duration
    #[default]
    Detailed,
    /// Verbose: adds start timestamps and remote error detail
    Verbose,
}

impl DetailLevel {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "minimal" => Self::Minimal,
            "verbose" => Self::Verbose,
            _ => Self::Detailed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Detailed => "detailed",
            Self::Verbose => "verbose",
        }
    }
}

/// Outcome of one pipeline step
#[derive(Debug, Clone)]
pub enum StepStatus {
    Created,
    AlreadyPresent,
    Updated,
    Unchanged,
    Deleted,
    AlreadyAbsent,
    Failed(ProvisionError),
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    /// Whether the step changed anything remotely
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Self::Created | Self::Updated | Self::Deleted => "✓",
            Self::AlreadyPresent | Self::Unchanged | Self::AlreadyAbsent => "◯",
            Self::Failed(_) => "✗",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::AlreadyPresent => "already-present",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Deleted => "deleted",
            Self::AlreadyAbsent => "already-absent",
            Self::Failed(_) => "failed",
        }
    }
}

/// A single executed step
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: String,
    pub resource: ResourceRef,
    pub status: StepStatus,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
}

impl StepRecord {
    /// Format duration for display
    pub fn duration_display(&self) -> String {
        let d = self.elapsed;
        if d.as_secs() < 1 {
            format!("{}ms", d.as_millis())
        } else if d.as_secs() < 60 {
            format!("{}s", d.as_secs())
        } else {
            format!("{}m{}s", d.as_secs() / 60, d.as_secs() % 60)
        }
    }

    pub fn line(&self, detail: DetailLevel) -> String {
        let icon = self.status.icon();
        match detail {
            DetailLevel::Minimal => format!("{} {}", icon, self.step),
            DetailLevel::Detailed => format!(
                "{} {} {} [{}] ({})",
                icon,
                self.step,
                self.resource,
                self.status.label(),
                self.duration_display()
            ),
            DetailLevel::Verbose => {
                let base = format!(
                    "{} {} {} {} in {} [{}] ({})",
                    self.started_at.format("%H:%M:%S"),
                    icon,
                    self.step,
                    self.resource,
                    self.resource.scope,
                    self.status.label(),
                    self.duration_display()
                );
                match &self.status {
                    StepStatus::Failed(err) => format!("{} - {}", base, err),
                    _ => base,
                }
            }
        }
    }
}

/// Steps of one pipeline, in order
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub pipeline: String,
    pub records: Vec<StepRecord>,
    /// Steps skipped after a failure
    pub not_attempted: Vec<String>,
}

impl PipelineReport {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            ..Default::default()
        }
    }

    pub fn failure(&self) -> Option<&StepRecord> {
        self.records.iter().find(|r| !r.status.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.failure().is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PhaseReport {
    pub phase: String,
    pub pipelines: Vec<PipelineReport>,
}

impl PhaseReport {
    pub fn failure(&self) -> Option<&StepRecord> {
        self.pipelines.iter().find_map(|p| p.failure())
    }

    pub fn is_success(&self) -> bool {
        self.pipelines.iter().all(|p| p.is_success())
    }

    pub fn records(&self) -> impl Iterator<Item = &StepRecord> {
        self.pipelines.iter().flat_map(|p| p.records.iter())
    }
}

/// Everything a run did
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub phases: Vec<PhaseReport>,
    /// Phases never started because an earlier one failed or the run stopped
    pub skipped_phases: Vec<String>,
}

impl RunReport {
    pub fn push(&mut self, phase: PhaseReport) {
        self.phases.push(phase);
    }

    pub fn failure(&self) -> Option<&StepRecord> {
        self.phases.iter().find_map(|p| p.failure())
    }

    pub fn is_success(&self) -> bool {
        self.failure().is_none()
    }

    pub fn records(&self) -> impl Iterator<Item = &StepRecord> {
        self.phases.iter().flat_map(|p| p.records())
    }

    /// Count of records with the given status label
    pub fn count(&self, label: &str) -> usize {
        self.records().filter(|r| r.status.label() == label).count()
    }

    pub fn render(&self, detail: DetailLevel) -> String {
        let mut out = String::new();
        for phase in &self.phases {
            let _ = writeln!(out, "== {} ==", phase.phase);
            for pipeline in &phase.pipelines {
                if phase.pipelines.len() > 1 {
                    let _ = writeln!(out, "  [{}]", pipeline.pipeline);
                }
                for record in &pipeline.records {
                    let _ = writeln!(out, "  {}", record.line(detail));
                }
                for step in &pipeline.not_attempted {
                    let _ = writeln!(out, "  - {} (not attempted)", step);
                }
            }
        }
        for phase in &self.skipped_phases {
            let _ = writeln!(out, "== {} == (not run)", phase);
        }

        let changed = self.records().filter(|r| r.status.is_change()).count();
        let total = self.records().count();
        let _ = writeln!(out, "{} step(s), {} changed", total, changed);
        out
    }
}
