//! Operation polling with capped exponential backoff
//!
//! Polls `{scope}/operations/{name}` until the operation reports `DONE`, the
//! status query fails, the caller cancels, or the optional deadline passes.
//! Only the polling task is suspended.

use super::api::ComputeApi;
use super::operation::{CancelReason, OperationHandle, OperationOutcome, OperationStatus};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Interval between status queries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2,
        }
    }
}

impl BackoffPolicy {
    /// Interval following `current`
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(self.multiplier.max(1)).min(self.max)
    }

    /// Successive intervals, starting with `initial`
    pub fn intervals(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial.min(self.max)), move |d| Some(self.next(*d)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Poller {
    pub policy: BackoffPolicy,
    /// Upper bound on the wait for a single operation
    pub deadline: Option<Duration>,
}

impl Poller {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Wait for `handle` to reach a terminal state
    pub async fn wait(
        &self,
        api: &dyn ComputeApi,
        handle: &OperationHandle,
        cancel: &CancellationToken,
    ) -> OperationOutcome {
        let deadline = self.deadline.map(|d| Instant::now() + d);
        let mut intervals = self.policy.intervals();
        let mut polls: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return OperationOutcome::Cancelled(CancelReason::Signal);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return OperationOutcome::Cancelled(CancelReason::Deadline);
            }

            polls += 1;
            let queried = tokio::select! {
                biased;
                _ = cancel.cancelled() => return OperationOutcome::Cancelled(CancelReason::Signal),
                _ = deadline_reached(deadline) => return OperationOutcome::Cancelled(CancelReason::Deadline),
                queried = api.get_operation(&handle.scope, &handle.name) => queried,
            };
            let operation = match queried {
                Ok(operation) => operation,
                Err(e) => {
                    tracing::warn!("Status query for operation {} failed: {}", handle.name, e);
                    return OperationOutcome::PollError(e);
                }
            };

            match OperationStatus::from_json(&operation) {
                OperationStatus::Done { error: None } => {
                    tracing::debug!("Operation {} done after {} poll(s)", handle.name, polls);
                    return OperationOutcome::Succeeded;
                }
                OperationStatus::Done { error: Some(detail) } => {
                    tracing::debug!("Operation {} failed: {}", handle.name, detail);
                    return OperationOutcome::Failed(detail);
                }
                OperationStatus::Unknown(status) => {
                    tracing::warn!(
                        "Operation {} reported unexpected status '{}', polling on",
                        handle.name,
                        status
                    );
                }
                OperationStatus::Pending | OperationStatus::Running => {}
            }

            let interval = intervals.next().unwrap_or(self.policy.max);
            tracing::trace!(
                "Operation {} on {}/{} not done, next poll in {:?}",
                handle.name,
                handle.kind,
                handle.target,
                interval
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return OperationOutcome::Cancelled(CancelReason::Signal),
                _ = deadline_reached(deadline) => return OperationOutcome::Cancelled(CancelReason::Deadline),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

/// Resolves once `deadline` passes; never without one
async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
