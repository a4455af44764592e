//! SLA thresholds and the pure rule evaluation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use homefix_jobs::{Assignment, Job, JobIssue, JobStatus};

use crate::alert::AlertType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaPolicy {
    pub open_too_long: Duration,
    pub assigned_not_started: Duration,
    pub in_progress_too_long: Duration,
    pub issue_unresolved: Duration,
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self {
            open_too_long: Duration::from_secs(15 * 60),
            assigned_not_started: Duration::from_secs(30 * 60),
            in_progress_too_long: Duration::from_secs(3 * 60 * 60),
            issue_unresolved: Duration::from_secs(60 * 60),
        }
    }
}

impl SlaPolicy {
    pub fn threshold(&self, kind: AlertType) -> Duration {
        match kind {
            AlertType::OpenTooLong => self.open_too_long,
            AlertType::AssignedNotStarted => self.assigned_not_started,
            AlertType::InProgressTooLong => self.in_progress_too_long,
            AlertType::IssueUnresolved => self.issue_unresolved,
        }
    }

    /// Entities whose reference timestamp is strictly before this instant breach `kind`.
    pub fn cutoff(&self, kind: AlertType, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.threshold(kind))
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether `job` breaches `kind` at `now`.
    ///
    /// `issues` are the job's reported issues; resolved ones are ignored.
    pub fn is_breached(
        &self,
        kind: AlertType,
        job: &Job,
        assignment: Option<&Assignment>,
        issues: &[JobIssue],
        now: DateTime<Utc>,
    ) -> bool {
        let cutoff = self.cutoff(kind, now);
        match kind {
            AlertType::OpenTooLong => job.status == JobStatus::Open && job.created_at < cutoff,
            AlertType::AssignedNotStarted => {
                job.status == JobStatus::Assigned
                    && job.assigned_at.is_some_and(|at| at < cutoff)
                    && assignment.is_some_and(|a| a.started_at.is_none())
            }
            AlertType::InProgressTooLong => {
                job.status == JobStatus::InProgress
                    && assignment
                        .and_then(|a| a.started_at)
                        .is_some_and(|at| at < cutoff)
            }
            AlertType::IssueUnresolved => {
                !job.status.is_terminal()
                    && issues
                        .iter()
                        .any(|i| i.job_id == job.id && !i.is_resolved() && i.created_at < cutoff)
            }
        }
    }
}
