//! Job status and the transition allow-table.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Open,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Open,
        JobStatus::Assigned,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Open => "open",
            JobStatus::Assigned => "assigned",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// Targets reachable from `self` through an explicit transition.
    ///
    /// `Assigned` is deliberately absent as a target: it is only entered through
    /// proposal acceptance, never through a status change request.
    pub fn allowed_targets(self) -> &'static [JobStatus] {
        match self {
            JobStatus::Open | JobStatus::Assigned => {
                &[JobStatus::InProgress, JobStatus::Cancelled]
            }
            JobStatus::InProgress => &[JobStatus::Completed, JobStatus::Cancelled],
            JobStatus::Completed | JobStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, target: JobStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Whether `target` appears anywhere in the allow-table as a destination.
    pub fn is_transition_target(self) -> bool {
        matches!(
            self,
            JobStatus::InProgress | JobStatus::Completed | JobStatus::Cancelled
        )
    }

    /// Reject a requested status that no explicit transition can produce.
    pub fn ensure_transition_target(self) -> Result<(), JobError> {
        if self.is_transition_target() {
            Ok(())
        } else {
            Err(JobError::InvalidStatus(format!(
                "'{}' cannot be requested as a status change",
                self.as_str()
            )))
        }
    }

    /// Validate `self -> target` against the allow-table.
    ///
    /// A terminal current status is `INVALID_STATUS`; a live status that does
    /// not permit `target` is `INVALID_TRANSITION`.
    pub fn check_transition(self, target: JobStatus) -> Result<(), JobError> {
        target.ensure_transition_target()?;
        if self.is_terminal() {
            return Err(JobError::InvalidStatus(format!(
                "job is already {}",
                self.as_str()
            )));
        }
        if !self.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                from: self,
                to: target,
            });
        }
        Ok(())
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "open" => Ok(JobStatus::Open),
            "assigned" => Ok(JobStatus::Assigned),
            "in_progress" | "inprogress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(JobError::InvalidStatus(format!("unknown status '{other}'"))),
        }
    }
}
