//! Customer-reported problems with a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use homefix_core::{IssueId, JobId, UserId};

use crate::error::JobError;

const MAX_DETAIL_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueReason {
    NoContact,
    Late,
    BadService,
    Other,
}

impl IssueReason {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueReason::NoContact => "no_contact",
            IssueReason::Late => "late",
            IssueReason::BadService => "bad_service",
            IssueReason::Other => "other",
        }
    }
}

impl core::str::FromStr for IssueReason {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "no_contact" => Ok(IssueReason::NoContact),
            "late" => Ok(IssueReason::Late),
            "bad_service" => Ok(IssueReason::BadService),
            "other" => Ok(IssueReason::Other),
            other => Err(JobError::validation(format!("unknown issue reason '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobIssue {
    pub id: IssueId,
    pub job_id: JobId,
    pub reported_by: UserId,
    pub reason: IssueReason,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
    pub resolution_note: Option<String>,
}

impl JobIssue {
    pub fn report(
        job_id: JobId,
        reported_by: UserId,
        reason: IssueReason,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, JobError> {
        let detail = detail
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        if detail
            .as_deref()
            .is_some_and(|d| d.chars().count() > MAX_DETAIL_LEN)
        {
            return Err(JobError::validation(format!(
                "detail must be at most {MAX_DETAIL_LEN} characters"
            )));
        }
        Ok(Self {
            id: IssueId::new(),
            job_id,
            reported_by,
            reason,
            detail,
            created_at: now,
            resolved_at: None,
            resolved_by: None,
            resolution_note: None,
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn resolve(
        &mut self,
        by: UserId,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        if self.is_resolved() {
            return Err(JobError::IssueAlreadyResolved);
        }
        self.resolved_at = Some(now);
        self.resolved_by = Some(by);
        self.resolution_note = note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        Ok(())
    }
}
