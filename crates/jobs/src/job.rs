//! The service request itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use homefix_core::{JobId, UserId, Version};

use crate::assignment::Assignment;
use crate::error::JobError;
use crate::status::JobStatus;

const MAX_TITLE_LEN: usize = 200;
const MAX_DESCRIPTION_LEN: usize = 2000;
const MAX_ADDRESS_LEN: usize = 500;

/// Customer input for a new job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub customer_id: UserId,
    pub title: String,
    pub description: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub customer_id: UserId,
    pub title: String,
    pub description: String,
    pub address: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Version read from the store. Updates are applied only if it still matches.
    pub version: Version,
}

impl Job {
    pub fn create(input: NewJob, now: DateTime<Utc>) -> Result<Self, JobError> {
        let title = required(&input.title, "title", MAX_TITLE_LEN)?;
        let description = bounded(&input.description, "description", MAX_DESCRIPTION_LEN)?;
        let address = required(&input.address, "address", MAX_ADDRESS_LEN)?;

        Ok(Self {
            id: JobId::new(),
            customer_id: input.customer_id,
            title,
            description,
            address,
            status: JobStatus::Open,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            completed_at: None,
            cancelled_at: None,
            version: Version::INITIAL,
        })
    }

    pub fn is_open(&self) -> bool {
        self.status == JobStatus::Open
    }

    /// Enter `Assigned` after a proposal was accepted.
    pub fn mark_assigned(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        if !self.is_open() {
            return Err(JobError::JobNotOpen);
        }
        self.status = JobStatus::Assigned;
        self.assigned_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Apply an already-authorized status change and its timestamp stamps.
    pub fn apply_transition(
        &mut self,
        to: JobStatus,
        now: DateTime<Utc>,
        assignment: Option<&mut Assignment>,
    ) -> Result<(), JobError> {
        self.status.check_transition(to)?;

        match to {
            JobStatus::InProgress => {
                if let Some(a) = assignment {
                    a.started_at.get_or_insert(now);
                }
            }
            JobStatus::Completed => {
                self.completed_at = Some(now);
                if let Some(a) = assignment {
                    a.started_at.get_or_insert(now);
                    a.completed_at = Some(now);
                }
            }
            JobStatus::Cancelled => {
                self.cancelled_at = Some(now);
            }
            JobStatus::Open | JobStatus::Assigned => {}
        }

        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

fn required(value: &str, field: &str, max: usize) -> Result<String, JobError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(JobError::validation(format!("{field} is required")));
    }
    bounded(trimmed, field, max)
}

fn bounded(value: &str, field: &str, max: usize) -> Result<String, JobError> {
    let trimmed = value.trim();
    if trimmed.chars().count() > max {
        return Err(JobError::validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(trimmed.to_string())
}
