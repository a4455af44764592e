//! Who is acting, and what each role may do to a job.

use serde::{Deserialize, Serialize};

use homefix_core::UserId;

use crate::assignment::Assignment;
use crate::error::JobError;
use crate::job::Job;
use crate::status::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Technician,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Technician => "technician",
            Role::Admin => "admin",
        }
    }
}

impl core::str::FromStr for Role {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Role::Customer),
            "technician" => Ok(Role::Technician),
            "admin" => Ok(Role::Admin),
            other => Err(JobError::validation(format!("unknown role '{other}'"))),
        }
    }
}

/// Authenticated caller of a lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn customer(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Customer,
        }
    }

    pub fn technician(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Technician,
        }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn owns(&self, job: &Job) -> bool {
        job.customer_id == self.user_id
    }

    pub fn is_assigned_to(&self, assignment: Option<&Assignment>) -> bool {
        assignment.is_some_and(|a| a.technician_id == self.user_id)
    }

    /// The actor must be the job's customer, its assigned technician, or an admin.
    pub fn ensure_participant(
        &self,
        job: &Job,
        assignment: Option<&Assignment>,
    ) -> Result<(), JobError> {
        if self.is_admin() || self.owns(job) || self.is_assigned_to(assignment) {
            Ok(())
        } else {
            Err(JobError::forbidden("not a participant of this job"))
        }
    }

    /// Role policy layered on top of the allow-table.
    ///
    /// Assumes `from -> to` already passed [`JobStatus::check_transition`].
    pub fn ensure_may_transition(
        &self,
        job: &Job,
        assignment: Option<&Assignment>,
        to: JobStatus,
    ) -> Result<(), JobError> {
        if self.is_admin() {
            return Ok(());
        }
        let from = job.status;
        if to == JobStatus::Cancelled && self.owns(job) && from == JobStatus::InProgress {
            return Err(JobError::InvalidStatus(
                "service is already in progress".to_string(),
            ));
        }
        let allowed = match to {
            JobStatus::Cancelled => {
                self.owns(job) && matches!(from, JobStatus::Open | JobStatus::Assigned)
            }
            JobStatus::Completed => self.owns(job) && from == JobStatus::InProgress,
            JobStatus::InProgress => {
                self.role == Role::Technician
                    && self.is_assigned_to(assignment)
                    && from == JobStatus::Assigned
            }
            JobStatus::Open | JobStatus::Assigned => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(JobError::forbidden(format!(
                "{} may not move this job from {from} to {to}",
                self.role.as_str()
            )))
        }
    }
}

/// Account record as seen by the lifecycle: contact address and the
/// technician's completed-job counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub email: Option<String>,
    pub role: Role,
    pub completed_jobs: u32,
}

impl User {
    pub fn new(display_name: impl Into<String>, email: Option<String>, role: Role) -> Self {
        Self {
            id: UserId::new(),
            display_name: display_name.into(),
            email,
            role,
            completed_jobs: 0,
        }
    }

    pub fn actor(&self) -> Actor {
        Actor {
            user_id: self.id,
            role: self.role,
        }
    }

    /// Email address if one is on file and not blank.
    pub fn contact_email(&self) -> Option<&str> {
        self.email.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }
}
