//! Job lifecycle error model.
//!
//! Every variant maps to a stable, machine-readable code via [`JobError::code`].

use thiserror::Error;

use homefix_core::DomainError;

use crate::status::JobStatus;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("job not found")]
    JobNotFound,

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("cannot transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("job already has an assignment")]
    JobAlreadyAssigned,

    /// The job changed underneath the caller. Re-read and retry.
    #[error("job was modified concurrently")]
    ConcurrencyConflict,

    #[error("proposal is not pending")]
    ProposalNotPending,

    #[error("job is not open")]
    JobNotOpen,

    #[error("proposal not found")]
    ProposalNotFound,

    #[error("technicians cannot bid on their own job")]
    SelfProposal,

    #[error("technician already submitted a proposal for this job")]
    DuplicateProposal,

    #[error("user not found")]
    UserNotFound,

    #[error("issue not found")]
    IssueNotFound,

    #[error("issue already resolved")]
    IssueAlreadyResolved,

    #[error("validation failed: {0}")]
    Validation(String),

    /// Infrastructure failure underneath a lifecycle operation.
    #[error("store error: {0}")]
    Store(String),
}

impl JobError {
    pub fn code(&self) -> &'static str {
        match self {
            JobError::JobNotFound => "JOB_NOT_FOUND",
            JobError::InvalidStatus(_) => "INVALID_STATUS",
            JobError::InvalidTransition { .. } => "INVALID_TRANSITION",
            JobError::Forbidden(_) => "FORBIDDEN",
            JobError::JobAlreadyAssigned => "JOB_ALREADY_ASSIGNED",
            JobError::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            JobError::ProposalNotPending => "PROPOSAL_NOT_PENDING",
            JobError::JobNotOpen => "JOB_NOT_OPEN",
            JobError::ProposalNotFound => "PROPOSAL_NOT_FOUND",
            JobError::SelfProposal => "SELF_PROPOSAL",
            JobError::DuplicateProposal => "DUPLICATE_PROPOSAL",
            JobError::UserNotFound => "USER_NOT_FOUND",
            JobError::IssueNotFound => "ISSUE_NOT_FOUND",
            JobError::IssueAlreadyResolved => "ISSUE_ALREADY_RESOLVED",
            JobError::Validation(_) => "VALIDATION",
            JobError::Store(_) => "STORE_ERROR",
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Caller-fixable errors are never retried automatically; conflicts are
    /// retryable after a fresh read.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::ConcurrencyConflict)
    }
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => JobError::Validation(msg),
            DomainError::InvariantViolation(msg) => JobError::InvalidStatus(msg),
            DomainError::NotFound => JobError::JobNotFound,
            DomainError::Conflict(_) => JobError::ConcurrencyConflict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(JobError::JobNotFound.code(), "JOB_NOT_FOUND");
        assert_eq!(
            JobError::InvalidTransition {
                from: JobStatus::Open,
                to: JobStatus::Completed
            }
            .code(),
            "INVALID_TRANSITION"
        );
        assert_eq!(JobError::ConcurrencyConflict.code(), "CONCURRENCY_CONFLICT");
    }

    #[test]
    fn domain_conflict_maps_to_concurrency_conflict() {
        let err: JobError = DomainError::conflict("stale").into();
        assert_eq!(err, JobError::ConcurrencyConflict);
        assert!(err.is_retryable());
    }

    #[test]
    fn transition_error_message_names_both_states() {
        let err = JobError::InvalidTransition {
            from: JobStatus::Open,
            to: JobStatus::Completed,
        };
        assert_eq!(err.to_string(), "cannot transition from open to completed");
    }
}
