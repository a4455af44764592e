use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use homefix_core::{AssignmentId, JobId, ProposalId, UserId};

use crate::proposal::Proposal;

/// The single accepted proposal of a job. At most one exists per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub job_id: JobId,
    pub proposal_id: ProposalId,
    pub technician_id: UserId,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Assignment {
    pub fn for_proposal(proposal: &Proposal, now: DateTime<Utc>) -> Self {
        Self {
            id: AssignmentId::new(),
            job_id: proposal.job_id,
            proposal_id: proposal.id,
            technician_id: proposal.technician_id,
            assigned_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }
}
