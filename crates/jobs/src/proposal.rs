//! Technician bids on an open job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use homefix_core::{JobId, ProposalId, UserId};

use crate::error::JobError;

/// Upper bound (exclusive) on a quoted price, in cents.
pub const MAX_PRICE_CENTS: u64 = 1_000_000 * 100;
const MAX_MESSAGE_LEN: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
        }
    }
}

impl core::str::FromStr for ProposalStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProposalStatus::Pending),
            "accepted" => Ok(ProposalStatus::Accepted),
            "rejected" => Ok(ProposalStatus::Rejected),
            other => Err(JobError::validation(format!("unknown proposal status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProposal {
    pub job_id: JobId,
    pub price_cents: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub job_id: JobId,
    pub technician_id: UserId,
    pub price_cents: u64,
    pub message: String,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

impl Proposal {
    pub fn submit(
        input: NewProposal,
        technician_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Self, JobError> {
        if input.price_cents == 0 || input.price_cents >= MAX_PRICE_CENTS {
            return Err(JobError::validation(
                "price must be greater than 0 and less than 1,000,000",
            ));
        }
        let message = input.message.trim();
        if message.chars().count() > MAX_MESSAGE_LEN {
            return Err(JobError::validation(format!(
                "message must be at most {MAX_MESSAGE_LEN} characters"
            )));
        }

        Ok(Self {
            id: ProposalId::new(),
            job_id: input.job_id,
            technician_id,
            price_cents: input.price_cents,
            message: message.to_string(),
            status: ProposalStatus::Pending,
            created_at: now,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == ProposalStatus::Pending
    }
}
