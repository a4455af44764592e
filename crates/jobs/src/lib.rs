//! `homefix-jobs`: the job lifecycle domain.
//!
//! Pure decision logic for service requests: the status allow-table, the
//! per-role transition policy, proposal and assignment rules. Persistence and
//! orchestration live in `homefix-infra`.

pub mod actor;
pub mod assignment;
pub mod error;
pub mod issue;
pub mod job;
pub mod proposal;
pub mod status;

pub use actor::{Actor, Role, User};
pub use assignment::Assignment;
pub use error::{JobError, JobResult};
pub use issue::{IssueReason, JobIssue};
pub use job::{Job, NewJob};
pub use proposal::{NewProposal, Proposal, ProposalStatus};
pub use status::JobStatus;
