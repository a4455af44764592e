//! `homefix-core`: shared building blocks for the marketplace domain.
//!
//! Pure types only: identifiers, version tokens, the domain error and the
//! clock abstraction. No IO.

pub mod clock;
pub mod error;
pub mod id;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{AlertId, AssignmentId, IssueId, JobId, NotificationId, OutboxId, ProposalId, UserId};
pub use version::Version;
