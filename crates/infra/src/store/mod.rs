//! Transactional store contract shared by the lifecycle service and the
//! background loops.
//!
//! ## Units of work
//!
//! Every business mutation runs inside one [`UnitOfWork`]: reads, version
//! checked writes, notification rows and outbox records all become visible
//! together on [`UnitOfWork::commit`], or not at all. Dropping a unit of work
//! without committing discards it.
//!
//! ## Optimistic concurrency
//!
//! [`UnitOfWork::update_job`] is a compare-and-swap on the job's version token.
//! The caller passes the job as it read it (including `version`); the store
//! applies the write only if the stored version is unchanged, and returns the
//! job carrying the bumped version. A mismatch is [`StoreError::Conflict`],
//! raised either at the write or at commit time, depending on the backend.
//!
//! ## Job row locks
//!
//! A unit of work whose decision depends on a job it does not write takes a
//! [`RowLock::Share`] through [`UnitOfWork::lock_job`]: a concurrent write to
//! the job makes one of the two fail. A unit that must see every row hanging
//! off the job (accepting a proposal rejects all others) takes
//! [`RowLock::Update`], which also excludes concurrent share holders.
//!
//! ## Outbox claiming
//!
//! [`Store::claim_outbox`] selects due records and marks them `processing` in a
//! single atomic step, skipping rows another dispatcher already holds. It runs
//! outside any business unit of work so the claim commits immediately.
//!
//! The claim stamps `updated_at`; that stamp is the dispatcher's lease. The
//! dispatcher renews the leases of the records it still holds before each
//! send ([`Store::renew_outbox_leases`]) and its outcome writes only land on
//! records whose stamp still matches, so a record recovered as an orphan and
//! re-claimed elsewhere is never touched by the stale holder.
//!
//! ## Implementations
//!
//! - [`InMemoryStore`]: snapshot-per-transaction store with commit-time
//!   validation, for tests and local development.
//! - [`PostgresStore`]: SQLx/PostgreSQL backed production store.

mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use homefix_core::{AlertId, IssueId, JobId, OutboxId, ProposalId, UserId};
use homefix_jobs::{Assignment, Job, JobError, JobIssue, Proposal, User};
use homefix_notify::{Notification, OutboxRecord};
use homefix_sla::{Alert, AlertType, Breach, SlaPolicy};

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Version token mismatch on a compare-and-swap write.
    #[error("version conflict: {0}")]
    Conflict(String),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Connection, serialization or other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(_) => JobError::ConcurrencyConflict,
            StoreError::NotFound(_) => JobError::JobNotFound,
            other => JobError::Store(other.to_string()),
        }
    }
}

/// Lock mode for [`UnitOfWork::lock_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLock {
    /// Compatible with other share holders; conflicts with writers.
    Share,
    /// Exclusive: conflicts with writers and share holders.
    Update,
}

/// A claimed outbox record paired with the lease stamp it is held under.
pub type LeasedRecord = (OutboxRecord, DateTime<Utc>);

/// Result of writing an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(OutboxId),
    /// A record with the same `(notification id, channel)` already exists.
    Duplicate,
}

/// One atomic unit of reads and writes.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn user(&mut self, id: UserId) -> Result<Option<User>, StoreError>;
    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError>;
    async fn admin_ids(&mut self) -> Result<Vec<UserId>, StoreError>;
    async fn increment_completed_jobs(&mut self, technician: UserId) -> Result<(), StoreError>;

    async fn job(&mut self, id: JobId) -> Result<Option<Job>, StoreError>;
    /// Read a job and hold it in `mode` until the unit of work ends.
    async fn lock_job(&mut self, id: JobId, mode: RowLock) -> Result<Option<Job>, StoreError>;
    async fn insert_job(&mut self, job: &Job) -> Result<(), StoreError>;
    /// Compare-and-swap on `job.version`. Returns the job with its new version.
    async fn update_job(&mut self, job: &Job) -> Result<Job, StoreError>;

    async fn proposal(&mut self, id: ProposalId) -> Result<Option<Proposal>, StoreError>;
    async fn proposals_for_job(&mut self, job_id: JobId) -> Result<Vec<Proposal>, StoreError>;
    /// Unique on `(job_id, technician_id)`.
    async fn insert_proposal(&mut self, proposal: &Proposal) -> Result<(), StoreError>;
    async fn update_proposal(&mut self, proposal: &Proposal) -> Result<(), StoreError>;

    async fn assignment_for_job(&mut self, job_id: JobId)
    -> Result<Option<Assignment>, StoreError>;
    /// Unique on `job_id`.
    async fn insert_assignment(&mut self, assignment: &Assignment) -> Result<(), StoreError>;
    async fn update_assignment(&mut self, assignment: &Assignment) -> Result<(), StoreError>;

    async fn issue(&mut self, id: IssueId) -> Result<Option<JobIssue>, StoreError>;
    async fn insert_issue(&mut self, issue: &JobIssue) -> Result<(), StoreError>;
    async fn update_issue(&mut self, issue: &JobIssue) -> Result<(), StoreError>;

    async fn insert_notification(&mut self, notification: &Notification)
    -> Result<(), StoreError>;
    /// Write an outbox record. A duplicate idempotency key is not an error.
    async fn enqueue_outbox(&mut self, record: &OutboxRecord)
    -> Result<EnqueueOutcome, StoreError>;

    async fn alert(&mut self, id: AlertId) -> Result<Option<Alert>, StoreError>;
    async fn has_unresolved_alert(
        &mut self,
        job_id: JobId,
        kind: AlertType,
    ) -> Result<bool, StoreError>;
    /// Returns `false` when an unresolved alert for the same `(job, kind)`
    /// already exists and nothing was written.
    async fn insert_alert(&mut self, alert: &Alert) -> Result<bool, StoreError>;
    /// Persist the resolution stamp. Returns `false` when the stored alert is
    /// already resolved and nothing was written.
    async fn resolve_alert(&mut self, alert: &Alert) -> Result<bool, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}

/// Store entry points.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: UnitOfWork + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Reset records stuck in `processing` since before `stuck_before` back to
    /// `pending`. Returns the number of records reset.
    async fn recover_orphans(
        &self,
        stuck_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Atomically claim up to `limit` due records, oldest first, marking them
    /// `processing`. Rows locked by a concurrent claimer are skipped.
    async fn claim_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Move the lease of each still-held `(id, stamp)` to `now`. Returns the
    /// new stamp of every record renewed; records missing from the result
    /// were recovered or re-claimed elsewhere and must not be sent.
    async fn renew_outbox_leases(
        &self,
        leases: &[(OutboxId, DateTime<Utc>)],
        now: DateTime<Utc>,
    ) -> Result<Vec<(OutboxId, DateTime<Utc>)>, StoreError>;

    /// Persist dispatch outcomes for claimed records. A record is written only
    /// if it is still `processing` under the given lease stamp.
    async fn save_outbox_outcomes(&self, outcomes: &[LeasedRecord]) -> Result<(), StoreError>;

    async fn outbox_record(&self, id: OutboxId) -> Result<Option<OutboxRecord>, StoreError>;

    /// Jobs currently breaching `kind` under `policy`.
    async fn find_breaches(
        &self,
        policy: &SlaPolicy,
        kind: AlertType,
        now: DateTime<Utc>,
    ) -> Result<Vec<Breach>, StoreError>;
}

#[async_trait]
impl<S: Store> Store for Arc<S> {
    type Tx = S::Tx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        (**self).begin().await
    }

    async fn recover_orphans(
        &self,
        stuck_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        (**self).recover_orphans(stuck_before, now).await
    }

    async fn claim_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        (**self).claim_outbox(limit, now).await
    }

    async fn renew_outbox_leases(
        &self,
        leases: &[(OutboxId, DateTime<Utc>)],
        now: DateTime<Utc>,
    ) -> Result<Vec<(OutboxId, DateTime<Utc>)>, StoreError> {
        (**self).renew_outbox_leases(leases, now).await
    }

    async fn save_outbox_outcomes(&self, outcomes: &[LeasedRecord]) -> Result<(), StoreError> {
        (**self).save_outbox_outcomes(outcomes).await
    }

    async fn outbox_record(&self, id: OutboxId) -> Result<Option<OutboxRecord>, StoreError> {
        (**self).outbox_record(id).await
    }

    async fn find_breaches(
        &self,
        policy: &SlaPolicy,
        kind: AlertType,
        now: DateTime<Utc>,
    ) -> Result<Vec<Breach>, StoreError> {
        (**self).find_breaches(policy, kind, now).await
    }
}
