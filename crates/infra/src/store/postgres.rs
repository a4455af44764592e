//! PostgreSQL-backed store.
//!
//! ## Concurrency
//!
//! - Jobs carry an explicit `version BIGINT`. Updates are
//!   `UPDATE jobs ... WHERE id = $1 AND version = $2`; zero rows affected means
//!   the caller read a stale row and gets [`StoreError::Conflict`].
//! - `assignments.job_id` is `UNIQUE`, so two transactions accepting bids on the
//!   same job cannot both commit even if both passed the version check.
//! - [`UnitOfWork::lock_job`] is `SELECT ... FOR SHARE` / `FOR UPDATE`, so a
//!   bid waits for a concurrent accept to commit and then sees the job as
//!   assigned, and an accept waits for in-flight bids before listing them.
//! - Outbox claiming is a single `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE
//!   SKIP LOCKED) RETURNING ...` statement, so concurrent dispatchers never see
//!   each other's rows. The returned `updated_at` is the lease stamp; renewals
//!   and outcome writes match on it.
//!
//! ## Idempotency
//!
//! Outbox inserts use `ON CONFLICT (notification_id, channel) DO NOTHING` inside
//! a savepoint: a duplicate is reported as [`EnqueueOutcome::Duplicate`] and any
//! other failure rolls back to the savepoint, leaving the business transaction
//! usable. Alerts rely on a partial unique index over unresolved
//! `(job_id, kind)` pairs in the same way.
//!
//! ## Error Mapping
//!
//! | PostgreSQL code | StoreError |
//! |---|---|
//! | `23505` unique violation | `UniqueViolation` |
//! | `40001` serialization failure | `Conflict` |
//! | anything else, pool closed, decode errors | `Backend` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use homefix_core::{
    AlertId, AssignmentId, IssueId, JobId, NotificationId, OutboxId, ProposalId, UserId, Version,
};
use homefix_jobs::{Assignment, Job, JobIssue, Proposal, User};
use homefix_notify::{Notification, OutboxRecord};
use homefix_sla::{Alert, AlertType, Breach, SlaPolicy};

use super::{EnqueueOutcome, LeasedRecord, RowLock, Store, StoreError, UnitOfWork};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const OUTBOX_COLUMNS: &str = "id, notification_id, channel, destination, subject, body, job_id, \
     status, attempts, last_error, created_at, updated_at, sent_at, next_retry_at";

/// Postgres-backed [`Store`].
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Unit of work over one Postgres transaction. Dropping it rolls back.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PostgresTx {
    async fn user(&mut self, id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, display_name, email, role, completed_jobs
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("user", e))?;

        row.as_ref().map(decode_user).transpose()
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, display_name, email, role, completed_jobs)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user.id.as_uuid())
        .bind(&user.display_name)
        .bind(user.email.as_deref())
        .bind(user.role.as_str())
        .bind(user.completed_jobs as i32)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_user", e))?;
        Ok(())
    }

    async fn admin_ids(&mut self) -> Result<Vec<UserId>, StoreError> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM users WHERE role = 'admin' ORDER BY id")
                .fetch_all(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("admin_ids", e))?;
        Ok(ids.into_iter().map(UserId::from_uuid).collect())
    }

    async fn increment_completed_jobs(&mut self, technician: UserId) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE users SET completed_jobs = completed_jobs + 1 WHERE id = $1")
                .bind(technician.as_uuid())
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("increment_completed_jobs", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {technician}")));
        }
        Ok(())
    }

    async fn job(&mut self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, customer_id, title, description, address, status,
                   created_at, updated_at, assigned_at, completed_at, cancelled_at, version
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("job", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn lock_job(&mut self, id: JobId, mode: RowLock) -> Result<Option<Job>, StoreError> {
        let clause = match mode {
            RowLock::Share => "FOR SHARE",
            RowLock::Update => "FOR UPDATE",
        };
        let sql = format!(
            r#"
            SELECT id, customer_id, title, description, address, status,
                   created_at, updated_at, assigned_at, completed_at, cancelled_at, version
            FROM jobs
            WHERE id = $1
            {clause}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_job", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    async fn insert_job(&mut self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, customer_id, title, description, address, status,
                created_at, updated_at, assigned_at, completed_at, cancelled_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.customer_id.as_uuid())
        .bind(&job.title)
        .bind(&job.description)
        .bind(&job.address)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.assigned_at)
        .bind(job.completed_at)
        .bind(job.cancelled_at)
        .bind(job.version.get() as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, expected_version = %job.version), err)]
    async fn update_job(&mut self, job: &Job) -> Result<Job, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET title = $3,
                description = $4,
                address = $5,
                status = $6,
                updated_at = $7,
                assigned_at = $8,
                completed_at = $9,
                cancelled_at = $10,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.version.get() as i64)
        .bind(&job.title)
        .bind(&job.description)
        .bind(&job.address)
        .bind(job.status.as_str())
        .bind(job.updated_at)
        .bind(job.assigned_at)
        .bind(job.completed_at)
        .bind(job.cancelled_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT version FROM jobs WHERE id = $1")
                .bind(job.id.as_uuid())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("update_job", e))?;
            return Err(match exists {
                Some(actual) => StoreError::Conflict(format!(
                    "job {} expected version {}, found {}",
                    job.id, job.version, actual
                )),
                None => StoreError::NotFound(format!("job {}", job.id)),
            });
        }

        let mut updated = job.clone();
        updated.version = job.version.next();
        Ok(updated)
    }

    async fn proposal(&mut self, id: ProposalId) -> Result<Option<Proposal>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, technician_id, price_cents, message, status, created_at
            FROM proposals
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("proposal", e))?;

        row.as_ref().map(decode_proposal).transpose()
    }

    async fn proposals_for_job(&mut self, job_id: JobId) -> Result<Vec<Proposal>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, technician_id, price_cents, message, status, created_at
            FROM proposals
            WHERE job_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("proposals_for_job", e))?;

        rows.iter().map(decode_proposal).collect()
    }

    async fn insert_proposal(&mut self, proposal: &Proposal) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO proposals (id, job_id, technician_id, price_cents, message, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(proposal.id.as_uuid())
        .bind(proposal.job_id.as_uuid())
        .bind(proposal.technician_id.as_uuid())
        .bind(proposal.price_cents as i64)
        .bind(&proposal.message)
        .bind(proposal.status.as_str())
        .bind(proposal.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_proposal", e))?;
        Ok(())
    }

    async fn update_proposal(&mut self, proposal: &Proposal) -> Result<(), StoreError> {
        sqlx::query("UPDATE proposals SET status = $2 WHERE id = $1")
            .bind(proposal.id.as_uuid())
            .bind(proposal.status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update_proposal", e))?;
        Ok(())
    }

    async fn assignment_for_job(
        &mut self,
        job_id: JobId,
    ) -> Result<Option<Assignment>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, proposal_id, technician_id, assigned_at, started_at, completed_at
            FROM assignments
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("assignment_for_job", e))?;

        row.as_ref().map(decode_assignment).transpose()
    }

    async fn insert_assignment(&mut self, assignment: &Assignment) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO assignments (
                id, job_id, proposal_id, technician_id, assigned_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(assignment.id.as_uuid())
        .bind(assignment.job_id.as_uuid())
        .bind(assignment.proposal_id.as_uuid())
        .bind(assignment.technician_id.as_uuid())
        .bind(assignment.assigned_at)
        .bind(assignment.started_at)
        .bind(assignment.completed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_assignment", e))?;
        Ok(())
    }

    async fn update_assignment(&mut self, assignment: &Assignment) -> Result<(), StoreError> {
        sqlx::query("UPDATE assignments SET started_at = $2, completed_at = $3 WHERE id = $1")
            .bind(assignment.id.as_uuid())
            .bind(assignment.started_at)
            .bind(assignment.completed_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update_assignment", e))?;
        Ok(())
    }

    async fn issue(&mut self, id: IssueId) -> Result<Option<JobIssue>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, reported_by, reason, detail, created_at,
                   resolved_at, resolved_by, resolution_note
            FROM job_issues
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("issue", e))?;

        row.as_ref().map(decode_issue).transpose()
    }

    async fn insert_issue(&mut self, issue: &JobIssue) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_issues (
                id, job_id, reported_by, reason, detail, created_at,
                resolved_at, resolved_by, resolution_note
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(issue.id.as_uuid())
        .bind(issue.job_id.as_uuid())
        .bind(issue.reported_by.as_uuid())
        .bind(issue.reason.as_str())
        .bind(issue.detail.as_deref())
        .bind(issue.created_at)
        .bind(issue.resolved_at)
        .bind(issue.resolved_by.map(Uuid::from))
        .bind(issue.resolution_note.as_deref())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_issue", e))?;
        Ok(())
    }

    async fn update_issue(&mut self, issue: &JobIssue) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE job_issues
            SET resolved_at = $2, resolved_by = $3, resolution_note = $4
            WHERE id = $1
            "#,
        )
        .bind(issue.id.as_uuid())
        .bind(issue.resolved_at)
        .bind(issue.resolved_by.map(Uuid::from))
        .bind(issue.resolution_note.as_deref())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_issue", e))?;
        Ok(())
    }

    async fn insert_notification(
        &mut self,
        notification: &Notification,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, job_id, kind, message, is_read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(notification.id.as_uuid())
        .bind(notification.user_id.as_uuid())
        .bind(notification.job_id.map(Uuid::from))
        .bind(notification.kind.as_str())
        .bind(&notification.message)
        .bind(notification.is_read)
        .bind(notification.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_notification", e))?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(outbox_id = %record.id), err)]
    async fn enqueue_outbox(
        &mut self,
        record: &OutboxRecord,
    ) -> Result<EnqueueOutcome, StoreError> {
        sqlx::query("SAVEPOINT outbox_enqueue")
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("enqueue_outbox", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO notification_outbox (
                id, notification_id, channel, destination, subject, body, job_id,
                status, attempts, last_error, created_at, updated_at, sent_at, next_retry_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (notification_id, channel) WHERE notification_id IS NOT NULL
            DO NOTHING
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.notification_id.map(Uuid::from))
        .bind(record.channel.as_str())
        .bind(&record.destination)
        .bind(&record.subject)
        .bind(&record.body)
        .bind(record.job_id.map(Uuid::from))
        .bind(record.status.as_str())
        .bind(record.attempts as i32)
        .bind(record.last_error.as_deref())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.sent_at)
        .bind(record.next_retry_at)
        .execute(&mut *self.tx)
        .await;

        match inserted {
            Ok(result) => {
                sqlx::query("RELEASE SAVEPOINT outbox_enqueue")
                    .execute(&mut *self.tx)
                    .await
                    .map_err(|e| map_sqlx_error("enqueue_outbox", e))?;
                if result.rows_affected() == 0 {
                    Ok(EnqueueOutcome::Duplicate)
                } else {
                    Ok(EnqueueOutcome::Enqueued(record.id))
                }
            }
            Err(err) => {
                sqlx::query("ROLLBACK TO SAVEPOINT outbox_enqueue")
                    .execute(&mut *self.tx)
                    .await
                    .map_err(|e| map_sqlx_error("enqueue_outbox", e))?;
                if is_unique_violation(&err) {
                    Ok(EnqueueOutcome::Duplicate)
                } else {
                    Err(map_sqlx_error("enqueue_outbox", err))
                }
            }
        }
    }

    async fn alert(&mut self, id: AlertId) -> Result<Option<Alert>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, kind, message, is_resolved, created_at, resolved_at, resolved_by
            FROM job_alerts
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("alert", e))?;

        row.as_ref().map(decode_alert).transpose()
    }

    async fn has_unresolved_alert(
        &mut self,
        job_id: JobId,
        kind: AlertType,
    ) -> Result<bool, StoreError> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM job_alerts
                WHERE job_id = $1 AND kind = $2 AND NOT is_resolved
            )
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(kind.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("has_unresolved_alert", e))
    }

    async fn insert_alert(&mut self, alert: &Alert) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_alerts (
                id, job_id, kind, message, is_resolved, created_at, resolved_at, resolved_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (job_id, kind) WHERE NOT is_resolved
            DO NOTHING
            "#,
        )
        .bind(alert.id.as_uuid())
        .bind(alert.job_id.as_uuid())
        .bind(alert.kind.as_str())
        .bind(&alert.message)
        .bind(alert.is_resolved)
        .bind(alert.created_at)
        .bind(alert.resolved_at)
        .bind(alert.resolved_by.map(Uuid::from))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_alert", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn resolve_alert(&mut self, alert: &Alert) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_alerts
            SET is_resolved = $2, resolved_at = $3, resolved_by = $4
            WHERE id = $1 AND NOT is_resolved
            "#,
        )
        .bind(alert.id.as_uuid())
        .bind(alert.is_resolved)
        .bind(alert.resolved_at)
        .bind(alert.resolved_by.map(Uuid::from))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("resolve_alert", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }
}

#[async_trait]
impl Store for PostgresStore {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresTx { tx })
    }

    #[instrument(skip(self), err)]
    async fn recover_orphans(
        &self,
        stuck_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_outbox
            SET status = 'pending', next_retry_at = NULL, updated_at = $2
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(stuck_before)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_orphans", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn claim_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let sql = format!(
            r#"
            UPDATE notification_outbox
            SET status = 'processing', updated_at = $2
            WHERE id IN (
                SELECT id FROM notification_outbox
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= $2)
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {OUTBOX_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_outbox", e))?;

        let mut records = rows
            .iter()
            .map(decode_outbox)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| (r.created_at, r.id));
        debug!(claimed = records.len(), "claimed outbox records");
        Ok(records)
    }

    #[instrument(skip(self, leases), fields(count = leases.len()), err)]
    async fn renew_outbox_leases(
        &self,
        leases: &[(OutboxId, DateTime<Utc>)],
        now: DateTime<Utc>,
    ) -> Result<Vec<(OutboxId, DateTime<Utc>)>, StoreError> {
        if leases.is_empty() {
            return Ok(Vec::new());
        }
        let (ids, stamps): (Vec<Uuid>, Vec<DateTime<Utc>>) = leases
            .iter()
            .map(|(id, stamp)| (*id.as_uuid(), *stamp))
            .unzip();

        let rows = sqlx::query(
            r#"
            UPDATE notification_outbox o
            SET updated_at = $1
            FROM UNNEST($2::uuid[], $3::timestamptz[]) AS l(id, lease)
            WHERE o.id = l.id
              AND o.status = 'processing'
              AND o.updated_at = l.lease
            RETURNING o.id, o.updated_at
            "#,
        )
        .bind(now)
        .bind(&ids)
        .bind(&stamps)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_outbox_leases", e))?;

        rows.iter()
            .map(|row| {
                Ok((
                    OutboxId::from_uuid(row.try_get("id").map_err(decode_error)?),
                    row.try_get("updated_at").map_err(decode_error)?,
                ))
            })
            .collect()
    }

    #[instrument(skip(self, outcomes), fields(count = outcomes.len()), err)]
    async fn save_outbox_outcomes(&self, outcomes: &[LeasedRecord]) -> Result<(), StoreError> {
        if outcomes.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for (record, lease) in outcomes {
            sqlx::query(
                r#"
                UPDATE notification_outbox
                SET status = $2,
                    attempts = $3,
                    last_error = $4,
                    updated_at = $5,
                    sent_at = $6,
                    next_retry_at = $7
                WHERE id = $1 AND status = 'processing' AND updated_at = $8
                "#,
            )
            .bind(record.id.as_uuid())
            .bind(record.status.as_str())
            .bind(record.attempts as i32)
            .bind(record.last_error.as_deref())
            .bind(record.updated_at)
            .bind(record.sent_at)
            .bind(record.next_retry_at)
            .bind(*lease)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("save_outbox_outcomes", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn outbox_record(&self, id: OutboxId) -> Result<Option<OutboxRecord>, StoreError> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM notification_outbox WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("outbox_record", e))?;
        row.as_ref().map(decode_outbox).transpose()
    }

    #[instrument(skip(self, policy), fields(alert_type = %kind), err)]
    async fn find_breaches(
        &self,
        policy: &SlaPolicy,
        kind: AlertType,
        now: DateTime<Utc>,
    ) -> Result<Vec<Breach>, StoreError> {
        let sql = match kind {
            AlertType::OpenTooLong => {
                r#"
                SELECT j.id, j.title FROM jobs j
                WHERE j.status = 'open' AND j.created_at < $1
                ORDER BY j.created_at, j.id
                "#
            }
            AlertType::AssignedNotStarted => {
                r#"
                SELECT j.id, j.title FROM jobs j
                JOIN assignments a ON a.job_id = j.id
                WHERE j.status = 'assigned'
                  AND j.assigned_at IS NOT NULL
                  AND j.assigned_at < $1
                  AND a.started_at IS NULL
                ORDER BY j.created_at, j.id
                "#
            }
            AlertType::InProgressTooLong => {
                r#"
                SELECT j.id, j.title FROM jobs j
                JOIN assignments a ON a.job_id = j.id
                WHERE j.status = 'in_progress'
                  AND a.started_at IS NOT NULL
                  AND a.started_at < $1
                ORDER BY j.created_at, j.id
                "#
            }
            AlertType::IssueUnresolved => {
                r#"
                SELECT j.id, j.title FROM jobs j
                WHERE j.status NOT IN ('completed', 'cancelled')
                  AND EXISTS (
                      SELECT 1 FROM job_issues i
                      WHERE i.job_id = j.id
                        AND i.resolved_at IS NULL
                        AND i.created_at < $1
                  )
                ORDER BY j.created_at, j.id
                "#
            }
        };

        let rows = sqlx::query(sql)
            .bind(policy.cutoff(kind, now))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_breaches", e))?;

        rows.iter()
            .map(|row| {
                Ok(Breach {
                    job_id: JobId::from_uuid(row.try_get("id").map_err(decode_error)?),
                    title: row.try_get("title").map_err(decode_error)?,
                    kind,
                })
            })
            .collect()
    }
}

// Row decoding

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::backend(format!("failed to decode row: {err}"))
}

fn parse_column<T>(column: &str, value: &str) -> Result<T, StoreError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    value
        .parse()
        .map_err(|e| StoreError::backend(format!("invalid {column}: {e}")))
}

fn non_negative(column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::backend(format!("negative {column}: {value}")))
}

fn decode_user(row: &PgRow) -> Result<User, StoreError> {
    let role: String = row.try_get("role").map_err(decode_error)?;
    let completed: i32 = row.try_get("completed_jobs").map_err(decode_error)?;
    Ok(User {
        id: UserId::from_uuid(row.try_get("id").map_err(decode_error)?),
        display_name: row.try_get("display_name").map_err(decode_error)?,
        email: row.try_get("email").map_err(decode_error)?,
        role: parse_column("role", &role)?,
        completed_jobs: non_negative("completed_jobs", completed.into())? as u32,
    })
}

fn decode_job(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(decode_error)?),
        customer_id: UserId::from_uuid(row.try_get("customer_id").map_err(decode_error)?),
        title: row.try_get("title").map_err(decode_error)?,
        description: row.try_get("description").map_err(decode_error)?,
        address: row.try_get("address").map_err(decode_error)?,
        status: parse_column("status", &status)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
        assigned_at: row.try_get("assigned_at").map_err(decode_error)?,
        completed_at: row.try_get("completed_at").map_err(decode_error)?,
        cancelled_at: row.try_get("cancelled_at").map_err(decode_error)?,
        version: Version::new(non_negative("version", version)?),
    })
}

fn decode_proposal(row: &PgRow) -> Result<Proposal, StoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let price: i64 = row.try_get("price_cents").map_err(decode_error)?;
    Ok(Proposal {
        id: ProposalId::from_uuid(row.try_get("id").map_err(decode_error)?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode_error)?),
        technician_id: UserId::from_uuid(row.try_get("technician_id").map_err(decode_error)?),
        price_cents: non_negative("price_cents", price)?,
        message: row.try_get("message").map_err(decode_error)?,
        status: parse_column("status", &status)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn decode_assignment(row: &PgRow) -> Result<Assignment, StoreError> {
    Ok(Assignment {
        id: AssignmentId::from_uuid(row.try_get("id").map_err(decode_error)?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode_error)?),
        proposal_id: ProposalId::from_uuid(row.try_get("proposal_id").map_err(decode_error)?),
        technician_id: UserId::from_uuid(row.try_get("technician_id").map_err(decode_error)?),
        assigned_at: row.try_get("assigned_at").map_err(decode_error)?,
        started_at: row.try_get("started_at").map_err(decode_error)?,
        completed_at: row.try_get("completed_at").map_err(decode_error)?,
    })
}

fn decode_issue(row: &PgRow) -> Result<JobIssue, StoreError> {
    let reason: String = row.try_get("reason").map_err(decode_error)?;
    let resolved_by: Option<Uuid> = row.try_get("resolved_by").map_err(decode_error)?;
    Ok(JobIssue {
        id: IssueId::from_uuid(row.try_get("id").map_err(decode_error)?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode_error)?),
        reported_by: UserId::from_uuid(row.try_get("reported_by").map_err(decode_error)?),
        reason: parse_column("reason", &reason)?,
        detail: row.try_get("detail").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        resolved_at: row.try_get("resolved_at").map_err(decode_error)?,
        resolved_by: resolved_by.map(UserId::from_uuid),
        resolution_note: row.try_get("resolution_note").map_err(decode_error)?,
    })
}

fn decode_outbox(row: &PgRow) -> Result<OutboxRecord, StoreError> {
    let channel: String = row.try_get("channel").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode_error)?;
    let notification_id: Option<Uuid> = row.try_get("notification_id").map_err(decode_error)?;
    let job_id: Option<Uuid> = row.try_get("job_id").map_err(decode_error)?;
    Ok(OutboxRecord {
        id: OutboxId::from_uuid(row.try_get("id").map_err(decode_error)?),
        notification_id: notification_id.map(NotificationId::from_uuid),
        channel: parse_column("channel", &channel)?,
        destination: row.try_get("destination").map_err(decode_error)?,
        subject: row.try_get("subject").map_err(decode_error)?,
        body: row.try_get("body").map_err(decode_error)?,
        job_id: job_id.map(JobId::from_uuid),
        status: parse_column("status", &status)?,
        attempts: non_negative("attempts", attempts.into())? as u32,
        last_error: row.try_get("last_error").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
        sent_at: row.try_get("sent_at").map_err(decode_error)?,
        next_retry_at: row.try_get("next_retry_at").map_err(decode_error)?,
    })
}

fn decode_alert(row: &PgRow) -> Result<Alert, StoreError> {
    let kind: String = row.try_get("kind").map_err(decode_error)?;
    let resolved_by: Option<Uuid> = row.try_get("resolved_by").map_err(decode_error)?;
    Ok(Alert {
        id: AlertId::from_uuid(row.try_get("id").map_err(decode_error)?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode_error)?),
        kind: parse_column("kind", &kind)?,
        message: row.try_get("message").map_err(decode_error)?,
        is_resolved: row.try_get("is_resolved").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        resolved_at: row.try_get("resolved_at").map_err(decode_error)?,
        resolved_by: resolved_by.map(UserId::from_uuid),
    })
}

/// Map SQLx errors to [`StoreError`].
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::UniqueViolation(msg),
                Some("40001") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("row not found in {}", operation)),
        other => StoreError::Backend(format!("sqlx error in {}: {}", operation, other)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
