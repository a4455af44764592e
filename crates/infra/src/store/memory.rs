//! In-memory store.
//!
//! Each unit of work starts from a snapshot of the committed state and records
//! its writes as an operation log. Reads inside the unit see the snapshot plus
//! the unit's own writes. On commit the log is replayed against the *current*
//! committed state, re-checking version tokens and uniqueness, so two units
//! that raced from the same snapshot cannot both win.
//!
//! Job row locks are emulated the same way: a share lock re-checks the job's
//! version at commit and bumps a per-job share counter; an update lock also
//! requires that counter to be unchanged.
//!
//! The lock guarding committed state is a `std::sync::Mutex` and is never held
//! across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use homefix_core::{
    AlertId, IssueId, JobId, NotificationId, OutboxId, ProposalId, UserId, Version,
};
use homefix_jobs::{Assignment, Job, JobIssue, Proposal, Role, User};
use homefix_notify::{Channel, Notification, OutboxRecord, OutboxStatus};
use homefix_sla::{Alert, AlertType, Breach, SlaPolicy};

use super::{EnqueueOutcome, LeasedRecord, RowLock, Store, StoreError, UnitOfWork};

#[derive(Debug, Default, Clone)]
struct State {
    users: HashMap<UserId, User>,
    jobs: HashMap<JobId, Job>,
    /// Committed share locks per job.
    job_shares: HashMap<JobId, u64>,
    proposals: HashMap<ProposalId, Proposal>,
    assignments: HashMap<JobId, Assignment>,
    issues: HashMap<IssueId, JobIssue>,
    notifications: Vec<Notification>,
    outbox: HashMap<OutboxId, OutboxRecord>,
    alerts: HashMap<AlertId, Alert>,
}

#[derive(Debug, Clone)]
enum Op {
    InsertUser(User),
    IncrementCompletedJobs(UserId),
    InsertJob(Job),
    UpdateJob(Job),
    LockJob {
        id: JobId,
        version: Version,
        shares: u64,
        mode: RowLock,
    },
    InsertProposal(Proposal),
    UpdateProposal(Proposal),
    InsertAssignment(Assignment),
    UpdateAssignment(Assignment),
    InsertIssue(JobIssue),
    UpdateIssue(JobIssue),
    InsertNotification(Notification),
    EnqueueOutbox(OutboxRecord),
    InsertAlert(Alert),
    ResolveAlert(Alert),
}

/// Outcome of applying one operation.
enum Applied {
    Done,
    /// Idempotent insert that found an existing row; nothing written.
    Skipped,
}

impl State {
    fn apply(&mut self, op: &Op) -> Result<Applied, StoreError> {
        match op {
            Op::InsertUser(user) => {
                if self.users.contains_key(&user.id) {
                    return Err(StoreError::UniqueViolation(format!("user {}", user.id)));
                }
                self.users.insert(user.id, user.clone());
            }
            Op::IncrementCompletedJobs(id) => {
                let user = self
                    .users
                    .get_mut(id)
                    .ok_or_else(|| StoreError::NotFound(format!("user {id}")))?;
                user.completed_jobs += 1;
            }
            Op::InsertJob(job) => {
                if self.jobs.contains_key(&job.id) {
                    return Err(StoreError::UniqueViolation(format!("job {}", job.id)));
                }
                self.jobs.insert(job.id, job.clone());
            }
            Op::UpdateJob(job) => {
                let stored = self
                    .jobs
                    .get_mut(&job.id)
                    .ok_or_else(|| StoreError::NotFound(format!("job {}", job.id)))?;
                job.version
                    .check(stored.version)
                    .map_err(|e| StoreError::Conflict(e.to_string()))?;
                let mut next = job.clone();
                next.version = job.version.next();
                *stored = next;
            }
            Op::LockJob {
                id,
                version,
                shares,
                mode,
            } => {
                let stored = self
                    .jobs
                    .get(id)
                    .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
                version
                    .check(stored.version)
                    .map_err(|e| StoreError::Conflict(e.to_string()))?;
                let held = self.job_shares.entry(*id).or_default();
                match mode {
                    RowLock::Share => *held += 1,
                    RowLock::Update if *held != *shares => {
                        return Err(StoreError::Conflict(format!(
                            "job {id} was locked by a concurrent writer"
                        )));
                    }
                    RowLock::Update => {}
                }
            }
            Op::InsertProposal(p) => {
                let duplicate = self
                    .proposals
                    .values()
                    .any(|x| x.job_id == p.job_id && x.technician_id == p.technician_id);
                if duplicate || self.proposals.contains_key(&p.id) {
                    return Err(StoreError::UniqueViolation(format!(
                        "proposal for job {} by {}",
                        p.job_id, p.technician_id
                    )));
                }
                self.proposals.insert(p.id, p.clone());
            }
            Op::UpdateProposal(p) => {
                let stored = self
                    .proposals
                    .get_mut(&p.id)
                    .ok_or_else(|| StoreError::NotFound(format!("proposal {}", p.id)))?;
                *stored = p.clone();
            }
            Op::InsertAssignment(a) => {
                if self.assignments.contains_key(&a.job_id) {
                    return Err(StoreError::UniqueViolation(format!(
                        "assignment for job {}",
                        a.job_id
                    )));
                }
                self.assignments.insert(a.job_id, a.clone());
            }
            Op::UpdateAssignment(a) => {
                let stored = self
                    .assignments
                    .get_mut(&a.job_id)
                    .filter(|s| s.id == a.id)
                    .ok_or_else(|| StoreError::NotFound(format!("assignment {}", a.id)))?;
                *stored = a.clone();
            }
            Op::InsertIssue(issue) => {
                self.issues.insert(issue.id, issue.clone());
            }
            Op::UpdateIssue(issue) => {
                let stored = self
                    .issues
                    .get_mut(&issue.id)
                    .ok_or_else(|| StoreError::NotFound(format!("issue {}", issue.id)))?;
                *stored = issue.clone();
            }
            Op::InsertNotification(n) => {
                self.notifications.push(n.clone());
            }
            Op::EnqueueOutbox(record) => {
                if let Some(key) = record.idempotency_key() {
                    if self.outbox_key_exists(key) {
                        return Ok(Applied::Skipped);
                    }
                }
                self.outbox.insert(record.id, record.clone());
            }
            Op::InsertAlert(alert) => {
                if self.unresolved_alert_exists(alert.job_id, alert.kind) {
                    return Err(StoreError::UniqueViolation(format!(
                        "unresolved {} alert for job {}",
                        alert.kind, alert.job_id
                    )));
                }
                self.alerts.insert(alert.id, alert.clone());
            }
            Op::ResolveAlert(alert) => {
                let stored = self
                    .alerts
                    .get_mut(&alert.id)
                    .ok_or_else(|| StoreError::NotFound(format!("alert {}", alert.id)))?;
                if stored.is_resolved {
                    return Err(StoreError::Conflict(format!(
                        "alert {} already resolved",
                        alert.id
                    )));
                }
                *stored = alert.clone();
            }
        }
        Ok(Applied::Done)
    }

    fn outbox_key_exists(&self, key: (NotificationId, Channel)) -> bool {
        self.outbox
            .values()
            .any(|r| r.idempotency_key() == Some(key))
    }

    fn unresolved_alert_exists(&self, job_id: JobId, kind: AlertType) -> bool {
        self.alerts
            .values()
            .any(|a| a.job_id == job_id && a.kind == kind && !a.is_resolved)
    }

    fn breaches(&self, policy: &SlaPolicy, kind: AlertType, now: DateTime<Utc>) -> Vec<Breach> {
        let mut hits: Vec<&Job> = self
            .jobs
            .values()
            .filter(|job| {
                let issues: Vec<JobIssue> = self
                    .issues
                    .values()
                    .filter(|i| i.job_id == job.id)
                    .cloned()
                    .collect();
                policy.is_breached(kind, job, self.assignments.get(&job.id), &issues, now)
            })
            .collect();
        hits.sort_by_key(|job| (job.created_at, job.id));
        hits.into_iter()
            .map(|job| Breach {
                job_id: job.id,
                title: job.title.clone(),
                kind,
            })
            .collect()
    }
}

/// In-memory [`Store`] for tests and local development.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::backend("lock poisoned"))
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        let guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&guard)
    }

    /// Committed jobs, for inspection.
    pub fn jobs(&self) -> Vec<Job> {
        self.read(|s| s.jobs.values().cloned().collect())
    }

    pub fn users(&self) -> Vec<User> {
        self.read(|s| s.users.values().cloned().collect())
    }

    pub fn assignments(&self) -> Vec<Assignment> {
        self.read(|s| s.assignments.values().cloned().collect())
    }

    pub fn proposals(&self) -> Vec<Proposal> {
        self.read(|s| s.proposals.values().cloned().collect())
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.read(|s| s.notifications.clone())
    }

    /// Outbox records ordered by creation time.
    pub fn outbox(&self) -> Vec<OutboxRecord> {
        let mut records: Vec<OutboxRecord> = self.read(|s| s.outbox.values().cloned().collect());
        records.sort_by_key(|r| (r.created_at, r.id));
        records
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.read(|s| s.alerts.values().cloned().collect())
    }

    /// Overwrite an outbox record directly, bypassing the unit-of-work path.
    /// Used to stage crash scenarios.
    pub fn put_outbox_record(&self, record: OutboxRecord) -> Result<(), StoreError> {
        self.lock()?.outbox.insert(record.id, record);
        Ok(())
    }
}

/// Unit of work over [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemoryTx {
    store: InMemoryStore,
    view: State,
    ops: Vec<Op>,
}

impl InMemoryTx {
    fn record(&mut self, op: Op) -> Result<Applied, StoreError> {
        let applied = self.view.apply(&op)?;
        if matches!(applied, Applied::Done) {
            self.ops.push(op);
        }
        Ok(applied)
    }
}

#[async_trait]
impl UnitOfWork for InMemoryTx {
    async fn user(&mut self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.view.users.get(&id).cloned())
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.record(Op::InsertUser(user.clone())).map(|_| ())
    }

    async fn admin_ids(&mut self) -> Result<Vec<UserId>, StoreError> {
        let mut ids: Vec<UserId> = self
            .view
            .users
            .values()
            .filter(|u| u.role == Role::Admin)
            .map(|u| u.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn increment_completed_jobs(&mut self, technician: UserId) -> Result<(), StoreError> {
        self.record(Op::IncrementCompletedJobs(technician)).map(|_| ())
    }

    async fn job(&mut self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.view.jobs.get(&id).cloned())
    }

    async fn lock_job(&mut self, id: JobId, mode: RowLock) -> Result<Option<Job>, StoreError> {
        let Some(job) = self.view.jobs.get(&id).cloned() else {
            return Ok(None);
        };
        let shares = self.view.job_shares.get(&id).copied().unwrap_or_default();
        self.record(Op::LockJob {
            id,
            version: job.version,
            shares,
            mode,
        })?;
        Ok(Some(job))
    }

    async fn insert_job(&mut self, job: &Job) -> Result<(), StoreError> {
        self.record(Op::InsertJob(job.clone())).map(|_| ())
    }

    async fn update_job(&mut self, job: &Job) -> Result<Job, StoreError> {
        self.record(Op::UpdateJob(job.clone()))?;
        self.view
            .jobs
            .get(&job.id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job.id)))
    }

    async fn proposal(&mut self, id: ProposalId) -> Result<Option<Proposal>, StoreError> {
        Ok(self.view.proposals.get(&id).cloned())
    }

    async fn proposals_for_job(&mut self, job_id: JobId) -> Result<Vec<Proposal>, StoreError> {
        let mut proposals: Vec<Proposal> = self
            .view
            .proposals
            .values()
            .filter(|p| p.job_id == job_id)
            .cloned()
            .collect();
        proposals.sort_by_key(|p| (p.created_at, p.id));
        Ok(proposals)
    }

    async fn insert_proposal(&mut self, proposal: &Proposal) -> Result<(), StoreError> {
        self.record(Op::InsertProposal(proposal.clone())).map(|_| ())
    }

    async fn update_proposal(&mut self, proposal: &Proposal) -> Result<(), StoreError> {
        self.record(Op::UpdateProposal(proposal.clone())).map(|_| ())
    }

    async fn assignment_for_job(
        &mut self,
        job_id: JobId,
    ) -> Result<Option<Assignment>, StoreError> {
        Ok(self.view.assignments.get(&job_id).cloned())
    }

    async fn insert_assignment(&mut self, assignment: &Assignment) -> Result<(), StoreError> {
        self.record(Op::InsertAssignment(assignment.clone())).map(|_| ())
    }

    async fn update_assignment(&mut self, assignment: &Assignment) -> Result<(), StoreError> {
        self.record(Op::UpdateAssignment(assignment.clone())).map(|_| ())
    }

    async fn issue(&mut self, id: IssueId) -> Result<Option<JobIssue>, StoreError> {
        Ok(self.view.issues.get(&id).cloned())
    }

    async fn insert_issue(&mut self, issue: &JobIssue) -> Result<(), StoreError> {
        self.record(Op::InsertIssue(issue.clone())).map(|_| ())
    }

    async fn update_issue(&mut self, issue: &JobIssue) -> Result<(), StoreError> {
        self.record(Op::UpdateIssue(issue.clone())).map(|_| ())
    }

    async fn insert_notification(
        &mut self,
        notification: &Notification,
    ) -> Result<(), StoreError> {
        self.record(Op::InsertNotification(notification.clone()))
            .map(|_| ())
    }

    async fn enqueue_outbox(
        &mut self,
        record: &OutboxRecord,
    ) -> Result<EnqueueOutcome, StoreError> {
        match self.record(Op::EnqueueOutbox(record.clone()))? {
            Applied::Done => Ok(EnqueueOutcome::Enqueued(record.id)),
            Applied::Skipped => Ok(EnqueueOutcome::Duplicate),
        }
    }

    async fn alert(&mut self, id: AlertId) -> Result<Option<Alert>, StoreError> {
        Ok(self.view.alerts.get(&id).cloned())
    }

    async fn has_unresolved_alert(
        &mut self,
        job_id: JobId,
        kind: AlertType,
    ) -> Result<bool, StoreError> {
        Ok(self.view.unresolved_alert_exists(job_id, kind))
    }

    async fn insert_alert(&mut self, alert: &Alert) -> Result<bool, StoreError> {
        if self.view.unresolved_alert_exists(alert.job_id, alert.kind) {
            return Ok(false);
        }
        self.record(Op::InsertAlert(alert.clone()))?;
        Ok(true)
    }

    async fn resolve_alert(&mut self, alert: &Alert) -> Result<bool, StoreError> {
        if self.view.alerts.get(&alert.id).is_some_and(|a| a.is_resolved) {
            return Ok(false);
        }
        self.record(Op::ResolveAlert(alert.clone()))?;
        Ok(true)
    }

    async fn commit(self) -> Result<(), StoreError> {
        tokio::task::yield_now().await;

        let mut guard = self.store.lock()?;
        let mut next = guard.clone();
        for op in &self.ops {
            next.apply(op)?;
        }
        *guard = next;
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        // Store calls are suspension points for callers, as with a real database.
        tokio::task::yield_now().await;

        let view = self.lock()?.clone();
        Ok(InMemoryTx {
            store: self.clone(),
            view,
            ops: Vec::new(),
        })
    }

    async fn recover_orphans(
        &self,
        stuck_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut guard = self.lock()?;
        let mut reset = 0;
        for record in guard.outbox.values_mut() {
            if record.is_orphaned(stuck_before) {
                record.reset_orphan(now);
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn claim_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let mut guard = self.lock()?;
        let mut due: Vec<(DateTime<Utc>, OutboxId)> = guard
            .outbox
            .values()
            .filter(|r| r.is_due(now))
            .map(|r| (r.created_at, r.id))
            .collect();
        due.sort();

        let mut claimed = Vec::with_capacity(limit.min(due.len()));
        for (_, id) in due.into_iter().take(limit) {
            if let Some(record) = guard.outbox.get_mut(&id) {
                record.mark_processing(now);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn renew_outbox_leases(
        &self,
        leases: &[(OutboxId, DateTime<Utc>)],
        now: DateTime<Utc>,
    ) -> Result<Vec<(OutboxId, DateTime<Utc>)>, StoreError> {
        let mut guard = self.lock()?;
        let mut renewed = Vec::with_capacity(leases.len());
        for &(id, stamp) in leases {
            if let Some(record) = guard.outbox.get_mut(&id) {
                if record.status == OutboxStatus::Processing && record.updated_at == stamp {
                    record.updated_at = now;
                    renewed.push((id, now));
                }
            }
        }
        Ok(renewed)
    }

    async fn save_outbox_outcomes(&self, outcomes: &[LeasedRecord]) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        for (record, lease) in outcomes {
            if let Some(stored) = guard.outbox.get_mut(&record.id) {
                if stored.status == OutboxStatus::Processing && stored.updated_at == *lease {
                    *stored = record.clone();
                }
            }
        }
        Ok(())
    }

    async fn outbox_record(&self, id: OutboxId) -> Result<Option<OutboxRecord>, StoreError> {
        Ok(self.lock()?.outbox.get(&id).cloned())
    }

    async fn find_breaches(
        &self,
        policy: &SlaPolicy,
        kind: AlertType,
        now: DateTime<Utc>,
    ) -> Result<Vec<Breach>, StoreError> {
        Ok(self.lock()?.breaches(policy, kind, now))
    }
}
