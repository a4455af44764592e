//! Job lifecycle orchestration: the state machine and the assignment engine.
//!
//! Every operation follows the same pipeline:
//!
//! ```text
//! request
//!   ↓
//! 1. begin a unit of work
//!   ↓
//! 2. load the job (and its assignment); bids and accepts also lock the job row
//!   ↓
//! 3. validate: allow-table first, then the actor's role policy
//!   ↓
//! 4. apply the change and write it with a version compare-and-swap
//!   ↓
//! 5. write notification rows and outbox records in the same unit
//!   ↓
//! 6. commit, then invalidate display caches
//! ```
//!
//! A version mismatch anywhere aborts the whole unit and surfaces
//! `CONCURRENCY_CONFLICT`; nothing is partially applied. Callers re-read and
//! retry.

use std::sync::Arc;

use tracing::{info, instrument};

use homefix_core::{Clock, IssueId, JobId, ProposalId, UserId};
use homefix_jobs::{
    Actor, Assignment, IssueReason, Job, JobError, JobIssue, JobResult, JobStatus, NewJob,
    NewProposal, Proposal, ProposalStatus, Role, User,
};
use homefix_notify::NotificationKind;

use crate::cache::{CacheInvalidator, DASHBOARD_KEY};
use crate::notifier::{JobRef, Notifier};
use crate::store::{RowLock, Store, StoreError, UnitOfWork};

pub struct JobLifecycleService<S> {
    store: S,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    cache: Arc<dyn CacheInvalidator>,
}

impl<S: Store> JobLifecycleService<S> {
    pub fn new(
        store: S,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        cache: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            cache,
        }
    }

    /// Open a new service request on behalf of the calling customer.
    #[instrument(skip(self, actor, input), fields(customer_id = %actor.user_id))]
    pub async fn create_job(&self, actor: &Actor, input: NewJob) -> JobResult<Job> {
        if actor.role != Role::Customer || input.customer_id != actor.user_id {
            return Err(JobError::forbidden("only customers may request jobs for themselves"));
        }

        let mut tx = self.store.begin().await?;
        if tx.user(actor.user_id).await?.is_none() {
            return Err(JobError::UserNotFound);
        }

        let job = Job::create(input, self.clock.now())?;
        tx.insert_job(&job).await?;
        self.notifier
            .notify(
                &mut tx,
                &[job.customer_id],
                NotificationKind::JobCreated,
                &format!("Your request '{}' is open for proposals.", job.title),
                &JobRef::from(&job),
            )
            .await?;
        tx.commit().await?;

        self.cache.invalidate(DASHBOARD_KEY);
        info!(job_id = %job.id, "job created");
        Ok(job)
    }

    /// Bid on an open job.
    ///
    /// The job is read under a share lock, so a bid racing an accept either
    /// lands before the accept lists the bids or sees the job as taken.
    #[instrument(
        skip(self, actor, input),
        fields(job_id = %input.job_id, technician_id = %actor.user_id)
    )]
    pub async fn submit_proposal(&self, actor: &Actor, input: NewProposal) -> JobResult<Proposal> {
        let mut tx = self.store.begin().await?;
        let job = tx
            .lock_job(input.job_id, RowLock::Share)
            .await?
            .ok_or(JobError::JobNotFound)?;
        if !job.is_open() {
            return Err(JobError::JobNotOpen);
        }
        if actor.role != Role::Technician {
            return Err(JobError::forbidden("only technicians may submit proposals"));
        }
        if actor.owns(&job) {
            return Err(JobError::SelfProposal);
        }
        let existing = tx.proposals_for_job(job.id).await?;
        if existing.iter().any(|p| p.technician_id == actor.user_id) {
            return Err(JobError::DuplicateProposal);
        }

        let proposal = Proposal::submit(input, actor.user_id, self.clock.now())?;
        tx.insert_proposal(&proposal)
            .await
            .map_err(|err| duplicate_as(err, JobError::DuplicateProposal))?;
        tx.commit()
            .await
            .map_err(|err| duplicate_as(err, JobError::DuplicateProposal))?;

        info!(proposal_id = %proposal.id, price_cents = proposal.price_cents, "proposal submitted");
        Ok(proposal)
    }

    /// Accept one proposal: first writer wins.
    ///
    /// The accepted proposal, the rejection of every other pending proposal,
    /// the assignment and the job's move to `Assigned` commit together.
    #[instrument(skip(self, actor), fields(actor_id = %actor.user_id))]
    pub async fn accept_proposal(
        &self,
        actor: &Actor,
        proposal_id: ProposalId,
    ) -> JobResult<Assignment> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut proposal = tx
            .proposal(proposal_id)
            .await?
            .ok_or(JobError::ProposalNotFound)?;
        let mut job = tx
            .lock_job(proposal.job_id, RowLock::Update)
            .await?
            .ok_or(JobError::JobNotFound)?;
        if !(actor.is_admin() || actor.owns(&job)) {
            return Err(JobError::forbidden("only the job's customer may accept proposals"));
        }
        if !job.is_open() {
            return Err(JobError::JobNotOpen);
        }
        if tx.assignment_for_job(job.id).await?.is_some() {
            return Err(JobError::JobAlreadyAssigned);
        }
        if !proposal.is_pending() {
            return Err(JobError::ProposalNotPending);
        }

        proposal.status = ProposalStatus::Accepted;
        tx.update_proposal(&proposal).await?;

        let mut rejected = 0;
        for mut rival in tx.proposals_for_job(job.id).await? {
            if rival.id != proposal.id && rival.is_pending() {
                rival.status = ProposalStatus::Rejected;
                tx.update_proposal(&rival).await?;
                rejected += 1;
            }
        }

        let assignment = Assignment::for_proposal(&proposal, now);
        tx.insert_assignment(&assignment)
            .await
            .map_err(|err| duplicate_as(err, JobError::JobAlreadyAssigned))?;

        job.mark_assigned(now)?;
        let job = tx.update_job(&job).await?;

        self.notifier
            .notify(
                &mut tx,
                &[job.customer_id, assignment.technician_id],
                NotificationKind::JobAssigned,
                &format!("A technician has been assigned to '{}'.", job.title),
                &JobRef::from(&job),
            )
            .await?;
        tx.commit()
            .await
            .map_err(|err| duplicate_as(err, JobError::JobAlreadyAssigned))?;

        self.cache.invalidate(DASHBOARD_KEY);
        info!(
            job_id = %job.id,
            proposal_id = %proposal.id,
            technician_id = %assignment.technician_id,
            rejected,
            version = %job.version,
            "proposal accepted"
        );
        Ok(assignment)
    }

    /// Move a job to `to`, subject to the allow-table and the actor's role.
    ///
    /// Error precedence: an unrequestable target is `INVALID_STATUS` before
    /// anything is read; then `JOB_NOT_FOUND`, `FORBIDDEN` for non-participants,
    /// the allow-table (`INVALID_STATUS` from a terminal state,
    /// `INVALID_TRANSITION` otherwise), and finally the role policy.
    #[instrument(skip(self, actor), fields(actor_id = %actor.user_id))]
    pub async fn transition(&self, actor: &Actor, job_id: JobId, to: JobStatus) -> JobResult<Job> {
        to.ensure_transition_target()?;

        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let mut job = tx.job(job_id).await?.ok_or(JobError::JobNotFound)?;
        let mut assignment = tx.assignment_for_job(job_id).await?;

        actor.ensure_participant(&job, assignment.as_ref())?;
        job.status.check_transition(to)?;
        actor.ensure_may_transition(&job, assignment.as_ref(), to)?;

        let from = job.status;
        job.apply_transition(to, now, assignment.as_mut())?;
        let job = tx.update_job(&job).await?;

        if let Some(assignment) = &assignment {
            if matches!(to, JobStatus::InProgress | JobStatus::Completed) {
                tx.update_assignment(assignment).await?;
            }
            if to == JobStatus::Completed {
                tx.increment_completed_jobs(assignment.technician_id).await?;
            }
        }

        let mut recipients = vec![job.customer_id];
        recipients.extend(assignment.as_ref().map(|a| a.technician_id));
        if to == JobStatus::Cancelled {
            recipients.extend(tx.admin_ids().await?);
        }
        let (kind, message) = status_notice(&job);
        self.notifier
            .notify(&mut tx, &recipients, kind, &message, &JobRef::from(&job))
            .await?;
        tx.commit().await?;

        self.cache.invalidate(DASHBOARD_KEY);
        info!(
            job_id = %job.id,
            from = %from,
            to = %to,
            version = %job.version,
            "job transitioned"
        );
        Ok(job)
    }

    pub async fn start(&self, actor: &Actor, job_id: JobId) -> JobResult<Job> {
        self.transition(actor, job_id, JobStatus::InProgress).await
    }

    pub async fn complete(&self, actor: &Actor, job_id: JobId) -> JobResult<Job> {
        self.transition(actor, job_id, JobStatus::Completed).await
    }

    pub async fn cancel(&self, actor: &Actor, job_id: JobId) -> JobResult<Job> {
        self.transition(actor, job_id, JobStatus::Cancelled).await
    }

    /// Report a problem with a job. Operators are notified.
    #[instrument(skip(self, actor, detail), fields(actor_id = %actor.user_id))]
    pub async fn report_issue(
        &self,
        actor: &Actor,
        job_id: JobId,
        reason: IssueReason,
        detail: Option<String>,
    ) -> JobResult<JobIssue> {
        let mut tx = self.store.begin().await?;
        let job = tx.job(job_id).await?.ok_or(JobError::JobNotFound)?;
        if !(actor.is_admin() || actor.owns(&job)) {
            return Err(JobError::forbidden("only the job's customer may report issues"));
        }

        let issue = JobIssue::report(job.id, actor.user_id, reason, detail, self.clock.now())?;
        tx.insert_issue(&issue).await?;

        let operators = tx.admin_ids().await?;
        self.notifier
            .notify(
                &mut tx,
                &operators,
                NotificationKind::IssueReported,
                &format!("Issue reported on '{}': {}.", job.title, reason.as_str()),
                &JobRef::from(&job),
            )
            .await?;
        tx.commit().await?;

        self.cache.invalidate(DASHBOARD_KEY);
        info!(issue_id = %issue.id, job_id = %job.id, "issue reported");
        Ok(issue)
    }

    #[instrument(skip(self, actor, note), fields(actor_id = %actor.user_id))]
    pub async fn resolve_issue(
        &self,
        actor: &Actor,
        issue_id: IssueId,
        note: Option<String>,
    ) -> JobResult<JobIssue> {
        if !actor.is_admin() {
            return Err(JobError::forbidden("only operators may resolve issues"));
        }

        let mut tx = self.store.begin().await?;
        let mut issue = tx.issue(issue_id).await?.ok_or(JobError::IssueNotFound)?;
        issue.resolve(actor.user_id, note, self.clock.now())?;
        tx.update_issue(&issue).await?;
        tx.commit().await?;

        self.cache.invalidate(DASHBOARD_KEY);
        info!(issue_id = %issue.id, job_id = %issue.job_id, "issue resolved");
        Ok(issue)
    }

    /// Look up a user. Used by callers that only hold an id.
    pub async fn user(&self, id: UserId) -> JobResult<User> {
        let mut tx = self.store.begin().await?;
        tx.user(id).await?.ok_or(JobError::UserNotFound)
    }
}

/// Map a uniqueness violation to the domain error it stands for.
fn duplicate_as(err: StoreError, duplicate: JobError) -> JobError {
    match err {
        StoreError::UniqueViolation(_) => duplicate,
        other => other.into(),
    }
}

fn status_notice(job: &Job) -> (NotificationKind, String) {
    let title = &job.title;
    match job.status {
        JobStatus::InProgress => (
            NotificationKind::JobStarted,
            format!("Work on '{title}' has started."),
        ),
        JobStatus::Completed => (
            NotificationKind::JobCompleted,
            format!("'{title}' has been completed."),
        ),
        JobStatus::Cancelled => (
            NotificationKind::JobCancelled,
            format!("'{title}' has been cancelled."),
        ),
        JobStatus::Open | JobStatus::Assigned => (
            NotificationKind::JobAssigned,
            format!("'{title}' has been updated."),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use homefix_core::{ManualClock, Version};

    use crate::cache::ReadCache;
    use crate::notifier::PlainTextComposer;
    use crate::outbox::OutboxEnqueuer;
    use crate::store::InMemoryStore;

    struct Fixture {
        store: InMemoryStore,
        cache: Arc<ReadCache<u32>>,
        svc: JobLifecycleService<InMemoryStore>,
        customer: User,
        tech_a: User,
        tech_b: User,
        admin: User,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = InMemoryStore::new();
            let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
            let cache = Arc::new(ReadCache::new(None));
            let notifier = Notifier::new(
                Arc::new(PlainTextComposer::default()),
                OutboxEnqueuer::new(Arc::clone(&clock)),
                Arc::clone(&clock),
            );
            let svc = JobLifecycleService::new(store.clone(), clock, notifier, cache.clone());

            let customer = User::new("Cara", Some("cara@example.com".into()), Role::Customer);
            let tech_a = User::new("Ana", Some("ana@example.com".into()), Role::Technician);
            let tech_b = User::new("Ben", None, Role::Technician);
            let admin = User::new("Ops", Some("ops@example.com".into()), Role::Admin);
            let mut tx = store.begin().await.unwrap();
            for user in [&customer, &tech_a, &tech_b, &admin] {
                tx.insert_user(user).await.unwrap();
            }
            tx.commit().await.unwrap();

            Self {
                store,
                cache,
                svc,
                customer,
                tech_a,
                tech_b,
                admin,
            }
        }

        async fn open_job(&self) -> Job {
            self.svc
                .create_job(
                    &self.customer.actor(),
                    NewJob {
                        customer_id: self.customer.id,
                        title: "Fix leaking tap".into(),
                        description: "Kitchen sink".into(),
                        address: "12 Elm St".into(),
                    },
                )
                .await
                .unwrap()
        }

        async fn propose(&self, tech: &User, job: &Job) -> Proposal {
            self.svc
                .submit_proposal(
                    &tech.actor(),
                    NewProposal {
                        job_id: job.id,
                        price_cents: 12_500,
                        message: "Can come today".into(),
                    },
                )
                .await
                .unwrap()
        }

        async fn assigned_job(&self) -> (Job, Assignment) {
            let job = self.open_job().await;
            let proposal = self.propose(&self.tech_a, &job).await;
            let assignment = self
                .svc
                .accept_proposal(&self.customer.actor(), proposal.id)
                .await
                .unwrap();
            (job, assignment)
        }

        fn job(&self, id: JobId) -> Job {
            self.store.jobs().into_iter().find(|j| j.id == id).unwrap()
        }
    }

    #[tokio::test]
    async fn create_job_opens_and_notifies_customer() {
        let fx = Fixture::new().await;
        fx.cache.set(DASHBOARD_KEY, 1);

        let job = fx.open_job().await;

        assert_eq!(job.status, JobStatus::Open);
        assert_eq!(job.version, Version::INITIAL);
        assert_eq!(fx.cache.get(DASHBOARD_KEY), None);
        let notes = fx.store.notifications();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, NotificationKind::JobCreated);
        assert_eq!(fx.store.outbox()[0].destination, "cara@example.com");
    }

    #[tokio::test]
    async fn create_job_rejects_other_roles_and_bad_input() {
        let fx = Fixture::new().await;
        let input = NewJob {
            customer_id: fx.tech_a.id,
            title: "Fix".into(),
            description: String::new(),
            address: "1 Main St".into(),
        };
        let err = fx
            .svc
            .create_job(&fx.tech_a.actor(), input)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        let err = fx
            .svc
            .create_job(
                &fx.customer.actor(),
                NewJob {
                    customer_id: fx.customer.id,
                    title: "   ".into(),
                    description: String::new(),
                    address: "1 Main St".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        assert!(fx.store.jobs().is_empty());
    }

    #[tokio::test]
    async fn proposal_submission_rules() {
        let fx = Fixture::new().await;
        let job = fx.open_job().await;
        fx.propose(&fx.tech_a, &job).await;

        let submit = |actor: Actor, job_id: JobId, price_cents: u64| {
            let svc = &fx.svc;
            async move {
                svc.submit_proposal(
                    &actor,
                    NewProposal {
                        job_id,
                        price_cents,
                        message: String::new(),
                    },
                )
                .await
                .unwrap_err()
                .code()
            }
        };

        assert_eq!(submit(fx.tech_a.actor(), job.id, 9_000).await, "DUPLICATE_PROPOSAL");
        assert_eq!(submit(fx.customer.actor(), job.id, 9_000).await, "FORBIDDEN");
        assert_eq!(submit(fx.tech_b.actor(), job.id, 0).await, "VALIDATION");
        assert_eq!(submit(fx.tech_b.actor(), JobId::new(), 9_000).await, "JOB_NOT_FOUND");

        fx.svc.cancel(&fx.customer.actor(), job.id).await.unwrap();
        assert_eq!(submit(fx.tech_b.actor(), job.id, 9_000).await, "JOB_NOT_OPEN");
    }

    #[tokio::test]
    async fn technician_cannot_bid_on_own_job() {
        let fx = Fixture::new().await;
        let own = Job::create(
            NewJob {
                customer_id: fx.tech_a.id,
                title: "Own fence".into(),
                description: String::new(),
                address: "3 Oak Rd".into(),
            },
            Utc::now(),
        )
        .unwrap();
        let mut tx = fx.store.begin().await.unwrap();
        tx.insert_job(&own).await.unwrap();
        tx.commit().await.unwrap();

        let err = fx
            .svc
            .submit_proposal(
                &fx.tech_a.actor(),
                NewProposal {
                    job_id: own.id,
                    price_cents: 100,
                    message: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, JobError::SelfProposal);
    }

    #[tokio::test]
    async fn accepting_one_proposal_rejects_the_rival() {
        let fx = Fixture::new().await;
        let job = fx.open_job().await;
        let a = fx.propose(&fx.tech_a, &job).await;
        let b = fx.propose(&fx.tech_b, &job).await;

        let assignment = fx
            .svc
            .accept_proposal(&fx.customer.actor(), a.id)
            .await
            .unwrap();

        assert_eq!(assignment.proposal_id, a.id);
        assert_eq!(assignment.technician_id, fx.tech_a.id);
        let stored = fx.job(job.id);
        assert_eq!(stored.status, JobStatus::Assigned);
        assert!(stored.assigned_at.is_some());
        assert_eq!(stored.version.get(), 2);

        let statuses: Vec<(ProposalId, ProposalStatus)> =
            fx.store.proposals().iter().map(|p| (p.id, p.status)).collect();
        assert!(statuses.contains(&(a.id, ProposalStatus::Accepted)));
        assert!(statuses.contains(&(b.id, ProposalStatus::Rejected)));

        let err = fx
            .svc
            .accept_proposal(&fx.customer.actor(), b.id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::JobNotOpen | JobError::JobAlreadyAssigned
        ));
        assert_eq!(fx.store.assignments().len(), 1);

        let assigned: Vec<_> = fx
            .store
            .notifications()
            .into_iter()
            .filter(|n| n.kind == NotificationKind::JobAssigned)
            .map(|n| n.user_id)
            .collect();
        assert_eq!(assigned.len(), 2);
        assert!(assigned.contains(&fx.customer.id));
        assert!(assigned.contains(&fx.tech_a.id));
    }

    #[tokio::test]
    async fn concurrent_accepts_produce_exactly_one_assignment() {
        let fx = Fixture::new().await;
        let job = fx.open_job().await;
        let a = fx.propose(&fx.tech_a, &job).await;
        let b = fx.propose(&fx.tech_b, &job).await;
        let actor = fx.customer.actor();

        let (first, second) = tokio::join!(
            fx.svc.accept_proposal(&actor, a.id),
            fx.svc.accept_proposal(&actor, b.id),
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = outcomes.into_iter().find_map(Result::err).unwrap();
        assert!(
            matches!(
                loser,
                JobError::JobAlreadyAssigned | JobError::ConcurrencyConflict | JobError::JobNotOpen
            ),
            "unexpected error {loser:?}"
        );
        assert_eq!(fx.store.assignments().len(), 1);
        let accepted = fx
            .store
            .proposals()
            .into_iter()
            .filter(|p| p.status == ProposalStatus::Accepted)
            .count();
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn bid_racing_an_accept_never_stays_pending_on_an_assigned_job() {
        let fx = Fixture::new().await;
        let job = fx.open_job().await;
        let a = fx.propose(&fx.tech_a, &job).await;
        let actor = fx.customer.actor();
        let bidder = fx.tech_b.actor();

        let (accepted, submitted) = tokio::join!(
            fx.svc.accept_proposal(&actor, a.id),
            fx.svc.submit_proposal(
                &bidder,
                NewProposal {
                    job_id: job.id,
                    price_cents: 9_900,
                    message: "Free this afternoon".into(),
                },
            ),
        );

        if let Err(err) = &submitted {
            assert!(
                matches!(err, JobError::JobNotOpen | JobError::ConcurrencyConflict),
                "unexpected bid error {err:?}"
            );
        }
        if let Err(err) = &accepted {
            assert_eq!(err, &JobError::ConcurrencyConflict);
        }
        assert!(accepted.is_ok() || submitted.is_ok());

        let stored = fx.job(job.id);
        let pending = fx
            .store
            .proposals()
            .into_iter()
            .filter(|p| p.job_id == job.id && p.status == ProposalStatus::Pending)
            .count();
        if stored.status == JobStatus::Assigned {
            assert_eq!(pending, 0);
            assert_eq!(fx.store.assignments().len(), 1);
        } else {
            assert_eq!(stored.status, JobStatus::Open);
            assert_eq!(pending, 2);
        }
    }

    #[tokio::test]
    async fn bid_after_a_committed_accept_sees_the_job_taken() {
        let fx = Fixture::new().await;
        let (job, _) = fx.assigned_job().await;

        let err = fx
            .svc
            .submit_proposal(
                &fx.tech_b.actor(),
                NewProposal {
                    job_id: job.id,
                    price_cents: 9_900,
                    message: "Free this afternoon".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "JOB_NOT_OPEN");
    }

    #[tokio::test]
    async fn only_the_owner_accepts() {
        let fx = Fixture::new().await;
        let job = fx.open_job().await;
        let a = fx.propose(&fx.tech_a, &job).await;

        let err = fx
            .svc
            .accept_proposal(&fx.tech_b.actor(), a.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        let err = fx
            .svc
            .accept_proposal(&fx.customer.actor(), ProposalId::new())
            .await
            .unwrap_err();
        assert_eq!(err, JobError::ProposalNotFound);
    }

    #[tokio::test]
    async fn full_lifecycle_stamps_timestamps_and_counts_completion() {
        let fx = Fixture::new().await;
        let (job, _) = fx.assigned_job().await;

        let started = fx.svc.start(&fx.tech_a.actor(), job.id).await.unwrap();
        assert_eq!(started.status, JobStatus::InProgress);
        assert!(fx.store.assignments()[0].started_at.is_some());

        let done = fx.svc.complete(&fx.customer.actor(), job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.version.get(), 4);
        assert!(fx.store.assignments()[0].completed_at.is_some());

        let tech = fx.svc.user(fx.tech_a.id).await.unwrap();
        assert_eq!(tech.completed_jobs, 1);

        // Only the customer is emailed about lifecycle events.
        let completed_mail: Vec<_> = fx
            .store
            .outbox()
            .into_iter()
            .filter(|r| r.subject == "HomeFix - Service completed")
            .collect();
        assert_eq!(completed_mail.len(), 1);
        assert_eq!(completed_mail[0].destination, "cara@example.com");
    }

    #[tokio::test]
    async fn cancelling_twice_is_an_invalid_status() {
        let fx = Fixture::new().await;
        let (job, _) = fx.assigned_job().await;

        let cancelled = fx.svc.cancel(&fx.customer.actor(), job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        let err = fx.svc.cancel(&fx.customer.actor(), job.id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATUS");

        // Customer, technician and operator hear about the cancellation.
        let told: Vec<UserId> = fx
            .store
            .notifications()
            .into_iter()
            .filter(|n| n.kind == NotificationKind::JobCancelled)
            .map(|n| n.user_id)
            .collect();
        assert_eq!(told.len(), 3);
        assert!(told.contains(&fx.admin.id));
    }

    #[tokio::test]
    async fn concurrent_cancels_apply_once() {
        let fx = Fixture::new().await;
        let job = fx.open_job().await;
        let actor = fx.customer.actor();

        let (first, second) =
            tokio::join!(fx.svc.cancel(&actor, job.id), fx.svc.cancel(&actor, job.id));

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = outcomes.into_iter().find_map(Result::err).unwrap();
        assert!(matches!(
            loser,
            JobError::ConcurrencyConflict | JobError::InvalidStatus(_)
        ));
        assert_eq!(fx.job(job.id).version.get(), 2);
    }

    #[tokio::test]
    async fn transition_error_precedence() {
        let fx = Fixture::new().await;
        let job = fx.open_job().await;
        let admin = fx.admin.actor();

        let err = fx
            .svc
            .transition(&admin, job.id, JobStatus::Assigned)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATUS");

        let err = fx
            .svc
            .transition(&admin, JobId::new(), JobStatus::Cancelled)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "JOB_NOT_FOUND");

        let err = fx
            .svc
            .transition(&admin, job.id, JobStatus::Completed)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            JobError::InvalidTransition {
                from: JobStatus::Open,
                to: JobStatus::Completed
            }
        );

        let err = fx.svc.start(&fx.tech_a.actor(), job.id).await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        // The customer may not start their own job.
        let err = fx.svc.start(&fx.customer.actor(), job.id).await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
        assert_eq!(fx.job(job.id).status, JobStatus::Open);
    }

    #[tokio::test]
    async fn issues_are_reported_to_operators_and_resolved_once() {
        let fx = Fixture::new().await;
        let (job, _) = fx.assigned_job().await;

        let err = fx
            .svc
            .report_issue(&fx.tech_b.actor(), job.id, IssueReason::Late, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        let issue = fx
            .svc
            .report_issue(
                &fx.customer.actor(),
                job.id,
                IssueReason::NoContact,
                Some("No answer at the door".into()),
            )
            .await
            .unwrap();
        let reported: Vec<_> = fx
            .store
            .notifications()
            .into_iter()
            .filter(|n| n.kind == NotificationKind::IssueReported)
            .collect();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].user_id, fx.admin.id);

        let err = fx
            .svc
            .resolve_issue(&fx.customer.actor(), issue.id, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        let resolved = fx
            .svc
            .resolve_issue(&fx.admin.actor(), issue.id, Some("Rescheduled".into()))
            .await
            .unwrap();
        assert_eq!(resolved.resolved_by, Some(fx.admin.id));

        let err = fx
            .svc
            .resolve_issue(&fx.admin.actor(), issue.id, None)
            .await
            .unwrap_err();
        assert_eq!(err, JobError::IssueAlreadyResolved);
    }
}
