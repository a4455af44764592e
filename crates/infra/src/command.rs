//! Typed request dispatch.
//!
//! Each request is a [`JobCommand`] variant; [`JobCommand::dispatch`] routes it
//! to the lifecycle operation that handles it and wraps the result in a
//! [`CommandOutcome`]. Transition requests carry the requested status as text
//! so that unknown names surface as `INVALID_STATUS` like any other
//! unrequestable target.

use serde::{Deserialize, Serialize};
use tracing::debug;

use homefix_core::{IssueId, JobId, ProposalId};
use homefix_jobs::{
    Actor, Assignment, IssueReason, Job, JobIssue, JobResult, JobStatus, NewJob, NewProposal,
    Proposal,
};

use crate::lifecycle::JobLifecycleService;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobCommand {
    CreateJob(NewJob),
    SubmitProposal(NewProposal),
    AcceptProposal {
        proposal_id: ProposalId,
    },
    Transition {
        job_id: JobId,
        status: String,
    },
    Start {
        job_id: JobId,
    },
    Complete {
        job_id: JobId,
    },
    Cancel {
        job_id: JobId,
    },
    ReportIssue {
        job_id: JobId,
        reason: IssueReason,
        detail: Option<String>,
    },
    ResolveIssue {
        issue_id: IssueId,
        note: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CommandOutcome {
    Job(Job),
    Proposal(Proposal),
    Assignment(Assignment),
    Issue(JobIssue),
}

impl JobCommand {
    pub fn name(&self) -> &'static str {
        match self {
            JobCommand::CreateJob(_) => "create_job",
            JobCommand::SubmitProposal(_) => "submit_proposal",
            JobCommand::AcceptProposal { .. } => "accept_proposal",
            JobCommand::Transition { .. } => "transition",
            JobCommand::Start { .. } => "start",
            JobCommand::Complete { .. } => "complete",
            JobCommand::Cancel { .. } => "cancel",
            JobCommand::ReportIssue { .. } => "report_issue",
            JobCommand::ResolveIssue { .. } => "resolve_issue",
        }
    }

    pub async fn dispatch<S: Store>(
        self,
        service: &JobLifecycleService<S>,
        actor: &Actor,
    ) -> JobResult<CommandOutcome> {
        debug!(command = self.name(), actor_id = %actor.user_id, "dispatching command");
        match self {
            JobCommand::CreateJob(input) => {
                service.create_job(actor, input).await.map(CommandOutcome::Job)
            }
            JobCommand::SubmitProposal(input) => service
                .submit_proposal(actor, input)
                .await
                .map(CommandOutcome::Proposal),
            JobCommand::AcceptProposal { proposal_id } => service
                .accept_proposal(actor, proposal_id)
                .await
                .map(CommandOutcome::Assignment),
            JobCommand::Transition { job_id, status } => {
                let to: JobStatus = status.parse()?;
                service
                    .transition(actor, job_id, to)
                    .await
                    .map(CommandOutcome::Job)
            }
            JobCommand::Start { job_id } => {
                service.start(actor, job_id).await.map(CommandOutcome::Job)
            }
            JobCommand::Complete { job_id } => {
                service.complete(actor, job_id).await.map(CommandOutcome::Job)
            }
            JobCommand::Cancel { job_id } => {
                service.cancel(actor, job_id).await.map(CommandOutcome::Job)
            }
            JobCommand::ReportIssue {
                job_id,
                reason,
                detail,
            } => service
                .report_issue(actor, job_id, reason, detail)
                .await
                .map(CommandOutcome::Issue),
            JobCommand::ResolveIssue { issue_id, note } => service
                .resolve_issue(actor, issue_id, note)
                .await
                .map(CommandOutcome::Issue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use homefix_core::{Clock, ManualClock};
    use homefix_jobs::{Role, User};

    use crate::cache::NoopInvalidator;
    use crate::notifier::{Notifier, PlainTextComposer};
    use crate::outbox::OutboxEnqueuer;
    use crate::store::{InMemoryStore, UnitOfWork};

    async fn service_with_customer() -> (JobLifecycleService<InMemoryStore>, User) {
        let store = InMemoryStore::new();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let notifier = Notifier::new(
            Arc::new(PlainTextComposer::default()),
            OutboxEnqueuer::new(Arc::clone(&clock)),
            Arc::clone(&clock),
        );
        let customer = User::new("Cara", None, Role::Customer);
        let mut tx = store.begin().await.unwrap();
        tx.insert_user(&customer).await.unwrap();
        tx.commit().await.unwrap();
        (
            JobLifecycleService::new(store, clock, notifier, Arc::new(NoopInvalidator)),
            customer,
        )
    }

    #[test]
    fn commands_deserialize_from_tagged_json() {
        let job_id = JobId::new();
        let raw = format!(r#"{{"type":"transition","job_id":"{job_id}","status":"cancelled"}}"#);
        let command: JobCommand = serde_json::from_str(&raw).unwrap();
        assert_eq!(command.name(), "transition");
        assert_eq!(
            command,
            JobCommand::Transition {
                job_id,
                status: "cancelled".into()
            }
        );
    }

    #[tokio::test]
    async fn dispatch_routes_to_the_lifecycle() {
        let (svc, customer) = service_with_customer().await;
        let actor = customer.actor();

        let created = JobCommand::CreateJob(NewJob {
            customer_id: customer.id,
            title: "Mount TV".into(),
            description: String::new(),
            address: "7 Lake Dr".into(),
        })
        .dispatch(&svc, &actor)
        .await
        .unwrap();
        let CommandOutcome::Job(job) = created else {
            panic!("expected a job");
        };

        let cancelled = JobCommand::Transition {
            job_id: job.id,
            status: "canceled".into(),
        }
        .dispatch(&svc, &actor)
        .await
        .unwrap();
        assert!(matches!(cancelled, CommandOutcome::Job(j) if j.status == JobStatus::Cancelled));
    }

    #[tokio::test]
    async fn start_and_cancel_commands_reach_their_transitions() {
        let (svc, customer) = service_with_customer().await;
        let actor = customer.actor();
        let CommandOutcome::Job(job) = JobCommand::CreateJob(NewJob {
            customer_id: customer.id,
            title: "Patch drywall".into(),
            description: String::new(),
            address: "12 Elm St".into(),
        })
        .dispatch(&svc, &actor)
        .await
        .unwrap() else {
            panic!("expected a job");
        };

        let err = JobCommand::Start { job_id: job.id }
            .dispatch(&svc, &actor)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        let cancelled = JobCommand::Cancel { job_id: job.id }
            .dispatch(&svc, &actor)
            .await
            .unwrap();
        assert!(matches!(cancelled, CommandOutcome::Job(j) if j.status == JobStatus::Cancelled));
    }

    #[tokio::test]
    async fn unknown_status_name_is_invalid_status() {
        let (svc, customer) = service_with_customer().await;
        let err = JobCommand::Transition {
            job_id: JobId::new(),
            status: "archived".into(),
        }
        .dispatch(&svc, &customer.actor())
        .await
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATUS");
    }
}
