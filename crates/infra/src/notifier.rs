//! Side-effect notifications written inside a business unit of work.
//!
//! For every recipient the notifier stores an in-app [`Notification`] row and,
//! when the delivery policy selects that recipient, composes an email and hands
//! it to the [`OutboxEnqueuer`] with the notification id as idempotency key.

use std::sync::Arc;

use tracing::debug;

use homefix_core::{Clock, JobId, UserId};
use homefix_jobs::{Job, User};
use homefix_notify::{Notification, NotificationKind, OutboxMessage};
use homefix_sla::Breach;

use crate::outbox::OutboxEnqueuer;
use crate::store::{StoreError, UnitOfWork};

/// Subject and body of an outbound email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    pub subject: String,
    pub body: String,
}

/// Turns a domain notification into deliverable content.
pub trait NotificationComposer: Send + Sync {
    fn compose(
        &self,
        kind: NotificationKind,
        job: &JobRef,
        message: &str,
        recipient: &User,
    ) -> ComposedMessage;
}

/// Plain-text composer.
#[derive(Debug, Clone)]
pub struct PlainTextComposer {
    brand: String,
}

impl PlainTextComposer {
    pub fn new(brand: impl Into<String>) -> Self {
        Self {
            brand: brand.into(),
        }
    }

    fn subject(&self, kind: NotificationKind) -> String {
        let topic = match kind {
            NotificationKind::JobCreated => "We received your request",
            NotificationKind::JobAssigned => "Technician assigned",
            NotificationKind::JobStarted => "Your service is under way",
            NotificationKind::JobCompleted => "Service completed",
            NotificationKind::JobCancelled => "Request cancelled",
            NotificationKind::IssueReported => "Issue reported",
            NotificationKind::SlaAlert => "SLA alert",
        };
        format!("{} - {}", self.brand, topic)
    }
}

impl Default for PlainTextComposer {
    fn default() -> Self {
        Self::new("HomeFix")
    }
}

impl NotificationComposer for PlainTextComposer {
    fn compose(
        &self,
        kind: NotificationKind,
        job: &JobRef,
        message: &str,
        recipient: &User,
    ) -> ComposedMessage {
        ComposedMessage {
            subject: self.subject(kind),
            body: format!(
                "Hello {},\n\n{}\n\nJob: {}\nReference: {}\n",
                recipient.display_name, message, job.title, job.id
            ),
        }
    }
}

/// The job a notification is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub id: JobId,
    pub title: String,
    /// Known for lifecycle events; drives the customer-only email policy.
    pub customer_id: Option<UserId>,
}

impl From<&Job> for JobRef {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            title: job.title.clone(),
            customer_id: Some(job.customer_id),
        }
    }
}

impl From<&Breach> for JobRef {
    fn from(breach: &Breach) -> Self {
        Self {
            id: breach.job_id,
            title: breach.title.clone(),
            customer_id: None,
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    composer: Arc<dyn NotificationComposer>,
    enqueuer: OutboxEnqueuer,
    clock: Arc<dyn Clock>,
}

impl Notifier {
    pub fn new(
        composer: Arc<dyn NotificationComposer>,
        enqueuer: OutboxEnqueuer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            composer,
            enqueuer,
            clock,
        }
    }

    /// Notify each recipient once. Unknown users are skipped.
    ///
    /// Returns the number of in-app notifications written. Outbox failures are
    /// absorbed by the enqueuer; failures writing the notification rows
    /// themselves are part of the unit of work and propagate.
    pub async fn notify<U: UnitOfWork>(
        &self,
        tx: &mut U,
        recipients: &[UserId],
        kind: NotificationKind,
        message: &str,
        job: &JobRef,
    ) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut seen: Vec<UserId> = Vec::with_capacity(recipients.len());
        let mut written = 0;

        for &user_id in recipients {
            if seen.contains(&user_id) {
                continue;
            }
            seen.push(user_id);

            let Some(user) = tx.user(user_id).await? else {
                debug!(user_id = %user_id, kind = kind.as_str(), "skipping unknown recipient");
                continue;
            };

            let notification = Notification::new(user_id, Some(job.id), kind, message, now);
            tx.insert_notification(&notification).await?;
            written += 1;

            let is_customer = job.customer_id == Some(user_id);
            if !kind.emails(is_customer) || job.title.trim().is_empty() {
                continue;
            }
            let Some(email) = user.contact_email() else {
                continue;
            };

            let composed = self.composer.compose(kind, job, message, &user);
            let outbound = OutboxMessage::email(email, composed.subject, composed.body)
                .with_notification(notification.id)
                .with_job(job.id);
            self.enqueuer.enqueue(tx, outbound).await;
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, Store};
    use chrono::Utc;
    use homefix_core::ManualClock;
    use homefix_jobs::{NewJob, Role};

    fn notifier(clock: Arc<dyn Clock>) -> Notifier {
        Notifier::new(
            Arc::new(PlainTextComposer::default()),
            OutboxEnqueuer::new(clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn lifecycle_event_emails_only_the_customer() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryStore::new();
        let customer = User::new("Cara", Some("cara@example.com".into()), Role::Customer);
        let tech = User::new("Tom", Some("tom@example.com".into()), Role::Technician);
        let job = Job::create(
            NewJob {
                customer_id: customer.id,
                title: "Replace fuse".into(),
                description: String::new(),
                address: "4 Birch Ave".into(),
            },
            clock.now(),
        )
        .unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_user(&customer).await.unwrap();
        tx.insert_user(&tech).await.unwrap();
        let written = notifier(clock)
            .notify(
                &mut tx,
                &[customer.id, tech.id, customer.id, UserId::new()],
                NotificationKind::JobStarted,
                "Your technician is on the way",
                &JobRef::from(&job),
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(written, 2);
        assert_eq!(store.notifications().len(), 2);
        let outbox = store.outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].destination, "cara@example.com");
        assert_eq!(outbox[0].subject, "HomeFix - Your service is under way");
        assert_eq!(outbox[0].job_id, Some(job.id));
    }

    #[tokio::test]
    async fn operational_event_emails_everyone_with_an_address() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryStore::new();
        let ops = User::new("Ops", Some("ops@example.com".into()), Role::Admin);
        let silent = User::new("NoMail", None, Role::Admin);
        let breach = Breach {
            job_id: JobId::new(),
            title: "Unclog drain".into(),
            kind: homefix_sla::AlertType::OpenTooLong,
        };

        let mut tx = store.begin().await.unwrap();
        tx.insert_user(&ops).await.unwrap();
        tx.insert_user(&silent).await.unwrap();
        notifier(clock)
            .notify(
                &mut tx,
                &[ops.id, silent.id],
                NotificationKind::SlaAlert,
                "late",
                &JobRef::from(&breach),
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.notifications().len(), 2);
        assert_eq!(store.outbox().len(), 1);
    }
}
