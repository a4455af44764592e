use std::sync::Arc;

use tracing::{debug, warn};

use homefix_core::Clock;
use homefix_notify::{OutboxMessage, OutboxRecord};

use crate::store::{EnqueueOutcome, UnitOfWork};

/// Writes outbox records inside the caller's unit of work.
///
/// Fire-and-forget: nothing that happens here is surfaced to the business
/// operation. Duplicates of an idempotency key are expected when an upstream
/// event is retried and are logged, not raised.
#[derive(Clone)]
pub struct OutboxEnqueuer {
    clock: Arc<dyn Clock>,
}

impl OutboxEnqueuer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub async fn enqueue<U: UnitOfWork>(&self, tx: &mut U, message: OutboxMessage) {
        if message.destination.trim().is_empty() {
            warn!(
                notification_id = ?message.notification_id,
                "outbox enqueue skipped: empty destination"
            );
            return;
        }

        let record = OutboxRecord::pending(message, self.clock.now());
        match tx.enqueue_outbox(&record).await {
            Ok(EnqueueOutcome::Enqueued(id)) => {
                debug!(outbox_id = %id, job_id = ?record.job_id, "outbox record enqueued");
            }
            Ok(EnqueueOutcome::Duplicate) => {
                warn!(
                    notification_id = ?record.notification_id,
                    channel = record.channel.as_str(),
                    "duplicate outbox enqueue ignored"
                );
            }
            Err(err) => {
                warn!(
                    outbox_id = %record.id,
                    notification_id = ?record.notification_id,
                    error = %err,
                    "outbox enqueue failed"
                );
            }
        }
    }
}
