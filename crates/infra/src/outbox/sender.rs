use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use homefix_notify::OutboxRecord;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("send cancelled")]
    Cancelled,
}

/// Outbound transport.
///
/// `Ok(true)` means delivered, `Ok(false)` means the transport declined the
/// message; both failures and declines are retried by the dispatcher.
/// Implementations should stop promptly once `cancel` fires.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, record: &OutboxRecord, cancel: CancellationToken)
    -> Result<bool, SendError>;
}

#[async_trait]
impl<T: Sender + ?Sized> Sender for Arc<T> {
    async fn send(
        &self,
        record: &OutboxRecord,
        cancel: CancellationToken,
    ) -> Result<bool, SendError> {
        (**self).send(record, cancel).await
    }
}

/// Development transport: logs the message and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSender;

#[async_trait]
impl Sender for LogSender {
    async fn send(
        &self,
        record: &OutboxRecord,
        cancel: CancellationToken,
    ) -> Result<bool, SendError> {
        if cancel.is_cancelled() {
            return Err(SendError::Cancelled);
        }
        info!(
            outbox_id = %record.id,
            channel = record.channel.as_str(),
            destination = %record.destination,
            subject = %record.subject,
            "delivering message"
        );
        Ok(true)
    }
}
