//! Outbox records and their delivery state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use homefix_core::{JobId, NotificationId, OutboxId};

use crate::retry::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::Failed)
    }
}

impl core::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OutboxStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "sent" => Ok(OutboxStatus::Sent),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(ParseError {
                kind: "outbox status",
                value: other.to_string(),
            }),
        }
    }
}

/// Delivery channel. Part of the idempotency key together with the
/// notification id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Email => "email",
        }
    }
}

impl core::str::FromStr for Channel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            other => Err(ParseError {
                kind: "channel",
                value: other.to_string(),
            }),
        }
    }
}

/// What to deliver. Content is composed upstream; the outbox stores it as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub notification_id: Option<NotificationId>,
    pub channel: Channel,
    pub destination: String,
    pub subject: String,
    pub body: String,
    pub job_id: Option<JobId>,
}

impl OutboxMessage {
    pub fn email(
        destination: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            notification_id: None,
            channel: Channel::Email,
            destination: destination.into(),
            subject: subject.into(),
            body: body.into(),
            job_id: None,
        }
    }

    pub fn with_notification(mut self, id: NotificationId) -> Self {
        self.notification_id = Some(id);
        self
    }

    pub fn with_job(mut self, id: JobId) -> Self {
        self.job_id = Some(id);
        self
    }

    /// `(notification id, channel)`, when the message has a notification id.
    pub fn idempotency_key(&self) -> Option<(NotificationId, Channel)> {
        self.notification_id.map(|id| (id, self.channel))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub notification_id: Option<NotificationId>,
    pub channel: Channel,
    pub destination: String,
    pub subject: String,
    pub body: String,
    pub job_id: Option<JobId>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn pending(message: OutboxMessage, now: DateTime<Utc>) -> Self {
        Self {
            id: OutboxId::new(),
            notification_id: message.notification_id,
            channel: message.channel,
            destination: message.destination,
            subject: message.subject,
            body: message.body,
            job_id: message.job_id,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            next_retry_at: None,
        }
    }

    pub fn idempotency_key(&self) -> Option<(NotificationId, Channel)> {
        self.notification_id.map(|id| (id, self.channel))
    }

    /// Pending and either never scheduled or past its retry time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Processing since before `stuck_before`: its worker never reported back.
    pub fn is_orphaned(&self, stuck_before: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Processing && self.updated_at < stuck_before
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Processing;
        self.updated_at = now;
    }

    pub fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Sent;
        self.sent_at = Some(now);
        self.next_retry_at = None;
        self.last_error = None;
        self.updated_at = now;
    }

    /// Count a failed attempt and either schedule the retry or give up.
    pub fn record_failure(
        &mut self,
        policy: &RetryPolicy,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.updated_at = now;

        if policy.should_retry(self.attempts) {
            let delay = chrono::Duration::from_std(policy.delay_for_attempt(self.attempts))
                .unwrap_or_else(|_| chrono::Duration::days(365));
            self.status = OutboxStatus::Pending;
            self.next_retry_at = now.checked_add_signed(delay);
        } else {
            self.status = OutboxStatus::Failed;
            self.next_retry_at = None;
        }
    }

    /// Hand a claimed record back without counting an attempt.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Pending;
        self.updated_at = now;
    }

    /// Orphan recovery: back to Pending and immediately due.
    pub fn reset_orphan(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Pending;
        self.next_retry_at = None;
        self.updated_at = now;
    }
}
