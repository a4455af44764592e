//! In-app notifications and which of them also go out by email.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use homefix_core::{JobId, NotificationId, UserId};

use crate::outbox::ParseError;

const MAX_MESSAGE_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    JobCreated,
    JobAssigned,
    JobStarted,
    JobCompleted,
    JobCancelled,
    IssueReported,
    SlaAlert,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::JobCreated => "job_created",
            NotificationKind::JobAssigned => "job_assigned",
            NotificationKind::JobStarted => "job_started",
            NotificationKind::JobCompleted => "job_completed",
            NotificationKind::JobCancelled => "job_cancelled",
            NotificationKind::IssueReported => "issue_reported",
            NotificationKind::SlaAlert => "sla_alert",
        }
    }

    /// Operator-facing kinds are emailed to every recipient.
    pub fn is_operational(self) -> bool {
        matches!(self, NotificationKind::IssueReported | NotificationKind::SlaAlert)
    }

    /// Delivery policy: lifecycle updates are emailed to the job's customer
    /// only; operational notices are emailed to everyone they target.
    pub fn emails(self, recipient_is_customer: bool) -> bool {
        self.is_operational() || recipient_is_customer
    }
}

impl core::str::FromStr for NotificationKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job_created" => Ok(NotificationKind::JobCreated),
            "job_assigned" => Ok(NotificationKind::JobAssigned),
            "job_started" => Ok(NotificationKind::JobStarted),
            "job_completed" => Ok(NotificationKind::JobCompleted),
            "job_cancelled" => Ok(NotificationKind::JobCancelled),
            "issue_reported" => Ok(NotificationKind::IssueReported),
            "sla_alert" => Ok(NotificationKind::SlaAlert),
            other => Err(ParseError {
                kind: "notification kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub job_id: Option<JobId>,
    pub kind: NotificationKind,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user_id: UserId,
        job_id: Option<JobId>,
        kind: NotificationKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: NotificationId::new(),
            user_id,
            job_id,
            kind,
            message: truncate(message, MAX_MESSAGE_LEN),
            is_read: false,
            created_at: now,
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
