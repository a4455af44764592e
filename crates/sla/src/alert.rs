use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use homefix_core::{AlertId, JobId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    OpenTooLong,
    AssignedNotStarted,
    InProgressTooLong,
    IssueUnresolved,
}

impl AlertType {
    pub const ALL: [AlertType; 4] = [
        AlertType::OpenTooLong,
        AlertType::AssignedNotStarted,
        AlertType::InProgressTooLong,
        AlertType::IssueUnresolved,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::OpenTooLong => "open_too_long",
            AlertType::AssignedNotStarted => "assigned_not_started",
            AlertType::InProgressTooLong => "in_progress_too_long",
            AlertType::IssueUnresolved => "issue_unresolved",
        }
    }

    /// Operator-facing message for a breach on the job titled `title`.
    pub fn message(self, title: &str) -> String {
        match self {
            AlertType::OpenTooLong => {
                format!("Job '{title}' has been open for more than 15 minutes.")
            }
            AlertType::AssignedNotStarted => {
                format!("Job '{title}' was assigned more than 30 minutes ago and has not started.")
            }
            AlertType::InProgressTooLong => {
                format!("Job '{title}' has been in progress for more than 3 hours.")
            }
            AlertType::IssueUnresolved => {
                format!("Job '{title}' has reported issue(s) unresolved for more than 1 hour.")
            }
        }
    }
}

impl core::fmt::Display for AlertType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for AlertType {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlertType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| AlertError::UnknownType(s.to_string()))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AlertError {
    #[error("unknown alert type '{0}'")]
    UnknownType(String),

    #[error("alert already resolved")]
    AlreadyResolved,
}

/// A job currently violating one rule. Input to alert creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breach {
    pub job_id: JobId,
    pub title: String,
    pub kind: AlertType,
}

/// Operator-visible SLA alert. At most one unresolved alert exists per
/// `(job_id, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub job_id: JobId,
    pub kind: AlertType,
    pub message: String,
    pub is_resolved: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
}

impl Alert {
    pub fn raise(breach: &Breach, now: DateTime<Utc>) -> Self {
        Self {
            id: AlertId::new(),
            job_id: breach.job_id,
            kind: breach.kind,
            message: breach.kind.message(&breach.title),
            is_resolved: false,
            created_at: now,
            resolved_at: None,
            resolved_by: None,
        }
    }

    pub fn resolve(&mut self, by: UserId, now: DateTime<Utc>) -> Result<(), AlertError> {
        if self.is_resolved {
            return Err(AlertError::AlreadyResolved);
        }
        self.is_resolved = true;
        self.resolved_at = Some(now);
        self.resolved_by = Some(by);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_roundtrip() {
        for t in AlertType::ALL {
            assert_eq!(t.as_str().parse::<AlertType>().unwrap(), t);
        }
        assert!("late".parse::<AlertType>().is_err());
    }

    #[test]
    fn resolve_is_single_shot() {
        let breach = Breach {
            job_id: JobId::new(),
            title: "Fix sink".into(),
            kind: AlertType::OpenTooLong,
        };
        let mut alert = Alert::raise(&breach, Utc::now());
        assert!(alert.message.contains("'Fix sink'"));
        alert.resolve(UserId::new(), Utc::now()).unwrap();
        assert!(alert.is_resolved);
        assert_eq!(alert.resolve(UserId::new(), Utc::now()), Err(AlertError::AlreadyResolved));
    }
}
