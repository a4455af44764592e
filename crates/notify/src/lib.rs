//! `homefix-notify`: durable notification outbox model.
//!
//! - [`OutboxRecord`]: one pending delivery and its state machine
//!   (`pending -> processing -> sent | pending(retry) | failed`).
//! - [`RetryPolicy`]: exponential backoff with a bounded number of attempts.
//! - [`Notification`]: the in-app notification row that an outbox email
//!   mirrors, keyed by the same id.

pub mod notification;
pub mod outbox;
pub mod retry;

pub use notification::{Notification, NotificationKind};
pub use outbox::{Channel, OutboxMessage, OutboxRecord, OutboxStatus, ParseError};
pub use retry::RetryPolicy;
