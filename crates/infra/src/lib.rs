//! `homefix-infra`: storage, orchestration and background workers.
//!
//! - [`store`]: the transactional store contract with in-memory and PostgreSQL
//!   implementations.
//! - [`lifecycle`]: job state machine and assignment engine over a store.
//! - [`notifier`] / [`outbox`]: side-effect notifications, the durable outbox
//!   and its dispatcher loop.
//! - [`sla`]: the SLA rule engine loop and alert resolution.
//! - [`cache`], [`config`], [`command`]: read cache, settings, typed dispatch.

pub mod cache;
pub mod command;
pub mod config;
pub mod lifecycle;
pub mod notifier;
pub mod outbox;
pub mod sla;
pub mod store;
pub mod worker;

pub use cache::{CacheInvalidator, DASHBOARD_KEY, NoopInvalidator, ReadCache};
pub use command::{CommandOutcome, JobCommand};
pub use crate::config::Settings;
pub use lifecycle::JobLifecycleService;
pub use notifier::{JobRef, NotificationComposer, Notifier, PlainTextComposer};
pub use outbox::{DispatcherConfig, LogSender, OutboxDispatcher, OutboxEnqueuer, Sender};
pub use sla::{AlertService, SlaEngine, SlaEngineConfig};
pub use store::{InMemoryStore, PostgresStore, RowLock, Store, StoreError, UnitOfWork};
pub use worker::WorkerHandle;
