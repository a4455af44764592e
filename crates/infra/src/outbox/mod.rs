//! Durable notification outbox: the enqueue side used inside business units of
//! work, the transport seam, and the background dispatcher.

mod dispatcher;
mod enqueuer;
mod sender;

pub use dispatcher::{
    CycleReport, DispatchError, DispatcherConfig, DispatcherStats, OutboxDispatcher,
};
pub use enqueuer::OutboxEnqueuer;
pub use sender::{LogSender, SendError, Sender};
