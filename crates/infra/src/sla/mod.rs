//! SLA rule engine loop and operator alert handling.

mod alerts;
mod engine;

pub use alerts::{AlertService, ResolveAlertError};
pub use engine::{SlaCycleReport, SlaEngine, SlaEngineConfig, SlaEngineStats};
