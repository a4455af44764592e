//! `homefix-sla`: time-based service level rules and operator alerts.

pub mod alert;
pub mod policy;

pub use alert::{Alert, AlertError, AlertType, Breach};
pub use policy::SlaPolicy;
