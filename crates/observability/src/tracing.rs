//! Tracing subscriber installation.
//!
//! Output is JSON by default, one object per event, with every structured
//! field (`job_id`, `outbox_id`, `attempts`, ...) carried as a key. Set
//! `HOMEFIX_LOG_FORMAT=compact` for human-readable lines during development.
//! Filtering follows `RUST_LOG` and defaults to `info`.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

pub const FORMAT_ENV: &str = "HOMEFIX_LOG_FORMAT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

impl LogFormat {
    /// Parse a format name; unknown names fall back to JSON.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "compact" | "text" | "plain" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }

    pub fn from_env() -> Self {
        std::env::var(FORMAT_ENV)
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }
}

/// Initialize tracing for the process using `HOMEFIX_LOG_FORMAT`.
pub fn init() {
    init_with(LogFormat::from_env());
}

/// Install a global subscriber in `format`. Returns `false` when one was
/// already installed.
pub fn init_with(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Compact => builder.compact().try_init().is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names() {
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse(" TEXT "), LogFormat::Compact);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("bogus"), LogFormat::Json);
    }

    #[test]
    fn second_init_is_a_no_op() {
        init_with(LogFormat::Json);
        assert!(!init_with(LogFormat::Compact));
    }
}
