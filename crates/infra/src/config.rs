//! Process settings.
//!
//! Layers, later wins: built-in defaults, an optional `homefix.toml` (or an
//! explicit file), then `HOMEFIX__SECTION__KEY` environment variables.

use std::path::Path;
use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use homefix_notify::RetryPolicy;
use homefix_sla::SlaPolicy;

use crate::outbox::DispatcherConfig;
use crate::sla::SlaEngineConfig;

pub const DEFAULT_FILE: &str = "homefix.toml";
pub const ENV_PREFIX: &str = "HOMEFIX";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub outbox: OutboxSettings,
    pub sla: SlaSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Unset means the in-memory store.
    #[serde(default)]
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxSettings {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub send_timeout_secs: u64,
    pub orphan_threshold_secs: u64,
    pub max_attempts: u32,
    pub base_retry_delay_secs: u64,
    pub max_retry_delay_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaSettings {
    pub interval_secs: u64,
    pub open_too_long_mins: u64,
    pub assigned_not_started_mins: u64,
    pub in_progress_too_long_mins: u64,
    pub issue_unresolved_mins: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Zero disables expiry.
    pub ttl_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings {
                url: None,
                max_connections: 10,
                acquire_timeout_secs: 5,
            },
            outbox: OutboxSettings {
                poll_interval_secs: 10,
                batch_size: 20,
                send_timeout_secs: 30,
                orphan_threshold_secs: 300,
                max_attempts: 4,
                base_retry_delay_secs: 10,
                max_retry_delay_secs: 3600,
            },
            sla: SlaSettings {
                interval_secs: 120,
                open_too_long_mins: 15,
                assigned_not_started_mins: 30,
                in_progress_too_long_mins: 180,
                issue_unresolved_mins: 60,
            },
            cache: CacheSettings { ttl_secs: 60 },
        }
    }
}

impl Settings {
    /// Load from `path` when given (the file must exist), otherwise from
    /// `homefix.toml` in the working directory if present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => File::new(&p.to_string_lossy(), FileFormat::Toml),
            None => File::new(DEFAULT_FILE, FileFormat::Toml).required(false),
        };
        Self::assemble(Self::defaults()?.add_source(file), Self::environment())
    }

    /// Parse TOML text over the defaults, without consulting the environment.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let builder = Self::defaults()?.add_source(File::from_str(text, FileFormat::Toml));
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("database.max_connections", 10)?
            .set_default("database.acquire_timeout_secs", 5)?
            .set_default("outbox.poll_interval_secs", 10)?
            .set_default("outbox.batch_size", 20)?
            .set_default("outbox.send_timeout_secs", 30)?
            .set_default("outbox.orphan_threshold_secs", 300)?
            .set_default("outbox.max_attempts", 4)?
            .set_default("outbox.base_retry_delay_secs", 10)?
            .set_default("outbox.max_retry_delay_secs", 3600)?
            .set_default("sla.interval_secs", 120)?
            .set_default("sla.open_too_long_mins", 15)?
            .set_default("sla.assigned_not_started_mins", 30)?
            .set_default("sla.in_progress_too_long_mins", 180)?
            .set_default("sla.issue_unresolved_mins", 60)?
            .set_default("cache.ttl_secs", 60)
    }

    fn assemble(
        builder: ConfigBuilder<DefaultState>,
        env: Environment,
    ) -> Result<Self, ConfigError> {
        let settings: Settings = builder.add_source(env).build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Message(msg.to_string()));
        if self.outbox.batch_size == 0 {
            return invalid("outbox.batch_size must be at least 1");
        }
        if self.outbox.poll_interval_secs == 0 || self.sla.interval_secs == 0 {
            return invalid("poll intervals must be at least one second");
        }
        if self.outbox.max_attempts == 0 {
            return invalid("outbox.max_attempts must be at least 1");
        }
        if self.outbox.send_timeout_secs == 0 {
            return invalid("outbox.send_timeout_secs must be at least 1");
        }
        // One send must fit inside one outbox lease.
        if self.outbox.orphan_threshold_secs <= self.outbox.send_timeout_secs {
            return invalid("outbox.orphan_threshold_secs must exceed outbox.send_timeout_secs");
        }
        if self.database.max_connections == 0 {
            return invalid("database.max_connections must be at least 1");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.outbox.max_attempts,
            Duration::from_secs(self.outbox.base_retry_delay_secs),
            Duration::from_secs(self.outbox.max_retry_delay_secs),
        )
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_secs(self.outbox.poll_interval_secs),
            batch_size: self.outbox.batch_size,
            send_timeout: Duration::from_secs(self.outbox.send_timeout_secs),
            orphan_threshold: Duration::from_secs(self.outbox.orphan_threshold_secs),
            retry: self.retry_policy(),
        }
    }

    pub fn sla_policy(&self) -> SlaPolicy {
        let mins = |m: u64| Duration::from_secs(m * 60);
        SlaPolicy {
            open_too_long: mins(self.sla.open_too_long_mins),
            assigned_not_started: mins(self.sla.assigned_not_started_mins),
            in_progress_too_long: mins(self.sla.in_progress_too_long_mins),
            issue_unresolved: mins(self.sla.issue_unresolved_mins),
        }
    }

    pub fn sla_engine_config(&self) -> SlaEngineConfig {
        SlaEngineConfig {
            interval: Duration::from_secs(self.sla.interval_secs),
            policy: self.sla_policy(),
        }
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache.ttl_secs > 0).then(|| Duration::from_secs(self.cache.ttl_secs))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.database.acquire_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.dispatcher_config(), DispatcherConfig::default());
        assert_eq!(settings.sla_policy(), SlaPolicy::default());
        assert_eq!(settings.retry_policy(), RetryPolicy::default());
        assert_eq!(settings.cache_ttl(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn file_values_override_defaults() {
        let settings = Settings::from_toml(
            r#"
            [database]
            url = "postgres://localhost/homefix"

            [outbox]
            batch_size = 50

            [cache]
            ttl_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(
            settings.database.url.as_deref(),
            Some("postgres://localhost/homefix")
        );
        assert_eq!(settings.outbox.batch_size, 50);
        assert_eq!(settings.outbox.poll_interval_secs, 10);
        assert_eq!(settings.cache_ttl(), None);
    }

    #[test]
    fn environment_overrides_file() {
        let mut vars = config::Map::new();
        vars.insert("HOMEFIX__OUTBOX__BATCH_SIZE".to_string(), "7".to_string());
        vars.insert("HOMEFIX__SLA__OPEN_TOO_LONG_MINS".to_string(), "5".to_string());
        let builder = Settings::defaults()
            .unwrap()
            .add_source(File::from_str("[outbox]\nbatch_size = 50", FileFormat::Toml));

        let settings =
            Settings::assemble(builder, Settings::environment().source(Some(vars))).unwrap();

        assert_eq!(settings.outbox.batch_size, 7);
        assert_eq!(
            settings.sla_policy().open_too_long,
            Duration::from_secs(5 * 60)
        );
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = Settings::from_toml("[outbox]\nbatch_size = 0").unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn orphan_threshold_must_outlast_a_send() {
        let err = Settings::from_toml(
            "[outbox]\nsend_timeout_secs = 60\norphan_threshold_secs = 60",
        )
        .unwrap_err();
        assert!(err.to_string().contains("orphan_threshold_secs"));

        let ok =
            Settings::from_toml("[outbox]\nsend_timeout_secs = 60\norphan_threshold_secs = 61");
        assert!(ok.is_ok());
    }
}
