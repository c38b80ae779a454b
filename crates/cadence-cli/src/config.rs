use cadence_core::models::{SchedulerConfig, SyncConfig};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::path::Path;

use crate::timezone::detect_system_timezone;

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Timezone used when `--timezone` is omitted (IANA format)
    #[serde(default = "detect_system_timezone")]
    pub default_timezone: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote calendar endpoint. Without a base URL, sync runs against an
/// in-process provider.
#[derive(Deserialize, Debug, Default)]
pub struct CalendarConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

fn default_database_path() -> String {
    "cadence.db".to_string()
}

impl Config {
    pub fn new(path: &Path) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use std::time::Duration;

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let config = Config::new(Path::new("missing.toml"))?;
            assert_eq!(config.database_path, "cadence.db");
            assert_eq!(config.scheduler.tick_interval, Duration::from_secs(60));
            assert!(config.scheduler.enable_catchup);
            assert!(config.calendar.base_url.is_none());
            assert_eq!(config.logging.format, LogFormat::Pretty);
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                database_path = "ops.db"
                default_timezone = "Europe/Berlin"

                [scheduler]
                tick_interval = 15
                enable_catchup = false

                [sync]
                call_timeout = 2500

                [logging]
                level = "debug"
                format = "json"
                "#,
            )?;
            jail.set_env("CADENCE_SCHEDULER__TEMPLATE_CONCURRENCY", "2");
            jail.set_env("CADENCE_CALENDAR__BASE_URL", "https://calendar.example.com/v1");

            let config = Config::new(Path::new("cadence.toml"))?;
            assert_eq!(config.database_path, "ops.db");
            assert_eq!(config.default_timezone, "Europe/Berlin");
            assert_eq!(config.scheduler.tick_interval, Duration::from_secs(15));
            assert!(!config.scheduler.enable_catchup);
            assert_eq!(config.scheduler.template_concurrency, 2);
            assert_eq!(config.sync.call_timeout, Duration::from_millis(2500));
            assert_eq!(config.sync.max_attempts, SyncConfig::default().max_attempts);
            assert_eq!(config.calendar.base_url.as_deref(), Some("https://calendar.example.com/v1"));
            assert_eq!(config.logging.level, "debug");
            assert_eq!(config.logging.format, LogFormat::Json);
            Ok(())
        });
    }
}
