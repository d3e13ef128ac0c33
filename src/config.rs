//! TOML configuration: airports, dispatch tuning, redaction policy and
//! user profiles.
//!
//! ```toml
//! [dispatch]
//! event_buffer = 1024
//! staleness_horizon = "36h"
//!
//! [[airports]]
//! code = "SYD"
//! base_url = "http://ams.example/api"
//! window_min_days = -1
//! window_max_days = 2
//! notifications = { kind = "http_poll", url = "http://ams.example/queue" }
//!
//! [[users]]
//! name = "ops"
//! allowed_airports = ["SYD"]
//! allowed_airlines = ["*"]
//! ```

use crate::client::ClientConfig;
use crate::collector::CollectorConfig;
use crate::events::DEFAULT_EVENT_BUFFER;
use crate::ingest::{Window, MAX_WINDOW_DAYS};
use crate::profile::UserProfile;
use crate::query::RedactionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

fn default_staleness() -> Duration {
    Duration::from_secs(36 * 3600)
}

fn default_delivery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_min_days() -> i64 {
    -1
}

fn default_max_days() -> i64 {
    2
}

fn default_chunk_days() -> u32 {
    1
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Capacity of each event queue
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Flights scheduled further ahead are not dispatched
    #[serde(default = "default_staleness", with = "humantime_serde")]
    pub staleness_horizon: Duration,
    /// Timeout for every outbound push
    #[serde(default = "default_delivery_timeout", with = "humantime_serde")]
    pub delivery_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            staleness_horizon: default_staleness(),
            delivery_timeout: default_delivery_timeout(),
        }
    }
}

/// How change notifications reach an airport's collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationTransport {
    /// Periodic refresh only.
    #[default]
    Disabled,
    HttpPoll {
        url: String,
        #[serde(default = "default_poll_interval", with = "humantime_serde")]
        poll_interval: Duration,
    },
}

/// One airport repository definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirportConfig {
    pub code: String,
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_min_days")]
    pub window_min_days: i64,
    #[serde(default = "default_max_days")]
    pub window_max_days: i64,
    #[serde(default = "default_chunk_days")]
    pub chunk_days: u32,
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub notifications: NotificationTransport,
}

impl AirportConfig {
    pub fn window(&self) -> Window {
        Window::new(self.window_min_days, self.window_max_days)
    }

    pub fn client_config(&self) -> ClientConfig {
        let config = ClientConfig::new(self.base_url.clone()).with_timeout(self.request_timeout);
        match &self.token {
            Some(token) => config.with_token(token.clone()),
            None => config,
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            window: self.window(),
            chunk_days: self.chunk_days,
            refresh_interval: self.refresh_interval,
            retry_delay: self.retry_delay,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub query: RedactionPolicy,
    #[serde(default)]
    pub airports: Vec<AirportConfig>,
    #[serde(default)]
    pub users: Vec<UserProfile>,
}

impl Config {
    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for airport in &self.airports {
            let code = airport.code.trim();
            if code.is_empty() {
                return Err(ConfigError::Invalid("airport with empty code".into()));
            }
            if !seen.insert(code) {
                return Err(ConfigError::Invalid(format!("duplicate airport {code}")));
            }
            if airport.window_min_days > airport.window_max_days {
                return Err(ConfigError::Invalid(format!(
                    "airport {code}: window_min_days {} is after window_max_days {}",
                    airport.window_min_days, airport.window_max_days
                )));
            }
            for days in [airport.window_min_days, airport.window_max_days] {
                if days.abs() > MAX_WINDOW_DAYS {
                    return Err(ConfigError::Invalid(format!(
                        "airport {code}: window offset {days} exceeds {MAX_WINDOW_DAYS} days"
                    )));
                }
            }
            if airport.chunk_days == 0 || i64::from(airport.chunk_days) > MAX_WINDOW_DAYS {
                return Err(ConfigError::Invalid(format!(
                    "airport {code}: chunk_days must be between 1 and {MAX_WINDOW_DAYS}"
                )));
            }
        }

        for user in &self.users {
            if let Some(sub) = user.push_subscriptions.iter().find(|s| s.cadence.is_zero()) {
                return Err(ConfigError::Invalid(format!(
                    "user {}: push subscription {} has a zero cadence",
                    user.name, sub.id
                )));
            }
        }
        Ok(())
    }

    pub fn airport(&self, code: &str) -> Option<&AirportConfig> {
        self.airports.iter().find(|a| a.code == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::PushKind;
    use crate::query::UnsetFieldPolicy;
    use crate::scheduler::Cadence;
    use std::io::Write;

    const SAMPLE: &str = r#"
[dispatch]
event_buffer = 256
staleness_horizon = "12h"

[query]
changes_when_unset = "allow_none"

[[airports]]
code = "SYD"
base_url = "http://ams.local/api"
token = "t0k"
chunk_days = 2
refresh_interval = "5m"
notifications = { kind = "http_poll", url = "http://ams.local/queue", poll_interval = "250ms" }

[[airports]]
code = "MEL"
base_url = "http://ams.local/mel"

[[users]]
name = "ops"
token = "secret"
allowed_airports = ["SYD"]
allowed_airlines = ["*"]
allowed_custom_fields = ["Remark"]

[[users.change_subscriptions]]
airport = "SYD"
destination = "http://hooks.local/gates"
gate = true
headers = { "X-Api-Key" = "abc" }

[[users.push_subscriptions]]
id = "board"
airport = "SYD"
destination = "http://hooks.local/board"
push_on_startup = true
kind = { type = "flights", direction = "D", from_offset_hours = -1, to_offset_hours = 6 }
cadence = { unit = "minutes", every = 10 }
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.dispatch.event_buffer, 256);
        assert_eq!(config.dispatch.staleness_horizon, Duration::from_secs(12 * 3600));
        assert_eq!(config.dispatch.delivery_timeout, Duration::from_secs(30));
        assert_eq!(config.query.changes_when_unset, UnsetFieldPolicy::AllowNone);
        assert_eq!(config.query.fields_when_unset, UnsetFieldPolicy::AllowNone);

        let syd = config.airport("SYD").unwrap();
        assert_eq!(syd.window(), Window::new(-1, 2));
        assert_eq!(syd.collector_config().refresh_interval, Duration::from_secs(300));
        assert_eq!(syd.client_config().token.as_deref(), Some("t0k"));
        assert_eq!(
            syd.notifications,
            NotificationTransport::HttpPoll {
                url: "http://ams.local/queue".into(),
                poll_interval: Duration::from_millis(250),
            }
        );
        assert_eq!(config.airport("MEL").unwrap().notifications, NotificationTransport::Disabled);

        let ops = &config.users[0];
        assert!(ops.change_subscriptions[0].enabled);
        assert_eq!(ops.change_subscriptions[0].headers["X-Api-Key"], "abc");
        let push = &ops.push_subscriptions[0];
        assert_eq!(push.cadence, Cadence::Minutes { every: 10 });
        match &push.kind {
            PushKind::Flights(q) => {
                assert_eq!(q.direction.as_deref(), Some("D"));
                assert_eq!(q.to_offset_hours, 6);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_validation_errors() {
        let dup = "[[airports]]\ncode = \"SYD\"\nbase_url = \"x\"\n[[airports]]\ncode = \"SYD\"\nbase_url = \"y\"\n";
        assert!(matches!(
            Config::from_toml_str(dup).unwrap().validate(),
            Err(ConfigError::Invalid(msg)) if msg.contains("duplicate")
        ));

        let window = "[[airports]]\ncode = \"SYD\"\nbase_url = \"x\"\nwindow_min_days = 3\nwindow_max_days = 1\n";
        assert!(Config::from_toml_str(window).unwrap().validate().is_err());

        let chunk = "[[airports]]\ncode = \"SYD\"\nbase_url = \"x\"\nchunk_days = 0\n";
        assert!(Config::from_toml_str(chunk).unwrap().validate().is_err());

        let huge = "[[airports]]\ncode = \"SYD\"\nbase_url = \"x\"\nwindow_max_days = 9999999999\n";
        assert!(matches!(
            Config::from_toml_str(huge).unwrap().validate(),
            Err(ConfigError::Invalid(msg)) if msg.contains("window offset")
        ));

        let past = "[[airports]]\ncode = \"SYD\"\nbase_url = \"x\"\nwindow_min_days = -400\n";
        assert!(Config::from_toml_str(past).unwrap().validate().is_err());

        let wide = "[[airports]]\ncode = \"SYD\"\nbase_url = \"x\"\nchunk_days = 4000000000\n";
        assert!(Config::from_toml_str(wide).unwrap().validate().is_err());

        let edge = "[[airports]]\ncode = \"SYD\"\nbase_url = \"x\"\nwindow_min_days = -366\nwindow_max_days = 366\n";
        Config::from_toml_str(edge).unwrap().validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.airports.len(), 2);

        assert!(matches!(
            Config::load(file.path().with_extension("missing")),
            Err(ConfigError::Io { .. })
        ));
    }
}
