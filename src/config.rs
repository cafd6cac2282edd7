//! Client configuration (spec §6, ambient stack per §2.3).
//!
//! Modeled on `cli/src/config.rs`'s `Default` + `apply_env_overrides`
//! pattern, minus the on-disk persistence half (`config_dir`/`save`/
//! `load_from_file`) — nothing here calls for config state surviving past
//! the process.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Every recognized configuration option (spec §6), with the documented
/// defaults.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
    /// Pusher/Reverb application key. Required.
    pub app_key: String,
    /// Application secret used to sign admission tokens. Required, secret —
    /// never logged.
    #[serde(skip_serializing)]
    pub app_secret: String,
    /// Broker host. Required.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// `"ws"` or `"wss"`.
    pub scheme: String,
    /// Whether a dropped connection is retried automatically.
    pub reconnect_enabled: bool,
    /// Minimum reconnect delay, seconds.
    pub reconnect_delay_min: f64,
    /// Maximum reconnect delay, seconds.
    pub reconnect_delay_max: f64,
    /// Backoff multiplier applied per attempt.
    pub reconnect_multiplier: f64,
    /// Cap on reconnect attempts; `None` means unbounded.
    pub reconnect_max_attempts: Option<u32>,
    /// Interval between client-initiated keepalive pings, seconds.
    pub ping_interval: f64,
    /// How long a `subscribe` call waits for `subscription_succeeded`
    /// before failing with `TimeoutError`, seconds.
    pub subscription_timeout: f64,
    /// Log level hint for the embedding binary's `log` sink. Purely
    /// advisory — this crate never initializes a sink itself (spec §2.1).
    pub log_level: String,
}

impl std::fmt::Debug for Config {
    /// Redacts `app_secret` — `derive(Debug)` would otherwise print it
    /// verbatim, defeating the `#[serde(skip_serializing)]` above.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("app_key", &self.app_key)
            .field("app_secret", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("reconnect_enabled", &self.reconnect_enabled)
            .field("reconnect_delay_min", &self.reconnect_delay_min)
            .field("reconnect_delay_max", &self.reconnect_delay_max)
            .field("reconnect_multiplier", &self.reconnect_multiplier)
            .field("reconnect_max_attempts", &self.reconnect_max_attempts)
            .field("ping_interval", &self.ping_interval)
            .field("subscription_timeout", &self.subscription_timeout)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            app_secret: String::new(),
            host: String::new(),
            port: 443,
            scheme: "wss".to_string(),
            reconnect_enabled: true,
            reconnect_delay_min: 1.0,
            reconnect_delay_max: 30.0,
            reconnect_multiplier: 2.0,
            reconnect_max_attempts: None,
            ping_interval: 30.0,
            subscription_timeout: 10.0,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// `Config::default()` with `app_key`/`app_secret`/`host` set.
    #[must_use]
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            host: host.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    #[must_use]
    pub fn with_reconnect_enabled(mut self, enabled: bool) -> Self {
        self.reconnect_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_reconnect_delays(mut self, min: f64, max: f64, multiplier: f64) -> Self {
        self.reconnect_delay_min = min;
        self.reconnect_delay_max = max;
        self.reconnect_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_reconnect_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.reconnect_max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_ping_interval(mut self, seconds: f64) -> Self {
        self.ping_interval = seconds;
        self
    }

    #[must_use]
    pub fn with_subscription_timeout(mut self, seconds: f64) -> Self {
        self.subscription_timeout = seconds;
        self
    }

    /// `Config::default()` layered with `PUSHER_*`/`REVERB_*` environment
    /// overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Overwrite fields for which a recognized environment variable is set
    /// and parses. Unset or unparseable variables leave the field
    /// untouched, mirroring the teacher's `apply_env_overrides`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("PUSHER_APP_KEY") {
            self.app_key = value;
        }
        if let Ok(value) = std::env::var("PUSHER_APP_SECRET") {
            self.app_secret = value;
        }
        if let Ok(value) = std::env::var("REVERB_HOST") {
            self.host = value;
        }
        if let Ok(value) = std::env::var("REVERB_PORT") {
            if let Ok(port) = value.parse::<u16>() {
                self.port = port;
            }
        }
        if let Ok(value) = std::env::var("REVERB_SCHEME") {
            self.scheme = value;
        }
        if let Ok(value) = std::env::var("REVERB_RECONNECT_ENABLED") {
            if let Ok(enabled) = value.parse::<bool>() {
                self.reconnect_enabled = enabled;
            }
        }
        if let Ok(value) = std::env::var("REVERB_RECONNECT_DELAY_MIN") {
            if let Ok(seconds) = value.parse::<f64>() {
                self.reconnect_delay_min = seconds;
            }
        }
        if let Ok(value) = std::env::var("REVERB_RECONNECT_DELAY_MAX") {
            if let Ok(seconds) = value.parse::<f64>() {
                self.reconnect_delay_max = seconds;
            }
        }
        if let Ok(value) = std::env::var("REVERB_RECONNECT_MULTIPLIER") {
            if let Ok(multiplier) = value.parse::<f64>() {
                self.reconnect_multiplier = multiplier;
            }
        }
        if let Ok(value) = std::env::var("REVERB_RECONNECT_MAX_ATTEMPTS") {
            if let Ok(max) = value.parse::<u32>() {
                self.reconnect_max_attempts = Some(max);
            }
        }
        if let Ok(value) = std::env::var("REVERB_PING_INTERVAL") {
            if let Ok(seconds) = value.parse::<f64>() {
                self.ping_interval = seconds;
            }
        }
        if let Ok(value) = std::env::var("REVERB_SUBSCRIPTION_TIMEOUT") {
            if let Ok(seconds) = value.parse::<f64>() {
                self.subscription_timeout = seconds;
            }
        }
        if let Ok(value) = std::env::var("REVERB_LOG_LEVEL") {
            self.log_level = value;
        }
    }

    /// Checked before `connect` (spec §7, `ConfigurationError`): the three
    /// required fields must be non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.app_key.is_empty() {
            return Err(Error::Configuration("app_key is required".to_string()));
        }
        if self.app_secret.is_empty() {
            return Err(Error::Configuration("app_secret is required".to_string()));
        }
        if self.host.is_empty() {
            return Err(Error::Configuration("host is required".to_string()));
        }
        Ok(())
    }
}
