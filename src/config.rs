use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid origin url: {0}")]
    InvalidOrigin(#[from] url::ParseError),
    #[error("unsupported origin scheme: {0}")]
    UnsupportedScheme(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub origin: String,
    pub push_path: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub initial_connect_delay: Duration,
    pub toast_ttl: Duration,
    pub history_cap: usize,
    pub history_path: PathBuf,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:5173".into(),
            push_path: "/ws/notifications".into(),
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(30_000),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
            initial_connect_delay: Duration::from_millis(1000),
            toast_ttl: Duration::from_millis(5000),
            history_cap: 50,
            history_path: PathBuf::from("notification_history.json"),
        }
    }
}

impl HubConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let number = |key: &str, default: u64| -> anyhow::Result<u64> {
            match lookup(key) {
                Some(raw) => raw
                    .parse::<u64>()
                    .with_context(|| format!("{key} must be a number")),
                None => Ok(default),
            }
        };

        let reconnect_base_ms = number("NOTIFY_RECONNECT_BASE_MS", 1000)?;
        let reconnect_max_ms = number("NOTIFY_RECONNECT_MAX_MS", 30_000)?;
        let max_reconnect_attempts = u32::try_from(number("NOTIFY_MAX_RECONNECT_ATTEMPTS", 10)?)
            .context("NOTIFY_MAX_RECONNECT_ATTEMPTS is out of range")?;
        let heartbeat_secs = number("NOTIFY_HEARTBEAT_SECS", 30)?;
        let initial_connect_delay_ms = number("NOTIFY_INITIAL_CONNECT_DELAY_MS", 1000)?;
        let toast_ttl_ms = number("NOTIFY_TOAST_TTL_MS", 5000)?;
        let history_cap = usize::try_from(number("NOTIFY_HISTORY_CAP", 50)?)
            .context("NOTIFY_HISTORY_CAP is out of range")?;

        let config = Self {
            origin: lookup("NOTIFY_ORIGIN").unwrap_or(defaults.origin),
            push_path: lookup("NOTIFY_PUSH_PATH").unwrap_or(defaults.push_path),
            reconnect_base_delay: Duration::from_millis(reconnect_base_ms),
            reconnect_max_delay: Duration::from_millis(reconnect_max_ms),
            max_reconnect_attempts,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            initial_connect_delay: Duration::from_millis(initial_connect_delay_ms),
            toast_ttl: Duration::from_millis(toast_ttl_ms),
            history_cap,
            history_path: lookup("NOTIFY_HISTORY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.history_path),
        };

        config
            .validate()
            .context("NOTIFY_* timing values must be non-zero")?;
        config
            .push_url()
            .context("NOTIFY_ORIGIN must be an http(s) or ws(s) url")?;

        Ok(config)
    }

    /// Rejects periods that would make the session loop spin.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("reconnect_base_delay", self.reconnect_base_delay),
            ("reconnect_max_delay", self.reconnect_max_delay),
            ("toast_ttl", self.toast_ttl),
        ];
        match periods.into_iter().find(|(_, period)| period.is_zero()) {
            Some((name, _)) => Err(ConfigError::ZeroDuration(name)),
            None => Ok(()),
        }
    }

    pub fn push_url(&self) -> Result<Url, ConfigError> {
        push_url(&self.origin, &self.push_path)
    }
}

/// Derives the push endpoint from the page origin: same host and port, scheme
/// translated to its websocket equivalent, fixed path.
pub fn push_url(origin: &str, path: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(origin)?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };

    url.set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme(scheme.to_string()))?;
    url.set_path(path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
