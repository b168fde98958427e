use std::{collections::HashMap, fs, path::Path, time::Duration};

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::connection::ConnectionConfig;

pub const SETTINGS_FILE: &str = "client.toml";

const TUNABLE_KEYS: &[&str] = &[
    "server_url",
    "ws_path",
    "history_page_size",
    "handshake_timeout_ms",
    "reconnect_delay_ms",
    "max_reconnect_attempts",
    "heartbeat_interval_ms",
    "health_probe_interval_ms",
    "send_ready_timeout_ms",
    "pending_queue_limit",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid server url '{0}'")]
    InvalidServerUrl(String),
    #[error("server url must use http:// or https://, got '{0}'")]
    UnsupportedScheme(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub ws_path: String,
    pub history_page_size: u32,
    pub handshake_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub health_probe_interval: Duration,
    pub send_ready_timeout: Duration,
    pub pending_queue_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            ws_path: "/ws".into(),
            history_page_size: 30,
            handshake_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(10),
            health_probe_interval: Duration::from_secs(30),
            send_ready_timeout: Duration::from_secs(5),
            pending_queue_limit: 64,
        }
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in file_cfg {
                    let value = match value {
                        toml::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    settings.apply(&key, &value);
                }
            }
            Err(err) => warn!(path = %path.display(), "config: ignoring unreadable settings file: {err}"),
        }
    }

    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Applies `SERVER_URL` and every `APP__<KEY>` override found by `lookup`.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SERVER_URL") {
        settings.apply("server_url", &v);
    }
    for key in TUNABLE_KEYS {
        if let Some(v) = lookup(&format!("APP__{}", key.to_ascii_uppercase())) {
            settings.apply(key, &v);
        }
    }
}

impl Settings {
    fn apply(&mut self, key: &str, value: &str) {
        let value = value.trim();
        let applied = match key {
            "server_url" => {
                self.server_url = value.trim_end_matches('/').to_string();
                true
            }
            "ws_path" => {
                self.ws_path = if value.starts_with('/') {
                    value.to_string()
                } else {
                    format!("/{value}")
                };
                true
            }
            "history_page_size" => parse_into(value, &mut self.history_page_size),
            "max_reconnect_attempts" => parse_into(value, &mut self.max_reconnect_attempts),
            "pending_queue_limit" => parse_into(value, &mut self.pending_queue_limit),
            "handshake_timeout_ms" => parse_millis(value, &mut self.handshake_timeout),
            "reconnect_delay_ms" => parse_millis(value, &mut self.reconnect_delay),
            "heartbeat_interval_ms" => parse_millis(value, &mut self.heartbeat_interval),
            "health_probe_interval_ms" => parse_millis(value, &mut self.health_probe_interval),
            "send_ready_timeout_ms" => parse_millis(value, &mut self.send_ready_timeout),
            _ => {
                debug!(key, "config: unknown setting ignored");
                return;
            }
        };
        if !applied {
            warn!(key, value, "config: ignoring unparsable value");
        }
    }

    /// WebSocket endpoint derived from the HTTP base url (`http→ws`, `https→wss`).
    pub fn websocket_url(&self) -> Result<String, ConfigError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|_| ConfigError::InvalidServerUrl(self.server_url.clone()))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            _ => return Err(ConfigError::UnsupportedScheme(self.server_url.clone())),
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::InvalidServerUrl(self.server_url.clone()))?;
        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base_path}{}", self.ws_path));
        Ok(url.to_string())
    }

    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        Ok(ConnectionConfig {
            endpoint: self.websocket_url()?,
            handshake_timeout: self.handshake_timeout,
            reconnect_delay: self.reconnect_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat_interval: self.heartbeat_interval,
            health_probe_interval: self.health_probe_interval,
            pending_queue_limit: self.pending_queue_limit,
        })
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, slot: &mut T) -> bool {
    match value.parse::<T>() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

fn parse_millis(value: &str, slot: &mut Duration) -> bool {
    match value.parse::<u64>() {
        Ok(ms) if ms > 0 => {
            *slot = Duration::from_millis(ms);
            true
        }
        _ => false,
    }
}
