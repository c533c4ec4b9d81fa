//! Configuration handling for the courier service.
//!
//! Values come from the shared YAML config file (the `services.courier`
//! section), then `COURIER_*` environment variables, then command-line flags
//! applied by `main`.

use anyhow::{Context, Result};
use courier_session::{BackoffConfig, LineTransportConfig, SessionConfig, DEFAULT_MAX_JITTER};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Default relay address
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:5236";

/// Default domain appended to the sender id to form the login name
pub const DEFAULT_AUTH_DOMAIN: &str = "gcm.googleapis.com";

/// Attempts and base wait of one backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSettings {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Wait after the first failure
    pub base_wait: Duration,
}

impl BackoffSettings {
    fn from_config(config: BackoffConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_wait: config.base_wait,
        }
    }

    fn with_jitter(self, max_jitter: Duration) -> BackoffConfig {
        BackoffConfig {
            max_attempts: self.max_attempts,
            base_wait: self.base_wait,
            max_jitter,
        }
    }
}

/// Courier service configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourierConfig {
    /// Relay address, `host:port`
    pub server_addr: String,
    /// Sender (project) id
    pub sender_id: String,
    /// Server key
    pub api_key: String,
    /// Login domain
    pub auth_domain: String,
    /// Backoff for message and ack sends
    pub send_backoff: BackoffSettings,
    /// Backoff for reconnection
    pub reconnect_backoff: BackoffSettings,
    /// Age after which unacknowledged messages are replayed
    pub replay_grace: Duration,
    /// Upper bound of backoff jitter
    pub max_jitter: Duration,
}

impl Default for CourierConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            sender_id: String::new(),
            api_key: String::new(),
            auth_domain: DEFAULT_AUTH_DOMAIN.to_string(),
            send_backoff: BackoffSettings::from_config(session.send_backoff),
            reconnect_backoff: BackoffSettings::from_config(session.reconnect_backoff),
            replay_grace: session.replay_grace,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

/// Root of the shared YAML file
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    courier: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl CourierConfig {
    /// Load from `config_path` and the process environment.
    ///
    /// A missing or unparsable file leaves the defaults in place.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();
        let path = config_path.as_ref();

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root)?;
                    info!("Loaded configuration from {:?}", path);
                }
                Err(e) => warn!("Failed to parse config file {:?}, using defaults: {}", path, e),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_overrides(|name| std::env::var(name).ok())?;

        info!(
            "Courier configuration: server={}, username={}, replay_grace={:?}",
            config.server_addr,
            config.username(),
            config.replay_grace
        );
        Ok(config)
    }

    /// Login name, `<sender id>@<auth domain>`
    pub fn username(&self) -> String {
        format!("{}@{}", self.sender_id, self.auth_domain)
    }

    /// Session parameters
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            send_backoff: self.send_backoff.with_jitter(self.max_jitter),
            reconnect_backoff: self.reconnect_backoff.with_jitter(self.max_jitter),
            replay_grace: self.replay_grace,
        }
    }

    /// Transport parameters
    pub fn transport_config(&self) -> LineTransportConfig {
        LineTransportConfig {
            server_addr: self.server_addr.clone(),
            username: self.username(),
            api_key: self.api_key.clone(),
        }
    }

    fn apply_root_config(&mut self, root: RootConfig) -> Result<()> {
        let Some(service) = root.services.and_then(|services| services.courier) else {
            return Ok(());
        };

        for arg in service.args.unwrap_or_default() {
            if let Some(server) = arg.strip_prefix("--server=") {
                self.server_addr = server.to_string();
            } else if let Some(sender_id) = arg.strip_prefix("--sender-id=") {
                self.sender_id = sender_id.to_string();
            }
        }

        for (key, value) in service.config.unwrap_or_default() {
            match key.strip_prefix("services.courier.") {
                Some(setting) => self.apply_setting(setting, &value)?,
                None => warn!("Ignoring configuration key outside services.courier: {}", key),
            }
        }
        Ok(())
    }

    fn apply_setting(&mut self, setting: &str, value: &str) -> Result<()> {
        match setting {
            "server_addr" => self.server_addr = value.to_string(),
            "sender_id" => self.sender_id = value.to_string(),
            "api_key" => self.api_key = value.to_string(),
            "auth_domain" => self.auth_domain = value.to_string(),
            "send.max_attempts" => self.send_backoff.max_attempts = parse_attempts(setting, value)?,
            "send.base_wait" => self.send_backoff.base_wait = parse_duration(setting, value)?,
            "reconnect.max_attempts" => {
                self.reconnect_backoff.max_attempts = parse_attempts(setting, value)?
            }
            "reconnect.base_wait" => {
                self.reconnect_backoff.base_wait = parse_duration(setting, value)?
            }
            "replay_grace" => self.replay_grace = parse_duration(setting, value)?,
            "max_jitter" => self.max_jitter = parse_duration(setting, value)?,
            _ => warn!("Ignoring unknown configuration key services.courier.{}", setting),
        }
        Ok(())
    }

    /// Apply `COURIER_*` overrides read through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        const OVERRIDES: &[(&str, &str)] = &[
            ("COURIER_SERVER_ADDR", "server_addr"),
            ("COURIER_SENDER_ID", "sender_id"),
            ("COURIER_API_KEY", "api_key"),
            ("COURIER_AUTH_DOMAIN", "auth_domain"),
            ("COURIER_SEND_MAX_ATTEMPTS", "send.max_attempts"),
            ("COURIER_SEND_BASE_WAIT", "send.base_wait"),
            ("COURIER_RECONNECT_MAX_ATTEMPTS", "reconnect.max_attempts"),
            ("COURIER_RECONNECT_BASE_WAIT", "reconnect.base_wait"),
            ("COURIER_REPLAY_GRACE", "replay_grace"),
            ("COURIER_MAX_JITTER", "max_jitter"),
        ];

        for (variable, setting) in OVERRIDES {
            if let Some(value) = lookup(variable) {
                self.apply_setting(setting, &value)
                    .with_context(|| format!("invalid value in {}", variable))?;
                if *variable != "COURIER_API_KEY" {
                    info!("{} overridden by environment: {}", setting, value);
                }
            }
        }
        Ok(())
    }
}

fn parse_attempts(setting: &str, value: &str) -> Result<u32> {
    let attempts: u32 = value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a positive integer, got {:?}", setting, value))?;
    anyhow::ensure!(attempts > 0, "{} must be at least 1", setting);
    Ok(attempts)
}

fn parse_duration(setting: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .with_context(|| format!("{} must be a duration like 500ms or 5s, got {:?}", setting, value))
}
