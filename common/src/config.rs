use std::{path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_API_BASE_URL: &str = "https://api.ecobee.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required setting [{section}] {key}")]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },

    #[error("invalid setting [{section}] {key}: {reason}")]
    Invalid {
        section: &'static str,
        key: &'static str,
        reason: String,
    },
}

/// Hysteresis and polling parameters for the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlConfig {
    /// Deadband half-width in tenths of a degree.
    pub threshold: i32,
    pub check_interval_ms: u64,
    pub tick_ms: u64,
    pub cache_life_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            threshold: 2,
            check_interval_ms: 180_000,
            tick_ms: 1_000,
            cache_life_ms: 180_000,
        }
    }
}

impl ControlConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn cache_life(&self) -> Duration {
        Duration::from_millis(self.cache_life_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub client_id: String,
    pub api_base_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinConfig {
    pub fireplace_pin: u8,
    pub indicator_pin: u8,
    pub button_pin: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub secret_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireplaceConfig {
    pub auth: AuthConfig,
    pub pins: PinConfig,
    pub server: ServerConfig,
    pub control: ControlConfig,
    pub credential_path: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    auth: RawAuth,
    #[serde(default)]
    environment: RawEnvironment,
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    control: RawControl,
}

#[derive(Debug, Default, Deserialize)]
struct RawAuth {
    client_id: Option<String>,
    api_base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnvironment {
    fireplace_pin: Option<u8>,
    indicator_pin: Option<u8>,
    button_pin: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct RawServer {
    host: Option<String>,
    port: Option<u16>,
    secret_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawControl {
    threshold: Option<i32>,
    check_interval_secs: Option<u64>,
    tick_millis: Option<u64>,
    cache_life_secs: Option<u64>,
    credential_path: Option<String>,
}

impl FireplaceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(raw)?;
        let defaults = ControlConfig::default();

        let client_id = required_str(raw.auth.client_id, "auth", "client_id")?;
        let api_base_url = raw
            .auth
            .api_base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        let pins = PinConfig {
            fireplace_pin: required(
                raw.environment.fireplace_pin,
                "environment",
                "fireplace_pin",
            )?,
            indicator_pin: required(
                raw.environment.indicator_pin,
                "environment",
                "indicator_pin",
            )?,
            button_pin: required(
                raw.environment.button_pin,
                "environment",
                "button_pin",
            )?,
        };
        if pins.fireplace_pin == pins.indicator_pin
            || pins.fireplace_pin == pins.button_pin
            || pins.indicator_pin == pins.button_pin
        {
            return Err(ConfigError::Invalid {
                section: "environment",
                key: "fireplace_pin",
                reason: "pin assignments must be distinct".to_string(),
            });
        }

        let server = ServerConfig {
            host: raw.server.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: raw.server.port.unwrap_or(5000),
            secret_key: required_str(raw.server.secret_key, "server", "secret_key")?,
        };

        let threshold = raw.control.threshold.unwrap_or(defaults.threshold);
        if threshold < 0 {
            return Err(ConfigError::Invalid {
                section: "control",
                key: "threshold",
                reason: "must not be negative".to_string(),
            });
        }
        let check_interval_ms = raw
            .control
            .check_interval_secs
            .map(|secs| secs.saturating_mul(1_000))
            .unwrap_or(defaults.check_interval_ms);
        let tick_ms = raw.control.tick_millis.unwrap_or(defaults.tick_ms);
        if tick_ms == 0 || check_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                section: "control",
                key: if tick_ms == 0 {
                    "tick_millis"
                } else {
                    "check_interval_secs"
                },
                reason: "must be greater than zero".to_string(),
            });
        }
        let cache_life_ms = raw
            .control
            .cache_life_secs
            .map(|secs| secs.saturating_mul(1_000))
            .unwrap_or(defaults.cache_life_ms);

        Ok(Self {
            auth: AuthConfig {
                client_id,
                api_base_url,
            },
            pins,
            server,
            control: ControlConfig {
                threshold,
                check_interval_ms,
                tick_ms,
                cache_life_ms,
            },
            credential_path: raw
                .control
                .credential_path
                .unwrap_or_else(|| ".credential.json".to_string()),
        })
    }
}

fn required<T>(
    value: Option<T>,
    section: &'static str,
    key: &'static str,
) -> Result<T, ConfigError> {
    value.ok_or(ConfigError::MissingKey { section, key })
}

fn required_str(
    value: Option<String>,
    section: &'static str,
    key: &'static str,
) -> Result<String, ConfigError> {
    value
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::MissingKey { section, key })
}
