use crate::error::ConfigError;
use crate::protocol::{CLIENT_TO_SERVER_CAP, SERVER_TO_CLIENT_CAP};
use serde::Deserialize;
use std::time::Duration;

pub const URL_VAR: &str = "PROJECTION_SYNC_URL";
pub const MAX_ATTEMPTS_VAR: &str = "PROJECTION_RECONNECT_MAX_ATTEMPTS";
pub const BASE_MS_VAR: &str = "PROJECTION_RECONNECT_BASE_MS";
pub const MAX_MS_VAR: &str = "PROJECTION_RECONNECT_MAX_MS";
pub const POLICY_VAR: &str = "PROJECTION_RECONNECT_POLICY";

const DEFAULT_URL: &str = "ws://127.0.0.1:4000/projection/socket";
const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_BASE_MS: u64 = 1_000;
const DEFAULT_MAX_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub url: String,
    pub reconnect: ReconnectConfig,
    pub max_inbound_frame: usize,
    pub max_outbound_frame: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            max_inbound_frame: SERVER_TO_CLIENT_CAP,
            max_outbound_frame: CLIENT_TO_SERVER_CAP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub policy: BackoffPolicy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            policy: BackoffPolicy::Exponential {
                base_ms: DEFAULT_BASE_MS,
                factor: 2,
                max_ms: DEFAULT_MAX_MS,
            },
        }
    }
}

/// Delay before reconnect attempt `n` (1-based). No jitter, so the schedule is
/// reproducible in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed { interval_ms: u64 },
    Exponential { base_ms: u64, factor: u32, max_ms: u64 },
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { interval_ms } => Duration::from_millis(interval_ms),
            Self::Exponential {
                base_ms,
                factor,
                max_ms,
            } => {
                let multiplier = u64::from(factor).saturating_pow(attempt.saturating_sub(1));
                Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
            }
        }
    }
}

impl SyncConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Defaults overridden by the `PROJECTION_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup(URL_VAR).filter(|url| !url.is_empty()) {
            config.url = url;
        }

        if let Some(max_attempts) = parse_var(&lookup, MAX_ATTEMPTS_VAR)? {
            config.reconnect.max_attempts = max_attempts;
        }

        let base_ms = parse_var(&lookup, BASE_MS_VAR)?.unwrap_or(DEFAULT_BASE_MS);
        let max_ms = parse_var(&lookup, MAX_MS_VAR)?.unwrap_or(DEFAULT_MAX_MS);

        config.reconnect.policy = match lookup(POLICY_VAR).as_deref() {
            None | Some("") | Some("exponential") => BackoffPolicy::Exponential {
                base_ms,
                factor: 2,
                max_ms,
            },
            Some("fixed") => BackoffPolicy::Fixed {
                interval_ms: base_ms,
            },
            Some("off") => {
                config.reconnect.enabled = false;
                config.reconnect.policy
            }
            Some(other) => {
                return Err(ConfigError::InvalidVar {
                    var: POLICY_VAR,
                    value: other.to_string(),
                });
            }
        };

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar { var, value: raw }),
    }
}
