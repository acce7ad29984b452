//! Environment-backed runtime configuration.

use std::{
    env,
    error::Error,
    fmt,
    path::PathBuf,
};

use sync_core::{RetryPolicy, driver};

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:4000/rt";
const DEFAULT_API_URL: &str = "http://127.0.0.1:4000";
const DEFAULT_DATA_DIR: &str = "./.livecart-sync-store";
const DEFAULT_LOCAL_USER_ID: &str = "local-user";
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Runtime configuration for the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Websocket origin the namespace connections attach to.
    pub server_url: String,
    /// REST base URL for the order collaborator endpoints.
    pub api_base_url: String,
    /// Optional auth token prefill; `SyncCommand::Connect` overrides it.
    pub auth_token: Option<String>,
    /// Local user id used for sender-echo deduplication.
    pub local_user_id: String,
    /// Directory holding the persisted store sections.
    pub data_dir: PathBuf,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Silence window after which the driver arrival alert re-arms.
    pub driver_inactivity_window_ms: u64,
    /// ETA threshold (minutes) for the driver arrival alert.
    pub arrival_eta_threshold_minutes: u32,
}

impl SyncConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let server_url = optional_trimmed_env("LIVECART_SERVER_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_owned());
        let api_base_url = optional_trimmed_env("LIVECART_API_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_API_URL.to_owned());
        let auth_token = optional_trimmed_env("LIVECART_AUTH_TOKEN", &mut lookup);
        let local_user_id = optional_trimmed_env("LIVECART_USER_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_LOCAL_USER_ID.to_owned());
        let data_dir = optional_trimmed_env("LIVECART_DATA_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let reconnect_max_attempts = parse_optional_u32(
            "LIVECART_RECONNECT_MAX_ATTEMPTS",
            DEFAULT_RECONNECT_MAX_ATTEMPTS,
            &mut lookup,
        )?;
        let reconnect_base_delay_ms = parse_optional_u64(
            "LIVECART_RECONNECT_BASE_DELAY_MS",
            DEFAULT_RECONNECT_BASE_DELAY_MS,
            &mut lookup,
        )?;
        let reconnect_max_delay_ms = parse_optional_u64(
            "LIVECART_RECONNECT_MAX_DELAY_MS",
            DEFAULT_RECONNECT_MAX_DELAY_MS,
            &mut lookup,
        )?;
        let driver_inactivity_window_ms = parse_optional_u64(
            "LIVECART_DRIVER_INACTIVITY_WINDOW_MS",
            driver::DEFAULT_INACTIVITY_WINDOW_MS,
            &mut lookup,
        )?;
        let arrival_eta_threshold_minutes = parse_optional_u32(
            "LIVECART_ARRIVAL_ETA_THRESHOLD",
            driver::DEFAULT_ARRIVAL_ETA_THRESHOLD,
            &mut lookup,
        )?;

        if reconnect_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LIVECART_RECONNECT_MAX_ATTEMPTS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if driver_inactivity_window_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LIVECART_DRIVER_INACTIVITY_WINDOW_MS",
                value: "0".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        Ok(Self {
            server_url,
            api_base_url,
            auth_token,
            local_user_id,
            data_dir,
            reconnect_max_attempts,
            reconnect_base_delay_ms,
            reconnect_max_delay_ms,
            driver_inactivity_window_ms,
            arrival_eta_threshold_minutes,
        })
    }

    /// Backoff policy for the namespace reconnect loops.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.reconnect_base_delay_ms,
            self.reconnect_max_delay_ms,
            self.reconnect_max_attempts,
        )
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u32<F>(key: &'static str, default: u32, lookup: &mut F) -> Result<u32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value.parse::<u32>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_optional_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value.parse::<u64>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}
