use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::http::ValidatedUrl;
use crate::{
    DEFAULT_COORDINATE_PRECISION, DEFAULT_OVERLAY_CACHE_CAPACITY,
    DEFAULT_PREFERENCE_PUSH_DEBOUNCE_MS, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_VIEWPORT_SETTLE_MS,
    GUEST_PREFERENCES_KEY, MAX_COORDINATE_PRECISION, MAX_REQUEST_TIMEOUT_MS, PENDING_WRITE_KEY,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Timing and storage knobs for the sync engine and overlay fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub preference_push_debounce_ms: u64,
    pub viewport_settle_ms: u64,
    /// Decimal places kept when quantizing viewport bounds into a key.
    pub coordinate_precision: u32,
    /// Recent viewport datasets kept for instant redisplay; 0 disables.
    pub overlay_cache_capacity: usize,
    pub guest_preferences_key: String,
    pub pending_write_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            preference_push_debounce_ms: DEFAULT_PREFERENCE_PUSH_DEBOUNCE_MS,
            viewport_settle_ms: DEFAULT_VIEWPORT_SETTLE_MS,
            coordinate_precision: DEFAULT_COORDINATE_PRECISION,
            overlay_cache_capacity: DEFAULT_OVERLAY_CACHE_CAPACITY,
            guest_preferences_key: GUEST_PREFERENCES_KEY.to_string(),
            pending_write_key: PENDING_WRITE_KEY.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preference_push_debounce_ms == 0 {
            return Err(ConfigError::Validation(
                "preference_push_debounce_ms must be > 0".into(),
            ));
        }
        if self.coordinate_precision > MAX_COORDINATE_PRECISION {
            return Err(ConfigError::Validation(format!(
                "coordinate_precision must be <= {MAX_COORDINATE_PRECISION}"
            )));
        }
        if self.guest_preferences_key.trim().is_empty() || self.pending_write_key.trim().is_empty() {
            return Err(ConfigError::Validation("storage keys cannot be empty".into()));
        }
        if self.guest_preferences_key == self.pending_write_key {
            return Err(ConfigError::Validation(
                "guest and pending slots must use different keys".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn push_debounce(&self) -> Duration {
        Duration::from_millis(self.preference_push_debounce_ms)
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.viewport_settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_url()?;
        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_REQUEST_TIMEOUT_MS {
            return Err(ConfigError::Validation(format!(
                "request_timeout_ms must be in 1..={MAX_REQUEST_TIMEOUT_MS}"
            )));
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<ValidatedUrl, ConfigError> {
        ValidatedUrl::new(&self.base_url).map_err(|e| ConfigError::Validation(e.to_string()))
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
