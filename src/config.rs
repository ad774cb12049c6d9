use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::{
    AppError, ErrorKind, DEFAULT_CANCEL_REASONS, DEFAULT_OFFER_STATUS_FILTER, DEFAULT_ROUTE_MODE,
    MAX_COUNTDOWN_DISPLAY_SECS,
};

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid base_url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("{0}")]
    Validation(String),
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Configuration, e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub offer_poll_interval_ms: u64,
    pub location_ping_interval_ms: u64,
    pub countdown_tick_ms: u64,
    pub expiry_skew_ms: u64,
    pub max_countdown_display_secs: i64,
    pub offer_status_filter: String,
    pub route_mode: String,
    pub device_name: String,
    pub fallback_cancel_reasons: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dispatch.example.com/".to_string(),
            request_timeout_ms: 30_000,
            offer_poll_interval_ms: 5_000,
            location_ping_interval_ms: 12_000,
            countdown_tick_ms: 1_000,
            expiry_skew_ms: 1_000,
            max_countdown_display_secs: MAX_COUNTDOWN_DISPLAY_SECS,
            offer_status_filter: DEFAULT_OFFER_STATUS_FILTER.to_string(),
            route_mode: DEFAULT_ROUTE_MODE.to_string(),
            device_name: "driver-app".to_string(),
            fallback_cancel_reasons: DEFAULT_CANCEL_REASONS
                .iter()
                .map(|r| (*r).to_string())
                .collect(),
        }
    }
}

impl DispatchConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_url()?;
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Validation("request_timeout_ms must be > 0".into()));
        }
        if self.offer_poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "offer_poll_interval_ms must be > 0".into(),
            ));
        }
        if self.location_ping_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "location_ping_interval_ms must be > 0".into(),
            ));
        }
        if self.countdown_tick_ms == 0 {
            return Err(ConfigError::Validation("countdown_tick_ms must be > 0".into()));
        }
        if self.expiry_skew_ms >= self.offer_poll_interval_ms {
            return Err(ConfigError::Validation(
                "expiry_skew_ms must be smaller than offer_poll_interval_ms".into(),
            ));
        }
        if self.max_countdown_display_secs <= 0 {
            return Err(ConfigError::Validation(
                "max_countdown_display_secs must be > 0".into(),
            ));
        }
        if self.offer_status_filter.trim().is_empty() {
            return Err(ConfigError::Validation(
                "offer_status_filter cannot be empty".into(),
            ));
        }
        if self.fallback_cancel_reasons.iter().all(|r| r.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "fallback_cancel_reasons needs at least one reason".into(),
            ));
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        if url.cannot_be_a_base() {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: "URL cannot be used as a base".into(),
            });
        }
        Ok(url)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn offer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.offer_poll_interval_ms)
    }

    #[must_use]
    pub const fn location_ping_interval(&self) -> Duration {
        Duration::from_millis(self.location_ping_interval_ms)
    }

    #[must_use]
    pub const fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }

    #[must_use]
    pub fn expiry_skew(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.expiry_skew_ms).unwrap_or(i64::MAX))
    }

    #[must_use]
    pub fn cancel_reason_fallbacks(&self) -> Vec<String> {
        self.fallback_cancel_reasons
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect()
    }
}
