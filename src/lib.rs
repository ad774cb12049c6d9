// lib.rs - driver dispatch core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod clock;
pub mod config;
pub mod engine;
pub mod event;
pub mod geo;
pub mod metrics;
pub mod model;
pub mod offers;
pub mod ping;
pub mod ride;
pub mod scheduler;
pub mod session;
pub mod shift;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use capabilities::{ApiClient, CredentialStore, LocationProvider};
pub use config::DispatchConfig;
pub use engine::DispatchEngine;
pub use event::{DispatchEvent, EventBus};

pub const DEFAULT_OFFER_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_LOCATION_PING_INTERVAL: Duration = Duration::from_secs(12);
pub const DEFAULT_COUNTDOWN_TICK: Duration = Duration::from_secs(1);
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(1);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_COUNTDOWN_DISPLAY_SECS: i64 = 300;
pub const MAX_CANCEL_REASON_LENGTH: usize = 160;
pub const DEFAULT_OFFER_STATUS_FILTER: &str = "offered";
pub const DEFAULT_ROUTE_MODE: &str = "driving";
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const COUNTDOWN_PLACEHOLDER: &str = "—";

pub const DEFAULT_CANCEL_REASONS: &[&str] = &[
    "Passenger not responding",
    "Wrong address",
    "Waited too long",
    "Driver emergency",
    "Other…",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Validation,
    ServerRejected,
    NotFound,
    Conflict,
    RateLimited,
    Deserialization,
    Location,
    Configuration,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::ServerRejected => "SERVER_REJECTED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::Location => "LOCATION_ERROR",
            Self::Configuration => "CONFIG_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::Timeout
            | Self::Conflict
            | Self::RateLimited
            | Self::Location => ErrorSeverity::Transient,

            Self::Deserialization | Self::Internal | Self::InvalidState => ErrorSeverity::Fatal,

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::ServerRejected
            | Self::NotFound
            | Self::Configuration
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Conflict | Self::Location
        )
    }

    /// Network-class failures that background workers retry on their next tick.
    #[must_use]
    pub const fn is_transient_network(self) -> bool {
        matches!(self, Self::Network | Self::Timeout)
    }

    #[must_use]
    pub const fn http_status_hint(self) -> Option<u16> {
        match self {
            Self::Authentication => Some(401),
            Self::Authorization => Some(403),
            Self::NotFound => Some(404),
            Self::Conflict => Some(409),
            Self::RateLimited => Some(429),
            Self::Validation => Some(400),
            Self::ServerRejected => Some(422),
            Self::Internal => Some(500),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub retry_after_ms: Option<u64>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            retry_after_ms: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerRejected, message)
    }

    /// A broken internal contract. Callers log these at error level.
    #[must_use]
    pub fn logic_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(self.kind, ErrorKind::Authentication)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => "Your session has expired. Please sign in again.".into(),
            ErrorKind::Authorization => {
                "You don't have permission to perform this action.".into()
            }
            ErrorKind::Validation | ErrorKind::ServerRejected => self.message.clone(),
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Conflict => {
                "This action conflicts with a recent change. Please refresh and try again.".into()
            }
            ErrorKind::RateLimited => {
                if let Some(retry_after) = self.retry_after_ms {
                    let seconds = retry_after / 1000;
                    format!("Too many requests. Please wait {seconds} seconds and try again.")
                } else {
                    "Too many requests. Please wait a moment and try again.".into()
                }
            }
            ErrorKind::Deserialization => {
                "The server sent an unexpected response. Please try again.".into()
            }
            ErrorKind::Location => {
                "Unable to determine your location. Please check your GPS settings.".into()
            }
            ErrorKind::Configuration => {
                "The app is misconfigured. Please contact support.".into()
            }
            ErrorKind::InvalidState => {
                "The app is in an invalid state. Please restart the app.".into()
            }
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let kind = match status {
            400 => ErrorKind::Validation,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Authorization,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            422 => ErrorKind::ServerRejected,
            429 => ErrorKind::RateLimited,
            408 => ErrorKind::Timeout,
            500..=599 => ErrorKind::Internal,
            _ => ErrorKind::Unknown,
        };

        let message = body
            .and_then(|b| serde_json::from_slice::<ApiErrorResponse>(b).ok())
            .and_then(ApiErrorResponse::into_message)
            .unwrap_or_else(|| format!("HTTP error: {status}"));

        Self::new(kind, message).with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

/// Error payload shape used by the backend. Laravel-style validation
/// errors put the text under `message`, older endpoints under `error`.
#[derive(Debug, Clone, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl ApiErrorResponse {
    fn into_message(self) -> Option<String> {
        self.message
            .filter(|m| !m.trim().is_empty())
            .or(self.error.filter(|m| !m.trim().is_empty()))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_maps_to_kind() {
        assert_eq!(AppError::from_http_status(401, None).kind, ErrorKind::Authentication);
        assert_eq!(AppError::from_http_status(422, None).kind, ErrorKind::ServerRejected);
        assert_eq!(AppError::from_http_status(503, None).kind, ErrorKind::Internal);
        assert_eq!(AppError::from_http_status(418, None).kind, ErrorKind::Unknown);
    }

    #[test]
    fn http_body_message_is_used_when_present() {
        let err = AppError::from_http_status(422, Some(br#"{"message":"Offer already taken"}"#));
        assert_eq!(err.message, "Offer already taken");
        assert_eq!(err.user_facing_message(), "Offer already taken");

        let err = AppError::from_http_status(400, Some(br#"{"error":"bad shift"}"#));
        assert_eq!(err.message, "bad shift");

        let err = AppError::from_http_status(500, Some(b"<html>oops</html>"));
        assert_eq!(err.message, "HTTP error: 500");
        assert_eq!(err.context.get("http_status").map(String::as_str), Some("500"));
    }

    #[test]
    fn logic_violations_are_fatal_and_not_retryable() {
        let err = AppError::logic_violation("second presentation");
        assert_eq!(err.severity, ErrorSeverity::Fatal);
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_network_kinds() {
        assert!(ErrorKind::Network.is_transient_network());
        assert!(ErrorKind::Timeout.is_transient_network());
        assert!(!ErrorKind::Authentication.is_transient_network());
        assert!(AppError::new(ErrorKind::Network, "down").is_retryable());
    }

    #[test]
    fn display_includes_internal_detail() {
        let err = AppError::new(ErrorKind::Network, "offline").with_internal("dns failure");
        assert_eq!(err.to_string(), "[NETWORK_ERROR] offline (internal: dns failure)");
    }
}
