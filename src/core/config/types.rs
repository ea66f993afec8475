use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Settings {
    pub(super) runtime: RuntimeSettings,
    pub(super) api: ApiSettings,
    pub(super) capture: CaptureSettings,
    pub(super) retry: RetrySettings,
    pub(super) submit: SubmitSettings,
    pub(super) flags: FlagSettings,
    pub(super) telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub base_url: ApiBaseUrl,
    pub token: String,
    pub connect_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub questions_page_size: u32,
}

/// Durations and size bounds for one spoken-answer capture.
///
/// Questions may override the three durations through their constraints;
/// the byte bounds are global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub prep_seconds: u64,
    pub min_duration_seconds: u64,
    pub max_duration_seconds: u64,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub auto_advance_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitSettings {
    pub timeout_retry_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct FlagSettings {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub log_level: String,
    pub json: bool,
    pub prometheus_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub environment: Environment,
    pub strict_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Test => "test",
        }
    }

    pub(super) fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Root URL of the remote attempt service, always without a trailing slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiBaseUrl(String);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid api base url: {0}")]
    InvalidBaseUrl(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("missing required secret for {0}")]
    MissingSecret(&'static str),
}

impl ApiBaseUrl {
    pub(super) fn parse(value: String) -> Result<Self, ConfigError> {
        let trimmed = value.trim().trim_end_matches('/');
        let parsed =
            reqwest::Url::parse(trimmed).map_err(|_| ConfigError::InvalidBaseUrl(value.clone()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBaseUrl(value));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ApiSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl CaptureSettings {
    pub fn auto_advance_delay(&self) -> Duration {
        Duration::from_millis(self.auto_advance_delay_ms)
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            prep_seconds: 5,
            min_duration_seconds: 10,
            max_duration_seconds: 30,
            min_bytes: 1024,
            max_bytes: 10 * 1024 * 1024,
            auto_advance_delay_ms: 1500,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 4, base_delay_ms: 1000, max_delay_ms: 16_000 }
    }
}

impl SubmitSettings {
    pub fn timeout_retry_delay(&self) -> Duration {
        Duration::from_millis(self.timeout_retry_delay_ms)
    }
}

impl Default for SubmitSettings {
    fn default() -> Self {
        Self { timeout_retry_delay_ms: 1000 }
    }
}
