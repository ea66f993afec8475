use std::path::PathBuf;

use super::parsing::{env_optional, env_or_default, parse_bool, parse_environment, parse_u32, parse_u64};
use super::types::{
    ApiBaseUrl, ApiSettings, CaptureSettings, ConfigError, FlagSettings, RetrySettings,
    RuntimeSettings, Settings, SubmitSettings, TelemetrySettings,
};

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let environment = parse_environment(
            env_optional("EXAM_SESSION_ENV").or_else(|| env_optional("ENVIRONMENT")),
        );
        let strict_config = env_optional("EXAM_SESSION_STRICT_CONFIG")
            .map(|value| parse_bool(&value))
            .unwrap_or(false)
            || environment.is_production();

        let base_url = env_or_default("EXAM_API_BASE_URL", "http://localhost:8000/api/v1");
        let token = env_or_default("EXAM_API_TOKEN", "");
        let connect_timeout_seconds = parse_u64(
            "EXAM_API_CONNECT_TIMEOUT_SECONDS",
            env_or_default("EXAM_API_CONNECT_TIMEOUT_SECONDS", "10"),
        )?;
        let request_timeout_seconds = parse_u64(
            "EXAM_API_REQUEST_TIMEOUT_SECONDS",
            env_or_default("EXAM_API_REQUEST_TIMEOUT_SECONDS", "30"),
        )?;
        let questions_page_size = parse_u32(
            "EXAM_QUESTIONS_PAGE_SIZE",
            env_or_default("EXAM_QUESTIONS_PAGE_SIZE", "50"),
        )?;

        let defaults = CaptureSettings::default();
        let capture = CaptureSettings {
            prep_seconds: parse_u64(
                "CAPTURE_PREP_SECONDS",
                env_or_default("CAPTURE_PREP_SECONDS", &defaults.prep_seconds.to_string()),
            )?,
            min_duration_seconds: parse_u64(
                "CAPTURE_MIN_DURATION_SECONDS",
                env_or_default(
                    "CAPTURE_MIN_DURATION_SECONDS",
                    &defaults.min_duration_seconds.to_string(),
                ),
            )?,
            max_duration_seconds: parse_u64(
                "CAPTURE_MAX_DURATION_SECONDS",
                env_or_default(
                    "CAPTURE_MAX_DURATION_SECONDS",
                    &defaults.max_duration_seconds.to_string(),
                ),
            )?,
            min_bytes: parse_u64(
                "CAPTURE_MIN_BYTES",
                env_or_default("CAPTURE_MIN_BYTES", &defaults.min_bytes.to_string()),
            )?,
            max_bytes: parse_u64(
                "CAPTURE_MAX_BYTES",
                env_or_default("CAPTURE_MAX_BYTES", &defaults.max_bytes.to_string()),
            )?,
            auto_advance_delay_ms: parse_u64(
                "CAPTURE_AUTO_ADVANCE_MS",
                env_or_default(
                    "CAPTURE_AUTO_ADVANCE_MS",
                    &defaults.auto_advance_delay_ms.to_string(),
                ),
            )?,
        };

        let retry_defaults = RetrySettings::default();
        let retry = RetrySettings {
            max_attempts: parse_u32(
                "RETRY_MAX_ATTEMPTS",
                env_or_default("RETRY_MAX_ATTEMPTS", &retry_defaults.max_attempts.to_string()),
            )?,
            base_delay_ms: parse_u64(
                "RETRY_BASE_DELAY_MS",
                env_or_default("RETRY_BASE_DELAY_MS", &retry_defaults.base_delay_ms.to_string()),
            )?,
            max_delay_ms: parse_u64(
                "RETRY_MAX_DELAY_MS",
                env_or_default("RETRY_MAX_DELAY_MS", &retry_defaults.max_delay_ms.to_string()),
            )?,
        };

        let timeout_retry_delay_ms = parse_u64(
            "SUBMIT_RETRY_DELAY_MS",
            env_or_default("SUBMIT_RETRY_DELAY_MS", "1000"),
        )?;

        let flags_path = PathBuf::from(env_or_default(
            "CALIBRATION_FLAGS_PATH",
            ".exam_session/calibration.json",
        ));

        let log_level = env_or_default("EXAM_SESSION_LOG_LEVEL", "info");
        let json =
            env_optional("EXAM_SESSION_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings {
                base_url: ApiBaseUrl::parse(base_url)?,
                token,
                connect_timeout_seconds,
                request_timeout_seconds,
                questions_page_size,
            },
            capture,
            retry,
            submit: SubmitSettings { timeout_retry_delay_ms },
            flags: FlagSettings { path: flags_path },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;

        Ok(settings)
    }

    pub fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub fn capture(&self) -> &CaptureSettings {
        &self.capture
    }

    pub fn retry(&self) -> &RetrySettings {
        &self.retry
    }

    pub fn submit(&self) -> &SubmitSettings {
        &self.submit
    }

    pub fn flags(&self) -> &FlagSettings {
        &self.flags
    }

    pub fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        validate_capture(&self.capture)?;

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "RETRY_MAX_ATTEMPTS",
                value: self.retry.max_attempts.to_string(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "RETRY_BASE_DELAY_MS",
                value: self.retry.base_delay_ms.to_string(),
            });
        }
        if self.api.questions_page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "EXAM_QUESTIONS_PAGE_SIZE",
                value: String::from("0"),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.api.token.is_empty() {
            return Err(ConfigError::MissingSecret("EXAM_API_TOKEN"));
        }

        Ok(())
    }
}

fn validate_capture(capture: &CaptureSettings) -> Result<(), ConfigError> {
    if capture.max_duration_seconds == 0 {
        return Err(ConfigError::InvalidValue {
            field: "CAPTURE_MAX_DURATION_SECONDS",
            value: String::from("0"),
        });
    }
    if capture.min_duration_seconds > capture.max_duration_seconds {
        return Err(ConfigError::InvalidValue {
            field: "CAPTURE_MIN_DURATION_SECONDS",
            value: capture.min_duration_seconds.to_string(),
        });
    }
    if capture.min_bytes > capture.max_bytes {
        return Err(ConfigError::InvalidValue {
            field: "CAPTURE_MIN_BYTES",
            value: capture.min_bytes.to_string(),
        });
    }
    Ok(())
}

impl Settings {
    /// Default settings pointing at `base_url`, without reading the environment.
    pub fn local(base_url: &str) -> Result<Self, ConfigError> {
        let settings = Self {
            runtime: RuntimeSettings {
                environment: super::types::Environment::Development,
                strict_config: false,
            },
            api: ApiSettings {
                base_url: ApiBaseUrl::parse(base_url.to_string())?,
                token: String::new(),
                connect_timeout_seconds: 10,
                request_timeout_seconds: 30,
                questions_page_size: 50,
            },
            capture: CaptureSettings::default(),
            retry: RetrySettings::default(),
            submit: SubmitSettings::default(),
            flags: FlagSettings { path: PathBuf::from(".exam_session/calibration.json") },
            telemetry: TelemetrySettings {
                log_level: String::from("info"),
                json: false,
                prometheus_enabled: false,
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api.token = token.into();
        self
    }

    pub fn with_capture(mut self, capture: CaptureSettings) -> Result<Self, ConfigError> {
        validate_capture(&capture)?;
        self.capture = capture;
        Ok(self)
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_submit(mut self, submit: SubmitSettings) -> Self {
        self.submit = submit;
        self
    }

    pub fn with_flags_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.flags.path = path.into();
        self
    }
}
