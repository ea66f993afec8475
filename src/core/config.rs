mod parsing;
mod settings;
mod types;

pub use types::{
    ApiBaseUrl, ApiSettings, CaptureSettings, ConfigError, Environment, FlagSettings,
    RetrySettings, RuntimeSettings, Settings, SubmitSettings, TelemetrySettings,
};
