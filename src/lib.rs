pub mod core;
pub mod domain;
pub mod schemas;
pub mod services;
pub mod session;

#[cfg(test)]
mod test_support;

use crate::core::{config::Settings, telemetry};

pub use crate::core::errors::{DeviceFailure, ErrorClass, SessionError};
pub use crate::session::device::{DeviceEvent, DeviceEvents, RecordingDevice};
pub use crate::session::{SessionController, SessionState};

/// Loads `.env` and settings, then installs tracing and the metrics recorder.
pub fn init() -> anyhow::Result<Settings> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    tracing::info!(
        api = %settings.api().base_url.as_str(),
        environment = %settings.runtime().environment.as_str(),
        "Exam session runtime initialized"
    );
    Ok(settings)
}
