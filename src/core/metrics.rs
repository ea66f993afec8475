use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) const ANSWER_PERSIST_TOTAL: &str = "exam_session_answer_persist_total";
pub(crate) const STALE_RESPONSES_TOTAL: &str = "exam_session_stale_responses_total";
pub(crate) const UPLOAD_ATTEMPTS_TOTAL: &str = "exam_session_upload_attempts_total";
pub(crate) const UPLOAD_FAILURES_TOTAL: &str = "exam_session_upload_failures_total";
pub(crate) const FORCED_SUBMITS_TOTAL: &str = "exam_session_forced_submits_total";
pub(crate) const SUBMIT_TOTAL: &str = "exam_session_submit_total";

pub fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

pub fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

pub(crate) fn record_persist(outcome: &'static str) {
    metrics::counter!(ANSWER_PERSIST_TOTAL, "outcome" => outcome).increment(1);
}

pub(crate) fn record_stale_response() {
    metrics::counter!(STALE_RESPONSES_TOTAL).increment(1);
}

pub(crate) fn record_upload_attempt() {
    metrics::counter!(UPLOAD_ATTEMPTS_TOTAL).increment(1);
}

pub(crate) fn record_upload_failure() {
    metrics::counter!(UPLOAD_FAILURES_TOTAL).increment(1);
}

pub(crate) fn record_forced_submit() {
    metrics::counter!(FORCED_SUBMITS_TOTAL).increment(1);
}

pub(crate) fn record_submit(outcome: &'static str) {
    metrics::counter!(SUBMIT_TOTAL, "outcome" => outcome).increment(1);
}
