//! Metrics recording and the optional Prometheus endpoint.
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed.

#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
#[cfg(feature = "prometheus")]
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

pub fn record_session_open() {
    metrics::gauge!("parley_sessions_active").increment(1.0);
    metrics::counter!("parley_sessions_total").increment(1);
}

pub fn record_session_close(duration_secs: f64) {
    metrics::gauge!("parley_sessions_active").decrement(1.0);
    metrics::histogram!("parley_session_duration_seconds").record(duration_secs);
}

/// Session creation refused (bad configuration, backend open failure).
pub fn record_session_rejected() {
    metrics::counter!("parley_sessions_rejected_total").increment(1);
}

pub fn record_turn_started() {
    metrics::counter!("parley_turns_started_total").increment(1);
}

pub fn record_turn_completed(duration_secs: f64) {
    metrics::counter!("parley_turns_completed_total").increment(1);
    metrics::histogram!("parley_turn_duration_seconds").record(duration_secs);
}

pub fn record_turn_failed(stage: &str) {
    let labels = [("stage", stage.to_string())];
    metrics::counter!("parley_turns_failed_total", &labels).increment(1);
}

pub fn record_barge_in() {
    metrics::counter!("parley_barge_ins_total").increment(1);
}

/// Time from final transcript to the first audio frame sent to the client.
pub fn record_first_audio_latency(secs: f64) {
    metrics::histogram!("parley_first_audio_latency_seconds").record(secs);
}

pub fn record_upstream_failure(upstream: &str) {
    let labels = [("upstream", upstream.to_string())];
    metrics::counter!("parley_upstream_failures_total", &labels).increment(1);
}

/// Audio frames dropped by direction ("to_client", "to_recognition", "stale").
pub fn record_dropped_frames(direction: &str, count: u64) {
    if count == 0 {
        return;
    }
    let labels = [("direction", direction.to_string())];
    metrics::counter!("parley_dropped_frames_total", &labels).increment(count);
}
