// ABOUTME: Prometheus metrics for stream frames, handlers, reconnects and OAuth refreshes
// ABOUTME: Thin recording helpers over the metrics facade plus the exporter handle

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Safe to call more than once.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    Ok(HANDLE.get_or_init(|| handle).clone())
}

// =============================================================================
// Event stream
// =============================================================================

pub fn record_frame_received() {
    counter!("boardbot_frames_received_total").increment(1);
}

/// `reason` is one of: decode, lane_closed
pub fn record_frame_dropped(reason: &'static str) {
    counter!("boardbot_frames_dropped_total", "reason" => reason).increment(1);
}

pub fn record_event_dispatched(event_type: &str) {
    counter!("boardbot_events_dispatched_total", "event_type" => event_type.to_string())
        .increment(1);
}

pub fn record_handler_failure(handler: &'static str, kind: &'static str) {
    counter!("boardbot_handler_failures_total", "handler" => handler, "kind" => kind)
        .increment(1);
}

pub fn record_reconnect() {
    counter!("boardbot_reconnects_total").increment(1);
}

pub fn set_session_connected(connected: bool) {
    gauge!("boardbot_session_connected").set(if connected { 1.0 } else { 0.0 });
}

// =============================================================================
// Rooms and credentials
// =============================================================================

pub fn set_rooms_tracked(count: usize) {
    gauge!("boardbot_rooms_tracked").set(count as f64);
}

/// `outcome` is one of: success, rejected, transport, missing
pub fn record_token_refresh(outcome: &'static str) {
    counter!("boardbot_token_refreshes_total", "outcome" => outcome).increment(1);
}

/// `outcome` is one of: linked, not_admin, provider_error, missing_params, invalid_state,
/// exchange_failed, store_failed
pub fn record_oauth_callback(outcome: &'static str) {
    counter!("boardbot_oauth_callbacks_total", "outcome" => outcome).increment(1);
}

pub fn record_command(command: &'static str) {
    counter!("boardbot_commands_total", "command" => command).increment(1);
}

pub fn record_error(error_type: &'static str) {
    counter!("boardbot_errors_total", "type" => error_type).increment(1);
}
