//! Prometheus metrics for the circuit swarm.
//!
//! Grounded on `src/metrics.rs`'s `lazy_static!` registry +
//! `Once`-guarded `init_metrics`/`encode_metrics` shape.

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::Once;

use crate::circuit::CircuitState;

static INIT: Once = Once::new();

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Current lifecycle state per circuit, one-hot across the five states.
    pub static ref CIRCUIT_STATE: GaugeVec = GaugeVec::new(
        Opts::new("circuit_swarm_circuit_state", "Current lifecycle state (one-hot)"),
        &["circuit", "state"]
    ).expect("metric can be created");

    pub static ref CIRCUIT_REF_COUNT: GaugeVec = GaugeVec::new(
        Opts::new("circuit_swarm_ref_count", "Dialers currently outstanding"),
        &["circuit"]
    ).expect("metric can be created");

    pub static ref CIRCUIT_SOCKET_COUNT: GaugeVec = GaugeVec::new(
        Opts::new("circuit_swarm_socket_count", "Dialers handed out since last restart"),
        &["circuit"]
    ).expect("metric can be created");

    pub static ref RESTARTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("circuit_swarm_restarts_total", "Total circuit restarts"),
        &["circuit"]
    ).expect("metric can be created");

    pub static ref RESURRECTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("circuit_swarm_resurrections_total", "Total restarts triggered by unexpected child exit"),
        &["circuit"]
    ).expect("metric can be created");

    pub static ref TERMINATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("circuit_swarm_terminations_total", "Total permanent circuit terminations"),
        &["circuit", "reason"]
    ).expect("metric can be created");

    pub static ref DRAIN_TIMEOUTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("circuit_swarm_drain_timeouts_total", "Total drain timeouts (ref_count force-reset)"),
        &["circuit"]
    ).expect("metric can be created");
}

pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(CIRCUIT_STATE.clone())).expect("CIRCUIT_STATE registers");
        REGISTRY.register(Box::new(CIRCUIT_REF_COUNT.clone())).expect("CIRCUIT_REF_COUNT registers");
        REGISTRY.register(Box::new(CIRCUIT_SOCKET_COUNT.clone())).expect("CIRCUIT_SOCKET_COUNT registers");
        REGISTRY.register(Box::new(RESTARTS_TOTAL.clone())).expect("RESTARTS_TOTAL registers");
        REGISTRY.register(Box::new(RESURRECTIONS_TOTAL.clone())).expect("RESURRECTIONS_TOTAL registers");
        REGISTRY.register(Box::new(TERMINATIONS_TOTAL.clone())).expect("TERMINATIONS_TOTAL registers");
        REGISTRY.register(Box::new(DRAIN_TIMEOUTS_TOTAL.clone())).expect("DRAIN_TIMEOUTS_TOTAL registers");
        tracing::debug!("circuit swarm metrics initialized");
    });
}

pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("failed to encode metrics: {e}");
        return format!("# error encoding metrics: {e}\n");
    }
    String::from_utf8(buffer).unwrap_or_else(|e| format!("# error converting metrics to utf8: {e}\n"))
}

fn state_label(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Booting => "booting",
        CircuitState::Ready => "ready",
        CircuitState::Draining => "draining",
        CircuitState::Stopped => "stopped",
        CircuitState::Terminated => "terminated",
    }
}

pub fn set_circuit_state(name: &str, state: CircuitState) {
    for candidate in ["booting", "ready", "draining", "stopped", "terminated"] {
        let value = if candidate == state_label(state) { 1.0 } else { 0.0 };
        CIRCUIT_STATE.with_label_values(&[name, candidate]).set(value);
    }
}

pub fn set_ref_count(name: &str, value: i64) {
    CIRCUIT_REF_COUNT.with_label_values(&[name]).set(value as f64);
}

pub fn set_socket_count(name: &str, value: u64) {
    CIRCUIT_SOCKET_COUNT.with_label_values(&[name]).set(value as f64);
}

pub fn inc_restarts(name: &str) {
    RESTARTS_TOTAL.with_label_values(&[name]).inc();
}

pub fn inc_resurrections(name: &str) {
    RESURRECTIONS_TOTAL.with_label_values(&[name]).inc();
}

pub fn inc_terminations(name: &str, reason: &str) {
    TERMINATIONS_TOTAL.with_label_values(&[name, reason]).inc();
}

pub fn inc_drain_timeouts(name: &str) {
    DRAIN_TIMEOUTS_TOTAL.with_label_values(&[name]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_labels_are_one_hot() {
        init_metrics();
        set_circuit_state("tor-test", CircuitState::Ready);
        assert_eq!(CIRCUIT_STATE.with_label_values(&["tor-test", "ready"]).get(), 1.0);
        assert_eq!(CIRCUIT_STATE.with_label_values(&["tor-test", "booting"]).get(), 0.0);
    }

    #[test]
    fn encode_metrics_contains_namespace() {
        init_metrics();
        let output = encode_metrics();
        assert!(output.contains("circuit_swarm_"));
    }
}
