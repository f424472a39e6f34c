// SPDX-License-Identifier: AGPL-3.0-only
//! Prometheus metrics for WebDAV gate observability.

use prometheus::{CounterVec, Gauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;
use usg_dav_gate::{ConnectionError, GateError, GateMetrics, LoginMethod};

/// Global metrics registry singleton.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    registry: Registry,

    // Login metrics
    pub login_attempts_total: CounterVec,
    pub login_results_total: CounterVec,

    // Connection metrics
    pub connections_rejected_total: CounterVec,
    pub connections_active: Gauge,

    // TLS metrics
    pub tls_verification_failures_total: CounterVec,

    // Request metrics
    pub requests_total: CounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let login_attempts_total = CounterVec::new(
            Opts::new("dav_login_attempts_total", "Login attempts by method"),
            &["method"],
        )
        .expect("metric can be created");

        let login_results_total = CounterVec::new(
            Opts::new(
                "dav_login_results_total",
                "Login results by method and result",
            ),
            &["method", "result"],
        )
        .expect("metric can be created");

        let connections_rejected_total = CounterVec::new(
            Opts::new(
                "dav_connections_rejected_total",
                "Connections rejected by reason",
            ),
            &["reason"],
        )
        .expect("metric can be created");

        let connections_active = Gauge::with_opts(Opts::new(
            "dav_connections_active",
            "Number of active WebDAV connections",
        ))
        .expect("metric can be created");

        let tls_verification_failures_total = CounterVec::new(
            Opts::new(
                "dav_tls_verification_failures_total",
                "TLS client certificate verification failures by reason",
            ),
            &["reason"],
        )
        .expect("metric can be created");

        let requests_total = CounterVec::new(
            Opts::new("dav_requests_total", "Requests by method and status"),
            &["method", "status"],
        )
        .expect("metric can be created");

        registry
            .register(Box::new(login_attempts_total.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(login_results_total.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(connections_rejected_total.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(connections_active.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(tls_verification_failures_total.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(requests_total.clone()))
            .expect("metric can be registered");

        Self {
            registry,
            login_attempts_total,
            login_results_total,
            connections_rejected_total,
            connections_active,
            tls_verification_failures_total,
            requests_total,
        }
    }

    /// Encode all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }
}

/// Result label for a login outcome.
fn result_label(outcome: Option<&GateError>) -> &'static str {
    match outcome {
        None => "success",
        Some(err) if err.is_user_not_found() => "user_not_found",
        Some(GateError::Auth(_)) => "invalid_credentials",
        Some(GateError::Admission(_)) => "denied",
        Some(_) => "error",
    }
}

/// Feeds the gate's counters into the global registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl GateMetrics for PrometheusMetrics {
    fn login_attempt(&self, method: LoginMethod) {
        metrics()
            .login_attempts_total
            .with_label_values(&[method.as_str()])
            .inc();
    }

    fn login_result(&self, method: LoginMethod, outcome: Option<&GateError>) {
        metrics()
            .login_results_total
            .with_label_values(&[method.as_str(), result_label(outcome)])
            .inc();
    }

    fn connection_rejected(&self, err: &ConnectionError) {
        metrics()
            .connections_rejected_total
            .with_label_values(&[err.reason()])
            .inc();
    }

    fn connections_active(&self, count: usize) {
        metrics().connections_active.set(count as f64);
    }

    fn request_completed(&self, method: &str, status: u16) {
        metrics()
            .requests_total
            .with_label_values(&[method, &status.to_string()])
            .inc();
    }
}
