use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Thin handle around the global metrics recorder. After `Metrics::install()`
/// the `metrics` crate macros (`counter!`, `gauge!`) can be used anywhere in
/// the codebase; the handle is retained only to render `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Installs the global Prometheus recorder and registers metric
    /// descriptions. Must be called once at startup before any
    /// `counter!`/`gauge!` call.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "gatehouse_connections_total",
            Unit::Count,
            "Total connections accepted across all listeners"
        );
        describe_gauge!(
            "gatehouse_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "gatehouse_admission_rejected_total",
            Unit::Count,
            "Total connections rejected by admission control, by reason"
        );
        describe_counter!(
            "gatehouse_requests_total",
            Unit::Count,
            "Total proxy requests served, by kind (connect/forward) and status"
        );

        Self { handle }
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}
