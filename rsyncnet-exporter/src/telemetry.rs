//! Self-telemetry of the exporter process, served on `/metrics`.

use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::metrics::info::Info;
use prometheus_client::registry::Registry;

/// Content type of the OpenMetrics text produced by [`ExporterMetrics::render`].
pub const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildLabels {
    version: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    method: String,
    path: String,
    status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RouteLabels {
    method: String,
    path: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ProbeLabels {
    outcome: String,
}

/// How a probe request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    MissingTarget,
    ForbiddenHost,
    Failure,
}

impl ProbeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeOutcome::Success => "success",
            ProbeOutcome::MissingTarget => "missing_target",
            ProbeOutcome::ForbiddenHost => "forbidden_host",
            ProbeOutcome::Failure => "failure",
        }
    }
}

/// Registry and handles for the exporter's own metrics.
pub struct ExporterMetrics {
    registry: Registry,
    http_requests: Family<RequestLabels, Counter>,
    http_request_duration: Family<RouteLabels, Histogram>,
    probes: Family<ProbeLabels, Counter>,
}

/// Shareable handle to the exporter metrics.
pub type SharedMetrics = Arc<ExporterMetrics>;

impl ExporterMetrics {
    /// Create the registry with all exporter metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let info = Info::new(BuildLabels {
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        registry.register(
            "rsyncnet_exporter",
            "Information about rsync.net-exporter itself",
            info,
        );

        let http_requests = Family::<RequestLabels, Counter>::default();
        registry.register(
            "rsyncnet_exporter_http_requests",
            "HTTP requests handled",
            http_requests.clone(),
        );

        let http_request_duration =
            Family::<RouteLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 12))
            });
        registry.register(
            "rsyncnet_exporter_http_request_duration_seconds",
            "Time spent handling HTTP requests",
            http_request_duration.clone(),
        );

        let probes = Family::<ProbeLabels, Counter>::default();
        registry.register(
            "rsyncnet_exporter_probes",
            "Probe requests by outcome",
            probes.clone(),
        );

        Self {
            registry,
            http_requests,
            http_request_duration,
            probes,
        }
    }

    /// Record one handled HTTP request.
    pub fn observe_request(&self, method: &str, path: &str, status: u16, elapsed: Duration) {
        self.http_requests
            .get_or_create(&RequestLabels {
                method: method.to_string(),
                path: path.to_string(),
                status: status.to_string(),
            })
            .inc();
        self.http_request_duration
            .get_or_create(&RouteLabels {
                method: method.to_string(),
                path: path.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    /// Record the outcome of one probe.
    pub fn record_probe(&self, outcome: ProbeOutcome) {
        self.probes
            .get_or_create(&ProbeLabels {
                outcome: outcome.as_str().to_string(),
            })
            .inc();
    }

    /// Render all exporter metrics in OpenMetrics text format.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for ExporterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_build_info() {
        let metrics = ExporterMetrics::new();
        let output = metrics.render().unwrap();

        assert!(output.contains("# TYPE rsyncnet_exporter info"));
        assert!(output.contains(&format!(
            "rsyncnet_exporter_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        )));
        assert!(output.ends_with("# EOF\n"));
    }

    #[test]
    fn test_observe_request() {
        let metrics = ExporterMetrics::new();
        metrics.observe_request("GET", "/probe", 200, Duration::from_millis(12));
        metrics.observe_request("GET", "/probe", 200, Duration::from_millis(30));
        metrics.observe_request("GET", "/probe", 403, Duration::from_millis(1));

        let output = metrics.render().unwrap();
        assert!(output.contains(
            "rsyncnet_exporter_http_requests_total{method=\"GET\",path=\"/probe\",status=\"200\"} 2"
        ));
        assert!(output.contains(
            "rsyncnet_exporter_http_requests_total{method=\"GET\",path=\"/probe\",status=\"403\"} 1"
        ));
        assert!(output.contains(
            "rsyncnet_exporter_http_request_duration_seconds_count{method=\"GET\",path=\"/probe\"} 3"
        ));
    }

    #[test]
    fn test_record_probe() {
        let metrics = ExporterMetrics::new();
        metrics.record_probe(ProbeOutcome::Success);
        metrics.record_probe(ProbeOutcome::ForbiddenHost);
        metrics.record_probe(ProbeOutcome::ForbiddenHost);

        let output = metrics.render().unwrap();
        assert!(output.contains("rsyncnet_exporter_probes_total{outcome=\"success\"} 1"));
        assert!(output.contains("rsyncnet_exporter_probes_total{outcome=\"forbidden_host\"} 2"));
        assert!(!output.contains("outcome=\"failure\""));
    }
}
