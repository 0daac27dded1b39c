use crate::metrics::{MetricsCollector, MetricsSnapshot};
use std::fmt::Write;
use std::sync::Arc;

/// Renders [`MetricsCollector`] counters in the Prometheus text format.
pub struct PrometheusExporter {
    metrics: Arc<MetricsCollector>,
}

impl PrometheusExporter {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self { metrics }
    }

    pub fn render(&self) -> String {
        render_snapshot(&self.metrics.get_metrics_snapshot())
    }
}

fn push_metric(output: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP tlsgate_{} {}", name, help);
    let _ = writeln!(output, "# TYPE tlsgate_{} {}", name, kind);
    let _ = writeln!(output, "tlsgate_{} {}", name, value);
    output.push('\n');
}

pub fn render_snapshot(snapshot: &MetricsSnapshot) -> String {
    let mut output = String::new();

    push_metric(
        &mut output,
        "requests_total",
        "counter",
        "Total number of proxied HTTP requests",
        snapshot.requests_total,
    );
    push_metric(
        &mut output,
        "request_duration_milliseconds",
        "counter",
        "Total time spent handling requests",
        snapshot.requests_duration_ms,
    );
    push_metric(
        &mut output,
        "cache_hits_total",
        "counter",
        "Requests answered from the response cache",
        snapshot.cache_hits,
    );
    push_metric(
        &mut output,
        "cache_misses_total",
        "counter",
        "Cache lookups that went to the backend",
        snapshot.cache_misses,
    );
    push_metric(
        &mut output,
        "rate_limited_total",
        "counter",
        "Requests rejected by the per-client rate limiter",
        snapshot.rate_limited,
    );
    push_metric(
        &mut output,
        "backend_errors_total",
        "counter",
        "Requests that failed talking to the backend",
        snapshot.backend_errors,
    );
    push_metric(
        &mut output,
        "redirects_total",
        "counter",
        "Plaintext requests redirected to HTTPS",
        snapshot.redirects,
    );
    push_metric(
        &mut output,
        "tunnels_opened_total",
        "counter",
        "WebSocket tunnels established",
        snapshot.tunnels_opened,
    );
    push_metric(
        &mut output,
        "active_tunnels",
        "gauge",
        "WebSocket tunnels currently open",
        snapshot.active_tunnels,
    );

    output.push_str("# HELP tlsgate_requests_by_status_total Requests by HTTP status code\n");
    output.push_str("# TYPE tlsgate_requests_by_status_total counter\n");
    for (status, count) in &snapshot.status_codes {
        let _ = writeln!(
            output,
            "tlsgate_requests_by_status_total{{status=\"{}\"}} {}",
            status, count
        );
    }
    output.push('\n');

    let _ = writeln!(
        output,
        "# HELP tlsgate_build_info Build information\n# TYPE tlsgate_build_info gauge\ntlsgate_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    );

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use std::time::Duration;

    #[test]
    fn test_render_contains_counters() {
        let metrics = Arc::new(MetricsCollector::new());
        metrics.record_request(StatusCode::BAD_GATEWAY, Duration::from_millis(3));
        metrics.record_backend_error();

        let text = PrometheusExporter::new(metrics).render();
        assert!(text.contains("tlsgate_requests_total 1\n"));
        assert!(text.contains("tlsgate_backend_errors_total 1\n"));
        assert!(text.contains("tlsgate_requests_by_status_total{status=\"502\"} 1\n"));
        assert!(text.contains("# TYPE tlsgate_active_tunnels gauge\n"));
    }
}
