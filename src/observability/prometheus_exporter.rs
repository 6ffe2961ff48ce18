//! Prometheus metrics exporter
//!
//! Renders the [`MetricsRegistry`] in Prometheus text exposition format for
//! `/health/metrics` and as a flat JSON object for `/health/metrics/json`.

use std::fmt::Write;
use std::sync::Arc;

use tokio::time::Instant;

use super::metrics::MetricsRegistry;

/// Configuration for Prometheus exporter
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Emit a process uptime gauge ahead of the registry metrics
    pub include_uptime: bool,
    /// Emit a build info gauge carrying the crate version as a label
    pub include_build_info: bool,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            include_uptime: true,
            include_build_info: true,
        }
    }
}

/// Prometheus metrics exporter
///
/// Formats metrics in Prometheus text exposition format for scraping
/// by Prometheus or compatible monitoring systems.
pub struct PrometheusExporter {
    /// Configuration
    config: PrometheusConfig,
    /// Registry being exported
    metrics: Arc<MetricsRegistry>,
    /// When the exporter was created, used for the uptime gauge
    started_at: Instant,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    pub fn new(config: PrometheusConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            config,
            metrics,
            started_at: Instant::now(),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let mut output = String::new();
        let prefix = self.metrics.namespace();

        self.export_process_metrics(&mut output, prefix);

        match self.metrics.encode_text() {
            Ok(registry_metrics) => output.push_str(&registry_metrics),
            Err(e) => tracing::warn!(error = %e, "Failed to encode registry metrics"),
        }

        output
    }

    /// Export the gauges that are computed at scrape time rather than stored
    fn export_process_metrics(&self, output: &mut String, prefix: &str) {
        if self.config.include_uptime {
            let _ = writeln!(
                output,
                "# HELP {}_uptime_seconds Process uptime in seconds",
                prefix
            );
            let _ = writeln!(output, "# TYPE {}_uptime_seconds gauge", prefix);
            let _ = writeln!(
                output,
                "{}_uptime_seconds {}",
                prefix,
                self.started_at.elapsed().as_secs()
            );
        }

        if self.config.include_build_info {
            let _ = writeln!(
                output,
                "# HELP {}_build_info Build information",
                prefix
            );
            let _ = writeln!(output, "# TYPE {}_build_info gauge", prefix);
            let _ = writeln!(
                output,
                "{}_build_info{{version=\"{}\"}} 1",
                prefix,
                env!("CARGO_PKG_VERSION")
            );
        }
    }

    /// Export metrics as a flat JSON object
    pub fn export_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        if self.config.include_uptime {
            map.insert(
                format!("{}_uptime_seconds", self.metrics.namespace()),
                serde_json::json!(self.started_at.elapsed().as_secs()),
            );
        }
        for (name, value) in self.metrics.snapshot() {
            map.insert(name, serde_json::json!(value));
        }
        serde_json::Value::Object(map)
    }

    /// Export metrics as HTTP response body with correct content type
    pub fn export_http(&self) -> (String, &'static str) {
        let body = self.export();
        let content_type = "text/plain; version=0.0.4; charset=utf-8";
        (body, content_type)
    }
}
