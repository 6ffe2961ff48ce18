//! Observability layer
//!
//! Provides the process-wide metrics registry and its exposition formats.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Observability Layer                     │
//! │  ┌────────────────────────┐  ┌────────────────────────┐ │
//! │  │   Prometheus text      │  │      JSON dump         │ │
//! │  │   /health/metrics      │  │  /health/metrics/json  │ │
//! │  └───────────┬────────────┘  └───────────┬────────────┘ │
//! └──────────────┼───────────────────────────┼──────────────┘
//!                └─────────────┬─────────────┘
//!                    ┌─────────▼─────────┐
//!                    │  MetricsRegistry  │
//!                    │ (counters/gauges/ │
//!                    │    histograms)    │
//!                    └───────────────────┘
//! ```

pub mod metrics;
pub mod prometheus_exporter;

pub use metrics::MetricsRegistry;
pub use prometheus_exporter::{PrometheusConfig, PrometheusExporter};
