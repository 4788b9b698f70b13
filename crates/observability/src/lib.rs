//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability (tracing/logging + span metrics).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Span-duration histograms.
pub mod metrics;

/// Stable span names, tag keys and histogram names.
pub mod telemetry;

pub use self::metrics::{HistogramSink, MetricsFacadeSink, MetricsLayer};
