//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::metrics::MetricsLayer;

/// Initialize tracing/logging for the process.
///
/// JSON logs with timestamps, filtered via `RUST_LOG` (default `info`), plus
/// the [`MetricsLayer`] that turns event-store and command spans into
/// duration histograms.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt = tracing_subscriber::fmt::layer()
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .with(MetricsLayer::new())
        .try_init();
}
