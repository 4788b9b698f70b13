//! Duration histograms derived from spans.
//!
//! The [`MetricsLayer`] listens to closed spans instead of being called
//! explicitly, so instrumented code only has to follow the span contract in
//! [`telemetry`](crate::telemetry):
//!
//! - spans with the event-store target feed
//!   `eventflow.eventstore.duration_ms{operation}`
//! - spans named `HandleCommand` feed `eventflow.appservice.duration_ms{command}`

use std::sync::Arc;
use std::time::Instant;

use tracing::field::{Field, Visit};
use tracing::{Subscriber, span};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::telemetry::{EVENT_STORE_TARGET, histograms, spans, tags};

/// Destination for recorded durations.
pub trait HistogramSink: Send + Sync + 'static {
    fn record(&self, histogram: &'static str, label: &'static str, value: String, duration_ms: f64);
}

/// Sink that forwards to the `metrics` facade (whatever recorder is installed).
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsFacadeSink;

impl HistogramSink for MetricsFacadeSink {
    fn record(&self, histogram: &'static str, label: &'static str, value: String, duration_ms: f64) {
        metrics::histogram!(histogram, label => value).record(duration_ms);
    }
}

enum Tracked {
    Store { operation: &'static str },
    Command { command: Option<String> },
}

struct SpanTiming {
    started: Instant,
    tracked: Tracked,
}

/// `tracing-subscriber` layer recording span durations as histograms.
#[derive(Clone)]
pub struct MetricsLayer {
    sink: Arc<dyn HistogramSink>,
}

impl MetricsLayer {
    pub fn new() -> Self {
        Self::with_sink(MetricsFacadeSink)
    }

    pub fn with_sink(sink: impl HistogramSink) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }
}

impl Default for MetricsLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct CommandVisitor(Option<String>);

impl Visit for CommandVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == tags::COMMAND {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn core::fmt::Debug) {
        if field.name() == tags::COMMAND {
            self.0 = Some(format!("{value:?}").trim_matches('"').to_string());
        }
    }
}

impl<S> Layer<S> for MetricsLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let meta = attrs.metadata();
        let tracked = if meta.target() == EVENT_STORE_TARGET {
            Tracked::Store {
                operation: meta.name(),
            }
        } else if meta.name() == spans::HANDLE_COMMAND {
            let mut visitor = CommandVisitor::default();
            attrs.record(&mut visitor);
            Tracked::Command { command: visitor.0 }
        } else {
            return;
        };

        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanTiming {
                started: Instant::now(),
                tracked,
            });
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        if let Some(SpanTiming {
            tracked: Tracked::Command { command },
            ..
        }) = extensions.get_mut::<SpanTiming>()
        {
            let mut visitor = CommandVisitor::default();
            values.record(&mut visitor);
            if visitor.0.is_some() {
                *command = visitor.0;
            }
        }
    }

    fn on_close(&self, id: span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(&id) else {
            return;
        };
        let Some(timing) = span.extensions_mut().remove::<SpanTiming>() else {
            return;
        };

        let elapsed_ms = timing.started.elapsed().as_secs_f64() * 1000.0;
        match timing.tracked {
            Tracked::Store { operation } => self.sink.record(
                histograms::EVENT_STORE_DURATION,
                histograms::OPERATION_LABEL,
                operation.to_string(),
                elapsed_ms,
            ),
            Tracked::Command { command } => self.sink.record(
                histograms::COMMAND_DURATION,
                histograms::COMMAND_LABEL,
                command.unwrap_or_else(|| "unknown".to_string()),
                elapsed_ms,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[derive(Default, Clone)]
    struct Capture(Arc<Mutex<Vec<(&'static str, String)>>>);

    impl HistogramSink for Capture {
        fn record(&self, histogram: &'static str, _label: &'static str, value: String, duration_ms: f64) {
            assert!(duration_ms >= 0.0);
            self.0.lock().unwrap().push((histogram, value));
        }
    }

    #[test]
    fn store_spans_are_recorded_by_operation() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::registry().with(MetricsLayer::with_sink(capture.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let _append = tracing::info_span!(target: "eventflow::eventstore", "AppendEvents").entered();
        });

        let recorded = capture.0.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec![(histograms::EVENT_STORE_DURATION, "AppendEvents".to_string())]
        );
    }

    #[test]
    fn command_spans_use_command_tag() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::registry().with(MetricsLayer::with_sink(capture.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("HandleCommand", command = tracing::field::Empty);
            span.record("command", "PlaceOrder");
            drop(span);
        });

        let recorded = capture.0.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec![(histograms::COMMAND_DURATION, "PlaceOrder".to_string())]
        );
    }

    #[test]
    fn unrelated_spans_are_ignored() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::registry().with(MetricsLayer::with_sink(capture.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let _other = tracing::info_span!("SomethingElse").entered();
        });

        assert!(capture.0.lock().unwrap().is_empty());
    }
}
