//! Telemetry contract shared with observability backends.
//!
//! Span names and tag keys are part of the public contract: dashboards and
//! the [`MetricsLayer`](crate::MetricsLayer) match on them.

/// `tracing` target used by every event-store span.
pub const EVENT_STORE_TARGET: &str = "eventflow::eventstore";

/// Storage-system identifier recorded on event-store spans.
pub const STORAGE_SYSTEM: &str = "eventstore";

pub mod spans {
    pub const APPEND_EVENTS: &str = "AppendEvents";
    pub const READ_EVENTS: &str = "ReadEvents";
    pub const READ_EVENTS_BACKWARDS: &str = "ReadEventsBackwards";
    pub const TRUNCATE_STREAM: &str = "TruncateStream";
    pub const DELETE_STREAM: &str = "DeleteStream";
    pub const STREAM_EXISTS: &str = "StreamExists";

    /// Emitted by application services around command handling.
    pub const HANDLE_COMMAND: &str = "HandleCommand";

    /// Emitted by the subscription pipeline around handler execution.
    pub const HANDLE_EVENT: &str = "HandleEvent";

    pub const STORE_OPERATIONS: [&str; 6] = [
        APPEND_EVENTS,
        READ_EVENTS,
        READ_EVENTS_BACKWARDS,
        TRUNCATE_STREAM,
        DELETE_STREAM,
        STREAM_EXISTS,
    ];
}

pub mod tags {
    pub const DB_SYSTEM: &str = "db.system";
    pub const DB_OPERATION: &str = "db.operation";
    pub const STREAM: &str = "eventflow.stream";
    pub const COMMAND: &str = "command";
    pub const STATUS_CODE: &str = "otel.status_code";
    pub const ERROR: &str = "error";
}

pub mod histograms {
    /// Event store operation duration (ms), labelled by `operation`.
    pub const EVENT_STORE_DURATION: &str = "eventflow.eventstore.duration_ms";
    /// Application service command duration (ms), labelled by `command`.
    pub const COMMAND_DURATION: &str = "eventflow.appservice.duration_ms";

    pub const OPERATION_LABEL: &str = "operation";
    pub const COMMAND_LABEL: &str = "command";
}
