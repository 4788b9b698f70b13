use std::time::Duration;

use serde::{Deserialize, Deserializer, de};

use eventflow_core::StreamName;
use eventflow_subscriptions::CheckpointCommitOptions;
use eventflow_subscriptions::checkpoint::millis;

/// Configuration of one catch-up subscription.
///
/// Deserializes from a config section; durations are given in milliseconds
/// (`poll_interval_ms`, `resubscribe_delay_ms`). Only `subscription_id` and
/// `stream` are required.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamSubscriptionOptions {
    /// Checkpoint key; must be unique per logical consumer.
    pub subscription_id: String,

    pub stream: StreamName,

    /// Events requested per read; at least 1.
    #[serde(default = "defaults::page_size", deserialize_with = "positive")]
    pub page_size: usize,

    /// How long to wait before reading again once caught up.
    #[serde(
        rename = "poll_interval_ms",
        default = "defaults::poll_interval",
        deserialize_with = "millis::deserialize"
    )]
    pub poll_interval: Duration,

    /// Treat deserialization and handler failures as fatal.
    #[serde(default)]
    pub throw_on_error: bool,

    /// Skip `$`-prefixed event types.
    #[serde(default = "defaults::ignore_system_events")]
    pub ignore_system_events: bool,

    #[serde(default)]
    pub checkpoint: CheckpointCommitOptions,

    /// Delay before resubscribing after a connection-lost drop.
    #[serde(
        rename = "resubscribe_delay_ms",
        default = "defaults::resubscribe_delay",
        deserialize_with = "millis::deserialize"
    )]
    pub resubscribe_delay: Duration,
}

fn positive<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    match usize::deserialize(deserializer)? {
        0 => Err(de::Error::invalid_value(
            de::Unexpected::Unsigned(0),
            &"a page size of at least 1",
        )),
        n => Ok(n),
    }
}

mod defaults {
    use std::time::Duration;

    pub fn page_size() -> usize {
        500
    }

    pub fn poll_interval() -> Duration {
        Duration::from_millis(100)
    }

    pub fn ignore_system_events() -> bool {
        true
    }

    pub fn resubscribe_delay() -> Duration {
        Duration::from_secs(1)
    }
}

impl StreamSubscriptionOptions {
    pub fn new(subscription_id: impl Into<String>, stream: StreamName) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            stream,
            page_size: defaults::page_size(),
            poll_interval: defaults::poll_interval(),
            throw_on_error: false,
            ignore_system_events: defaults::ignore_system_events(),
            checkpoint: CheckpointCommitOptions::default(),
            resubscribe_delay: defaults::resubscribe_delay(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = throw;
        self
    }

    pub fn ignore_system_events(mut self, ignore: bool) -> Self {
        self.ignore_system_events = ignore;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointCommitOptions) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let options: StreamSubscriptionOptions =
            serde_json::from_str(r#"{"subscription_id":"orders","stream":"order-1"}"#).unwrap();

        assert_eq!(
            options,
            StreamSubscriptionOptions::new("orders", StreamName::new("order-1").unwrap())
        );
        assert_eq!(options.page_size, 500);
        assert_eq!(options.poll_interval, Duration::from_millis(100));
        assert!(options.ignore_system_events);
        assert!(!options.throw_on_error);
    }

    #[test]
    fn durations_are_milliseconds() {
        let options: StreamSubscriptionOptions = serde_json::from_str(
            r#"{
                "subscription_id": "orders",
                "stream": "order-1",
                "poll_interval_ms": 25,
                "resubscribe_delay_ms": 10,
                "checkpoint": { "batch_size": 7, "interval_ms": 250 }
            }"#,
        )
        .unwrap();

        assert_eq!(options.poll_interval, Duration::from_millis(25));
        assert_eq!(options.resubscribe_delay, Duration::from_millis(10));
        assert_eq!(options.checkpoint.batch_size, 7);
        assert_eq!(options.checkpoint.interval, Duration::from_millis(250));
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let result: Result<StreamSubscriptionOptions, _> =
            serde_json::from_str(r#"{"subscription_id":"orders","stream":"order-1","page_size":0}"#);
        assert!(result.is_err());

        let options = StreamSubscriptionOptions::new("orders", StreamName::new("order-1").unwrap()).with_page_size(0);
        assert_eq!(options.page_size, 1);
    }

    #[test]
    fn empty_stream_name_is_rejected() {
        let result: Result<StreamSubscriptionOptions, _> =
            serde_json::from_str(r#"{"subscription_id":"orders","stream":""}"#);
        assert!(result.is_err());
    }
}
