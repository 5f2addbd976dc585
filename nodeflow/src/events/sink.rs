//! Engine event sinks.

use crate::utils::now_millis;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::Level;

/// An event recorded by [`CollectingEventSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmittedEvent {
    /// Dotted event type, e.g. `rollback.started`.
    pub event_type: String,
    /// Event payload.
    pub data: Option<serde_json::Value>,
    /// Epoch milliseconds at emission.
    pub emitted_at: i64,
}

/// Receives engine-level events such as `rollback.info`,
/// `policy.violation` and `plan.completed`.
///
/// Emitting never fails the caller; a sink logs and drops what it cannot
/// deliver.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Emits an event from synchronous code.
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// Writes events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    fn log(&self, event_type: &str, data: Option<&serde_json::Value>) {
        let data = data.map(ToString::to_string).unwrap_or_default();
        match self.level {
            Level::ERROR => tracing::error!(event_type, %data, "Engine event"),
            Level::WARN => tracing::warn!(event_type, %data, "Engine event"),
            Level::INFO => tracing::info!(event_type, %data, "Engine event"),
            Level::DEBUG => tracing::debug!(event_type, %data, "Engine event"),
            Level::TRACE => tracing::trace!(event_type, %data, "Engine event"),
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log(event_type, data.as_ref());
    }
}

/// Records events in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<EmittedEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<EmittedEvent> {
        self.events.lock().clone()
    }

    /// Returns the events whose type starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<EmittedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event_type.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Forgets every recorded event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.lock().push(EmittedEvent {
            event_type: event_type.to_string(),
            data,
            emitted_at: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit("plan.completed", None).await;
        LoggingEventSink::new(Level::DEBUG)
            .emit("rollback.info", Some(json!({"runtime_id": "n1"})))
            .await;
        LoggingEventSink::default().try_emit("plan.completed", None);
    }

    #[tokio::test]
    async fn test_collecting_sink_filters_by_prefix() {
        let sink = CollectingEventSink::new();
        sink.emit("rollback.info", None).await;
        sink.try_emit("policy.violation", Some(json!({"reason": "x"})));
        sink.emit("rollback.started", None).await;

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("rollback.").len(), 2);
        let events = sink.events();
        assert_eq!(events[1].event_type, "policy.violation");
        assert_eq!(events[1].data, Some(json!({"reason": "x"})));
        assert!(events[0].emitted_at <= events[2].emitted_at);

        sink.clear();
        assert!(sink.is_empty());
    }
}
