//! Engine-level event emission.
//!
//! The engine holds its own [`EventSink`]; capabilities that publish events
//! are handed a sink explicitly. There is no process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EmittedEvent, EventSink, LoggingEventSink, NoOpEventSink};
