//! Logging setup for hosts embedding the engine.

mod tracing;

pub use tracing::{init_tracing, node_span, LogFormat, SpanTimer, DEFAULT_FILTER};
