//! Task correlation: bridging dispatched work and out-of-band responses.
//!
//! A suspended node is represented by its registered wait-ids, not by a
//! blocked task. Responses are matched by wait-id and the node resumes once
//! its whole barrier group has delivered.

mod dispatch;
mod retry;
mod supplier;
mod wait;

#[cfg(test)]
pub use dispatch::MockTaskExecutor;
pub use dispatch::TaskExecutor;
pub use retry::{dispatch_with_retry, BackoffStrategy, JitterStrategy, RetryConfig};
pub use supplier::ResponseSupplier;
pub use wait::{Delivery, ResponseKind, WaitEntry, WaitRegistry};
