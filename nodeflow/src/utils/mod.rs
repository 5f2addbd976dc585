//! Id generation and timestamp helpers.

use chrono::Utc;
use uuid::Uuid;

/// Generates a runtime id for a node execution or plan execution.
///
/// Runtime ids are UUID v7 so that they sort by creation time.
#[must_use]
pub fn generate_runtime_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generates an opaque wait-id.
#[must_use]
pub fn generate_wait_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Returns the current time as epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
