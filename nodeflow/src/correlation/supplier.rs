//! Lazy access to delivered responses.

use crate::core::{FailureType, ResponseData, ResponseMap};
use crate::errors::ResponseError;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;

/// Hands delivered responses to a step callback without interpreting them.
///
/// Error payloads and decoding problems surface only when the step calls
/// [`get`](Self::get) or [`get_as`](Self::get_as), inside the callback. The
/// engine's failure capture and capability wrapping therefore apply to them.
#[derive(Debug, Clone, Default)]
pub struct ResponseSupplier {
    responses: ResponseMap,
}

impl ResponseSupplier {
    /// Wraps the responses delivered for one barrier group.
    #[must_use]
    pub fn new(responses: ResponseMap) -> Self {
        Self { responses }
    }

    /// A supplier with nothing delivered.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the payload of the delivered response.
    ///
    /// When several responses were delivered, the one with the smallest
    /// wait-id is returned.
    ///
    /// # Errors
    ///
    /// Returns the carried error for an error response, or
    /// [`ResponseError::missing`] when nothing was delivered.
    pub fn get(&self) -> Result<serde_json::Value, ResponseError> {
        self.raw().ok_or_else(ResponseError::missing)?.payload()
    }

    /// Decodes the delivered payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`get`](Self::get), plus an `UNKNOWN`
    /// failure when the payload does not match `T`.
    pub fn get_as<T: DeserializeOwned>(&self) -> Result<T, ResponseError> {
        let payload = self.get()?;
        serde_json::from_value(payload).map_err(|e| {
            ResponseError::new(
                format!("Failed to decode response: {e}"),
                BTreeSet::from([FailureType::Unknown]),
            )
        })
    }

    /// Returns the raw delivered response without surfacing errors.
    #[must_use]
    pub fn raw(&self) -> Option<&ResponseData> {
        self.responses.values().next()
    }

    /// Returns every delivered response keyed by wait-id.
    #[must_use]
    pub fn responses(&self) -> &ResponseMap {
        &self.responses
    }

    /// Returns true if nothing was delivered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_supplier_reports_missing() {
        let supplier = ResponseSupplier::empty();
        assert!(supplier.is_empty());
        assert_eq!(supplier.get().unwrap_err(), ResponseError::missing());
    }

    #[test]
    fn test_error_surfaces_only_on_get() {
        let mut responses = ResponseMap::new();
        responses.insert(
            "w1".to_string(),
            ResponseData::error("task failed", [FailureType::ConnectivityError]),
        );
        let supplier = ResponseSupplier::new(responses);

        assert!(supplier.raw().is_some());
        let err = supplier.get().unwrap_err();
        assert!(err.failure_types.contains(&FailureType::ConnectivityError));
    }

    #[test]
    fn test_get_as_decodes_payload() {
        let mut responses = ResponseMap::new();
        responses.insert("w1".to_string(), ResponseData::task(serde_json::json!(42)));
        let supplier = ResponseSupplier::new(responses);

        assert_eq!(supplier.get_as::<u32>().unwrap(), 42);
        let err = supplier.get_as::<String>().unwrap_err();
        assert!(err.failure_types.contains(&FailureType::Unknown));
    }
}
