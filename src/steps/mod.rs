//! Named business operations. Each is one [`ApiClient`](crate::ApiClient)
//! call; the extractors next to them validate the response shape a later step
//! depends on.

pub mod orders;
pub mod payments;
pub mod shipments;
pub mod webhooks;

use serde_json::Value;

use crate::error::{HarnessError, Result};
use crate::types::ApiResult;

/// `data` as an object, or a contract violation naming the step.
pub(crate) fn data_object<'a>(
    step: &str,
    result: &'a ApiResult,
) -> Result<&'a serde_json::Map<String, Value>> {
    result.data().as_object().ok_or_else(|| {
        HarnessError::contract(step, format!("data is not an object: {}", result.data()))
    })
}

/// `data` as an array; `null` reads as empty.
pub(crate) fn data_rows<'a>(step: &str, result: &'a ApiResult) -> Result<&'a [Value]> {
    match result.data() {
        Value::Array(rows) => Ok(rows),
        Value::Null => Ok(&[]),
        other => Err(HarnessError::contract(
            step,
            format!("data is not a list: {}", other),
        )),
    }
}

/// Fail fast unless the result succeeded with one of `http`.
pub(crate) fn require_success(step: &str, result: &ApiResult, http: &[u16]) -> Result<()> {
    if result.success() && result.status_in(http) {
        Ok(())
    } else {
        Err(HarnessError::contract(
            step,
            format!("expected success with http in {:?}, got {}", http, result.summary()),
        ))
    }
}
