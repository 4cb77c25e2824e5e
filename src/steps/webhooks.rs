//! Signed carrier-tracking webhook delivery.

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::checker::Expectation;
use crate::client::{ApiClient, ApiRequest};
use crate::error::Result;
use crate::types::ApiResult;

pub const SIGN_HEADER: &str = "sign";
pub const TRACKING_PATH: &str = "/webhooks/17track";
pub const DELIVERED: Expectation = Expectation::ok(&[200], &[]);
/// Duplicate deliveries that lose the dedup race may be refused with a conflict.
pub const CONFLICT_HTTP: u16 = 409;

/// Lower-case hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// A body and the signature computed over exactly those bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    pub raw: Vec<u8>,
    pub sign: String,
}

impl SignedPayload {
    /// `sign = hex(sha256(raw + "/" + secret))`
    pub fn sign(raw: Vec<u8>, secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(&raw);
        hasher.update(b"/");
        hasher.update(secret.as_bytes());
        Self {
            sign: format!("{:x}", hasher.finalize()),
            raw,
        }
    }

    /// Correlation key the backend records for this delivery.
    pub fn source_ref(&self) -> String {
        format!("17track:{}", sha256_hex(&self.raw))
    }
}

/// Compact JSON for a "picked up" tracking update.
pub fn picked_up_event(tracking_no: &str, carrier_code: &str) -> Vec<u8> {
    let body = json!({
        "event": "TRACKING_UPDATED",
        "data": {
            "number": tracking_no,
            "carrier": carrier_code,
            "track_info": {
                "latest_status": {"sub_status": "InTransit_PickedUp"},
                "latest_event": {
                    "time_iso": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
                },
            },
        },
    });
    body.to_string().into_bytes()
}

/// Deliver the exact signed bytes. No anti-forgery token; the signature authenticates.
pub async fn deliver(client: &ApiClient, payload: &SignedPayload) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::post(TRACKING_PATH)
                .without_csrf()
                .header(SIGN_HEADER, payload.sign.clone())
                .header("Content-Type", "application/json")
                .raw(payload.raw.clone()),
        )
        .await
}

/// Whether a duplicate delivery outcome is acceptable.
///
/// Strict mode demands 200 + success from every copy; otherwise a refused
/// conflict is tolerated.
pub fn duplicate_acceptable(result: &ApiResult, strict: bool) -> bool {
    let delivered = result.success() && result.status_in(DELIVERED.http);
    delivered || (!strict && !result.success() && result.status == Some(CONFLICT_HTTP))
}
