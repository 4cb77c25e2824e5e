use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::error::{HarnessError, Result};

/// Opaque token that makes repeated delivery of one logical mutation safe.
///
/// The client attaches it verbatim; it never generates or rewrites one on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// A fresh random (UUID v4) key.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for IdempotencyKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier handed out by the backend (order number, payment id, shipment id).
///
/// Integers and strings are both rendered as strings so handles of either kind
/// compare the same way in distinctness checks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceHandle(String);

impl ResourceHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Numeric view, for endpoints that take integer ids in their path.
    pub fn as_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }

    /// Build a handle from a JSON scalar. Objects, arrays and null yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl From<String> for ResourceHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ResourceHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for ResourceHandle {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pagination metadata carried by list endpoints.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Meta {
    pub total: Option<i64>,
    pub page: Option<i64>,
    pub size: Option<i64>,
}

/// Response envelope shared by every endpoint:
/// `{success, code, message, data, meta?}`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub code: String,
    pub message: String,
    pub data: Value,
    pub meta: Option<Meta>,
    /// Body text kept verbatim when it was not JSON.
    pub raw: Option<String>,
}

impl Envelope {
    /// Decode from a JSON document, tolerating missing or oddly-typed fields.
    ///
    /// `success` counts only when it is literally `true`; numeric codes are
    /// rendered as strings.
    pub fn from_value(value: Value) -> Self {
        let mut body = match value {
            Value::Object(body) => body,
            other => {
                return Self {
                    data: other,
                    ..Default::default()
                };
            }
        };

        let success = matches!(body.get("success"), Some(Value::Bool(true)));
        let code = match body.remove("code") {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        let message = match body.remove("message") {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        let meta = body
            .remove("meta")
            .and_then(|m| serde_json::from_value::<Meta>(m).ok());

        Self {
            success,
            code,
            message,
            data: body.remove("data").unwrap_or(Value::Null),
            meta,
            raw: None,
        }
    }

    /// Decode a response body: empty decodes to an empty envelope, non-JSON keeps the text.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Self::default();
        }
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Self::from_value(value),
            Err(_) => Self {
                raw: Some(String::from_utf8_lossy(bytes).into_owned()),
                ..Default::default()
            },
        }
    }
}

/// Why a batch member produced no usable HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallFailure {
    /// `TIMEOUT`, `TRANSPORT_ERROR`, `AUTH_ERROR`, `CONTRACT_VIOLATION`, `PANICKED`...
    pub code: String,
    pub message: String,
}

/// Immutable record of one HTTP exchange, or of one failed attempt inside a batch.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResult {
    /// `None` when no response was received.
    pub status: Option<u16>,
    pub envelope: Envelope,
    pub headers: Vec<(String, String)>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub failure: Option<CallFailure>,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u128(d.as_millis())
}

impl ApiResult {
    pub fn new(status: u16, envelope: Envelope, headers: Vec<(String, String)>, elapsed: Duration) -> Self {
        Self {
            status: Some(status),
            envelope,
            headers,
            elapsed,
            failure: None,
        }
    }

    /// A batch slot that never got a response.
    pub fn failed(code: impl Into<String>, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: None,
            envelope: Envelope::default(),
            headers: Vec::new(),
            elapsed,
            failure: Some(CallFailure {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    pub fn from_error(err: &HarnessError, elapsed: Duration) -> Self {
        Self::failed(err.code(), err.to_string(), elapsed)
    }

    pub fn success(&self) -> bool {
        self.failure.is_none() && self.envelope.success
    }

    /// Symbolic result code; for failed attempts, the failure code.
    pub fn code(&self) -> &str {
        match &self.failure {
            Some(f) => &f.code,
            None => &self.envelope.code,
        }
    }

    pub fn data(&self) -> &Value {
        &self.envelope.data
    }

    pub fn meta_total(&self) -> Option<i64> {
        self.envelope.meta.as_ref().and_then(|m| m.total)
    }

    pub fn status_in(&self, allowed: &[u16]) -> bool {
        self.status.is_some_and(|s| allowed.contains(&s))
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Strictly-typed view of `data`. Missing required fields surface as a contract violation.
    pub fn decode_data<T: DeserializeOwned>(&self, step: &str) -> Result<T> {
        serde_json::from_value(self.envelope.data.clone()).map_err(|e| {
            HarnessError::contract(step, format!("{} (data={})", e, self.envelope.data))
        })
    }

    /// One-line diagnostic rendering: `http=201 success=true code=CREATED`.
    pub fn summary(&self) -> String {
        match (&self.failure, self.status) {
            (Some(f), _) => format!("failed code={} ({})", f.code, f.message),
            (None, Some(status)) => format!(
                "http={} success={} code={}",
                status, self.envelope.success, self.envelope.code
            ),
            (None, None) => "no response".to_string(),
        }
    }
}

// Typed payloads. Every field name accepts both snake_case and camelCase;
// the alias is resolved here and nowhere else.

#[derive(Debug, Clone, Deserialize)]
pub struct CsrfIssued {
    #[serde(alias = "csrfToken")]
    pub csrf_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderCreated {
    #[serde(alias = "orderNo")]
    pub order_no: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderDetail {
    #[serde(alias = "orderNo")]
    pub order_no: Option<Value>,
    pub status: Option<String>,
    #[serde(alias = "addressChanged")]
    pub address_changed: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutCreated {
    #[serde(alias = "paymentId")]
    pub payment_id: i64,
    #[serde(alias = "approveUrl")]
    pub approve_url: Option<String>,
    #[serde(alias = "paypalOrderId")]
    pub paypal_order_id: Option<String>,
}

/// Loose view of a checkout response, for batches where a member may not
/// carry a usable id.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRef {
    #[serde(alias = "paymentId", default)]
    pub payment_id: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentStatus {
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InventoryLogRow {
    #[serde(alias = "changeType")]
    pub change_type: Option<String>,
    #[serde(alias = "skuId")]
    pub sku_id: Option<i64>,
    pub quantity: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub struct ShipmentIdentity {
    pub id: i64,
    #[serde(alias = "shipmentNo")]
    pub shipment_no: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShipmentDetail {
    pub status: Option<String>,
    #[serde(alias = "trackingNo")]
    pub tracking_no: Option<String>,
}

/// One row of a shipment listing; `status_logs` is a list or absent.
#[derive(Debug, Clone, Deserialize)]
pub struct ShipmentListItem {
    pub id: Option<i64>,
    #[serde(alias = "shipmentNo", default)]
    pub shipment_no: Option<String>,
    #[serde(alias = "statusLogs", default)]
    pub status_logs: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchOutcome {
    #[serde(alias = "shipmentIds", default)]
    pub shipment_ids: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusLogRow {
    #[serde(alias = "sourceRef")]
    pub source_ref: Option<String>,
}
