//! PayPal checkout, capture and cancel, plus the admin payment views.

use serde_json::{Value, json};

use super::data_object;
use crate::checker::Expectation;
use crate::client::{ApiClient, ApiRequest};
use crate::error::Result;
use crate::types::{
    ApiResult, CheckoutCreated, IdempotencyKey, PaymentRef, PaymentStatus, ResourceHandle,
};

pub const CHECKOUT: Expectation = Expectation::ok(&[200, 201], &[]);
pub const CAPTURE: Expectation = Expectation::ok(&[200], &[]);
pub const CANCEL: Expectation = Expectation::ok(&[200], &[]);
pub const SYNC: Expectation = Expectation::ok(&[200, 202], &[]);

pub const STATUS_SUCCESS: &str = "SUCCESS";

pub const DEFAULT_RETURN_URL: &str = "https://shopping.example.com/pay/return";
pub const DEFAULT_CANCEL_URL: &str = "https://shopping.example.com/pay/cancel";

pub async fn checkout(
    client: &ApiClient,
    order_no: &ResourceHandle,
    key: &IdempotencyKey,
) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::post("/payments/paypal/checkout")
                .json(json!({
                    "order_no": order_no,
                    "channel": "PAYPAL",
                    "return_url": DEFAULT_RETURN_URL,
                    "cancel_url": DEFAULT_CANCEL_URL,
                }))
                .idempotency_key(Some(key)),
        )
        .await
}

pub async fn capture(
    client: &ApiClient,
    payment_id: i64,
    note: &str,
    key: &IdempotencyKey,
) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::post(format!("/payments/paypal/{}/capture", payment_id))
                .json(json!({ "payer_id": null, "note": note }))
                .idempotency_key(Some(key)),
        )
        .await
}

pub async fn cancel(client: &ApiClient, payment_id: i64, key: &IdempotencyKey) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::post(format!("/payments/paypal/{}/cancel", payment_id))
                .json(json!({}))
                .idempotency_key(Some(key)),
        )
        .await
}

pub async fn admin_sync(client: &ApiClient, payment_id: i64) -> Result<ApiResult> {
    client
        .call(ApiRequest::post(format!("/admin/payments/{}/sync", payment_id)).json(json!({})))
        .await
}

pub async fn admin_payments(client: &ApiClient, order_no: &ResourceHandle) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::get("/admin/payments")
                .query("order_no", order_no)
                .query("page", 1)
                .query("size", 20),
        )
        .await
}

pub async fn admin_refunds(client: &ApiClient, order_no: &ResourceHandle) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::get("/admin/refunds")
                .query("order_no", order_no)
                .query("page", 1)
                .query("size", 20),
        )
        .await
}

/// Checkout response with every field a capture needs.
pub fn checkout_created(result: &ApiResult) -> Result<CheckoutCreated> {
    data_object("payments.checkout", result)?;
    result.decode_data("payments.checkout")
}

/// Payment id as a handle, for distinctness checks over a checkout batch.
pub fn payment_id(result: &ApiResult) -> Result<Option<ResourceHandle>> {
    data_object("payments.checkout", result)?;
    let payment: PaymentRef = result.decode_data("payments.checkout")?;
    Ok(payment
        .payment_id
        .filter(Value::is_i64)
        .as_ref()
        .and_then(ResourceHandle::from_value))
}

/// `status` of a capture or cancel response, upper-cased.
pub fn payment_status(result: &ApiResult) -> Option<String> {
    serde_json::from_value::<PaymentStatus>(result.data().clone())
        .ok()
        .and_then(|p| p.status)
        .map(|s| s.to_uppercase())
}
