//! Order endpoints, buyer and admin side.

use serde::Serialize;
use serde_json::json;

use super::{data_object, data_rows};
use crate::checker::Expectation;
use crate::client::{ApiClient, ApiRequest};
use crate::error::{HarnessError, Result};
use crate::types::{ApiResult, IdempotencyKey, InventoryLogRow, OrderCreated, OrderDetail, ResourceHandle};

pub const PREVIEW: Expectation = Expectation::ok(&[200], &["OK"]);
pub const CREATE: Expectation = Expectation::ok(&[201], &["CREATED"]);
pub const LIST: Expectation = Expectation::ok(&[200], &["OK"]);
pub const DETAIL: Expectation = Expectation::ok(&[200], &["OK"]);
pub const CANCEL: Expectation = Expectation::ok(&[200], &["OK"]);
pub const CHANGE_ADDRESS: Expectation = Expectation::ok(&[200], &["OK"]);
pub const REFUND_REQUEST: Expectation = Expectation::ok(&[202], &["ACCEPTED"]);
pub const CONFIRM_REFUND: Expectation = Expectation::ok(&[200], &["OK"]);
/// Admin read endpoints only promise a successful 200.
pub const ADMIN_VIEW: Expectation = Expectation::ok(&[200], &[]);

pub const STATUS_CANCELLED: &str = "CANCELLED";
pub const STATUS_REFUNDING: &str = "REFUNDING";
pub const STATUS_REFUNDED: &str = "REFUNDED";
pub const RESTOCK: &str = "RESTOCK";

#[derive(Debug, Clone, Serialize)]
pub struct OrderItem {
    pub sku_id: i64,
    pub quantity: i64,
}

/// Body shared by preview and create.
#[derive(Debug, Clone, Serialize)]
pub struct OrderDraft {
    pub source: String,
    pub address_id: i64,
    pub currency: String,
    pub items: Vec<OrderItem>,
    pub discount_code: Option<String>,
    pub buyer_remark: Option<String>,
    pub locale: String,
}

impl OrderDraft {
    pub fn with_remark(&self, remark: impl Into<String>) -> Self {
        Self {
            buyer_remark: Some(remark.into()),
            ..self.clone()
        }
    }
}

/// Mutations that compete for one order in a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderMutation {
    Cancel,
    RefundRequest,
    ChangeAddress,
}

impl OrderMutation {
    pub const ALL: [OrderMutation; 3] = [Self::Cancel, Self::RefundRequest, Self::ChangeAddress];

    pub fn label(self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::RefundRequest => "refund",
            Self::ChangeAddress => "change_address",
        }
    }

    pub fn expectation(self) -> Expectation {
        match self {
            Self::Cancel => CANCEL,
            Self::RefundRequest => REFUND_REQUEST,
            Self::ChangeAddress => CHANGE_ADDRESS,
        }
    }

    /// Whether the effect of this mutation shows in an order detail read.
    pub fn visible_in(self, detail: &OrderDetail) -> bool {
        let status = detail.status.as_deref().unwrap_or_default();
        match self {
            Self::Cancel => status == STATUS_CANCELLED,
            Self::RefundRequest => status == STATUS_REFUNDING || status == STATUS_REFUNDED,
            Self::ChangeAddress => detail.address_changed == Some(true),
        }
    }
}

pub async fn preview(client: &ApiClient, draft: &OrderDraft) -> Result<ApiResult> {
    client
        .call(ApiRequest::post("/users/me/orders/preview").json(json!(draft)))
        .await
}

pub async fn create(
    client: &ApiClient,
    draft: &OrderDraft,
    key: Option<&IdempotencyKey>,
) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::post("/users/me/orders")
                .json(json!(draft))
                .idempotency_key(key),
        )
        .await
}

pub async fn list(client: &ApiClient, page: u32, size: u32) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::get("/users/me/orders")
                .query("page", page)
                .query("size", size),
        )
        .await
}

pub async fn detail(client: &ApiClient, order_no: &ResourceHandle) -> Result<ApiResult> {
    client
        .call(ApiRequest::get(format!("/users/me/orders/{}", order_no)))
        .await
}

pub async fn cancel(client: &ApiClient, order_no: &ResourceHandle, reason: &str) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::post(format!("/users/me/orders/{}/cancel", order_no))
                .json(json!({ "reason": reason })),
        )
        .await
}

pub async fn change_address(
    client: &ApiClient,
    order_no: &ResourceHandle,
    address_id: i64,
    note: &str,
) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::post(format!("/users/me/orders/{}/change-address", order_no))
                .json(json!({ "address_id": address_id, "note": note })),
        )
        .await
}

pub async fn refund_request(
    client: &ApiClient,
    order_no: &ResourceHandle,
    reason_code: &str,
    reason_text: &str,
) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::post(format!("/users/me/orders/{}/refund-request", order_no)).json(json!({
                "reason_code": reason_code,
                "reason_text": reason_text,
                "attachments": [],
            })),
        )
        .await
}

/// Issue one race contender against `order_no`.
pub async fn apply(
    client: &ApiClient,
    order_no: &ResourceHandle,
    mutation: OrderMutation,
    alt_address_id: i64,
) -> Result<ApiResult> {
    match mutation {
        OrderMutation::Cancel => cancel(client, order_no, "race-test").await,
        OrderMutation::RefundRequest => refund_request(client, order_no, "OTHER", "race-test").await,
        OrderMutation::ChangeAddress => {
            change_address(client, order_no, alt_address_id, "race-test").await
        }
    }
}

pub async fn admin_detail(client: &ApiClient, order_no: &ResourceHandle) -> Result<ApiResult> {
    client
        .call(ApiRequest::get(format!("/admin/orders/{}", order_no)))
        .await
}

pub async fn confirm_refund(
    client: &ApiClient,
    order_no: &ResourceHandle,
    note: &str,
) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::post(format!("/admin/orders/{}/refund/confirm", order_no))
                .json(json!({ "note": note })),
        )
        .await
}

pub async fn inventory_logs(client: &ApiClient, order_no: &ResourceHandle) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::get(format!("/admin/orders/{}/inventory-logs", order_no))
                .query("page", 1)
                .query("size", 50),
        )
        .await
}

/// Order number of a create response. Absent → `None`; non-object data → contract violation.
pub fn order_no(result: &ApiResult) -> Result<Option<ResourceHandle>> {
    data_object("orders.create", result)?;
    let created: OrderCreated = result.decode_data("orders.create")?;
    Ok(created.order_no.as_ref().and_then(ResourceHandle::from_value))
}

pub fn order_detail(result: &ApiResult) -> Result<OrderDetail> {
    data_object("orders.detail", result)?;
    result.decode_data("orders.detail")
}

/// `meta.total` of a list response.
pub fn list_total(result: &ApiResult) -> Option<i64> {
    result.meta_total()
}

/// `change_type` of every inventory log row.
pub fn inventory_change_types(result: &ApiResult) -> Result<Vec<String>> {
    data_rows("orders.inventory_logs", result)?
        .iter()
        .map(|row| {
            serde_json::from_value::<InventoryLogRow>(row.clone())
                .map(|r| r.change_type.unwrap_or_default())
                .map_err(|e| HarnessError::contract("orders.inventory_logs", e.to_string()))
        })
        .collect()
}
