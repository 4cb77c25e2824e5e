//! Shipment endpoints, admin and user side, and the status-log audit trail.

use serde::Serialize;
use serde_json::json;

use super::{data_object, data_rows};
use crate::checker::Expectation;
use crate::client::{ApiClient, ApiRequest};
use crate::error::{HarnessError, Result};
use crate::types::{
    ApiResult, DispatchOutcome, IdempotencyKey, ResourceHandle, ShipmentDetail, ShipmentIdentity,
    ShipmentListItem, StatusLogRow,
};

pub const MANUAL_CREATE: Expectation = Expectation::ok(&[200, 201], &[]);
pub const FILL_LABEL_HTTP: &[u16] = &[200];
pub const DISPATCH_HTTP: &[u16] = &[200];
pub const DETAIL: Expectation = Expectation::ok(&[200], &[]);
pub const LIST: Expectation = Expectation::ok(&[200], &[]);

/// Statuses the admin page is filtered to; a fresh or labelled shipment is among them.
pub const OPEN_STATUSES: &[&str] =
    &["CREATED", "LABEL_CREATED", "PICKED_UP", "IN_TRANSIT", "EXCEPTION"];

pub const STATUS_CREATED: &str = "CREATED";
pub const STATUS_LABEL_CREATED: &str = "LABEL_CREATED";
pub const STATUS_PICKED_UP: &str = "PICKED_UP";

/// Body of `POST /admin/shipments/manual-create`.
#[derive(Debug, Clone, Serialize)]
pub struct ManualShipment {
    pub ship_from_address_id: i64,
    pub order_no: String,
    pub declared_value: String,
    pub currency: String,
}

/// Body of `POST /admin/shipments/{id}/label`.
#[derive(Debug, Clone, Serialize)]
pub struct LabelDraft {
    pub ship_from_address_id: i64,
    pub carrier_code: String,
    pub carrier_name: String,
    pub service_code: String,
    pub tracking_no: String,
    pub ext_external_id: String,
    pub label_url: String,
    pub weight_kg: String,
    pub length_cm: String,
    pub width_cm: String,
    pub height_cm: String,
    pub declared_value: String,
    pub currency: String,
}

/// `TRK{unix millis}{10 random alphanumerics}`
pub fn tracking_number() -> String {
    let suffix: String = std::iter::repeat_with(fastrand::alphanumeric)
        .take(10)
        .collect();
    format!(
        "TRK{}{}",
        chrono::Utc::now().timestamp_millis(),
        suffix.to_lowercase()
    )
}

/// `ext-{24 hex}` carrier-side label reference.
pub fn external_label_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("ext-{}", &hex[..24])
}

pub fn label_source_ref(shipment_id: i64, key: &IdempotencyKey) -> String {
    format!("admin:shipment:label:{}:{}", shipment_id, key)
}

pub fn dispatch_source_ref(key: &IdempotencyKey, shipment_id: i64) -> String {
    format!("admin:shipment:dispatch:{}:{}", key, shipment_id)
}

pub fn manual_create_source_ref(key: &IdempotencyKey) -> String {
    format!("admin:shipment:manual:create:{}", key)
}

pub async fn manual_create(
    client: &ApiClient,
    shipment: &ManualShipment,
    key: &IdempotencyKey,
) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::post("/admin/shipments/manual-create")
                .json(json!(shipment))
                .idempotency_key(Some(key)),
        )
        .await
}

pub async fn fill_label(
    client: &ApiClient,
    shipment_id: i64,
    label: &LabelDraft,
    key: &IdempotencyKey,
) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::post(format!("/admin/shipments/{}/label", shipment_id))
                .json(json!(label))
                .idempotency_key(Some(key)),
        )
        .await
}

pub async fn dispatch(
    client: &ApiClient,
    shipment_ids: &[i64],
    note: &str,
    key: &IdempotencyKey,
) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::post("/admin/shipments/dispatch")
                .json(json!({ "shipment_ids": shipment_ids, "note": note }))
                .idempotency_key(Some(key)),
        )
        .await
}

pub async fn detail(client: &ApiClient, shipment_id: i64) -> Result<ApiResult> {
    client
        .call(ApiRequest::get(format!("/admin/shipments/{}", shipment_id)))
        .await
}

/// Admin shipment page for one order, most recently updated first.
pub async fn admin_page(client: &ApiClient, order_no: &str) -> Result<ApiResult> {
    let request = OPEN_STATUSES.iter().fold(
        ApiRequest::get("/admin/shipments").query("order_no", order_no),
        |request, status| request.query("status_in", status),
    );
    client
        .call(
            request
                .query("page", 1)
                .query("size", 100)
                .query("sort", "updated_at,desc"),
        )
        .await
}

/// The buyer's shipments for one order, optionally with their status logs inlined.
pub async fn user_order_shipments(
    client: &ApiClient,
    order_no: &str,
    include_logs: bool,
) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::get(format!("/users/me/orders/{}/shipments", order_no))
                .query("include_logs", include_logs),
        )
        .await
}

pub async fn user_detail(client: &ApiClient, shipment_no: &str) -> Result<ApiResult> {
    client
        .call(ApiRequest::get(format!("/users/me/shipments/{}", shipment_no)))
        .await
}

pub async fn status_logs(client: &ApiClient, shipment_id: i64, source_ref: &str) -> Result<ApiResult> {
    client
        .call(
            ApiRequest::get("/admin/shipment-status-logs")
                .query("shipment_id", shipment_id)
                .query("source_ref", source_ref)
                .query("page", 1)
                .query("size", 200)
                .query("sort", "created_at,asc"),
        )
        .await
}

/// `(id, shipment_no)` of a create or label response; both fields are required.
pub fn identity(step: &str, result: &ApiResult) -> Result<ShipmentIdentity> {
    data_object(step, result)?;
    let identity: ShipmentIdentity = result.decode_data(step)?;
    if identity.shipment_no.is_empty() {
        return Err(HarnessError::contract(step, "shipment_no is empty"));
    }
    Ok(identity)
}

/// Identity rendered as one handle, for distinctness checks over a batch.
pub fn identity_handle(step: &'static str) -> impl Fn(&ApiResult) -> Result<Option<ResourceHandle>> {
    move |result| {
        let identity = identity(step, result)?;
        Ok(Some(ResourceHandle::from(format!(
            "{}/{}",
            identity.id, identity.shipment_no
        ))))
    }
}

pub fn shipment_detail(result: &ApiResult) -> Result<ShipmentDetail> {
    data_object("shipments.detail", result)?;
    result.decode_data("shipments.detail")
}

/// Row of a shipment listing whose number is `shipment_no`.
///
/// Non-object rows are skipped; an object row that does not decode is a
/// contract violation.
pub fn find_listed(
    step: &str,
    result: &ApiResult,
    shipment_no: &str,
) -> Result<Option<ShipmentListItem>> {
    let target = shipment_no.trim();
    for row in data_rows(step, result)?.iter().filter(|row| row.is_object()) {
        let item: ShipmentListItem = serde_json::from_value(row.clone())
            .map_err(|e| HarnessError::contract(step, format!("{} (row={})", e, row)))?;
        if item.shipment_no.as_deref().map(str::trim) == Some(target) {
            return Ok(Some(item));
        }
    }
    Ok(None)
}

/// Upper-cased shipment status; missing status is a contract violation.
pub fn status(result: &ApiResult) -> Result<String> {
    shipment_detail(result)?
        .status
        .filter(|s| !s.is_empty())
        .map(|s| s.to_uppercase())
        .ok_or_else(|| HarnessError::contract("shipments.detail", "status missing"))
}

pub fn tracking_no(result: &ApiResult) -> Result<String> {
    shipment_detail(result)?
        .tracking_no
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HarnessError::contract("shipments.detail", "tracking_no missing"))
}

/// Shipment numbers a dispatch response reports; anything malformed reads as none.
pub fn dispatch_nos(result: &ApiResult) -> Vec<String> {
    serde_json::from_value::<DispatchOutcome>(result.data().clone())
        .ok()
        .and_then(|o| o.shipment_ids)
        .unwrap_or_default()
        .iter()
        .filter_map(ResourceHandle::from_value)
        .map(|h| h.to_string())
        .collect()
}

/// `source_ref` of every status-log row.
pub fn log_source_refs(result: &ApiResult) -> Result<Vec<String>> {
    Ok(data_rows("shipments.status_logs", result)?
        .iter()
        .filter_map(|row| serde_json::from_value::<StatusLogRow>(row.clone()).ok())
        .filter_map(|row| row.source_ref)
        .collect())
}
