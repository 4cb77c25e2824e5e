//! In-process mock of the shop backend, for driving the harness end to end.
//!
//! Implements the response envelope, login/anti-forgery cookies, idempotency
//! key replay, stock, an order mutation guard, payments, shipments with status
//! logs and signed webhooks. Every mutation runs under one mutex, so the mock
//! is linearizable and the harness invariants must hold against it, unless a
//! [`MockOptions`] toggle deliberately breaks one.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use idemcheck::{Credential, HarnessConfig, Scenario};

pub const USER: (&str, &str) = ("buyer", "buyer-pw");
pub const ADMIN: (&str, &str) = ("ops", "ops-pw");
pub const WEBHOOK_SECRET: &str = "hook-secret";
pub const PAID_ORDER_NO: &str = "ORD-PAID-1";

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub stock: i64,
    /// When false, every create is treated as new regardless of its key.
    pub honor_idempotency: bool,
    /// Refuse every cancel, refund-request and change-address.
    pub refuse_mutations: bool,
    /// Let a second competing mutation win; change-address also applies to cancelled orders.
    pub allow_double_mutation: bool,
    /// Confirming an already refunded order answers 500.
    pub duplicate_confirm_error: bool,
    /// Confirming an already refunded order restocks again.
    pub double_restock: bool,
    /// `GET /auth/csrf` answers 500 after a short delay.
    pub csrf_unavailable: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            stock: 1_000,
            honor_idempotency: true,
            refuse_mutations: false,
            allow_double_mutation: false,
            duplicate_confirm_error: false,
            double_restock: false,
            csrf_unavailable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    User,
    Admin,
}

#[derive(Debug, Clone)]
struct Order {
    order_no: String,
    status: &'static str,
    quantity: i64,
    sku_id: i64,
    address_id: i64,
    address_changed: bool,
    /// Set once any competing mutation has won.
    mutated: bool,
}

#[derive(Debug, Clone)]
struct Payment {
    id: i64,
    order_no: String,
    status: &'static str,
}

#[derive(Debug, Clone)]
struct Shipment {
    id: i64,
    shipment_no: String,
    order_no: String,
    status: &'static str,
    tracking_no: Option<String>,
}

#[derive(Debug, Default)]
struct Data {
    sessions: HashMap<String, Role>,
    csrf_tokens: HashSet<String>,
    stock: i64,
    next_id: i64,
    orders: BTreeMap<String, Order>,
    order_keys: HashMap<String, String>,
    payments: BTreeMap<i64, Payment>,
    inventory_logs: Vec<Value>,
    shipments: BTreeMap<i64, Shipment>,
    shipment_keys: HashMap<String, i64>,
    label_keys: HashSet<String>,
    dispatch_keys: HashMap<String, Vec<String>>,
    status_logs: Vec<Value>,
    webhook_refs: HashSet<String>,
}

impl Data {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn status_log(&mut self, shipment_id: i64, source_ref: String, to_status: &str) {
        let id = self.next_id();
        self.status_logs.push(json!({
            "id": id,
            "shipment_id": shipment_id,
            "source_ref": source_ref,
            "to_status": to_status,
        }));
    }

    fn inventory_log(&mut self, order: &Order, change_type: &str) {
        let id = self.next_id();
        self.inventory_logs.push(json!({
            "id": id,
            "skuId": order.sku_id,
            "orderId": order.order_no,
            "changeType": change_type,
            "quantity": order.quantity,
            "reason": change_type.to_lowercase(),
            "createdAt": "2026-01-01T00:00:00Z",
        }));
    }
}

pub struct Backend {
    options: MockOptions,
    csrf_issued: AtomicUsize,
    data: Mutex<Data>,
}

impl Backend {
    fn data(&self) -> std::sync::MutexGuard<'_, Data> {
        self.data.lock().unwrap()
    }

    pub fn csrf_issued(&self) -> usize {
        self.csrf_issued.load(Ordering::SeqCst)
    }

    pub fn order_count(&self) -> usize {
        self.data().orders.len()
    }

    pub fn status_log_count(&self, source_ref: &str) -> usize {
        self.data()
            .status_logs
            .iter()
            .filter(|row| row["source_ref"] == source_ref)
            .count()
    }

    pub fn status_logs_with_prefix(&self, prefix: &str) -> usize {
        self.data()
            .status_logs
            .iter()
            .filter(|row| row["source_ref"].as_str().is_some_and(|r| r.starts_with(prefix)))
            .count()
    }

    pub fn restock_count(&self) -> usize {
        self.data()
            .inventory_logs
            .iter()
            .filter(|row| row["changeType"] == "RESTOCK")
            .count()
    }
}

pub struct MockServer {
    pub base_url: String,
    pub backend: Arc<Backend>,
}

impl MockServer {
    pub async fn start(options: MockOptions) -> Self {
        let backend = Arc::new(Backend {
            csrf_issued: AtomicUsize::new(0),
            data: Mutex::new(Data {
                stock: options.stock,
                ..Default::default()
            }),
            options,
        });

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_app(backend.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}/api/v1", addr),
            backend,
        }
    }

    pub fn user(&self) -> Credential {
        Credential::new(USER.0, USER.1)
    }

    pub fn admin(&self) -> Credential {
        Credential::new(ADMIN.0, ADMIN.1)
    }

    /// Configuration pointing every scenario at this mock.
    pub fn config(&self, scenarios: &[Scenario]) -> HarnessConfig {
        HarnessConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(10),
            user: Some(self.user()),
            admin: Some(self.admin()),
            paid_order_no: Some(PAID_ORDER_NO.to_string()),
            carrier_code: Some("usps".to_string()),
            carrier_name: Some("USPS".to_string()),
            webhook_key: Some(WEBHOOK_SECRET.to_string()),
            scenarios: scenarios.to_vec(),
            ..Default::default()
        }
    }
}

fn build_app(backend: Arc<Backend>) -> Router {
    let api = Router::new()
        .route("/auth/login", post(login))
        .route("/auth/csrf", get(issue_csrf))
        .route("/slow", get(slow))
        .route("/users/me/orders/preview", post(preview))
        .route("/users/me/orders", get(list_orders).post(create_order))
        .route("/users/me/orders/:no", get(order_detail))
        .route("/users/me/orders/:no/cancel", post(cancel_order))
        .route("/users/me/orders/:no/refund-request", post(refund_request))
        .route("/users/me/orders/:no/change-address", post(change_address))
        .route("/users/me/orders/:no/shipments", get(user_order_shipments))
        .route("/users/me/shipments/:no", get(user_shipment_detail))
        .route("/admin/orders/:no", get(order_detail))
        .route("/admin/orders/:no/refund/confirm", post(confirm_refund))
        .route("/admin/orders/:no/inventory-logs", get(inventory_logs))
        .route("/payments/paypal/checkout", post(checkout))
        .route("/payments/paypal/:id/capture", post(capture))
        .route("/payments/paypal/:id/cancel", post(cancel_payment))
        .route("/admin/payments", get(list_payments))
        .route("/admin/payments/:id/sync", post(sync_payment))
        .route("/admin/refunds", get(list_refunds))
        .route("/admin/shipments", get(admin_shipments))
        .route("/admin/shipments/manual-create", post(manual_create))
        .route("/admin/shipments/dispatch", post(dispatch))
        .route("/admin/shipments/:id", get(shipment_detail))
        .route("/admin/shipments/:id/label", post(fill_label))
        .route("/admin/shipment-status-logs", get(status_logs))
        .route("/webhooks/17track", post(webhook));

    Router::new()
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(backend.clone(), guard)),
        )
        .with_state(backend)
}

fn envelope(status: StatusCode, code: &str, data: Value) -> Response {
    let success = status.is_success();
    (
        status,
        Json(json!({
            "success": success,
            "code": code,
            "message": code.to_lowercase(),
            "data": data,
        })),
    )
        .into_response()
}

fn page(rows: Vec<Value>) -> Response {
    let total = rows.len();
    Json(json!({
        "success": true,
        "code": "OK",
        "message": "ok",
        "data": rows,
        "meta": {"total": total, "page": 1, "size": 200},
    }))
    .into_response()
}

fn conflict(code: &str) -> Response {
    envelope(StatusCode::CONFLICT, code, Value::Null)
}

fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}

/// Session and anti-forgery checks, in front of every route.
async fn guard(State(backend): State<Arc<Backend>>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let open = ["/api/v1/auth/", "/api/v1/webhooks/", "/api/v1/slow"]
        .iter()
        .any(|p| path.starts_with(p));
    if open {
        return next.run(request).await;
    }

    let headers = request.headers();
    let role = cookie(headers, "access_token")
        .and_then(|token| backend.data().sessions.get(&token).copied());
    let Some(role) = role else {
        return envelope(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", Value::Null);
    };
    if path.starts_with("/api/v1/admin/") && role != Role::Admin {
        return envelope(StatusCode::FORBIDDEN, "FORBIDDEN", Value::Null);
    }
    if request.method() == Method::POST {
        let header_token = headers.get("X-CSRF-Token").and_then(|v| v.to_str().ok());
        let cookie_token = cookie(headers, "csrf_token");
        let valid = match (header_token, cookie_token.as_deref()) {
            (Some(h), Some(c)) => h == c && backend.data().csrf_tokens.contains(h),
            _ => false,
        };
        if !valid {
            return envelope(StatusCode::FORBIDDEN, "CSRF_INVALID", Value::Null);
        }
    }
    next.run(request).await
}

async fn login(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    let account = body["account"].as_str().unwrap_or_default();
    let password = body["password"].as_str().unwrap_or_default();
    let role = match (account, password) {
        (a, p) if (a, p) == USER => Role::User,
        (a, p) if (a, p) == ADMIN => Role::Admin,
        _ => return envelope(StatusCode::UNAUTHORIZED, "BAD_CREDENTIALS", Value::Null),
    };
    let token = format!("tok-{}", uuid::Uuid::new_v4().simple());
    backend.data().sessions.insert(token.clone(), role);
    (
        [(
            header::SET_COOKIE,
            format!("access_token={}; Path=/; HttpOnly", token),
        )],
        envelope(StatusCode::OK, "OK", json!({"account": account})),
    )
        .into_response()
}

async fn issue_csrf(State(backend): State<Arc<Backend>>) -> Response {
    backend.csrf_issued.fetch_add(1, Ordering::SeqCst);
    if backend.options.csrf_unavailable {
        tokio::time::sleep(Duration::from_millis(200)).await;
        return envelope(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", Value::Null);
    }
    let token = uuid::Uuid::new_v4().to_string();
    backend.data().csrf_tokens.insert(token.clone());
    (
        [(header::SET_COOKIE, format!("csrf_token={}; Path=/", token))],
        envelope(StatusCode::OK, "OK", json!({"csrf_token": token})),
    )
        .into_response()
}

async fn slow() -> Response {
    tokio::time::sleep(Duration::from_secs(5)).await;
    envelope(StatusCode::OK, "OK", Value::Null)
}

async fn preview(Json(body): Json<Value>) -> Response {
    envelope(
        StatusCode::OK,
        "OK",
        json!({"items": body["items"], "currency": body["currency"], "total_amount": "10.00"}),
    )
}

fn order_view(order: &Order) -> Value {
    json!({
        "orderNo": order.order_no,
        "status": order.status,
        "addressId": order.address_id,
        "addressChanged": order.address_changed,
    })
}

async fn create_order(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .filter(|_| backend.options.honor_idempotency)
        .map(str::to_string);
    let item = &body["items"][0];
    let quantity = item["quantity"].as_i64().unwrap_or(1);
    let sku_id = item["sku_id"].as_i64().unwrap_or_default();

    let mut data = backend.data();
    if let Some(key) = &key
        && let Some(order_no) = data.order_keys.get(key)
    {
        return envelope(StatusCode::CREATED, "CREATED", json!({"order_no": order_no}));
    }
    if data.stock < quantity {
        return conflict("OUT_OF_STOCK");
    }
    data.stock -= quantity;
    let id = data.next_id();
    let order = Order {
        order_no: format!("ORD{:06}", id),
        status: "PENDING_PAYMENT",
        quantity,
        sku_id,
        address_id: body["address_id"].as_i64().unwrap_or_default(),
        address_changed: false,
        mutated: false,
    };
    data.inventory_log(&order, "RESERVE");
    if let Some(key) = key {
        data.order_keys.insert(key, order.order_no.clone());
    }
    let order_no = order.order_no.clone();
    data.orders.insert(order_no.clone(), order);
    envelope(StatusCode::CREATED, "CREATED", json!({"order_no": order_no}))
}

async fn list_orders(State(backend): State<Arc<Backend>>) -> Response {
    let rows = backend.data().orders.values().map(order_view).collect();
    page(rows)
}

async fn order_detail(State(backend): State<Arc<Backend>>, Path(no): Path<String>) -> Response {
    match backend.data().orders.get(&no) {
        Some(order) => envelope(StatusCode::OK, "OK", order_view(order)),
        None => envelope(StatusCode::NOT_FOUND, "NOT_FOUND", Value::Null),
    }
}

/// Apply one of the competing order mutations. At most one ever wins per order,
/// unless the options say otherwise.
fn mutate_order(
    backend: &Backend,
    no: &str,
    allowed_from: &[&str],
    apply: impl FnOnce(&mut Order),
    success: (StatusCode, &str),
) -> Response {
    let mut data = backend.data();
    let Some(order) = data.orders.get_mut(no) else {
        return envelope(StatusCode::NOT_FOUND, "NOT_FOUND", Value::Null);
    };
    if backend.options.refuse_mutations
        || (order.mutated && !backend.options.allow_double_mutation)
        || !allowed_from.contains(&order.status)
    {
        return conflict("CONFLICT");
    }
    order.mutated = true;
    apply(order);
    let view = order_view(order);
    envelope(success.0, success.1, view)
}

async fn cancel_order(State(backend): State<Arc<Backend>>, Path(no): Path<String>) -> Response {
    let response = mutate_order(
        &backend,
        &no,
        &["PENDING_PAYMENT"],
        |order| order.status = "CANCELLED",
        (StatusCode::OK, "OK"),
    );
    if response.status().is_success() {
        let mut data = backend.data();
        if let Some(order) = data.orders.get(&no).cloned() {
            data.stock += order.quantity;
            data.inventory_log(&order, "RELEASE");
        }
    }
    response
}

async fn refund_request(State(backend): State<Arc<Backend>>, Path(no): Path<String>) -> Response {
    mutate_order(
        &backend,
        &no,
        &["PAID"],
        |order| order.status = "REFUNDING",
        (StatusCode::ACCEPTED, "ACCEPTED"),
    )
}

async fn change_address(
    State(backend): State<Arc<Backend>>,
    Path(no): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let address_id = body["address_id"].as_i64().unwrap_or_default();
    let allowed_from: &[&str] = if backend.options.allow_double_mutation {
        &["PENDING_PAYMENT", "PAID", "CANCELLED"]
    } else {
        &["PENDING_PAYMENT", "PAID"]
    };
    mutate_order(
        &backend,
        &no,
        allowed_from,
        |order| {
            order.address_id = address_id;
            order.address_changed = true;
        },
        (StatusCode::OK, "OK"),
    )
}

async fn confirm_refund(State(backend): State<Arc<Backend>>, Path(no): Path<String>) -> Response {
    let mut data = backend.data();
    let Some(order) = data.orders.get_mut(&no) else {
        return envelope(StatusCode::NOT_FOUND, "NOT_FOUND", Value::Null);
    };
    match order.status {
        "REFUNDED" if backend.options.duplicate_confirm_error => envelope(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            Value::Null,
        ),
        "REFUNDED" if backend.options.double_restock => {
            let order = order.clone();
            data.stock += order.quantity;
            data.inventory_log(&order, "RESTOCK");
            envelope(StatusCode::OK, "OK", order_view(&order))
        }
        "REFUNDED" => {
            let view = order_view(order);
            envelope(StatusCode::OK, "OK", view)
        }
        "REFUNDING" => {
            order.status = "REFUNDED";
            let order = order.clone();
            data.stock += order.quantity;
            data.inventory_log(&order, "RESTOCK");
            envelope(StatusCode::OK, "OK", order_view(&order))
        }
        _ => conflict("CONFLICT"),
    }
}

async fn inventory_logs(State(backend): State<Arc<Backend>>, Path(no): Path<String>) -> Response {
    let rows = backend
        .data()
        .inventory_logs
        .iter()
        .filter(|row| row["orderId"] == no.as_str())
        .cloned()
        .collect();
    page(rows)
}

fn payment_view(payment: &Payment) -> Value {
    json!({
        "payment_id": payment.id,
        "order_no": payment.order_no,
        "status": payment.status,
        "approve_url": format!("https://paypal.example/approve/{}", payment.id),
        "paypal_order_id": format!("PP-{}", payment.id),
    })
}

async fn checkout(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    let order_no = body["order_no"].as_str().unwrap_or_default().to_string();
    let mut data = backend.data();
    if !data.orders.contains_key(&order_no) {
        return envelope(StatusCode::NOT_FOUND, "ORDER_NOT_FOUND", Value::Null);
    }
    if let Some(active) = data
        .payments
        .values()
        .find(|p| p.order_no == order_no && p.status == "PENDING")
    {
        return envelope(StatusCode::OK, "OK", payment_view(active));
    }
    let payment = Payment {
        id: data.next_id(),
        order_no,
        status: "PENDING",
    };
    let view = payment_view(&payment);
    data.payments.insert(payment.id, payment);
    envelope(StatusCode::CREATED, "CREATED", view)
}

/// Capture and cancel settle a pending attempt; on a settled one they report its state.
fn settle_payment(backend: &Backend, id: i64, to: &'static str) -> Response {
    let mut data = backend.data();
    let Some(payment) = data.payments.get_mut(&id) else {
        return envelope(StatusCode::NOT_FOUND, "PAYMENT_NOT_FOUND", Value::Null);
    };
    if payment.status == "PENDING" {
        payment.status = to;
    }
    let payment = payment.clone();
    if payment.status == "SUCCESS"
        && let Some(order) = data.orders.get_mut(&payment.order_no)
        && order.status == "PENDING_PAYMENT"
    {
        order.status = "PAID";
    }
    envelope(StatusCode::OK, "OK", payment_view(&payment))
}

async fn capture(State(backend): State<Arc<Backend>>, Path(id): Path<i64>) -> Response {
    settle_payment(&backend, id, "SUCCESS")
}

async fn cancel_payment(State(backend): State<Arc<Backend>>, Path(id): Path<i64>) -> Response {
    settle_payment(&backend, id, "CANCELLED")
}

async fn sync_payment(State(backend): State<Arc<Backend>>, Path(id): Path<i64>) -> Response {
    match backend.data().payments.get(&id) {
        Some(payment) => envelope(StatusCode::ACCEPTED, "ACCEPTED", payment_view(payment)),
        None => envelope(StatusCode::NOT_FOUND, "PAYMENT_NOT_FOUND", Value::Null),
    }
}

async fn list_payments(
    State(backend): State<Arc<Backend>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let order_no = query.get("order_no").cloned().unwrap_or_default();
    let rows = backend
        .data()
        .payments
        .values()
        .filter(|p| p.order_no == order_no)
        .map(payment_view)
        .collect();
    page(rows)
}

async fn list_refunds(
    State(backend): State<Arc<Backend>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let order_no = query.get("order_no").cloned().unwrap_or_default();
    let rows = backend
        .data()
        .orders
        .values()
        .filter(|o| o.order_no == order_no && o.status == "REFUNDED")
        .map(order_view)
        .collect();
    page(rows)
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn shipment_view(shipment: &Shipment) -> Value {
    json!({
        "id": shipment.id,
        "shipmentNo": shipment.shipment_no,
        "orderNo": shipment.order_no,
        "status": shipment.status,
        "trackingNo": shipment.tracking_no,
    })
}

async fn manual_create(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some(key) = idempotency_key(&headers) else {
        return envelope(StatusCode::BAD_REQUEST, "IDEMPOTENCY_KEY_REQUIRED", Value::Null);
    };
    let mut data = backend.data();
    if let Some(id) = data.shipment_keys.get(&key) {
        let view = shipment_view(&data.shipments[id]);
        return envelope(StatusCode::OK, "OK", view);
    }
    let id = data.next_id();
    let shipment = Shipment {
        id,
        shipment_no: format!("SHP{:06}", id),
        order_no: body["order_no"].as_str().unwrap_or_default().to_string(),
        status: "CREATED",
        tracking_no: None,
    };
    let view = shipment_view(&shipment);
    data.shipments.insert(id, shipment);
    data.shipment_keys.insert(key.clone(), id);
    data.status_log(id, format!("admin:shipment:manual:create:{}", key), "CREATED");
    envelope(StatusCode::CREATED, "CREATED", view)
}

async fn fill_label(
    State(backend): State<Arc<Backend>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some(key) = idempotency_key(&headers) else {
        return envelope(StatusCode::BAD_REQUEST, "IDEMPOTENCY_KEY_REQUIRED", Value::Null);
    };
    let mut guard = backend.data();
    let data = &mut *guard;
    let Some(shipment) = data.shipments.get_mut(&id) else {
        return envelope(StatusCode::NOT_FOUND, "SHIPMENT_NOT_FOUND", Value::Null);
    };
    if data.label_keys.insert(format!("{}:{}", id, key)) {
        shipment.tracking_no = body["tracking_no"].as_str().map(str::to_string);
        let view = shipment_view(shipment);
        data.status_log(id, format!("admin:shipment:label:{}:{}", id, key), "CREATED");
        return envelope(StatusCode::OK, "OK", view);
    }
    envelope(StatusCode::OK, "OK", shipment_view(shipment))
}

async fn dispatch(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some(key) = idempotency_key(&headers) else {
        return envelope(StatusCode::BAD_REQUEST, "IDEMPOTENCY_KEY_REQUIRED", Value::Null);
    };
    let mut data = backend.data();
    if let Some(nos) = data.dispatch_keys.get(&key) {
        return envelope(StatusCode::OK, "OK", json!({"shipment_ids": nos}));
    }
    let ids: Vec<i64> = body["shipment_ids"]
        .as_array()
        .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default();
    let mut nos = Vec::new();
    for id in ids {
        let Some(shipment) = data.shipments.get_mut(&id) else {
            continue;
        };
        shipment.status = "LABEL_CREATED";
        nos.push(shipment.shipment_no.clone());
        data.status_log(id, format!("admin:shipment:dispatch:{}:{}", key, id), "LABEL_CREATED");
    }
    data.dispatch_keys.insert(key, nos.clone());
    envelope(StatusCode::OK, "OK", json!({"shipmentIds": nos}))
}

async fn shipment_detail(State(backend): State<Arc<Backend>>, Path(id): Path<i64>) -> Response {
    match backend.data().shipments.get(&id) {
        Some(shipment) => envelope(StatusCode::OK, "OK", shipment_view(shipment)),
        None => envelope(StatusCode::NOT_FOUND, "SHIPMENT_NOT_FOUND", Value::Null),
    }
}

/// Shipment row as the listings render it; logs are inlined on request.
fn listed_shipment(data: &Data, shipment: &Shipment, include_logs: bool) -> Value {
    let mut row = shipment_view(shipment);
    row["statusLogs"] = if include_logs {
        Value::Array(
            data.status_logs
                .iter()
                .filter(|log| log["shipment_id"] == shipment.id)
                .cloned()
                .collect(),
        )
    } else {
        Value::Null
    };
    row
}

async fn admin_shipments(
    State(backend): State<Arc<Backend>>,
    Query(query): Query<Vec<(String, String)>>,
) -> Response {
    let order_no = query
        .iter()
        .find(|(k, _)| k == "order_no")
        .map(|(_, v)| v.as_str());
    let statuses: Vec<&str> = query
        .iter()
        .filter(|(k, _)| k == "status_in")
        .map(|(_, v)| v.as_str())
        .collect();
    let data = backend.data();
    let rows = data
        .shipments
        .values()
        .rev()
        .filter(|s| order_no.is_none_or(|no| s.order_no == no))
        .filter(|s| statuses.is_empty() || statuses.contains(&s.status))
        .map(|s| listed_shipment(&data, s, false))
        .collect();
    page(rows)
}

async fn user_order_shipments(
    State(backend): State<Arc<Backend>>,
    Path(no): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let include_logs = query.get("include_logs").is_some_and(|v| v == "true");
    let data = backend.data();
    let rows: Vec<Value> = data
        .shipments
        .values()
        .filter(|s| s.order_no == no)
        .map(|s| listed_shipment(&data, s, include_logs))
        .collect();
    envelope(StatusCode::OK, "OK", Value::Array(rows))
}

async fn user_shipment_detail(
    State(backend): State<Arc<Backend>>,
    Path(no): Path<String>,
) -> Response {
    let data = backend.data();
    match data.shipments.values().find(|s| s.shipment_no == no) {
        Some(shipment) => envelope(StatusCode::OK, "OK", shipment_view(shipment)),
        None => envelope(StatusCode::NOT_FOUND, "SHIPMENT_NOT_FOUND", Value::Null),
    }
}

async fn status_logs(
    State(backend): State<Arc<Backend>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let shipment_id: Option<i64> = query.get("shipment_id").and_then(|s| s.parse().ok());
    let source_ref = query.get("source_ref");
    let rows = backend
        .data()
        .status_logs
        .iter()
        .filter(|row| shipment_id.is_none_or(|id| row["shipment_id"] == id))
        .filter(|row| source_ref.is_none_or(|r| row["source_ref"] == r.as_str()))
        .cloned()
        .collect();
    page(rows)
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

async fn webhook(State(backend): State<Arc<Backend>>, headers: HeaderMap, body: Bytes) -> Response {
    let mut signed = body.to_vec();
    signed.extend_from_slice(b"/");
    signed.extend_from_slice(WEBHOOK_SECRET.as_bytes());
    let sign = headers.get("sign").and_then(|v| v.to_str().ok());
    if sign != Some(sha256_hex(&signed).as_str()) {
        return envelope(StatusCode::UNAUTHORIZED, "BAD_SIGNATURE", Value::Null);
    }

    let source_ref = format!("17track:{}", sha256_hex(&body));
    let Ok(event) = serde_json::from_slice::<Value>(&body) else {
        return envelope(StatusCode::BAD_REQUEST, "BAD_PAYLOAD", Value::Null);
    };
    let mut data = backend.data();
    if !data.webhook_refs.insert(source_ref.clone()) {
        return envelope(StatusCode::OK, "OK", json!({"duplicate": true}));
    }
    let number = event["data"]["number"].as_str().unwrap_or_default();
    let target = data
        .shipments
        .values_mut()
        .find(|s| s.tracking_no.as_deref() == Some(number));
    if let Some(shipment) = target {
        shipment.status = "PICKED_UP";
        let id = shipment.id;
        data.status_log(id, source_ref, "PICKED_UP");
    }
    envelope(StatusCode::OK, "OK", json!({"duplicate": false}))
}
