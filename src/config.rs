//! Run configuration, read from the environment.

use std::collections::BTreeSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::checker::{AllowList, INVENTORY_SHORTAGE_CODES};
use crate::client::DEFAULT_BASE_URL;
use crate::credential::Credential;
use crate::error::{HarnessError, Result};
use crate::scenario::Scenario;
use crate::steps::orders::{OrderDraft, OrderItem};
use crate::steps::shipments::ManualShipment;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Upper bound on in-flight calls per batch; `None` means one worker per call.
    pub pool_size: Option<usize>,
    pub user: Option<Credential>,
    pub admin: Option<Credential>,

    pub sku_id: i64,
    pub quantity: i64,
    pub address_id: i64,
    /// Target of the change-address mutation in the race.
    pub alt_address_id: i64,
    pub currency: String,
    pub source: String,
    pub locale: String,

    pub idempotency_concurrency: usize,
    pub concurrency_total: usize,
    pub checkout_concurrency: usize,
    pub confirm_concurrency: usize,
    pub label_concurrency: usize,
    pub dispatch_concurrency: usize,
    pub shipment_create_concurrency: usize,
    pub webhook_concurrency: usize,

    pub paid_order_no: Option<String>,
    pub ship_from_address_id: i64,
    pub declared_value: String,
    pub carrier_code: Option<String>,
    pub carrier_name: Option<String>,
    pub service_code: String,
    pub label_url: String,
    pub weight_kg: String,
    pub length_cm: String,
    pub width_cm: String,
    pub height_cm: String,
    /// Shared webhook secret; webhook checks are skipped without it.
    pub webhook_key: Option<String>,
    pub strict_webhook_dup_200: bool,
    /// Skip the second-shipment-on-one-order check.
    pub skip_split_shipment: bool,

    pub scenarios: Vec<Scenario>,
    /// Wait on stdin at approval checkpoints instead of skipping them.
    pub interactive: bool,
    pub allowed_failure_codes: BTreeSet<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            pool_size: None,
            user: None,
            admin: None,
            sku_id: 1,
            quantity: 1,
            address_id: 1,
            alt_address_id: 1,
            currency: "USD".to_string(),
            source: "DIRECT".to_string(),
            locale: "en-US".to_string(),
            idempotency_concurrency: 8,
            concurrency_total: 10,
            checkout_concurrency: 10,
            confirm_concurrency: 8,
            label_concurrency: 10,
            dispatch_concurrency: 10,
            shipment_create_concurrency: 10,
            webhook_concurrency: 10,
            paid_order_no: None,
            ship_from_address_id: 1,
            declared_value: "100.00".to_string(),
            carrier_code: None,
            carrier_name: None,
            service_code: "GROUND".to_string(),
            label_url: "https://example.com/labels/shipping-idem-test.pdf".to_string(),
            weight_kg: "1.234".to_string(),
            length_cm: "20.0".to_string(),
            width_cm: "10.0".to_string(),
            height_cm: "8.0".to_string(),
            webhook_key: None,
            strict_webhook_dup_200: false,
            skip_split_shipment: false,
            scenarios: Scenario::ALL.to_vec(),
            interactive: false,
            allowed_failure_codes: INVENTORY_SHORTAGE_CODES
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

impl HarnessConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Unset and blank values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let address_id = parse_or(&get, "ADDRESS_ID", defaults.address_id)?;
        let pool_size = match get("POOL_SIZE") {
            Some(raw) => Some(parse::<usize>("POOL_SIZE", &raw)?).filter(|n| *n > 0),
            None => None,
        };
        let scenarios = match get("SCENARIOS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Scenario::from_str)
                .collect::<Result<Vec<_>>>()?,
            None => defaults.scenarios.clone(),
        };
        let allowed_failure_codes = match get("ALLOWED_FAILURE_CODES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.allowed_failure_codes.clone(),
        };

        Ok(Self {
            base_url: get("BASE_URL").unwrap_or(defaults.base_url),
            timeout: Duration::from_secs(parse_or(&get, "TIMEOUT_SECS", 30u64)?),
            pool_size,
            user: credential(&get, "USER_ACCOUNT", "USER_PASSWORD")?,
            admin: credential(&get, "ADMIN_ACCOUNT", "ADMIN_PASSWORD")?,
            sku_id: parse_or(&get, "SKU_ID", defaults.sku_id)?,
            quantity: parse_or(&get, "QUANTITY", defaults.quantity)?,
            address_id,
            alt_address_id: parse_or(&get, "ALT_ADDRESS_ID", address_id)?,
            currency: get("CURRENCY").unwrap_or(defaults.currency),
            source: get("SOURCE").unwrap_or(defaults.source),
            locale: get("LOCALE").unwrap_or(defaults.locale),
            idempotency_concurrency: parse_or(
                &get,
                "IDEMPOTENCY_CONCURRENCY",
                defaults.idempotency_concurrency,
            )?,
            concurrency_total: parse_or(&get, "CONCURRENCY_TOTAL", defaults.concurrency_total)?,
            checkout_concurrency: parse_or(
                &get,
                "CHECKOUT_CONCURRENCY",
                defaults.checkout_concurrency,
            )?,
            confirm_concurrency: parse_or(&get, "CONFIRM_CONCURRENCY", defaults.confirm_concurrency)?,
            label_concurrency: parse_or(&get, "LABEL_CONCURRENCY", defaults.label_concurrency)?,
            dispatch_concurrency: parse_or(
                &get,
                "DISPATCH_CONCURRENCY",
                defaults.dispatch_concurrency,
            )?,
            shipment_create_concurrency: parse_or(
                &get,
                "SHIPMENT_CREATE_CONCURRENCY",
                defaults.shipment_create_concurrency,
            )?,
            webhook_concurrency: parse_or(&get, "WEBHOOK_CONCURRENCY", defaults.webhook_concurrency)?,
            paid_order_no: get("PAID_ORDER_NO"),
            ship_from_address_id: parse_or(
                &get,
                "SHIP_FROM_ADDRESS_ID",
                defaults.ship_from_address_id,
            )?,
            declared_value: get("DECLARED_VALUE").unwrap_or(defaults.declared_value),
            carrier_code: get("CARRIER_CODE"),
            carrier_name: get("CARRIER_NAME"),
            service_code: get("SERVICE_CODE").unwrap_or(defaults.service_code),
            label_url: get("LABEL_URL").unwrap_or(defaults.label_url),
            weight_kg: get("WEIGHT_KG").unwrap_or(defaults.weight_kg),
            length_cm: get("LENGTH_CM").unwrap_or(defaults.length_cm),
            width_cm: get("WIDTH_CM").unwrap_or(defaults.width_cm),
            height_cm: get("HEIGHT_CM").unwrap_or(defaults.height_cm),
            webhook_key: get("WEBHOOK_KEY"),
            strict_webhook_dup_200: flag(&get, "STRICT_WEBHOOK_DUP_200")?,
            skip_split_shipment: flag(&get, "SKIP_SPLIT_SHIPMENT")?,
            scenarios,
            interactive: flag(&get, "INTERACTIVE")?,
            allowed_failure_codes,
        })
    }

    /// Buyer credential, required by the order, payment and refund scenarios.
    pub fn require_user(&self) -> Result<&Credential> {
        self.user
            .as_ref()
            .ok_or_else(|| HarnessError::Config("USER_ACCOUNT and USER_PASSWORD are required".into()))
    }

    pub fn require_admin(&self) -> Result<&Credential> {
        self.admin
            .as_ref()
            .ok_or_else(|| HarnessError::Config("ADMIN_ACCOUNT and ADMIN_PASSWORD are required".into()))
    }

    pub fn allow_list(&self) -> AllowList {
        AllowList::new(self.allowed_failure_codes.iter().cloned())
    }

    /// Order body for the configured SKU, quantity and address.
    pub fn order_draft(&self) -> OrderDraft {
        OrderDraft {
            source: self.source.clone(),
            address_id: self.address_id,
            currency: self.currency.clone(),
            items: vec![OrderItem {
                sku_id: self.sku_id,
                quantity: self.quantity,
            }],
            discount_code: None,
            buyer_remark: None,
            locale: self.locale.clone(),
        }
    }

    /// Manual shipment body for a paid order.
    pub fn manual_shipment(&self, order_no: &str) -> ManualShipment {
        ManualShipment {
            ship_from_address_id: self.ship_from_address_id,
            order_no: order_no.to_string(),
            declared_value: self.declared_value.clone(),
            currency: self.currency.clone(),
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| HarnessError::Config(format!("{} has an invalid value: {:?}", key, raw)))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}

fn flag<G>(get: &G, key: &str) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        None | Some("0" | "false" | "no" | "off") => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some(other) => Err(HarnessError::Config(format!(
            "{} must be a boolean, got {:?}",
            key, other
        ))),
    }
}

/// Both halves or neither.
fn credential<G>(get: &G, account_key: &str, password_key: &str) -> Result<Option<Credential>>
where
    G: Fn(&str) -> Option<String>,
{
    match (get(account_key), get(password_key)) {
        (Some(account), Some(password)) => Ok(Some(Credential::new(account, password))),
        (None, None) => Ok(None),
        _ => Err(HarnessError::Config(format!(
            "{} and {} must be set together",
            account_key, password_key
        ))),
    }
}
