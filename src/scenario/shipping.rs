use crate::checker::{
    AllowList, InvariantVerdict, all_succeeded, all_success_or_allowed_failure,
    at_least_one_success, exactly_one_side_effect, response_matches, unique_identifier, value_in,
};
use crate::client::ApiClient;
use crate::error::{HarnessError, Result};
use crate::report::Report;
use crate::scenario::Context;
use crate::steps::shipments::{self, LabelDraft};
use crate::steps::{self, webhooks};
use crate::types::{IdempotencyKey, ShipmentIdentity};

pub(super) async fn run(ctx: &Context, report: &mut Report) -> Result<()> {
    let config = &ctx.config;
    let paid_order_no = config
        .paid_order_no
        .as_deref()
        .ok_or_else(|| HarnessError::Config("PAID_ORDER_NO is required for shipping".into()))?;
    let (carrier_code, carrier_name) = match (&config.carrier_code, &config.carrier_name) {
        (Some(code), Some(name)) => (code.clone(), name.clone()),
        _ => {
            return Err(HarnessError::Config(
                "CARRIER_CODE and CARRIER_NAME are required for shipping".into(),
            ));
        }
    };
    let admin = ctx.admin().await?;

    // Seed shipment for the label and dispatch batches
    let seed_key = IdempotencyKey::generate();
    let seeded = shipments::manual_create(admin, &config.manual_shipment(paid_order_no), &seed_key).await?;
    steps::require_success("shipping.seed", &seeded, shipments::MANUAL_CREATE.http)?;
    let seed = shipments::identity("shipping.seed", &seeded)?;
    tracing::info!(id = seed.id, shipment_no = %seed.shipment_no, "seed shipment created");

    // Fill label: same key, K times
    let label_key = IdempotencyKey::generate();
    let label = LabelDraft {
        ship_from_address_id: config.ship_from_address_id,
        carrier_code: carrier_code.clone(),
        carrier_name,
        service_code: config.service_code.clone(),
        tracking_no: shipments::tracking_number(),
        ext_external_id: shipments::external_label_id(),
        label_url: config.label_url.clone(),
        weight_kg: config.weight_kg.clone(),
        length_cm: config.length_cm.clone(),
        width_cm: config.width_cm.clone(),
        height_cm: config.height_cm.clone(),
        declared_value: config.declared_value.clone(),
        currency: config.currency.clone(),
    };
    let label_batch = {
        let admin = admin.clone();
        let label = label.clone();
        let key = label_key.clone();
        let shipment_id = seed.id;
        ctx.harness
            .fan_out(config.label_concurrency, move || {
                let admin = admin.clone();
                let label = label.clone();
                let key = key.clone();
                async move { shipments::fill_label(&admin, shipment_id, &label, &key).await }
            })
            .await
    };
    report.record(all_succeeded(
        "shipping.label.all_success",
        &label_batch,
        shipments::FILL_LABEL_HTTP,
    ));
    report.record(unique_identifier(
        "shipping.label.unique_identity",
        &label_batch,
        shipments::identity_handle("shipments.label"),
    )?);

    let detail = shipments::detail(admin, seed.id).await?;
    steps::require_success("shipping.label.detail", &detail, shipments::DETAIL.http)?;
    let status = shipments::status(&detail)?;
    report.record(value_in(
        "shipping.label.status_unchanged",
        Some(status.as_str()),
        &[shipments::STATUS_CREATED],
    ));
    let tracking_no = shipments::tracking_no(&detail)?;
    report.record(value_in(
        "shipping.label.tracking_no_persisted",
        Some(tracking_no.as_str()),
        &[label.tracking_no.as_str()],
    ));
    let label_ref = shipments::label_source_ref(seed.id, &label_key);
    report.record(exactly_one_side_effect(
        "shipping.label.single_status_log",
        &label_ref,
        &log_refs(admin, seed.id, &label_ref).await?,
    ));

    // Dispatch: same key, K times
    let dispatch_key = IdempotencyKey::generate();
    let dispatch_batch = {
        let admin = admin.clone();
        let key = dispatch_key.clone();
        let ids = vec![seed.id];
        ctx.harness
            .fan_out(config.dispatch_concurrency, move || {
                let admin = admin.clone();
                let key = key.clone();
                let ids = ids.clone();
                async move {
                    shipments::dispatch(&admin, &ids, "shipping-idem-concurrency-dispatch", &key)
                        .await
                }
            })
            .await
    };
    report.record(all_succeeded(
        "shipping.dispatch.all_success",
        &dispatch_batch,
        shipments::DISPATCH_HTTP,
    ));
    let missing: Vec<Vec<String>> = dispatch_batch
        .successes()
        .map(shipments::dispatch_nos)
        .filter(|nos| !nos.contains(&seed.shipment_no))
        .collect();
    report.record(InvariantVerdict::new(
        "shipping.dispatch.lists_shipment",
        format!("every success lists {}", seed.shipment_no),
        if missing.is_empty() {
            "all listed".to_string()
        } else {
            format!("{} missing: {:?}", missing.len(), missing)
        },
        missing.is_empty(),
    ));

    let detail = shipments::detail(admin, seed.id).await?;
    steps::require_success("shipping.dispatch.detail", &detail, shipments::DETAIL.http)?;
    let status = shipments::status(&detail)?;
    report.record(value_in(
        "shipping.dispatch.status",
        Some(status.as_str()),
        &[shipments::STATUS_LABEL_CREATED],
    ));
    let dispatch_ref = shipments::dispatch_source_ref(&dispatch_key, seed.id);
    report.record(exactly_one_side_effect(
        "shipping.dispatch.single_status_log",
        &dispatch_ref,
        &log_refs(admin, seed.id, &dispatch_ref).await?,
    ));

    listings(ctx, paid_order_no, &seed, report).await?;

    // Manual create: same key, K times
    let create_key = IdempotencyKey::generate();
    let create_batch = {
        let admin = admin.clone();
        let key = create_key.clone();
        let shipment = config.manual_shipment(paid_order_no);
        ctx.harness
            .fan_out(config.shipment_create_concurrency, move || {
                let admin = admin.clone();
                let key = key.clone();
                let shipment = shipment.clone();
                async move { shipments::manual_create(&admin, &shipment, &key).await }
            })
            .await
    };
    report.record(at_least_one_success("shipping.create.any_success", &create_batch));
    report.record(all_success_or_allowed_failure(
        "shipping.create.success_or_conflict",
        &create_batch,
        &AllowList::state_refusal().require_success_status(shipments::MANUAL_CREATE.http),
    ));
    report.record(unique_identifier(
        "shipping.create.unique_identity",
        &create_batch,
        shipments::identity_handle("shipments.manual_create"),
    )?);
    match create_batch.successes().next() {
        Some(first) => {
            let created = shipments::identity("shipments.manual_create", first)?;
            let create_ref = shipments::manual_create_source_ref(&create_key);
            report.record(exactly_one_side_effect(
                "shipping.create.single_status_log",
                &create_ref,
                &log_refs(admin, created.id, &create_ref).await?,
            ));
        }
        None => report.skip("shipping.create.single_status_log", "no shipment created"),
    }

    if config.skip_split_shipment {
        report.skip("shipping.split", "SKIP_SPLIT_SHIPMENT set");
    } else {
        split_shipment(ctx, paid_order_no, &seed, report).await?;
    }

    match config.webhook_key.as_deref() {
        Some(secret) => {
            let raw = webhooks::picked_up_event(&tracking_no, &carrier_code);
            let payload = webhooks::SignedPayload::sign(raw, secret);
            webhook_duplicates(ctx, admin, seed.id, payload, report).await?;
        }
        None => report.skip("shipping.webhook", "WEBHOOK_KEY not set"),
    }
    Ok(())
}

/// The seed shipment as the admin page and the buyer see it.
async fn listings(
    ctx: &Context,
    order_no: &str,
    seed: &ShipmentIdentity,
    report: &mut Report,
) -> Result<()> {
    let admin = ctx.admin().await?;
    let user = ctx.user().await?;

    let page = shipments::admin_page(admin, order_no).await?;
    steps::require_success("shipping.admin_page", &page, shipments::LIST.http)?;
    report.record(listed(
        "shipping.admin_page.lists_shipment",
        shipments::find_listed("shipments.admin_page", &page, &seed.shipment_no)?.is_some(),
        &seed.shipment_no,
    ));

    let with_logs = shipments::user_order_shipments(user, order_no, true).await?;
    steps::require_success("shipping.user_list", &with_logs, shipments::LIST.http)?;
    let item = shipments::find_listed("shipments.user_list", &with_logs, &seed.shipment_no)?;
    let log_count = item.as_ref().and_then(|i| i.status_logs.as_ref()).map(Vec::len);
    report.record(InvariantVerdict::new(
        "shipping.user_list.with_logs",
        format!("{} listed with >= 1 status log", seed.shipment_no),
        match (&item, log_count) {
            (None, _) => "not listed".to_string(),
            (Some(_), None) => "status_logs missing".to_string(),
            (Some(_), Some(n)) => format!("{} status logs", n),
        },
        log_count.is_some_and(|n| n >= 1),
    ));

    let without_logs = shipments::user_order_shipments(user, order_no, false).await?;
    steps::require_success("shipping.user_list", &without_logs, shipments::LIST.http)?;
    let item = shipments::find_listed("shipments.user_list", &without_logs, &seed.shipment_no)?;
    let log_count = item.as_ref().and_then(|i| i.status_logs.as_ref()).map(Vec::len);
    report.record(InvariantVerdict::new(
        "shipping.user_list.without_logs",
        format!("{} listed with no status logs", seed.shipment_no),
        match (&item, log_count) {
            (None, _) => "not listed".to_string(),
            (Some(_), n) => format!("{} status logs", n.unwrap_or(0)),
        },
        item.is_some() && log_count.unwrap_or(0) == 0,
    ));

    let detail = shipments::user_detail(user, &seed.shipment_no).await?;
    steps::require_success("shipping.user_detail", &detail, shipments::DETAIL.http)?;
    let seen = shipments::identity("shipments.user_detail", &detail)?;
    report.record(InvariantVerdict::new(
        "shipping.user_detail.identity",
        format!("{}/{}", seed.id, seed.shipment_no),
        format!("{}/{}", seen.id, seen.shipment_no),
        seen == *seed,
    ));
    Ok(())
}

/// A second shipment on the same order is a new shipment, and the buyer sees both.
async fn split_shipment(
    ctx: &Context,
    order_no: &str,
    seed: &ShipmentIdentity,
    report: &mut Report,
) -> Result<()> {
    let admin = ctx.admin().await?;
    let user = ctx.user().await?;

    let created = shipments::manual_create(
        admin,
        &ctx.config.manual_shipment(order_no),
        &IdempotencyKey::generate(),
    )
    .await?;
    steps::require_success("shipping.split.create", &created, shipments::MANUAL_CREATE.http)?;
    let second = shipments::identity("shipments.split_create", &created)?;
    tracing::info!(id = second.id, shipment_no = %second.shipment_no, "second shipment created");
    report.record(InvariantVerdict::new(
        "shipping.split.distinct_id",
        format!("id != {}", seed.id),
        second.id,
        second.id != seed.id,
    ));

    let listing = shipments::user_order_shipments(user, order_no, true).await?;
    steps::require_success("shipping.split.user_list", &listing, shipments::LIST.http)?;
    let first_listed = shipments::find_listed("shipments.user_list", &listing, &seed.shipment_no)?;
    let second_listed =
        shipments::find_listed("shipments.user_list", &listing, &second.shipment_no)?;
    report.record(listed(
        "shipping.split.both_listed",
        first_listed.is_some() && second_listed.is_some(),
        &format!("{} and {}", seed.shipment_no, second.shipment_no),
    ));
    Ok(())
}

fn listed(name: &str, found: bool, what: &str) -> InvariantVerdict {
    InvariantVerdict::new(
        name,
        format!("{} listed", what),
        if found { "listed" } else { "not listed" },
        found,
    )
}

/// Same signed event delivered K times at once, then once more.
async fn webhook_duplicates(
    ctx: &Context,
    admin: &ApiClient,
    shipment_id: i64,
    payload: webhooks::SignedPayload,
    report: &mut Report,
) -> Result<()> {
    let strict = ctx.config.strict_webhook_dup_200;
    let batch = {
        let admin = admin.clone();
        let payload = payload.clone();
        ctx.harness
            .fan_out(ctx.config.webhook_concurrency, move || {
                let admin = admin.clone();
                let payload = payload.clone();
                async move { webhooks::deliver(&admin, &payload).await }
            })
            .await
    };
    let rejected: Vec<String> = batch
        .iter()
        .filter(|r| !webhooks::duplicate_acceptable(r, strict))
        .map(|r| r.summary())
        .collect();
    report.record(InvariantVerdict::new(
        "shipping.webhook.concurrent_duplicates",
        if strict {
            "all 200 success"
        } else {
            "200 success or 409 conflict, at least one 200"
        },
        format!("{:?}", batch.outcomes()),
        rejected.is_empty() && batch.success_count() >= 1,
    ));

    let replay = webhooks::deliver(admin, &payload).await?;
    report.record(response_matches(
        "shipping.webhook.sequential_replay",
        &replay,
        &webhooks::DELIVERED,
    ));

    let source_ref = payload.source_ref();
    report.record(exactly_one_side_effect(
        "shipping.webhook.single_status_log",
        &source_ref,
        &log_refs(admin, shipment_id, &source_ref).await?,
    ));

    let detail = shipments::detail(admin, shipment_id).await?;
    steps::require_success("shipping.webhook.detail", &detail, shipments::DETAIL.http)?;
    let status = shipments::status(&detail)?;
    report.record(value_in(
        "shipping.webhook.status",
        Some(status.as_str()),
        &[shipments::STATUS_PICKED_UP],
    ));
    Ok(())
}

async fn log_refs(admin: &ApiClient, shipment_id: i64, source_ref: &str) -> Result<Vec<String>> {
    let logs = shipments::status_logs(admin, shipment_id, source_ref).await?;
    steps::require_success("shipping.status_logs", &logs, &[200])?;
    shipments::log_source_refs(&logs)
}
