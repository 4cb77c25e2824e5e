use crate::checker::{
    AllowList, all_succeeded, all_success_or_allowed_failure, at_least_one_success,
    response_matches, unique_identifier,
};
use crate::error::{HarnessError, Result};
use crate::harness::Operation;
use crate::report::Report;
use crate::scenario::Context;
use crate::steps::{self, orders, payments};
use crate::types::{IdempotencyKey, ResourceHandle};

pub(super) async fn run(ctx: &Context, report: &mut Report) -> Result<()> {
    let user = ctx.user().await?;
    let config = &ctx.config;

    let key = IdempotencyKey::generate();
    let draft = config.order_draft().with_remark(format!("idem-create-{}", key));
    let create_batch = {
        let user = user.clone();
        ctx.harness
            .fan_out(config.idempotency_concurrency, move || {
                let user = user.clone();
                let draft = draft.clone();
                let key = key.clone();
                async move { orders::create(&user, &draft, Some(&key)).await }
            })
            .await
    };
    report.record(unique_identifier(
        "payments.create.unique_order_no",
        &create_batch,
        orders::order_no,
    )?);
    let order_no = create_batch
        .distinct_identifiers(orders::order_no)?
        .pop_first()
        .ok_or_else(|| {
            HarnessError::contract(
                "payments.create",
                format!("no successful create: {:?}", create_batch.outcomes()),
            )
        })?;
    tracing::info!(%order_no, "order created for payment checks");

    // Distinct keys, same order: the backend must reuse one payment attempt
    let checkout_batch = {
        let user = user.clone();
        let order_no = order_no.clone();
        ctx.harness
            .fan_out(config.checkout_concurrency, move || {
                let user = user.clone();
                let order_no = order_no.clone();
                async move {
                    payments::checkout(&user, &order_no, &IdempotencyKey::generate()).await
                }
            })
            .await
    };
    report.record(at_least_one_success("payments.checkout.any_success", &checkout_batch));
    report.record(all_success_or_allowed_failure(
        "payments.checkout.success_or_conflict",
        &checkout_batch,
        &AllowList::state_refusal().require_success_status(payments::CHECKOUT.http),
    ));
    report.record(unique_identifier(
        "payments.checkout.single_payment_id",
        &checkout_batch,
        payments::payment_id,
    )?);
    let payment_id = checkout_batch
        .distinct_identifiers(payments::payment_id)?
        .first()
        .and_then(ResourceHandle::as_i64)
        .ok_or_else(|| {
            HarnessError::contract(
                "payments.checkout",
                format!("no payment id: {:?}", checkout_batch.outcomes()),
            )
        })?;

    // Cancel is idempotent: a repeat with a fresh key still succeeds
    let first = payments::cancel(user, payment_id, &IdempotencyKey::generate()).await?;
    report.record(response_matches("payments.cancel.first", &first, &payments::CANCEL));
    let repeat = payments::cancel(user, payment_id, &IdempotencyKey::generate()).await?;
    report.record(response_matches("payments.cancel.repeat", &repeat, &payments::CANCEL));

    cancel_capture_race(ctx, &order_no, report).await
}

/// Capture and cancel a freshly approved attempt at the same time.
async fn cancel_capture_race(
    ctx: &Context,
    order_no: &ResourceHandle,
    report: &mut Report,
) -> Result<()> {
    let user = ctx.user().await?;

    let checkout = payments::checkout(user, order_no, &IdempotencyKey::generate()).await?;
    steps::require_success("payments.recheckout", &checkout, payments::CHECKOUT.http)?;
    let created = payments::checkout_created(&checkout)?;
    let prompt = format!(
        "approve payment {} in the browser: {}",
        created.payment_id,
        created.approve_url.as_deref().unwrap_or("<no approve_url>")
    );
    if !ctx.signal.wait(&prompt).await {
        report.skip("payments.cancel_capture_race", "payment approval not given");
        return Ok(());
    }

    let payment_id = created.payment_id;
    let capture_user = user.clone();
    let cancel_user = user.clone();
    let capture: Operation = Box::pin(async move {
        payments::capture(&capture_user, payment_id, "race capture", &IdempotencyKey::generate())
            .await
    });
    let cancel: Operation = Box::pin(async move {
        payments::cancel(&cancel_user, payment_id, &IdempotencyKey::generate()).await
    });
    let batch = ctx.harness.race(vec![capture, cancel]).await;

    report.record(all_succeeded(
        "payments.race.both_answered",
        &batch,
        payments::CAPTURE.http,
    ));
    tracing::info!(
        capture = ?batch.get(0).and_then(payments::payment_status),
        cancel = ?batch.get(1).and_then(payments::payment_status),
        "cancel vs capture outcome"
    );
    Ok(())
}
