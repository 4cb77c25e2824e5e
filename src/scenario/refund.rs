use crate::checker::{
    AllowList, all_success_or_allowed_failure, at_least_one_success, exactly_one_side_effect,
    response_matches,
};
use crate::error::{HarnessError, Result};
use crate::report::Report;
use crate::scenario::Context;
use crate::steps::{self, orders, payments};
use crate::types::IdempotencyKey;

pub(super) async fn run(ctx: &Context, report: &mut Report) -> Result<()> {
    let user = ctx.user().await?;
    let admin = ctx.admin().await?;
    let config = &ctx.config;

    let draft = config
        .order_draft()
        .with_remark(format!("refund-create-{}", IdempotencyKey::generate()));
    let created = orders::create(user, &draft, Some(&IdempotencyKey::generate())).await?;
    steps::require_success("refund.create", &created, &[200, 201])?;
    let order_no = orders::order_no(&created)?
        .ok_or_else(|| HarnessError::contract("refund.create", "order_no missing"))?;

    let checkout = payments::checkout(user, &order_no, &IdempotencyKey::generate()).await?;
    steps::require_success("refund.checkout", &checkout, payments::CHECKOUT.http)?;
    let attempt = payments::checkout_created(&checkout)?;
    let approve_url = attempt
        .approve_url
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| HarnessError::contract("refund.checkout", "approve_url missing"))?;
    if attempt.paypal_order_id.as_deref().is_none_or(str::is_empty) {
        return Err(HarnessError::contract("refund.checkout", "paypal_order_id missing"));
    }

    let prompt = format!("approve payment {} in the browser: {}", attempt.payment_id, approve_url);
    if !ctx.signal.wait(&prompt).await {
        report.skip("refund", "payment approval not given");
        return Ok(());
    }

    let capture = payments::capture(
        user,
        attempt.payment_id,
        "refund capture",
        &IdempotencyKey::generate(),
    )
    .await?;
    report.record(response_matches("refund.capture", &capture, &payments::CAPTURE));
    let capture_status = payments::payment_status(&capture);

    let detail = orders::detail(user, &order_no).await?;
    report.record(response_matches("refund.order_detail", &detail, &orders::DETAIL));
    let admin_detail = orders::admin_detail(admin, &order_no).await?;
    report.record(response_matches(
        "refund.admin_order_detail",
        &admin_detail,
        &orders::ADMIN_VIEW,
    ));
    let listed = payments::admin_payments(admin, &order_no).await?;
    report.record(response_matches("refund.admin_payments", &listed, &orders::ADMIN_VIEW));
    let sync = payments::admin_sync(admin, attempt.payment_id).await?;
    report.record(response_matches("refund.admin_payment_sync", &sync, &payments::SYNC));

    if capture_status.as_deref() != Some(payments::STATUS_SUCCESS) {
        let cancel = payments::cancel(user, attempt.payment_id, &IdempotencyKey::generate()).await?;
        report.record(response_matches("refund.cancel_uncaptured", &cancel, &payments::CANCEL));
        report.skip(
            "refund.confirm",
            format!("capture status {:?}, nothing to refund", capture_status),
        );
        return Ok(());
    }

    let request = orders::refund_request(user, &order_no, "OTHER", "refund request").await?;
    report.record(response_matches("refund.request", &request, &orders::REFUND_REQUEST));

    // K operators confirm at once; stock must come back exactly once
    let confirms = {
        let admin = admin.clone();
        let order_no = order_no.clone();
        ctx.harness
            .fan_out(config.confirm_concurrency, move || {
                let admin = admin.clone();
                let order_no = order_no.clone();
                async move { orders::confirm_refund(&admin, &order_no, "confirm refund").await }
            })
            .await
    };
    report.record(at_least_one_success("refund.confirm.any_success", &confirms));
    // Late confirmations replay or conflict; anything else is a defect
    report.record(all_success_or_allowed_failure(
        "refund.confirm.success_or_conflict",
        &confirms,
        &AllowList::state_refusal(),
    ));
    tracing::info!(outcomes = ?confirms.outcomes(), "concurrent refund confirmations");

    let logs = orders::inventory_logs(admin, &order_no).await?;
    steps::require_success("refund.inventory_logs", &logs, orders::ADMIN_VIEW.http)?;
    let change_types = orders::inventory_change_types(&logs)?;
    // One order item, so one restock row
    report.record(exactly_one_side_effect(
        "refund.confirm.single_restock",
        orders::RESTOCK,
        &change_types,
    ));

    let refunds = payments::admin_refunds(admin, &order_no).await?;
    report.record(response_matches("refund.admin_refunds", &refunds, &orders::ADMIN_VIEW));
    Ok(())
}
