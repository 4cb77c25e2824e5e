use std::collections::BTreeSet;

use crate::checker::{
    AllowList, all_success_or_allowed_failure, at_least_one_success, at_most_one_success, duplicate_count_at_most,
    monotonic_total_increase, race_outcome_consistent, response_matches, unique_identifier,
    value_in, won_or_refused,
};
use crate::error::Result;
use crate::harness::Operation;
use crate::report::Report;
use crate::scenario::Context;
use crate::steps::orders::{self, OrderMutation};
use crate::types::{IdempotencyKey, ResourceHandle};

const LIST_PAGE_SIZE: u32 = 40;

pub(super) async fn run(ctx: &Context, report: &mut Report) -> Result<()> {
    let user = ctx.user().await?;
    let config = &ctx.config;
    let draft = config.order_draft();
    let allowed = config.allow_list();

    let before = orders::list(user, 1, LIST_PAGE_SIZE).await?;
    report.record(response_matches("orders.list_before", &before, &orders::LIST));
    let before_total = orders::list_total(&before);

    let preview = orders::preview(
        user,
        &draft.with_remark(format!("idem-preview-{}", IdempotencyKey::generate())),
    )
    .await?;
    report.record(response_matches("orders.preview", &preview, &orders::PREVIEW));

    // Same key, K times at once: one order
    let key = IdempotencyKey::generate();
    let idem_draft = draft.with_remark(format!("idem-create-{}", key));
    let idem_batch = {
        let user = user.clone();
        ctx.harness
            .fan_out(config.idempotency_concurrency, move || {
                let user = user.clone();
                let draft = idem_draft.clone();
                let key = key.clone();
                async move { orders::create(&user, &draft, Some(&key)).await }
            })
            .await
    };
    report.record(unique_identifier(
        "orders.idempotency.unique_order_no",
        &idem_batch,
        orders::order_no,
    )?);
    report.record(all_success_or_allowed_failure(
        "orders.idempotency.all_success_or_allowed_failure",
        &idem_batch,
        &allowed,
    ));
    let idem_ids = idem_batch.identifiers(orders::order_no)?;
    tracing::info!(ids = ?idem_ids, outcomes = ?idem_batch.outcomes(), "same-key creates");

    // Distinct keys: independent orders, never the same number twice
    let conc_batch = {
        let user = user.clone();
        let draft = draft.with_remark("concurrency-create");
        ctx.harness
            .fan_out(config.concurrency_total, move || {
                let user = user.clone();
                let draft = draft.clone();
                async move {
                    let key = IdempotencyKey::generate();
                    orders::create(&user, &draft, Some(&key)).await
                }
            })
            .await
    };
    let conc_ids = conc_batch.identifiers(orders::order_no)?;
    report.record(duplicate_count_at_most(
        "orders.concurrency.duplicate_order_nos",
        &conc_ids,
        0,
    ));
    report.record(all_success_or_allowed_failure(
        "orders.concurrency.create_success_or_allowed_failure",
        &conc_batch,
        &allowed.clone().require_success_status(orders::CREATE.http),
    ));

    let target = conc_ids.iter().min().or_else(|| idem_ids.first()).cloned();
    match target {
        Some(order_no) => race(ctx, &order_no, report).await?,
        None => report.skip("orders.race", "no order was created"),
    }

    let after = orders::list(user, 1, LIST_PAGE_SIZE).await?;
    report.record(response_matches("orders.list_after", &after, &orders::LIST));

    let created: BTreeSet<&ResourceHandle> = idem_ids.iter().chain(&conc_ids).collect();
    match (before_total, orders::list_total(&after)) {
        (Some(before), Some(after)) => {
            report.record(monotonic_total_increase(
                "orders.side_effect.total_increase",
                before,
                after,
                created.len() as i64,
            ));
        }
        _ => report.skip("orders.side_effect.total_increase", "list meta.total missing"),
    }
    Ok(())
}

/// Cancel, refund-request and change-address against one order at once.
async fn race(ctx: &Context, order_no: &ResourceHandle, report: &mut Report) -> Result<()> {
    let user = ctx.user().await?;
    let alt_address_id = ctx.config.alt_address_id;

    let contenders: Vec<Operation> = OrderMutation::ALL
        .into_iter()
        .map(|mutation| {
            let user = user.clone();
            let order_no = order_no.clone();
            let op: Operation = Box::pin(async move {
                orders::apply(&user, &order_no, mutation, alt_address_id).await
            });
            op
        })
        .collect();
    let batch = ctx.harness.race(contenders).await;

    let labels: Vec<&str> = OrderMutation::ALL.iter().map(|m| m.label()).collect();
    let refusals = AllowList::state_refusal();
    for (mutation, result) in OrderMutation::ALL.iter().zip(batch.iter()) {
        report.record(won_or_refused(
            &format!("orders.race.{}", mutation.label()),
            result,
            &mutation.expectation(),
            &refusals,
        ));
    }
    report.record(at_most_one_success(
        "orders.race.max_success_ops",
        &labels,
        &batch,
    )?);
    // The target is still pending, so cancel or change-address must get through
    report.record(at_least_one_success("orders.race.one_winner", &batch));

    let detail = orders::detail(user, order_no).await?;
    report.record(response_matches("orders.race.detail", &detail, &orders::DETAIL));
    if !detail.success() {
        return Ok(());
    }
    let detail = orders::order_detail(&detail)?;

    let visible: Vec<bool> = OrderMutation::ALL
        .iter()
        .map(|m| m.visible_in(&detail))
        .collect();
    report.record(race_outcome_consistent(
        "orders.race.detail_consistent",
        &labels,
        &batch,
        &visible,
    )?);

    let status = detail.status.as_deref();
    for (mutation, result) in OrderMutation::ALL.iter().zip(batch.iter()) {
        if !result.success() {
            continue;
        }
        let verdict = match mutation {
            OrderMutation::Cancel => value_in(
                "orders.race.status_after_cancel",
                status,
                &[orders::STATUS_CANCELLED],
            ),
            OrderMutation::RefundRequest => value_in(
                "orders.race.status_after_refund",
                status,
                &[orders::STATUS_REFUNDING, orders::STATUS_REFUNDED],
            ),
            OrderMutation::ChangeAddress => value_in(
                "orders.race.address_changed",
                detail.address_changed,
                &[true],
            ),
        };
        report.record(verdict);
    }
    Ok(())
}
