//! Duplicate deliveries apply exactly once

use std::sync::Arc;

use tierledger_billing::ledger::LedgerStore;
use tierledger_billing::IngestOutcome;
use tierledger_shared::Plan;

use crate::support::{
    envelope, now_ts, on_every_ledger, subscription_object, Harness, DAY, PRICE_PRO,
};

on_every_ledger!(concurrent_duplicates_apply_once);

async fn concurrent_duplicates_apply_once(harness: Arc<Harness>) {
    let customer_id = harness.id("cus_dup");
    let user = harness.user(&customer_id).await;

    let now = now_ts();
    let body = envelope(
        &harness.id("evt_dup"),
        "customer.subscription.created",
        now,
        subscription_object(
            &harness.id("sub_dup"),
            &customer_id,
            "active",
            PRICE_PRO,
            now,
            now + 30 * DAY,
            false,
        ),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let harness = harness.clone();
        let body = body.clone();
        handles.push(tokio::spawn(async move { harness.deliver(&body).await }));
    }

    let mut applied = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            IngestOutcome::Applied { .. } => applied += 1,
            IngestOutcome::AlreadyApplied => duplicates += 1,
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(duplicates, 7);

    let logs = harness.store.recent_logs(Some(user.id), 50).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(harness.reload(user.id).await.plan, Plan::Pro);
}

#[tokio::test]
async fn redelivered_payment_does_not_double_count_revenue() {
    let harness = Harness::new();
    harness.user("cus_pay").await;

    let body = envelope(
        "evt_invoice",
        "invoice.paid",
        now_ts(),
        crate::support::invoice_object("in_1", "cus_pay", "pi_1", 2900, "usd"),
    );
    assert!(matches!(
        harness.deliver(&body).await.unwrap(),
        IngestOutcome::Applied { .. }
    ));
    assert_eq!(
        harness.deliver(&body).await.unwrap(),
        IngestOutcome::AlreadyApplied
    );

    // Same payment reported again under a different event id
    let intent = envelope(
        "evt_intent",
        "payment_intent.succeeded",
        now_ts(),
        serde_json::json!({
            "id": "pi_1",
            "amount": 2900,
            "amount_received": 2900,
            "currency": "usd",
            "customer": "cus_pay",
            "invoice": "in_1",
            "payment_method_types": ["card"]
        }),
    );
    assert!(matches!(
        harness.deliver(&intent).await.unwrap(),
        IngestOutcome::Applied { .. }
    ));

    let overview = harness.billing.reconciliation.overview().await.unwrap();
    assert_eq!(overview.revenue.len(), 1);
    assert_eq!(overview.revenue[0].payment_count, 1);
    assert_eq!(overview.revenue[0].gross_minor, 2900);
}
