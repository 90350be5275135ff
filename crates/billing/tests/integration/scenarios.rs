//! End-to-end acceptance scenarios

use tierledger_billing::ledger::{HistoryEntry, HistoryKind, LedgerStore, PageRequest};
use tierledger_billing::IngestOutcome;
use tierledger_shared::{LogAction, Plan, SubscriptionStatus};

use crate::support::{envelope, invoice_object, now_ts, subscription_object, Harness, DAY, PRICE_PRO};

#[tokio::test]
async fn free_user_is_denied_at_the_101st_operation() {
    let harness = Harness::new();
    let user = harness.user("cus_free").await;

    for i in 1..=100 {
        let decision = harness
            .billing
            .usage
            .check_and_consume(user.id, Plan::Free, 1)
            .await
            .unwrap();
        assert!(decision.allowed, "operation {} should be allowed", i);
        assert_eq!(decision.remaining, 100 - i);
    }

    let denied = harness
        .billing
        .usage
        .check_and_consume(user.id, Plan::Free, 1)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    assert_eq!(harness.reload(user.id).await.period_usage, 100);
}

#[tokio::test]
async fn redelivered_event_leaves_one_record_and_one_log() {
    let harness = Harness::new();
    let user = harness.user("cus_b").await;

    let now = now_ts();
    let body = envelope(
        "evt_1",
        "customer.subscription.created",
        now,
        subscription_object("sub_b", "cus_b", "active", PRICE_PRO, now, now + 30 * DAY, false),
    );

    assert!(matches!(
        harness.deliver(&body).await.unwrap(),
        IngestOutcome::Applied { .. }
    ));
    assert_eq!(
        harness.deliver(&body).await.unwrap(),
        IngestOutcome::AlreadyApplied
    );

    let history = harness
        .billing
        .reconciliation
        .history(user.id, Some(HistoryKind::Subscription), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(history.total, 1);
    match &history.items[0] {
        HistoryEntry::Subscription(record) => {
            assert_eq!(record.external_id, "sub_b");
            assert_eq!(record.status, SubscriptionStatus::Active);
        }
        other => panic!("unexpected history entry {:?}", other),
    }

    let logs = harness.store.recent_logs(Some(user.id), 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].action, LogAction::Created);
    assert_eq!(logs[0].external_event_id.as_deref(), Some("evt_1"));
}

#[tokio::test]
async fn succeeded_payment_is_reported_in_major_units() {
    let harness = Harness::new();
    let user = harness.user("cus_c").await;

    let body = envelope(
        "evt_c",
        "invoice.payment_succeeded",
        now_ts(),
        invoice_object("in_c", "cus_c", "pi_c", 4999, "usd"),
    );
    harness.deliver(&body).await.unwrap();

    let overview = harness.billing.reconciliation.overview().await.unwrap();
    assert_eq!(overview.revenue.len(), 1);
    let usd = &overview.revenue[0];
    assert_eq!(usd.currency, "usd");
    assert_eq!(usd.gross_minor, 4999);
    assert_eq!(usd.gross, 49.99);
    assert_eq!(usd.net, 49.99);

    let monthly = harness.billing.reconciliation.monthly_revenue(1).await.unwrap();
    assert_eq!(monthly.len(), 1);
    assert_eq!(monthly[0].revenue.gross, 49.99);

    let payments = harness
        .billing
        .reconciliation
        .history(user.id, Some(HistoryKind::Payment), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(payments.total, 1);
    match &payments.items[0] {
        HistoryEntry::Payment(payment) => assert_eq!(payment.plan, Some(Plan::Pro)),
        other => panic!("unexpected history entry {:?}", other),
    }
}
