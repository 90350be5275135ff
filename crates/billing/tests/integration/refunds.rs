//! Refund handling keeps amounts monotonic and bounded

use tierledger_billing::ledger::{LedgerStore, PaymentKey};
use tierledger_billing::IngestOutcome;
use tierledger_shared::PaymentStatus;

use crate::support::{charge_object, envelope, invoice_object, now_ts, Harness};

fn payment_key() -> PaymentKey {
    PaymentKey {
        payment_intent_id: Some("pi_ref".into()),
        invoice_id: None,
    }
}

#[tokio::test]
async fn refunds_only_grow_and_are_clamped() {
    let harness = Harness::new();
    harness.user("cus_ref").await;

    let paid = envelope(
        "evt_paid",
        "invoice.paid",
        now_ts(),
        invoice_object("in_ref", "cus_ref", "pi_ref", 5000, "usd"),
    );
    harness.deliver(&paid).await.unwrap();

    let partial = envelope("evt_r1", "charge.refunded", now_ts(), charge_object("pi_ref", 5000, 2000));
    assert!(matches!(
        harness.deliver(&partial).await.unwrap(),
        IngestOutcome::Applied { .. }
    ));
    let payment = harness.store.find_payment(&payment_key()).await.unwrap().unwrap();
    assert_eq!(payment.refunded_amount, 2000);
    assert_eq!(payment.status, PaymentStatus::PartiallyRefunded);

    // A delayed event carrying an older, smaller refund total
    let delayed = envelope("evt_r0", "charge.refunded", now_ts(), charge_object("pi_ref", 5000, 1000));
    harness.deliver(&delayed).await.unwrap();
    let payment = harness.store.find_payment(&payment_key()).await.unwrap().unwrap();
    assert_eq!(payment.refunded_amount, 2000);

    // A charge reporting more than was paid
    let over = envelope("evt_r2", "charge.refunded", now_ts(), charge_object("pi_ref", 9000, 9000));
    harness.deliver(&over).await.unwrap();
    let payment = harness.store.find_payment(&payment_key()).await.unwrap().unwrap();
    assert_eq!(payment.amount, 5000);
    assert_eq!(payment.refunded_amount, 5000);
    assert_eq!(payment.status, PaymentStatus::Refunded);

    // A late failure notice never regresses a captured payment
    let failed = envelope(
        "evt_fail",
        "payment_intent.payment_failed",
        now_ts(),
        serde_json::json!({
            "id": "pi_ref",
            "amount": 5000,
            "currency": "usd",
            "customer": "cus_ref",
            "last_payment_error": {"code": "card_declined", "message": "Your card was declined."}
        }),
    );
    harness.deliver(&failed).await.unwrap();
    let payment = harness.store.find_payment(&payment_key()).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Refunded);

    let overview = harness.billing.reconciliation.overview().await.unwrap();
    assert_eq!(overview.revenue[0].gross_minor, 5000);
    assert_eq!(overview.revenue[0].refunded_minor, 5000);
    assert_eq!(overview.revenue[0].net_minor, 0);
}

#[tokio::test]
async fn refund_for_unknown_owner_is_rejected_and_logged() {
    let harness = Harness::new();

    let orphan = envelope("evt_orphan", "charge.refunded", now_ts(), charge_object("pi_none", 100, 100));
    let outcome = harness.deliver(&orphan).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Rejected { .. }));
    assert!(harness
        .store
        .find_log_by_event("evt_orphan")
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        harness.deliver(&orphan).await.unwrap(),
        IngestOutcome::AlreadyApplied
    );
}
