//! Quota enforcement under concurrency

use std::sync::Arc;

use tierledger_billing::BillingError;
use tierledger_shared::Plan;

use crate::support::{on_every_ledger, subscribe, Harness, PRICE_BASIC};

on_every_ledger!(concurrent_consumers_never_exceed_limit);
on_every_ledger!(concurrent_batches_stop_at_the_boundary);

async fn concurrent_consumers_never_exceed_limit(harness: Arc<Harness>) {
    let user = harness.user(&harness.id("cus_quota")).await;

    let mut handles = Vec::new();
    for _ in 0..150 {
        let harness = harness.clone();
        handles.push(tokio::spawn(async move {
            harness
                .billing
                .usage
                .check_and_consume(user.id, Plan::Free, 1)
                .await
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 100);

    let user = harness.reload(user.id).await;
    assert_eq!(user.period_usage, 100);
    assert_eq!(user.total_transformations, 100);
    assert_eq!(user.free_trials_remaining, 0);
}

async fn concurrent_batches_stop_at_the_boundary(harness: Arc<Harness>) {
    let user = harness.user(&harness.id("cus_batch")).await;

    let mut handles = Vec::new();
    for _ in 0..50 {
        let harness = harness.clone();
        handles.push(tokio::spawn(async move {
            harness
                .billing
                .usage
                .check_and_consume(user.id, Plan::Free, 3)
                .await
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        let decision = handle.await.unwrap().unwrap();
        if decision.allowed {
            allowed += 1;
        } else {
            assert_eq!(decision.remaining, 1);
        }
    }
    assert_eq!(allowed, 33);
    assert_eq!(harness.reload(user.id).await.period_usage, 99);
}

#[tokio::test]
async fn upgrade_resets_period_and_raises_limit() {
    let harness = Harness::new();
    let user = harness.user("cus_up").await;

    let decision = harness
        .billing
        .usage
        .check_and_consume_for_user(user.id, 100)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert!(!harness
        .billing
        .usage
        .check_and_consume_for_user(user.id, 1)
        .await
        .unwrap()
        .allowed);

    subscribe(&harness, "evt_up", "cus_up", PRICE_BASIC).await;

    let user = harness.reload(user.id).await;
    assert_eq!(user.plan, Plan::Basic);
    assert_eq!(user.period_usage, 0);
    assert_eq!(user.total_transformations, 100);

    let decision = harness
        .billing
        .usage
        .check_and_consume_for_user(user.id, 10)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 990);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let harness = Harness::new();
    let user = harness.user("cus_bad").await;
    assert!(matches!(
        harness.billing.usage.check_and_consume(user.id, Plan::Free, -5).await,
        Err(BillingError::Validation(_))
    ));
}
