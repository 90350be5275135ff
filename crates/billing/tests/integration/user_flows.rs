//! User-initiated plan changes, cancellations and the lapse sweep

use time::{Duration, OffsetDateTime};

use tierledger_billing::ledger::LedgerStore;
use tierledger_billing::{BillingError, IngestOutcome};
use tierledger_shared::{ActorType, LogAction, LogOutcome, Plan, SubscriptionStatus};

use crate::support::{envelope, now_ts, subscribe, subscription_object, Harness, PRICE_BASIC};

#[tokio::test]
async fn change_plan_goes_through_provider_then_ledger() {
    let harness = Harness::new();
    let user = harness.user("cus_change").await;
    subscribe(&harness, "evt_sub", "cus_change", PRICE_BASIC).await;

    let applied = harness
        .billing
        .reconciliation
        .change_plan(user.id, Plan::Pro)
        .await
        .unwrap();

    assert_eq!(applied.log.action, LogAction::Updated);
    assert_eq!(applied.log.actor, ActorType::User);
    assert!(applied.log.external_event_id.is_none());
    assert_eq!(applied.log.from_plan, Some(Plan::Basic));
    assert_eq!(applied.log.to_plan, Some(Plan::Pro));
    assert_eq!(harness.reload(user.id).await.plan, Plan::Pro);
    assert_eq!(harness.provider.calls(), 1);
}

#[tokio::test]
async fn invalid_plan_change_never_reaches_provider() {
    let harness = Harness::new();
    let user = harness.user("cus_invalid").await;
    subscribe(&harness, "evt_sub", "cus_invalid", PRICE_BASIC).await;

    let to_free = harness.billing.reconciliation.change_plan(user.id, Plan::Free).await;
    assert!(matches!(to_free, Err(BillingError::Validation(_))));
    let same = harness.billing.reconciliation.change_plan(user.id, Plan::Basic).await;
    assert!(matches!(same, Err(BillingError::Validation(_))));
    assert_eq!(harness.provider.calls(), 0);

    let stranger = harness.user("cus_none").await;
    let missing = harness
        .billing
        .reconciliation
        .change_plan(stranger.id, Plan::Pro)
        .await;
    assert!(matches!(missing, Err(BillingError::NotFound(_))));
}

#[tokio::test]
async fn provider_timeout_leaves_ledger_untouched() {
    let harness = Harness::new();
    let user = harness.user("cus_timeout").await;
    subscribe(&harness, "evt_sub", "cus_timeout", PRICE_BASIC).await;

    harness.provider.fail_next_with_timeout();
    let result = harness
        .billing
        .reconciliation
        .change_plan(user.id, Plan::Pro)
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, BillingError::Timeout(_)));
    assert!(err.is_retryable());
    assert_eq!(harness.reload(user.id).await.plan, Plan::Basic);
    assert_eq!(
        harness.store.recent_logs(Some(user.id), 10).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn cancel_at_period_end_then_reactivate() {
    let harness = Harness::new();
    let user = harness.user("cus_cancel").await;
    subscribe(&harness, "evt_sub", "cus_cancel", PRICE_BASIC).await;

    let cancelled = harness
        .billing
        .reconciliation
        .cancel(user.id, true)
        .await
        .unwrap();
    assert_eq!(cancelled.log.action, LogAction::Cancelled);
    assert!(cancelled.subscription.unwrap().cancel_at_period_end);

    let status = harness.billing.reconciliation.status(user.id).await.unwrap();
    assert!(status.is_active);
    assert_eq!(status.plan, Plan::Basic);
    assert!(status.cancel_at_period_end);

    // Cancelling twice is refused
    assert!(matches!(
        harness.billing.reconciliation.cancel(user.id, true).await,
        Err(BillingError::Validation(_))
    ));

    let reactivated = harness
        .billing
        .reconciliation
        .reactivate(user.id)
        .await
        .unwrap();
    assert_eq!(reactivated.log.action, LogAction::Reactivated);
    let status = harness.billing.reconciliation.status(user.id).await.unwrap();
    assert!(!status.cancel_at_period_end);
    assert!(status.is_active);

    // Nothing left to reactivate
    assert!(matches!(
        harness.billing.reconciliation.reactivate(user.id).await,
        Err(BillingError::Validation(_))
    ));
}

#[tokio::test]
async fn provider_confirmation_of_a_user_cancel_applies() {
    let harness = Harness::new();
    let user = harness.user("cus_confirm").await;
    subscribe(&harness, "evt_sub", "cus_confirm", PRICE_BASIC).await;

    let record = harness
        .billing
        .reconciliation
        .cancel(user.id, true)
        .await
        .unwrap()
        .subscription
        .unwrap();

    // The provider's webhook for the same cancel, stamped in whole seconds
    let confirmation = envelope(
        "evt_confirm",
        "customer.subscription.updated",
        now_ts(),
        subscription_object(
            &record.external_id,
            "cus_confirm",
            "active",
            PRICE_BASIC,
            record.current_period_start.unix_timestamp(),
            record.current_period_end.unix_timestamp(),
            true,
        ),
    );
    assert!(matches!(
        harness.deliver(&confirmation).await.unwrap(),
        IngestOutcome::Applied { .. }
    ));

    let log = harness
        .store
        .find_log_by_event("evt_confirm")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.outcome, LogOutcome::Success);
    assert!(harness.reload(user.id).await.is_active);
}

#[tokio::test]
async fn immediate_cancel_moves_user_to_free() {
    let harness = Harness::new();
    let user = harness.user("cus_now").await;
    subscribe(&harness, "evt_sub", "cus_now", PRICE_BASIC).await;

    let applied = harness
        .billing
        .reconciliation
        .cancel(user.id, false)
        .await
        .unwrap();
    let record = applied.subscription.unwrap();
    assert_eq!(record.status, SubscriptionStatus::Canceled);

    let user = harness.reload(user.id).await;
    assert!(!user.is_active);
    assert_eq!(user.plan, Plan::Free);
}

#[tokio::test]
async fn lapse_sweep_expires_cancelled_subscriptions_once() {
    let harness = Harness::new();
    let user = harness.user("cus_lapse").await;
    subscribe(&harness, "evt_sub", "cus_lapse", PRICE_BASIC).await;
    harness
        .billing
        .reconciliation
        .cancel(user.id, true)
        .await
        .unwrap();

    // Before the period ends nothing happens
    let expired = harness
        .billing
        .reconciliation
        .expire_lapsed(OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert_eq!(expired, 0);

    let after_period = OffsetDateTime::now_utc() + Duration::days(31);
    let expired = harness
        .billing
        .reconciliation
        .expire_lapsed(after_period)
        .await
        .unwrap();
    assert_eq!(expired, 1);

    let user = harness.reload(user.id).await;
    assert!(!user.is_active);
    assert_eq!(user.plan, Plan::Free);

    let logs = harness.store.recent_logs(Some(user.id), 1).await.unwrap();
    assert_eq!(logs[0].action, LogAction::Expired);
    assert_eq!(logs[0].actor, ActorType::System);

    // The provider status is left as reported
    let record = harness
        .store
        .get_subscription("sub_cus_lapse")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, SubscriptionStatus::Active);

    assert_eq!(
        harness
            .billing
            .reconciliation
            .expire_lapsed(after_period)
            .await
            .unwrap(),
        0
    );
}
