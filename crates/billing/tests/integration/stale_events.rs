//! Out-of-order subscription events never regress stored state

use std::sync::Arc;

use tierledger_billing::ledger::LedgerStore;
use tierledger_billing::IngestOutcome;
use tierledger_shared::{LogOutcome, Plan, SubscriptionStatus};

use crate::support::{
    envelope, now_ts, on_every_ledger, subscription_object, Harness, DAY, PRICE_BASIC, PRICE_PRO,
};

on_every_ledger!(older_period_is_rejected_as_stale);
on_every_ledger!(same_period_older_event_time_is_stale);

async fn older_period_is_rejected_as_stale(harness: Arc<Harness>) {
    let customer_id = harness.id("cus_stale");
    let subscription_id = harness.id("sub_stale");
    let previous_event = harness.id("evt_previous");
    let user = harness.user(&customer_id).await;
    let now = now_ts();

    // The renewal arrives first
    let renewal = envelope(
        &harness.id("evt_renewal"),
        "customer.subscription.updated",
        now,
        subscription_object(
            &subscription_id,
            &customer_id,
            "active",
            PRICE_PRO,
            now,
            now + 30 * DAY,
            false,
        ),
    );
    assert!(matches!(
        harness.deliver(&renewal).await.unwrap(),
        IngestOutcome::Applied { .. }
    ));

    // Then a delayed event from the previous period
    let delayed = envelope(
        &previous_event,
        "customer.subscription.updated",
        now + 10,
        subscription_object(
            &subscription_id,
            &customer_id,
            "past_due",
            PRICE_BASIC,
            now - 30 * DAY,
            now,
            false,
        ),
    );
    assert_eq!(harness.deliver(&delayed).await.unwrap(), IngestOutcome::Stale);

    let record = harness.store.get_subscription(&subscription_id).await.unwrap().unwrap();
    assert_eq!(record.status, SubscriptionStatus::Active);
    assert_eq!(record.plan, Plan::Pro);
    assert_eq!(record.current_period_end.unix_timestamp(), now + 30 * DAY);

    let user = harness.reload(user.id).await;
    assert!(user.is_active);
    assert_eq!(user.plan, Plan::Pro);

    let log = harness
        .store
        .find_log_by_event(&previous_event)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.outcome, LogOutcome::Failed);
    assert_eq!(log.metadata.get("stale"), Some("true"));
    assert!(log.error_message.unwrap().starts_with("STALE_EVENT"));

    // The stale event is recorded, so a redelivery dedupes
    assert_eq!(
        harness.deliver(&delayed).await.unwrap(),
        IngestOutcome::AlreadyApplied
    );
}

async fn same_period_older_event_time_is_stale(harness: Arc<Harness>) {
    let customer_id = harness.id("cus_order");
    let subscription_id = harness.id("sub_order");
    harness.user(&customer_id).await;
    let now = now_ts();
    let period = (now, now + 30 * DAY);

    let cancel = envelope(
        &harness.id("evt_cancel"),
        "customer.subscription.updated",
        now + 5,
        subscription_object(&subscription_id, &customer_id, "active", PRICE_PRO, period.0, period.1, true),
    );
    harness.deliver(&cancel).await.unwrap();

    let earlier = envelope(
        &harness.id("evt_earlier"),
        "customer.subscription.updated",
        now + 3,
        subscription_object(&subscription_id, &customer_id, "active", PRICE_PRO, period.0, period.1, false),
    );
    assert_eq!(harness.deliver(&earlier).await.unwrap(), IngestOutcome::Stale);

    let record = harness.store.get_subscription(&subscription_id).await.unwrap().unwrap();
    assert!(record.cancel_at_period_end);
}
