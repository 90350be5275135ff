//! Stripe webhook ingestion
//!
//! Verifies the signature header, deduplicates on the provider event id and
//! hands translated events to the [`SubscriptionStateMachine`]. The
//! idempotency check, the state change and its log row share one unit of
//! work, so a redelivered event either sees the committed log row or waits
//! on the event lock until the first delivery finishes.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use tierledger_shared::{ActorType, LogAction};

use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionLogBuilder;
use crate::ledger::LedgerStore;
use crate::provider_event::ProviderEvent;
use crate::subscriptions::{EventContext, SubscriptionStateMachine};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (either direction) of a signature timestamp
pub const DEFAULT_SIGNATURE_TOLERANCE: Duration = Duration::from_secs(300);

/// Deadline for one event's unit of work
pub const DEFAULT_WEBHOOK_DEADLINE: Duration = Duration::from_secs(10);

/// What happened to a delivered event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Applied {
        #[serde(rename = "logId")]
        log_id: Uuid,
    },
    AlreadyApplied,
    /// Older than the recorded state; logged, nothing changed
    Stale,
    /// Business rejection; logged as failed so redelivery dedupes
    Rejected { reason: String },
    /// Event type we do not act on
    Ignored,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Applied { .. } => "applied",
            IngestOutcome::AlreadyApplied => "already_applied",
            IngestOutcome::Stale => "stale",
            IngestOutcome::Rejected { .. } => "rejected",
            IngestOutcome::Ignored => "ignored",
        }
    }
}

/// Verify a `t=<unix>,v1=<hex>[,v1=<hex>...]` header against `now` (unix seconds).
///
/// Any matching `v1` signature is accepted, which keeps deliveries valid
/// while the endpoint secret is being rotated.
pub fn verify_signature_at(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance: Duration,
    now: i64,
) -> BillingResult<()> {
    if secret.is_empty() {
        tracing::error!("Webhook secret is not configured");
        return Err(BillingError::AuthenticationFailed);
    }

    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::AuthenticationFailed
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::AuthenticationFailed);
    }

    let age = now.saturating_sub(timestamp).unsigned_abs();
    if age > tolerance.as_secs() {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            age_secs = age,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::AuthenticationFailed);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    for candidate in signatures {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| BillingError::AuthenticationFailed)?;
        mac.update(signed_payload.as_bytes());
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    tracing::warn!("Webhook signature mismatch");
    Err(BillingError::AuthenticationFailed)
}

/// Verify against the current clock
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance: Duration,
) -> BillingResult<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    verify_signature_at(payload, header, secret, tolerance, now)
}

/// Build a signature header the way the provider does (for tooling and tests)
pub fn compute_signature_header(
    payload: &str,
    secret: &str,
    timestamp: i64,
) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Config(format!("invalid webhook secret: {}", e)))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Webhook entry point
#[derive(Clone)]
pub struct WebhookIngester {
    store: Arc<dyn LedgerStore>,
    machine: Arc<SubscriptionStateMachine>,
    secret: String,
    tolerance: Duration,
    deadline: Duration,
}

impl WebhookIngester {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        machine: Arc<SubscriptionStateMachine>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            store,
            machine,
            secret: secret.into(),
            tolerance: DEFAULT_SIGNATURE_TOLERANCE,
            deadline: DEFAULT_WEBHOOK_DEADLINE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Verify, deduplicate and apply one delivery
    pub async fn ingest(&self, raw_body: &str, signature: &str) -> BillingResult<IngestOutcome> {
        verify_signature(raw_body, signature, &self.secret, self.tolerance)?;

        let received_at = OffsetDateTime::now_utc();
        let event = ProviderEvent::parse(raw_body, received_at)?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook"
        );

        match tokio::time::timeout(self.deadline, self.process(&event)).await {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Webhook processing failed"
                    );
                }
                result
            }
            Err(_) => {
                tracing::warn!(
                    event_id = %event.id,
                    deadline_ms = self.deadline.as_millis() as u64,
                    "Webhook unit of work exceeded its deadline; rolled back"
                );
                Err(BillingError::Timeout(format!(
                    "event {} exceeded the {}ms deadline",
                    event.id,
                    self.deadline.as_millis()
                )))
            }
        }
    }

    async fn process(&self, event: &ProviderEvent) -> BillingResult<IngestOutcome> {
        let ctx = EventContext::from_provider(event, OffsetDateTime::now_utc());

        let translated = match event.translate() {
            Ok(Some(translated)) => translated,
            Ok(None) => {
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Unhandled webhook event type"
                );
                return Ok(IngestOutcome::Ignored);
            }
            Err(BillingError::Validation(reason)) => return self.reject(event, reason).await,
            Err(e) => return Err(e),
        };

        let mut tx = self.store.begin().await?;
        if tx.lock_event(&event.id).await? {
            tracing::info!(event_id = %event.id, "Webhook event already processed, skipping");
            return Ok(IngestOutcome::AlreadyApplied);
        }

        match self.machine.apply(tx.as_mut(), &translated, &ctx).await {
            Ok(applied) => {
                tx.commit().await?;
                if applied.stale {
                    Ok(IngestOutcome::Stale)
                } else {
                    Ok(IngestOutcome::Applied {
                        log_id: applied.log.id,
                    })
                }
            }
            Err(BillingError::Validation(reason)) => {
                // Roll back the partial mutation before recording the rejection
                drop(tx);
                self.reject(event, reason).await
            }
            Err(BillingError::AlreadyApplied) => Ok(IngestOutcome::AlreadyApplied),
            Err(e) => Err(e),
        }
    }

    /// Record a rejected event as a failed log row carrying its id
    async fn reject(&self, event: &ProviderEvent, reason: String) -> BillingResult<IngestOutcome> {
        tracing::warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            reason = %reason,
            "Webhook event rejected"
        );

        let mut tx = self.store.begin().await?;
        if tx.lock_event(&event.id).await? {
            return Ok(IngestOutcome::AlreadyApplied);
        }

        let log = SubscriptionLogBuilder::new(LogAction::Updated)
            .provider_event(event.id.clone())
            .actor(ActorType::Provider)
            .failed(reason.clone())
            .meta("event_type", event.event_type.clone())
            .build();
        match tx.append_log(log).await {
            Ok(_) => tx.commit().await?,
            Err(BillingError::AlreadyApplied) => return Ok(IngestOutcome::AlreadyApplied),
            Err(e) => return Err(e),
        }

        Ok(IngestOutcome::Rejected { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MemoryLedgerStore, NewUser};
    use crate::plans::PlanCatalog;
    use serde_json::json;
    use tierledger_shared::{LogOutcome, UserId};

    const SECRET: &str = "whsec_test_secret";

    fn signed(payload: &str) -> String {
        compute_signature_header(payload, SECRET, OffsetDateTime::now_utc().unix_timestamp())
            .unwrap()
    }

    #[test]
    fn test_valid_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = compute_signature_header(payload, SECRET, 1_700_000_000).unwrap();
        assert!(verify_signature_at(
            payload,
            &header,
            SECRET,
            DEFAULT_SIGNATURE_TOLERANCE,
            1_700_000_100
        )
        .is_ok());
    }

    #[test]
    fn test_signature_rejections() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = compute_signature_header(payload, SECRET, 1_700_000_000).unwrap();
        let tolerance = DEFAULT_SIGNATURE_TOLERANCE;

        // Wrong secret
        assert!(matches!(
            verify_signature_at(payload, &header, "whsec_other", tolerance, 1_700_000_000),
            Err(BillingError::AuthenticationFailed)
        ));
        // Tampered body
        assert!(verify_signature_at("{}", &header, SECRET, tolerance, 1_700_000_000).is_err());
        // Outside the replay window
        assert!(
            verify_signature_at(payload, &header, SECRET, tolerance, 1_700_000_301).is_err()
        );
        // Malformed headers
        assert!(verify_signature_at(payload, "garbage", SECRET, tolerance, 1_700_000_000).is_err());
        assert!(
            verify_signature_at(payload, "t=1700000000", SECRET, tolerance, 1_700_000_000)
                .is_err()
        );
        assert!(verify_signature_at(payload, &header, "", tolerance, 1_700_000_000).is_err());
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = compute_signature_header(payload, SECRET, 1_700_000_000).unwrap();
        let rotated = format!("{},v1={},v0=ignored", header, "ab".repeat(32));
        let reordered = format!("t=1700000000,v1={},{}", "cd".repeat(32), &header[13..]);
        for candidate in [rotated, reordered] {
            assert!(verify_signature_at(
                payload,
                &candidate,
                SECRET,
                DEFAULT_SIGNATURE_TOLERANCE,
                1_700_000_000
            )
            .is_ok());
        }
    }

    async fn ingester() -> (WebhookIngester, MemoryLedgerStore, UserId) {
        let store = MemoryLedgerStore::new();
        let user = store
            .create_user(NewUser {
                id: UserId::new(),
                email: "hook@example.com".into(),
                stripe_customer_id: Some("cus_hook".into()),
                free_trials: 100,
            })
            .await
            .unwrap();
        let catalog = Arc::new(PlanCatalog::with_price_ids(
            Some("price_basic".into()),
            Some("price_pro".into()),
            None,
        ));
        let ingester = WebhookIngester::new(
            Arc::new(store.clone()),
            Arc::new(SubscriptionStateMachine::new(catalog)),
            SECRET,
        );
        (ingester, store, user.id)
    }

    fn subscription_event(event_id: &str, price: &str) -> String {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        json!({
            "id": event_id,
            "type": "customer.subscription.created",
            "created": now,
            "data": {"object": {
                "id": "sub_hook",
                "customer": "cus_hook",
                "status": "active",
                "current_period_start": now,
                "current_period_end": now + 30 * 86_400,
                "currency": "usd",
                "items": {"data": [{
                    "quantity": 1,
                    "price": {"id": price, "unit_amount": 900, "currency": "usd",
                              "recurring": {"interval": "month"}}
                }]}
            }}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_ingest_applies_once() {
        let (ingester, store, user_id) = ingester().await;
        let body = subscription_event("evt_hook_1", "price_basic");

        let first = ingester.ingest(&body, &signed(&body)).await.unwrap();
        assert!(matches!(first, IngestOutcome::Applied { .. }));

        let second = ingester.ingest(&body, &signed(&body)).await.unwrap();
        assert_eq!(second, IngestOutcome::AlreadyApplied);

        let logs = store.recent_logs(Some(user_id), 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].external_event_id.as_deref(), Some("evt_hook_1"));
    }

    #[tokio::test]
    async fn test_bad_signature_writes_nothing() {
        let (ingester, store, _) = ingester().await;
        let body = subscription_event("evt_hook_2", "price_basic");
        let result = ingester.ingest(&body, "t=1,v1=00").await;
        assert!(matches!(result, Err(BillingError::AuthenticationFailed)));
        assert!(store.recent_logs(None, 10).await.unwrap().is_empty());
        assert!(store.get_subscription("sub_hook").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unhandled_type_is_ignored() {
        let (ingester, store, _) = ingester().await;
        let body = json!({
            "id": "evt_hook_3",
            "type": "customer.created",
            "data": {"object": {"id": "cus_x"}}
        })
        .to_string();
        let outcome = ingester.ingest(&body, &signed(&body)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored);
        assert!(store.recent_logs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_event_is_logged_and_dedupes() {
        let (ingester, store, _) = ingester().await;
        let body = subscription_event("evt_hook_4", "price_unknown");

        let outcome = ingester.ingest(&body, &signed(&body)).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Rejected { .. }));
        assert!(store.get_subscription("sub_hook").await.unwrap().is_none());

        let log = store.find_log_by_event("evt_hook_4").await.unwrap().unwrap();
        assert_eq!(log.outcome, LogOutcome::Failed);
        assert!(log.user_id.is_none());

        let again = ingester.ingest(&body, &signed(&body)).await.unwrap();
        assert_eq!(again, IngestOutcome::AlreadyApplied);
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_validation_error() {
        let (ingester, store, _) = ingester().await;
        let body = r#"{"type":"invoice.paid"}"#;
        let result = ingester.ingest(body, &signed(body)).await;
        assert!(matches!(result, Err(BillingError::Validation(_))));
        assert!(store.recent_logs(None, 10).await.unwrap().is_empty());
    }

    #[test]
    fn test_outcome_serialization() {
        let value = serde_json::to_value(IngestOutcome::Rejected {
            reason: "bad".into(),
        })
        .unwrap();
        assert_eq!(value["outcome"], "rejected");
        assert_eq!(value["reason"], "bad");
        assert_eq!(IngestOutcome::AlreadyApplied.as_str(), "already_applied");
    }
}
