//! Subscription log builder
//!
//! Every billing state change leaves one append-only row in
//! `subscription_logs`, written in the same unit of work as the change. The
//! log answers "why is this user on this plan?" and doubles as the webhook
//! idempotency record: a row carrying a provider event id means that event
//! has been handled.

use tierledger_shared::{ActorType, LogAction, LogOutcome, Metadata, Plan, UserId};

use crate::ledger::NewSubscriptionLog;

/// Builder for audit rows
#[derive(Debug, Clone)]
pub struct SubscriptionLogBuilder {
    log: NewSubscriptionLog,
}

impl SubscriptionLogBuilder {
    /// Start a successful, system-attributed entry
    pub fn new(action: LogAction) -> Self {
        Self {
            log: NewSubscriptionLog {
                user_id: None,
                action,
                from_plan: None,
                to_plan: None,
                external_event_id: None,
                subscription_external_id: None,
                actor: ActorType::System,
                outcome: LogOutcome::Success,
                error_message: None,
                metadata: Metadata::new(),
            },
        }
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.log.user_id = Some(user_id);
        self
    }

    pub fn user_opt(mut self, user_id: Option<UserId>) -> Self {
        self.log.user_id = user_id;
        self
    }

    /// Record the plan transition
    pub fn plans(mut self, from: Option<Plan>, to: Option<Plan>) -> Self {
        self.log.from_plan = from;
        self.log.to_plan = to;
        self
    }

    /// Set the provider event id (the idempotency key)
    pub fn provider_event(mut self, event_id: impl Into<String>) -> Self {
        self.log.external_event_id = Some(event_id.into());
        self
    }

    pub fn provider_event_opt(mut self, event_id: Option<String>) -> Self {
        self.log.external_event_id = event_id;
        self
    }

    pub fn subscription(mut self, external_id: impl Into<String>) -> Self {
        self.log.subscription_external_id = Some(external_id.into());
        self
    }

    pub fn subscription_opt(mut self, external_id: Option<String>) -> Self {
        self.log.subscription_external_id = external_id;
        self
    }

    pub fn actor(mut self, actor: ActorType) -> Self {
        self.log.actor = actor;
        self
    }

    pub fn outcome(mut self, outcome: LogOutcome) -> Self {
        self.log.outcome = outcome;
        self
    }

    /// Mark the entry failed with a reason
    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.log.outcome = LogOutcome::Failed;
        self.log.error_message = Some(message.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.log.metadata.insert(key, value);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        for (key, value) in metadata.iter() {
            self.log.metadata.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn build(self) -> NewSubscriptionLog {
        self.log
    }
}

impl From<SubscriptionLogBuilder> for NewSubscriptionLog {
    fn from(builder: SubscriptionLogBuilder) -> Self {
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let log = SubscriptionLogBuilder::new(LogAction::Updated).build();
        assert_eq!(log.actor, ActorType::System);
        assert_eq!(log.outcome, LogOutcome::Success);
        assert!(log.external_event_id.is_none());
        assert!(log.metadata.is_empty());
    }

    #[test]
    fn test_failed_entry() {
        let user = UserId::new();
        let log = SubscriptionLogBuilder::new(LogAction::Updated)
            .user(user)
            .provider_event("evt_9")
            .actor(ActorType::Provider)
            .failed("STALE_EVENT: older period")
            .meta("stale", "true")
            .build();

        assert_eq!(log.user_id, Some(user));
        assert_eq!(log.outcome, LogOutcome::Failed);
        assert_eq!(log.external_event_id.as_deref(), Some("evt_9"));
        assert_eq!(log.metadata.get("stale"), Some("true"));
        assert!(log.error_message.unwrap().starts_with("STALE_EVENT"));
    }
}
