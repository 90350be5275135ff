//! Billing integration tests
//!
//! Driven end to end through `BillingService` with a scripted provider. Every
//! scenario runs on the in-memory ledger; the concurrency, idempotency and
//! stale-ordering scenarios also run on Postgres when `DATABASE_URL` is set.
//!
//! ```bash
//! cargo test -p tierledger-billing --test integration
//! DATABASE_URL=postgres://localhost/tierledger_test cargo test -p tierledger-billing --test integration
//! ```

mod idempotency;
mod quota;
mod refunds;
mod scenarios;
mod stale_events;
mod support;
mod user_flows;
