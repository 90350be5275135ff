//! Scheduled billing jobs

use std::sync::Arc;
use std::time::Instant;

use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobSchedulerError};

use tierledger_billing::ReconciliationService;

/// Every five minutes, on the minute
pub const DEFAULT_LAPSE_SWEEP_SCHEDULE: &str = "0 */5 * * * *";

/// Expire owners of lapsed cancel-at-period-end subscriptions.
/// Failures are logged; the next run picks up whatever was missed.
pub async fn run_lapse_sweep(reconciliation: &ReconciliationService) -> usize {
    let started = Instant::now();
    match reconciliation.expire_lapsed(OffsetDateTime::now_utc()).await {
        Ok(expired) => {
            tracing::info!(
                expired = expired,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Lapse sweep finished"
            );
            expired
        }
        Err(e) => {
            tracing::error!(error = %e, retryable = e.is_retryable(), "Lapse sweep failed");
            0
        }
    }
}

pub fn lapse_sweep_job(
    schedule: &str,
    reconciliation: Arc<ReconciliationService>,
) -> Result<Job, JobSchedulerError> {
    Job::new_async(schedule, move |_id, _scheduler| {
        let reconciliation = reconciliation.clone();
        Box::pin(async move {
            run_lapse_sweep(&reconciliation).await;
        })
    })
}
