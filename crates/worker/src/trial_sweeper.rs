//! Periodic trial expiry sweep
//!
//! Runs on every worker instance; the advisory lock inside
//! [`TrialSweeper::run`] lets only one of them work per tick.

use dojogate_entitlements::{SweepReport, TrialSweeper};
use time::OffsetDateTime;
use tracing::{error, info};

/// Run one sweep tick. Errors are logged and left for the next tick.
pub async fn process_expired_trials(sweeper: &TrialSweeper) -> Option<SweepReport> {
    match sweeper.run(OffsetDateTime::now_utc()).await {
        Ok(report) => {
            if report.lock_held {
                info!("Another worker is sweeping, skipping this tick");
            } else if report.examined == sweeper.batch_size() as usize {
                info!(
                    processed = report.processed(),
                    batch_size = sweeper.batch_size(),
                    "Sweep batch full, remaining trials wait for the next tick"
                );
            }
            Some(report)
        }
        Err(e) => {
            error!(error = %e, "Trial sweep failed, will retry next tick");
            None
        }
    }
}
