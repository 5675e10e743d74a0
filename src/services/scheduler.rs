use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ScheduleConfig;
use crate::database::leases::LeaseLock;
use crate::errors::Result;
use crate::services::reconciliation_service::ReconciliationService;

/// Job lease TTL; long enough to cover one sweep.
const JOB_LEASE_TTL: Duration = Duration::from_secs(300);

/// Starts the background sweeps. Each run first takes the `job:{name}` lease,
/// so with several instances only one executes a given tick.
pub fn spawn_background_jobs(
    reconciliation: Arc<ReconciliationService>,
    locks: Arc<dyn LeaseLock>,
    schedule: ScheduleConfig,
) -> Vec<JoinHandle<()>> {
    info!(
        cleanup = ?schedule.cleanup_interval,
        discrepancy = ?schedule.discrepancy_interval,
        completion = ?schedule.completion_interval,
        "⏱️ Starting background jobs"
    );

    let grace = schedule.discrepancy_grace_minutes;
    vec![
        spawn_job("cleanup-expired-bookings", schedule.cleanup_interval, locks.clone(), {
            let service = reconciliation.clone();
            move || {
                let service = service.clone();
                async move { service.cleanup_expired_bookings().await.map(|_| ()) }
            }
        }),
        spawn_job("payment-discrepancies", schedule.discrepancy_interval, locks.clone(), {
            let service = reconciliation.clone();
            move || {
                let service = service.clone();
                async move { service.check_payment_discrepancies(grace).await.map(|_| ()) }
            }
        }),
        spawn_job("complete-finished-bookings", schedule.completion_interval, locks, {
            let service = reconciliation;
            move || {
                let service = service.clone();
                async move { service.complete_finished_bookings().await.map(|_| ()) }
            }
        }),
    ]
}

fn spawn_job<F, Fut>(name: &'static str, period: Duration, locks: Arc<dyn LeaseLock>, job: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let key = format!("job:{}", name);

        loop {
            interval.tick().await;

            let lease = match locks.try_acquire(&key, JOB_LEASE_TTL).await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    debug!(job = name, "Another instance is running this job");
                    continue;
                }
                Err(e) => {
                    warn!(job = name, error = %e, "Could not take job lease");
                    continue;
                }
            };

            if let Err(e) = job().await {
                error!(job = name, error = %e, "Background job failed");
            }

            if let Err(e) = locks.release(&lease).await {
                warn!(job = name, error = %e, "Failed to release job lease");
            }
        }
    })
}
