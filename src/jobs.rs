//! Background reaping of expired records.
//!
//! Expired device requests, device tokens, request limits, and auth codes
//! are deleted on a schedule. Reaping is best-effort garbage collection with
//! no precision guarantee; request handlers always revalidate expiry
//! themselves.

use crate::clock::Clock;
use crate::errors::PerigeeError;
use crate::storage;
use sea_orm::DatabaseConnection;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Start the scheduler with the expired-record reaper (every 5 minutes).
pub async fn init_scheduler(
    db: DatabaseConnection,
    clock: Clock,
) -> Result<JobScheduler, PerigeeError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| PerigeeError::Other(format!("Failed to create job scheduler: {}", e)))?;

    let reaper = Job::new_async("0 */5 * * * *", move |_uuid, _l| {
        let db = db.clone();
        let clock = clock.clone();
        Box::pin(async move {
            let now = clock.now();
            reap(&db, now).await;
        })
    })
    .map_err(|e| PerigeeError::Other(format!("Failed to create reaper job: {}", e)))?;

    sched
        .add(reaper)
        .await
        .map_err(|e| PerigeeError::Other(format!("Failed to add reaper job: {}", e)))?;

    sched
        .start()
        .await
        .map_err(|e| PerigeeError::Other(format!("Failed to start job scheduler: {}", e)))?;

    Ok(sched)
}

async fn reap(db: &DatabaseConnection, now: i64) {
    match storage::cleanup_expired_device_requests(db, now).await {
        Ok(count) if count > 0 => info!(count, "reaped expired device requests"),
        Ok(_) => {}
        Err(err) => error!(%err, "failed to reap expired device requests"),
    }
    match storage::cleanup_expired_device_tokens(db, now).await {
        Ok(count) if count > 0 => info!(count, "reaped expired device tokens"),
        Ok(_) => {}
        Err(err) => error!(%err, "failed to reap expired device tokens"),
    }
    match storage::cleanup_expired_request_limits(db, now).await {
        Ok(count) if count > 0 => info!(count, "reaped expired request limits"),
        Ok(_) => {}
        Err(err) => error!(%err, "failed to reap expired request limits"),
    }
    match storage::cleanup_expired_auth_codes(db, now).await {
        Ok(count) if count > 0 => info!(count, "reaped expired auth codes"),
        Ok(_) => {}
        Err(err) => error!(%err, "failed to reap expired auth codes"),
    }
}
