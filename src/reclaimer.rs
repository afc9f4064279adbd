use crate::storage;
use sqlx::PgPool;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, trace};

/// Returns jobs left in `processing` by a crashed processor to the queue.
pub(crate) struct Reclaimer {
    pub(crate) connection_pool: PgPool,
    /// How long a job may stay claimed before it is considered abandoned
    pub(crate) visibility_timeout: Duration,
    /// How often the sweep runs
    pub(crate) interval: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl Reclaimer {
    pub(crate) fn start(self) -> JoinHandle<()> {
        let span = info_span!("reclaimer", visibility_timeout = ?self.visibility_timeout);
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.shutdown.cancelled() => break,
            }

            match storage::reclaim_stale_jobs(&self.connection_pool, self.visibility_timeout).await
            {
                Ok(job_ids) if job_ids.is_empty() => trace!("No stale jobs to reclaim"),
                Ok(job_ids) => info!(count = job_ids.len(), ?job_ids, "Reclaimed stale jobs"),
                Err(error) => error!("Failed to reclaim stale jobs: {error}"),
            }
        }
    }
}
