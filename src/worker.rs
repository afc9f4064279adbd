use crate::llm::ChatModel;
use crate::processor::{ProcessOutcome, Processor};
use crate::util::try_to_extract_panic_info;
use futures_util::FutureExt;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

pub(crate) struct Worker<M> {
    pub(crate) processor: Arc<Processor<M>>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl<M: ChatModel> Worker<M> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Process jobs until shutdown is requested, or until the queue is empty
    /// if `shutdown_when_queue_empty` is set.
    pub(crate) async fn run(&self) {
        while !self.shutdown.is_cancelled() {
            match self.run_next_job().await {
                Ok(ProcessOutcome::NoJobs) if self.shutdown_when_queue_empty => {
                    debug!("No queued jobs found. Shutting down the worker…");
                    break;
                }
                Ok(ProcessOutcome::NoJobs) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No queued jobs found. Polling again in {sleep_duration:?}…",);
                    self.sleep_or_shutdown(sleep_duration).await;
                }
                Ok(outcome) => trace!(?outcome, "Processed job"),
                Err(error) => {
                    error!("Failed to process job: {error}");
                    self.sleep_or_shutdown(self.sleep_duration_with_jitter())
                        .await;
                }
            }
        }
        debug!("Worker stopped");
    }

    async fn sleep_or_shutdown(&self, duration: Duration) {
        tokio::select! {
            () = sleep(duration) => {}
            () = self.shutdown.cancelled() => {}
        }
    }

    /// Run the next job in the queue, turning a panic into an error so the
    /// worker survives it.
    async fn run_next_job(&self) -> anyhow::Result<ProcessOutcome> {
        let outcome = AssertUnwindSafe(self.processor.process_next_job())
            .catch_unwind()
            .await
            .map_err(|e| try_to_extract_panic_info(&*e))??;
        Ok(outcome)
    }
}
