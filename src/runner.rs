use crate::llm::ChatModel;
use crate::processor::Processor;
use crate::reclaimer::Reclaimer;
use crate::worker::Worker;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

/// Runs a pool of workers that keep draining the job queue, plus an
/// optional sweep that requeues abandoned jobs.
pub struct Runner<M> {
    processor: Arc<Processor<M>>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    reclaim_after: Option<Duration>,
    reclaim_interval: Duration,
    shutdown_when_queue_empty: bool,
}

impl<M> std::fmt::Debug for Runner<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("num_workers", &self.num_workers)
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .field("reclaim_after", &self.reclaim_after)
            .field("reclaim_interval", &self.reclaim_interval)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish_non_exhaustive()
    }
}

impl<M: ChatModel> Runner<M> {
    /// Create a new runner with a single worker around `processor`.
    pub fn new(processor: Arc<Processor<M>>) -> Self {
        Self {
            processor,
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            reclaim_after: None,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
            shutdown_when_queue_empty: false,
        }
    }

    /// Set the number of concurrent workers.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often idle workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter keeps idle workers from polling in lockstep. The actual jitter
    /// applied will be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Requeue jobs that have been in `processing` for longer than
    /// `visibility_timeout`.
    pub fn reclaim_after(mut self, visibility_timeout: Duration) -> Self {
        self.reclaim_after = Some(visibility_timeout);
        self
    }

    /// Set how often the reclaim sweep runs. A zero interval disables the
    /// sweep.
    pub fn reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Set the workers to shut down when the job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Start the workers.
    ///
    /// Returns a `RunHandle` which can be used to stop them or wait for them
    /// to shut down.
    pub fn start(&self) -> RunHandle {
        let shutdown = CancellationToken::new();

        let mut handles = Vec::with_capacity(self.num_workers);
        for i in 1..=self.num_workers {
            let name = format!("job-worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                processor: self.processor.clone(),
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
                shutdown: shutdown.clone(),
            };

            let span = info_span!("worker", worker.name = %name);
            let handle = tokio::spawn(async move { worker.run().instrument(span).await });

            handles.push(handle);
        }

        if self.reclaim_after.is_some() && self.reclaim_interval.is_zero() {
            warn!("Reclaim interval is zero, stale jobs will not be reclaimed");
        }
        let reclaimer = self
            .reclaim_after
            .filter(|_| !self.reclaim_interval.is_zero())
            .map(|visibility_timeout| {
                Reclaimer {
                    connection_pool: self.processor.pool().clone(),
                    visibility_timeout,
                    interval: self.reclaim_interval,
                    shutdown: shutdown.clone(),
                }
                .start()
            });

        RunHandle {
            handles,
            reclaimer,
            shutdown,
        }
    }
}

/// Handle to a running set of workers
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    reclaimer: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl RunHandle {
    /// Ask workers to stop after their current job.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether the reclaim sweep is running.
    pub fn is_reclaiming(&self) -> bool {
        self.reclaimer.is_some()
    }

    /// A token that stops the workers when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for all workers to shut down.
    ///
    /// The reclaim sweep is stopped once the last worker exits.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Worker task panicked");
            }
        });

        self.shutdown.cancel();
        if let Some(reclaimer) = self.reclaimer {
            if let Err(error) = reclaimer.await {
                warn!(%error, "Reclaimer task panicked");
            }
        }
    }
}
