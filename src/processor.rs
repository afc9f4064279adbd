use crate::errors::ProcessError;
use crate::llm::ChatModel;
use crate::payload::{JobPayload, PackagePrompt};
use crate::pipeline;
use crate::schema::{Job, JobStatus};
use crate::storage;
use crate::util::snippet;
use sqlx::PgPool;
use tracing::{Instrument, debug, info, info_span, trace, warn};
use uuid::Uuid;

/// Terminal status given to a job whose pipeline fell back on at least one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DegradedPolicy {
    /// Mark degraded jobs `completed`, like clean ones.
    #[default]
    MarkCompleted,
    /// Mark degraded jobs `completed_with_errors`.
    MarkCompletedWithErrors,
}

impl DegradedPolicy {
    fn status(self, degraded: bool) -> JobStatus {
        match (self, degraded) {
            (Self::MarkCompletedWithErrors, true) => JobStatus::CompletedWithErrors,
            _ => JobStatus::Completed,
        }
    }
}

/// What a single `process_next_job` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No queued job was found. Nothing was written.
    NoJobs,
    /// Another processor claimed the job between selection and claim.
    AlreadyClaimed {
        /// The job that was lost
        job_id: Uuid,
    },
    /// The job ran through the pipeline and reached a completed status.
    Completed {
        /// The processed job
        job_id: Uuid,
        /// Whether any stage fell back to a default
        degraded: bool,
    },
    /// The job's payload could not be decoded; it was marked `failed`.
    Failed {
        /// The failed job
        job_id: Uuid,
        /// Why decoding failed
        reason: String,
    },
}

/// Claims queued jobs one at a time and runs them through the packaging
/// pipeline.
#[derive(Debug)]
pub struct Processor<M> {
    pool: PgPool,
    model: M,
    degraded_policy: DegradedPolicy,
}

impl<M: ChatModel> Processor<M> {
    /// Create a processor over `pool` that calls `model` for each stage.
    pub fn new(pool: PgPool, model: M) -> Self {
        Self {
            pool,
            model,
            degraded_policy: DegradedPolicy::default(),
        }
    }

    /// Set the status given to jobs with failed stages.
    pub fn degraded_policy(mut self, policy: DegradedPolicy) -> Self {
        self.degraded_policy = policy;
        self
    }

    /// The model used for both stages.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The connection pool this processor works on.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Claims the oldest queued job and processes it.
    ///
    /// Returns:
    /// - `Ok(NoJobs)` if nothing was queued
    /// - `Ok(AlreadyClaimed)` if a concurrent processor won the claim
    /// - `Ok(Completed)` or `Ok(Failed)` once the claimed job is terminal
    /// - `Err(...)` on database errors; a claimed job stays in `processing`
    ///   until it is reclaimed
    pub async fn process_next_job(&self) -> Result<ProcessOutcome, ProcessError> {
        trace!("Looking for next queued job…");

        let Some(job) = storage::find_next_queued_job(&self.pool).await? else {
            return Ok(ProcessOutcome::NoJobs);
        };

        if !storage::claim_job(&self.pool, job.id).await? {
            debug!(job.id = %job.id, "Job already claimed by another processor");
            return Ok(ProcessOutcome::AlreadyClaimed { job_id: job.id });
        }

        let span = info_span!("job", job.id = %job.id, job.type = %job.job_type);
        self.run_claimed_job(job).instrument(span).await
    }

    async fn run_claimed_job(&self, job: Job) -> Result<ProcessOutcome, ProcessError> {
        debug!("Running job…");

        let payload = match JobPayload::decode(&job.job_type, &job.payload_json) {
            Ok(payload) => payload,
            Err(error) => {
                let reason = error.to_string();
                warn!(%reason, "Rejecting job with undecodable payload");
                if !storage::finish_job(&self.pool, job.id, JobStatus::Failed, Some(&reason))
                    .await?
                {
                    return Err(ProcessError::LostClaim(job.id));
                }
                return Ok(ProcessOutcome::Failed {
                    job_id: job.id,
                    reason,
                });
            }
        };

        match payload {
            JobPayload::PackagePrompt(request) => self.package_prompt(job.id, &request).await,
        }
    }

    async fn package_prompt(
        &self,
        job_id: Uuid,
        request: &PackagePrompt,
    ) -> Result<ProcessOutcome, ProcessError> {
        let standardized = pipeline::standardize(&self.model, request).await;
        storage::record_job_run(&self.pool, job_id, &standardized.record).await?;

        let classified = pipeline::classify(&self.model, &request.title, &standardized.text).await;
        storage::record_job_run(&self.pool, job_id, &classified.record).await?;

        let failures: Vec<String> = [&standardized.record, &classified.record]
            .into_iter()
            .filter(|record| !record.success)
            .map(|record| format!("{}: {}", record.step, snippet(&record.output)))
            .collect();
        let degraded = !failures.is_empty();
        let error = degraded.then(|| failures.join("; "));

        let mut tx = self.pool.begin().await?;

        if let Some(raw_id) = request.submission_id.as_deref() {
            match Uuid::parse_str(raw_id) {
                Ok(submission_id) => {
                    let written = storage::write_packaged_submission(
                        &mut tx,
                        submission_id,
                        &standardized.text,
                        &classified.classification,
                    )
                    .await?;
                    if !written {
                        warn!(%submission_id, "Submission not found, skipping write-back");
                    }
                }
                Err(_) => {
                    warn!(
                        submission_id = raw_id,
                        "Submission id is not a UUID, skipping write-back"
                    );
                }
            }
        }

        let status = self.degraded_policy.status(degraded);
        if !storage::finish_job(&mut *tx, job_id, status, error.as_deref()).await? {
            tx.rollback().await?;
            return Err(ProcessError::LostClaim(job_id));
        }
        tx.commit().await?;

        info!(%status, degraded, "Job finished");
        Ok(ProcessOutcome::Completed { job_id, degraded })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_keeps_degraded_jobs_completed() {
        let policy = DegradedPolicy::default();
        assert_eq!(policy.status(false), JobStatus::Completed);
        assert_eq!(policy.status(true), JobStatus::Completed);
    }

    #[test]
    fn strict_policy_flags_degraded_jobs() {
        let policy = DegradedPolicy::MarkCompletedWithErrors;
        assert_eq!(policy.status(false), JobStatus::Completed);
        assert_eq!(policy.status(true), JobStatus::CompletedWithErrors);
    }
}
