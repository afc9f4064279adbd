//! SQL access for the `jobs`, `job_runs` and `prompt_submissions` tables.

use crate::errors::EnqueueError;
use crate::payload::{JobPayload, PackagePrompt};
use crate::pipeline::{Classification, StageRecord};
use crate::schema::{Job, JobRun, JobStatus, PromptSubmission, SubmissionStatus};
use crate::util::snippet;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

const JOB_COLUMNS: &str =
    "id, type, payload_json, status, created_at, claimed_at, finished_at, error";

/// Runs the embedded migrations that create the job tables.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Inserts a queued job and returns its id.
#[instrument(name = "jobs.enqueue", skip_all, fields(job.type = payload.job_type()))]
pub async fn enqueue_job<'e>(
    executor: impl PgExecutor<'e>,
    payload: &JobPayload,
) -> Result<Uuid, EnqueueError> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO jobs (id, type, payload_json, status) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(payload.job_type())
        .bind(payload.to_json()?)
        .bind(JobStatus::Queued.as_str())
        .execute(executor)
        .await?;
    Ok(id)
}

/// Inserts a pending prompt submission and the `package_prompt` job that
/// packages it, in one transaction.
///
/// Returns `(submission_id, job_id)`.
pub async fn submit_prompt(
    pool: &PgPool,
    mut request: PackagePrompt,
) -> Result<(Uuid, Uuid), EnqueueError> {
    let submission_id = Uuid::new_v4();
    request.submission_id = Some(submission_id.to_string());

    let mut tx = pool.begin().await?;
    sqlx::query(
        r"
        INSERT INTO prompt_submissions (id, title, raw_prompt, problem, scope, integrations, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ",
    )
    .bind(submission_id)
    .bind(&request.title)
    .bind(&request.raw_prompt)
    .bind(&request.problem)
    .bind(&request.scope)
    .bind(&request.integrations)
    .bind(SubmissionStatus::Pending.as_str())
    .execute(&mut *tx)
    .await?;

    let job_id = enqueue_job(&mut *tx, &JobPayload::PackagePrompt(request)).await?;
    tx.commit().await?;

    Ok((submission_id, job_id))
}

/// Finds the oldest queued job, if any.
pub async fn find_next_queued_job(pool: &PgPool) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        SELECT {JOB_COLUMNS}
        FROM jobs
        WHERE status = 'queued'
        ORDER BY created_at ASC, id ASC
        LIMIT 1
        "
    ))
    .fetch_optional(pool)
    .await
}

/// Moves a job from `queued` to `processing`.
///
/// Returns `false` when the row was no longer queued, meaning another
/// processor claimed it first.
pub async fn claim_job(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let rows_affected = sqlx::query(
        r"
        UPDATE jobs
        SET status = 'processing', claimed_at = NOW()
        WHERE id = $1 AND status = 'queued'
        ",
    )
    .bind(job_id)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(rows_affected == 1)
}

/// Appends the audit record of one pipeline stage.
pub async fn record_job_run<'e>(
    executor: impl PgExecutor<'e>,
    job_id: Uuid,
    record: &StageRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO job_runs (job_id, step, input_snippet, output_snippet, success)
        VALUES ($1, $2, $3, $4, $5)
        ",
    )
    .bind(job_id)
    .bind(record.step.as_str())
    .bind(snippet(&record.input))
    .bind(snippet(&record.output))
    .bind(record.success)
    .execute(executor)
    .await?;
    Ok(())
}

/// Writes the packaged fields onto a submission and marks it packaged.
///
/// Returns `false` if no submission with that id exists.
pub async fn write_packaged_submission(
    tx: &mut Transaction<'_, Postgres>,
    submission_id: Uuid,
    packaged_prompt: &str,
    classification: &Classification,
) -> Result<bool, sqlx::Error> {
    let rows_affected = sqlx::query(
        r"
        UPDATE prompt_submissions
        SET packaged_prompt = $2,
            packaged_summary = $3,
            packaged_tags = $4,
            packaged_complexity = $5,
            status = $6
        WHERE id = $1
        ",
    )
    .bind(submission_id)
    .bind(packaged_prompt)
    .bind(&classification.summary)
    .bind(&classification.tags)
    .bind(classification.complexity.as_str())
    .bind(SubmissionStatus::Packaged.as_str())
    .execute(&mut **tx)
    .await?
    .rows_affected();

    Ok(rows_affected == 1)
}

/// Moves a claimed job to a terminal status.
///
/// Returns `false` if the job is no longer in `processing`, for example
/// because it was reclaimed.
pub async fn finish_job<'e>(
    executor: impl PgExecutor<'e>,
    job_id: Uuid,
    status: JobStatus,
    error: Option<&str>,
) -> Result<bool, sqlx::Error> {
    debug_assert!(status.is_terminal());
    let rows_affected = sqlx::query(
        r"
        UPDATE jobs
        SET status = $2, finished_at = NOW(), error = $3
        WHERE id = $1 AND status = 'processing'
        ",
    )
    .bind(job_id)
    .bind(status.as_str())
    .bind(error)
    .execute(executor)
    .await?
    .rows_affected();

    Ok(rows_affected == 1)
}

/// Returns jobs stuck in `processing` for longer than `older_than` to the
/// queue, and returns their ids.
pub async fn reclaim_stale_jobs(
    pool: &PgPool,
    older_than: Duration,
) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        r"
        UPDATE jobs
        SET status = 'queued', claimed_at = NULL
        WHERE status = 'processing'
          AND claimed_at < NOW() - INTERVAL '1 second' * $1::float8
        RETURNING id
        ",
    )
    .bind(older_than.as_secs_f64())
    .fetch_all(pool)
    .await
}

/// Fetches a single job.
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// Returns the audit records of a job in the order they were written.
pub async fn get_job_runs(pool: &PgPool, job_id: Uuid) -> Result<Vec<JobRun>, sqlx::Error> {
    sqlx::query_as::<_, JobRun>(
        r"
        SELECT id, job_id, step, input_snippet, output_snippet, success, created_at
        FROM job_runs
        WHERE job_id = $1
        ORDER BY id ASC
        ",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}

/// Fetches a single prompt submission.
pub async fn get_submission(
    pool: &PgPool,
    submission_id: Uuid,
) -> Result<Option<PromptSubmission>, sqlx::Error> {
    sqlx::query_as::<_, PromptSubmission>(
        r"
        SELECT id, title, raw_prompt, problem, scope, integrations, packaged_prompt,
               packaged_summary, packaged_tags, packaged_complexity, status, created_at
        FROM prompt_submissions
        WHERE id = $1
        ",
    )
    .bind(submission_id)
    .fetch_optional(pool)
    .await
}

/// Number of jobs currently in `status`.
pub async fn job_count(pool: &PgPool, status: JobStatus) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE status = $1")
        .bind(status.as_str())
        .fetch_one(pool)
        .await
}
