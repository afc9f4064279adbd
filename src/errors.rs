use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while enqueueing a job or a submission.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The payload does not match the job type.
    #[error(transparent)]
    InvalidPayload(#[from] PayloadError),

    /// Failed to serialize the job payload.
    #[error("failed to serialize job payload: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database error while inserting rows.
    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

/// Errors raised while decoding a job's `payload_json`.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// No payload variant exists for this job type.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// The payload does not have the shape the job type requires.
    #[error("invalid {job_type} payload: {source}")]
    Malformed {
        /// The job type that was being decoded
        job_type: String,
        /// The underlying decode failure
        source: serde_json::Error,
    },
}

/// Errors returned by a chat-completion backend.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The request could not be sent or the response body could not be read.
    #[error("AI gateway request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The gateway answered with a non-success status.
    #[error("AI gateway error {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body text
        body: String,
    },

    /// The gateway answered without any message content.
    #[error("AI gateway returned no message content")]
    EmptyResponse,
}

/// Errors that abort a `process_next_job` invocation.
///
/// Stage failures are not represented here; they are recorded as failed
/// job runs and processing continues with fallback values.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Database error while reading or writing job state.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The job left the `processing` state while it was being worked on.
    #[error("job {0} is no longer claimed by this processor")]
    LostClaim(Uuid),
}
