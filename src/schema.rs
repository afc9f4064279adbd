//! Database schema definitions for SQLx.
//!
//! This module contains the row types and status enums for the `jobs`,
//! `job_runs` and `prompt_submissions` tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Error returned when a status or enum column holds an unexpected value.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// The value as stored in the database.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownVariant;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

/// Lifecycle state of a row in the `jobs` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by a processor
    Processing,
    /// Finished; every stage succeeded, or degraded runs are not distinguished
    Completed,
    /// Finished, but at least one stage fell back to a default
    CompletedWithErrors,
    /// The payload could not be processed at all
    Failed,
}

text_enum!(JobStatus, "job status", {
    Queued => "queued",
    Processing => "processing",
    Completed => "completed",
    CompletedWithErrors => "completed_with_errors",
    Failed => "failed",
});

impl JobStatus {
    /// Whether the job will not be picked up again.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Failed
        )
    }
}

/// One of the two pipeline stages applied to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Rewrite the raw prompt into a structured document
    Standardize,
    /// Summarize, tag and rate the standardized prompt
    Classify,
}

text_enum!(Step, "step", {
    Standardize => "standardize",
    Classify => "classify",
});

/// Complexity rating assigned by the classify stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// A few screens, no integrations
    Simple,
    /// The fallback rating
    #[default]
    Medium,
    /// Several roles or integrations
    Complex,
    /// Platform-scale scope
    Advanced,
}

text_enum!(Complexity, "complexity", {
    Simple => "simple",
    Medium => "medium",
    Complex => "complex",
    Advanced => "advanced",
});

/// Status of a row in the `prompt_submissions` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Submitted, not yet packaged
    Pending,
    /// Packaged fields have been written
    Packaged,
}

text_enum!(SubmissionStatus, "submission status", {
    Pending => "pending",
    Packaged => "packaged",
});

/// Represents a job record in the database
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job
    pub id: Uuid,
    /// Type identifier for the job (selects the payload variant)
    #[sqlx(rename = "type")]
    pub job_type: String,
    /// JSON data containing the job payload
    pub payload_json: Value,
    /// Current lifecycle state
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the successful claim, cleared when reclaimed
    pub claimed_at: Option<DateTime<Utc>>,
    /// Timestamp when the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// Reason the job failed, if it did
    pub error: Option<String>,
}

/// Audit record of a single pipeline stage
#[derive(Debug, Clone, FromRow)]
pub struct JobRun {
    /// Row identifier
    pub id: i64,
    /// The job this stage ran for
    pub job_id: Uuid,
    /// Which stage ran
    #[sqlx(try_from = "String")]
    pub step: Step,
    /// Truncated stage input
    pub input_snippet: String,
    /// Truncated stage output, or the error message when the stage failed
    pub output_snippet: String,
    /// Whether the stage produced usable output
    pub success: bool,
    /// Timestamp when the stage finished
    pub created_at: DateTime<Utc>,
}

/// A user-submitted raw prompt and its packaged form
#[derive(Debug, Clone, FromRow)]
pub struct PromptSubmission {
    /// Unique identifier for the submission
    pub id: Uuid,
    /// Short product title
    pub title: String,
    /// The prompt as the user wrote it
    pub raw_prompt: String,
    /// Problem statement, if given
    pub problem: Option<String>,
    /// Scope description, if given
    pub scope: Option<String>,
    /// Third-party integrations the product needs
    pub integrations: Vec<String>,
    /// Standardized prompt text
    pub packaged_prompt: Option<String>,
    /// One-line summary
    pub packaged_summary: Option<String>,
    /// Classification tags
    pub packaged_tags: Option<Vec<String>>,
    /// Complexity rating as stored
    pub packaged_complexity: Option<String>,
    /// Packaging state
    #[sqlx(try_from = "String")]
    pub status: SubmissionStatus,
    /// Timestamp when the submission was created
    pub created_at: DateTime<Utc>,
}
