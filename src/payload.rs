use crate::errors::PayloadError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of a `package_prompt` job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePrompt {
    /// Submission that receives the packaged result, if any.
    ///
    /// Kept as text: an id that names no submission only skips the write-back,
    /// it does not stop the job from being packaged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
    /// Short product title.
    #[serde(default)]
    pub title: String,
    /// The prompt as the user wrote it.
    pub raw_prompt: String,
    /// Problem statement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    /// Scope description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Third-party integrations the product needs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub integrations: Vec<String>,
}

/// A decoded job payload, selected by the job's `type` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    /// Standardize and classify a raw prompt.
    PackagePrompt(PackagePrompt),
}

impl JobPayload {
    /// Job type of the `PackagePrompt` variant.
    pub const PACKAGE_PROMPT: &'static str = "package_prompt";

    /// Decodes `payload` according to `job_type`.
    ///
    /// Unknown job types are rejected rather than skipped.
    pub fn decode(job_type: &str, payload: &Value) -> Result<Self, PayloadError> {
        match job_type {
            Self::PACKAGE_PROMPT => PackagePrompt::deserialize(payload)
                .map(Self::PackagePrompt)
                .map_err(|source| PayloadError::Malformed {
                    job_type: job_type.to_string(),
                    source,
                }),
            other => Err(PayloadError::UnknownJobType(other.to_string())),
        }
    }

    /// The value stored in the `type` column.
    pub fn job_type(&self) -> &'static str {
        match self {
            Self::PackagePrompt(_) => Self::PACKAGE_PROMPT,
        }
    }

    /// The value stored in the `payload_json` column.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::PackagePrompt(payload) => serde_json::to_value(payload),
        }
    }
}
