//! The two-stage packaging pipeline: standardize, then classify.
//!
//! Neither stage ever fails the job. A failed standardize call passes the raw
//! prompt through to classification, and a failed or unparsable classify call
//! keeps the default classification. Each stage reports a [`StageRecord`] so
//! the caller can persist what happened.

use crate::errors::LlmError;
use crate::llm::ChatModel;
use crate::payload::PackagePrompt;
use crate::schema::{Complexity, Step};
use crate::util::truncate_chars;
use regex::Regex;
use serde::Deserialize;
use std::fmt::Write as _;
use std::sync::LazyLock;
use tracing::{debug, warn};

const STANDARDIZE_INSTRUCTIONS: &str = "\
You turn rough product ideas into clear, buildable app prompts.

Rewrite the user's request as a structured prompt with these sections, in order:
## Overview
## Core Features
## User Roles
## Pages & Navigation
## Data Model
## Integrations
## Admin Panel

Rules:
- Write every instruction in the imperative voice (\"Build\", \"Add\", \"Let users\").
- Keep the user's intent; do not invent unrelated features.
- Include the Admin Panel section whenever the product has user accounts, roles, \
payments, or content that someone must manage. Otherwise state that no admin panel is needed.
- List every integration the user named under Integrations.
- Output only the prompt text, without commentary.";

const CLASSIFY_INSTRUCTIONS: &str = "\
You classify app prompts. Respond with a single JSON object and nothing else:
{\"summary\": string, \"tags\": string[], \"complexity\": \"simple\" | \"medium\" | \"complex\" | \"advanced\"}

- summary: one sentence, at most 150 characters.
- tags: 2 to 5 short lowercase tags describing the domain and features.
- complexity: simple (a few screens), medium (accounts and CRUD), complex (several roles \
or integrations), advanced (platform scale, realtime, or heavy automation).";

/// Maximum length of a classification summary, in characters.
pub const MAX_SUMMARY_CHARS: usize = 150;
/// Maximum number of classification tags kept.
pub const MAX_TAGS: usize = 5;
/// Tag used when classification did not produce any.
pub const FALLBACK_TAG: &str = "unprocessed";

#[allow(clippy::expect_used)]
static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("JSON object pattern is valid"));

/// What a single stage consumed and produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    /// Which stage ran
    pub step: Step,
    /// The stage's input text
    pub input: String,
    /// The model's response, or the error message if the stage failed
    pub output: String,
    /// Whether the stage produced usable output
    pub success: bool,
}

/// Result of the standardize stage.
#[derive(Debug, Clone)]
pub struct Standardized {
    /// Text handed to the classify stage and stored as the packaged prompt
    pub text: String,
    /// Audit record of the stage
    pub record: StageRecord,
}

/// Summary, tags and complexity for a packaged prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// One-line summary, at most [`MAX_SUMMARY_CHARS`] characters
    pub summary: String,
    /// Up to [`MAX_TAGS`] lowercase tags
    pub tags: Vec<String>,
    /// Complexity rating
    pub complexity: Complexity,
}

impl Classification {
    /// The classification kept when the classify stage fails.
    pub fn fallback(title: &str) -> Self {
        let title = title.trim();
        let title = if title.is_empty() { "Untitled" } else { title };
        Self {
            summary: truncate_chars(&format!("{title}: packaged prompt"), MAX_SUMMARY_CHARS)
                .to_string(),
            tags: vec![FALLBACK_TAG.to_string()],
            complexity: Complexity::default(),
        }
    }
}

/// Result of the classify stage.
#[derive(Debug, Clone)]
pub struct Classified {
    /// Parsed classification, or the fallback
    pub classification: Classification,
    /// Audit record of the stage
    pub record: StageRecord,
}

#[derive(Debug, thiserror::Error)]
enum ClassifyError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("no JSON object found in classify response")]
    NoJsonObject,
    #[error("invalid classification JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
struct RawClassification {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    complexity: Option<String>,
}

/// Builds the user message of the standardize stage.
pub fn standardize_message(request: &PackagePrompt) -> String {
    let mut message = String::new();
    let _ = writeln!(message, "Title: {}", request.title.trim());
    if let Some(problem) = request.problem.as_deref().filter(|p| !p.trim().is_empty()) {
        let _ = writeln!(message, "Problem: {}", problem.trim());
    }
    if let Some(scope) = request.scope.as_deref().filter(|s| !s.trim().is_empty()) {
        let _ = writeln!(message, "Scope: {}", scope.trim());
    }
    if !request.integrations.is_empty() {
        let _ = writeln!(message, "Integrations: {}", request.integrations.join(", "));
    }
    let _ = write!(message, "\nRaw prompt:\n{}", request.raw_prompt);
    message
}

/// Runs the standardize stage. Falls back to the raw prompt on failure.
pub async fn standardize<M: ChatModel>(model: &M, request: &PackagePrompt) -> Standardized {
    let message = standardize_message(request);
    match model.complete(STANDARDIZE_INSTRUCTIONS, &message).await {
        Ok(text) if !text.trim().is_empty() => {
            debug!(output.len = text.len(), "Standardized prompt");
            Standardized {
                record: StageRecord {
                    step: Step::Standardize,
                    input: request.raw_prompt.clone(),
                    output: text.clone(),
                    success: true,
                },
                text,
            }
        }
        result => {
            let error = match result {
                Err(error) => error.to_string(),
                Ok(_) => LlmError::EmptyResponse.to_string(),
            };
            warn!(%error, "Standardize stage failed, using the raw prompt");
            Standardized {
                text: request.raw_prompt.clone(),
                record: StageRecord {
                    step: Step::Standardize,
                    input: request.raw_prompt.clone(),
                    output: error,
                    success: false,
                },
            }
        }
    }
}

/// Runs the classify stage over `text`. Keeps [`Classification::fallback`]
/// when the call fails or the response holds no usable JSON object.
pub async fn classify<M: ChatModel>(model: &M, title: &str, text: &str) -> Classified {
    let result = async {
        let response = model.complete(CLASSIFY_INSTRUCTIONS, text).await?;
        let classification = parse_classification(&response, title)?;
        Ok::<_, ClassifyError>((response, classification))
    }
    .await;

    match result {
        Ok((response, classification)) => {
            debug!(
                complexity = %classification.complexity,
                tags = ?classification.tags,
                "Classified prompt",
            );
            Classified {
                classification,
                record: StageRecord {
                    step: Step::Classify,
                    input: text.to_string(),
                    output: response,
                    success: true,
                },
            }
        }
        Err(error) => {
            warn!(%error, "Classify stage failed, using default classification");
            Classified {
                classification: Classification::fallback(title),
                record: StageRecord {
                    step: Step::Classify,
                    input: text.to_string(),
                    output: error.to_string(),
                    success: false,
                },
            }
        }
    }
}

/// Locates the outermost `{...}` block in a model response.
///
/// Tolerates prose or code fences around the object.
pub fn extract_json_object(response: &str) -> Option<&str> {
    JSON_OBJECT.find(response).map(|m| m.as_str())
}

fn parse_classification(response: &str, title: &str) -> Result<Classification, ClassifyError> {
    let object = extract_json_object(response).ok_or(ClassifyError::NoJsonObject)?;
    let raw: RawClassification = serde_json::from_str(object)?;
    Ok(normalize(raw, title))
}

fn normalize(raw: RawClassification, title: &str) -> Classification {
    let fallback = Classification::fallback(title);

    let summary = raw
        .summary
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(|s| truncate_chars(&s, MAX_SUMMARY_CHARS).to_string())
        .unwrap_or(fallback.summary);

    let mut tags: Vec<String> = Vec::new();
    for tag in raw.tags.unwrap_or_default() {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags.truncate(MAX_TAGS);
    if tags.is_empty() {
        tags = fallback.tags;
    }

    let complexity = raw
        .complexity
        .and_then(|c| c.trim().to_lowercase().parse().ok())
        .unwrap_or(fallback.complexity);

    Classification {
        summary,
        tags,
        complexity,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers each call with the next scripted response and records prompts.
    #[derive(Default)]
    struct ScriptedModel {
        responses: Mutex<VecDeque<Result<String, LlmError>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedModel {
        fn new(responses: impl IntoIterator<Item = Result<String, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
                calls: Mutex::default(),
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ChatModel for ScriptedModel {
        async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
            self.calls
                .lock()
                .unwrap()
                .push((system.to_string(), user.to_string()));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LlmError::EmptyResponse))
        }
    }

    fn gateway_error() -> LlmError {
        LlmError::Status {
            status: 500,
            body: "upstream exploded".into(),
        }
    }

    fn booking_app() -> PackagePrompt {
        PackagePrompt {
            title: "Booking app".into(),
            raw_prompt: "build me a booking app".into(),
            problem: Some("clients double-book".into()),
            integrations: vec!["stripe".into(), "google calendar".into()],
            ..Default::default()
        }
    }

    #[test]
    fn standardize_message_includes_context() {
        let message = standardize_message(&booking_app());
        assert!(message.contains("Title: Booking app"));
        assert!(message.contains("Problem: clients double-book"));
        assert!(message.contains("Integrations: stripe, google calendar"));
        assert!(message.ends_with("Raw prompt:\nbuild me a booking app"));
        assert!(!message.contains("Scope:"));
    }

    #[tokio::test]
    async fn standardize_uses_model_output() {
        let model = ScriptedModel::new([Ok("## Overview\nBuild a booking app.".into())]);
        let standardized = standardize(&model, &booking_app()).await;

        assert_eq!(standardized.text, "## Overview\nBuild a booking app.");
        assert!(standardized.record.success);
        assert_eq!(standardized.record.step, Step::Standardize);
        assert_eq!(standardized.record.input, "build me a booking app");
        assert!(model.calls()[0].0.contains("Admin Panel"));
    }

    #[tokio::test]
    async fn standardize_failure_falls_back_to_raw_prompt() {
        let model = ScriptedModel::new([Err(gateway_error())]);
        let standardized = standardize(&model, &booking_app()).await;

        assert_eq!(standardized.text, "build me a booking app");
        assert!(!standardized.record.success);
        assert_eq!(
            standardized.record.output,
            "AI gateway error 500: upstream exploded"
        );
    }

    #[tokio::test]
    async fn blank_standardize_output_counts_as_failure() {
        let model = ScriptedModel::new([Ok("   \n".into())]);
        let standardized = standardize(&model, &booking_app()).await;

        assert_eq!(standardized.text, "build me a booking app");
        assert!(!standardized.record.success);
    }

    #[tokio::test]
    async fn classify_parses_plain_json() {
        let model = ScriptedModel::new([Ok(
            r#"{"summary":"A booking app for salons","tags":["booking","payments"],"complexity":"complex"}"#.into(),
        )]);
        let classified = classify(&model, "Booking app", "standardized text").await;

        assert!(classified.record.success);
        assert_eq!(classified.record.input, "standardized text");
        assert_eq!(
            classified.classification,
            Classification {
                summary: "A booking app for salons".into(),
                tags: vec!["booking".into(), "payments".into()],
                complexity: Complexity::Complex,
            }
        );
        assert_eq!(model.calls()[0].1, "standardized text");
    }

    #[tokio::test]
    async fn classify_tolerates_code_fences() {
        let response = "```json\n{\"summary\": \"Salon bookings\", \"tags\": [\"booking\", \"salon\"], \"complexity\": \"simple\"}\n```";
        let model = ScriptedModel::new([Ok(response.into())]);
        let classified = classify(&model, "Booking app", "text").await;

        assert!(classified.record.success);
        assert_eq!(classified.classification.summary, "Salon bookings");
        assert_eq!(classified.classification.complexity, Complexity::Simple);
    }

    #[tokio::test]
    async fn classify_tolerates_surrounding_prose() {
        let response = "Sure! Here is the classification:\n{\"summary\": \"CRM\", \"tags\": [\"crm\", \"sales\"], \"complexity\": \"advanced\"}\nLet me know if you need more.";
        let model = ScriptedModel::new([Ok(response.into())]);
        let classified = classify(&model, "CRM", "text").await;

        assert!(classified.record.success);
        assert_eq!(classified.classification.complexity, Complexity::Advanced);
    }

    #[tokio::test]
    async fn classify_without_json_keeps_defaults() {
        let model = ScriptedModel::new([Ok("I cannot classify this prompt.".into())]);
        let classified = classify(&model, "Booking app", "text").await;

        assert!(!classified.record.success);
        assert_eq!(
            classified.record.output,
            "no JSON object found in classify response"
        );
        assert_eq!(
            classified.classification,
            Classification::fallback("Booking app")
        );
        assert_eq!(classified.classification.tags, vec!["unprocessed"]);
        assert_eq!(classified.classification.complexity, Complexity::Medium);
    }

    #[tokio::test]
    async fn classify_with_broken_json_keeps_defaults() {
        let model = ScriptedModel::new([Ok("{\"summary\": \"oops\", \"tags\": [}".into())]);
        let classified = classify(&model, "Booking app", "text").await;

        assert!(!classified.record.success);
        assert!(classified.record.output.starts_with("invalid classification JSON"));
        assert_eq!(
            classified.classification,
            Classification::fallback("Booking app")
        );
    }

    #[tokio::test]
    async fn classify_call_failure_keeps_defaults() {
        let model = ScriptedModel::new([Err(gateway_error())]);
        let classified = classify(&model, "", "text").await;

        assert!(!classified.record.success);
        assert_eq!(classified.classification.summary, "Untitled: packaged prompt");
    }

    #[test]
    fn extracts_outermost_object() {
        assert_eq!(
            extract_json_object("x {\"a\": {\"b\": 1}} y"),
            Some("{\"a\": {\"b\": 1}}")
        );
        assert_eq!(extract_json_object("no braces here"), None);
        assert_eq!(extract_json_object("{\n\"a\": 1\n}"), Some("{\n\"a\": 1\n}"));
    }

    #[test]
    fn normalization_clamps_fields() {
        let raw = RawClassification {
            summary: Some("s".repeat(400)),
            tags: Some(vec![
                " Booking ".into(),
                "booking".into(),
                "".into(),
                "a".into(),
                "b".into(),
                "c".into(),
                "d".into(),
                "e".into(),
            ]),
            complexity: Some("Extreme".into()),
        };

        let classification = normalize(raw, "Booking app");
        assert_eq!(classification.summary.chars().count(), MAX_SUMMARY_CHARS);
        assert_eq!(classification.tags, vec!["booking", "a", "b", "c", "d"]);
        assert_eq!(classification.complexity, Complexity::Medium);
    }

    #[test]
    fn normalization_fills_missing_fields() {
        let classification = normalize(RawClassification::default(), "Booking app");
        assert_eq!(classification, Classification::fallback("Booking app"));
    }
}
