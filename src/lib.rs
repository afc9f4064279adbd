#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Process-wide configuration.
pub mod config;
mod errors;
/// HTTP trigger surface.
pub mod http;
/// Chat-completion backends.
pub mod llm;
mod payload;
/// The standardize and classify stages.
pub mod pipeline;
mod processor;
mod reclaimer;
mod runner;
/// Database schema definitions.
pub mod schema;
/// Signal handling.
pub mod shutdown;
/// SQL access for the job tables.
pub mod storage;
mod util;
mod worker;

pub use self::errors::{EnqueueError, LlmError, PayloadError, ProcessError};
pub use self::llm::{ChatModel, GatewayClient, GatewayConfig};
pub use self::payload::{JobPayload, PackagePrompt};
/// The single-job claim-and-process unit of work.
pub use self::processor::{DegradedPolicy, ProcessOutcome, Processor};
/// The worker pool that keeps draining the queue.
pub use self::runner::{RunHandle, Runner};
pub use self::storage::setup_database;
