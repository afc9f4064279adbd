//! Shared setup for the integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use pfsw_jobs::{ChatModel, LlmError, setup_database};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres as PostgresImage;

/// Set up a test database with `TestContainers` and return the pool and container
pub async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<PostgresImage>)> {
    let postgres_image = PostgresImage::default();
    let container = postgres_image.start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    let pool = PgPool::connect(&connection_string).await?;
    setup_database(&pool).await?;

    Ok((pool, container))
}

/// A classification response that parses cleanly.
pub const CLASSIFICATION: &str =
    r#"{"summary": "Online booking for salons", "tags": ["booking", "payments"], "complexity": "complex"}"#;

/// Answers every call with the same text.
///
/// Returning a JSON object keeps both stages successful: standardize takes it
/// as the rewritten prompt and classify parses it.
pub struct ConstantModel {
    response: String,
    calls: AtomicUsize,
}

impl ConstantModel {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ConstantModel {
    fn default() -> Self {
        Self::new(CLASSIFICATION)
    }
}

impl ChatModel for ConstantModel {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

/// Answers each call with the next scripted response and records the user messages.
#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    user_messages: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(responses: impl IntoIterator<Item = Result<String, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            user_messages: Mutex::default(),
        }
    }

    pub fn user_messages(&self) -> Vec<String> {
        self.user_messages.lock().unwrap().clone()
    }
}

impl ChatModel for ScriptedModel {
    async fn complete(&self, _system: &str, user: &str) -> Result<String, LlmError> {
        self.user_messages.lock().unwrap().push(user.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }
}

/// Fails every call the way an unavailable gateway does.
pub struct FailingModel;

impl ChatModel for FailingModel {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
        Err(gateway_error(503, "service unavailable"))
    }
}

pub fn gateway_error(status: u16, body: &str) -> LlmError {
    LlmError::Status {
        status,
        body: body.to_string(),
    }
}

/// Inserts a job row directly, bypassing payload validation.
pub async fn insert_raw_job(
    pool: &PgPool,
    job_type: &str,
    payload: serde_json::Value,
) -> anyhow::Result<uuid::Uuid> {
    let id = uuid::Uuid::new_v4();
    sqlx::query("INSERT INTO jobs (id, type, payload_json) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(job_type)
        .bind(payload)
        .execute(pool)
        .await?;
    Ok(id)
}

/// Row-locks a job inside an open transaction. Claims on the job block until
/// the transaction ends.
pub async fn lock_job_row(
    pool: &PgPool,
    job_id: uuid::Uuid,
) -> anyhow::Result<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT id FROM jobs WHERE id = $1 FOR UPDATE")
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// Waits until `count` queries of this database are blocked on a lock.
pub async fn wait_for_lock_waiters(pool: &PgPool, count: i64) -> anyhow::Result<()> {
    for _ in 0..500 {
        let waiting: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pg_stat_activity
             WHERE datname = current_database() AND wait_event_type = 'Lock'",
        )
        .fetch_one(pool)
        .await?;
        if waiting >= count {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("expected {count} queries waiting on a lock")
}
