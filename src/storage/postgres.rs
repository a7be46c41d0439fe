use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use tracing::debug;
use uuid::Uuid;

use super::records::*;
use super::JobStore;
use crate::cli::config::StorageSettings;

/// PostgreSQL implementation of JobStore
pub struct PostgresJobStore {
    /// PostgreSQL connection pool
    pool: Pool<Postgres>,

    /// Schema name
    schema: String,

    /// Table prefix
    table_prefix: String,
}

impl PostgresJobStore {
    /// Connect and make sure the tables exist
    pub async fn new(settings: &StorageSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let store = Self {
            pool,
            schema: settings.schema_name.clone(),
            table_prefix: settings.table_prefix.clone(),
        };

        store.ensure_schema().await?;

        debug!("Connected to PostgreSQL database");

        Ok(store)
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}_{}", self.schema, self.table_prefix, name)
    }

    /// Ensure the schema and tables exist
    async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id UUID PRIMARY KEY,
                    label TEXT NOT NULL,
                    status TEXT NOT NULL,
                    strategy TEXT NOT NULL,
                    seeds JSONB NOT NULL,
                    config JSONB NOT NULL,
                    stats JSONB NOT NULL,
                    last_run_at TIMESTAMPTZ NOT NULL,
                    completed_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.table("jobs")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id UUID PRIMARY KEY,
                    job_id UUID NOT NULL REFERENCES {}(id),
                    url TEXT NOT NULL,
                    normalized_url TEXT NOT NULL,
                    depth INTEGER NOT NULL,
                    metadata JSONB NOT NULL,
                    last_status INTEGER,
                    last_scraped_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.table("targets"),
                self.table("jobs")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id UUID PRIMARY KEY,
                    job_id UUID NOT NULL REFERENCES {}(id),
                    target_id UUID NOT NULL REFERENCES {}(id),
                    url TEXT NOT NULL,
                    method TEXT NOT NULL,
                    status_code INTEGER,
                    duration_ms BIGINT NOT NULL,
                    bytes BIGINT,
                    request_headers JSONB NOT NULL,
                    response_headers JSONB,
                    timings JSONB NOT NULL,
                    error TEXT,
                    error_kind TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.table("requests"),
                self.table("jobs"),
                self.table("targets")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id UUID PRIMARY KEY,
                    job_id UUID NOT NULL REFERENCES {}(id),
                    target_id UUID NOT NULL REFERENCES {}(id),
                    url TEXT NOT NULL,
                    content_type TEXT,
                    charset TEXT,
                    raw_html TEXT NOT NULL,
                    raw_text TEXT NOT NULL,
                    structured JSONB NOT NULL,
                    metadata JSONB NOT NULL,
                    hash TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.table("results"),
                self.table("jobs"),
                self.table("targets")
            ),
            // Fingerprints may collide; lookups only
            format!(
                "CREATE INDEX IF NOT EXISTS {}_results_hash_idx ON {} (hash)",
                self.table_prefix,
                self.table("results")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id UUID PRIMARY KEY,
                    job_id UUID NOT NULL REFERENCES {}(id),
                    target_id UUID NOT NULL REFERENCES {}(id),
                    request_id UUID NOT NULL REFERENCES {}(id),
                    code TEXT NOT NULL,
                    message TEXT NOT NULL,
                    details JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.table("errors"),
                self.table("jobs"),
                self.table("targets"),
                self.table("requests")
            ),
        ];

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context(format!("Failed to bootstrap schema: {}", self.schema))?;
        }

        debug!("Ensured tables exist in schema: {}", self.schema);

        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(&self, job: &NewJob) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let query = format!(
            "INSERT INTO {} (id, label, status, strategy, seeds, config, stats, last_run_at)
             VALUES ($1, $2, $3, $4, $5, $6, '{{}}'::jsonb, $7)",
            self.table("jobs")
        );

        sqlx::query(&query)
            .bind(id)
            .bind(&job.label)
            .bind(JobStatus::Running.as_str())
            .bind(&job.strategy)
            .bind(Json(&job.seeds))
            .bind(Json(&job.config))
            .bind(job.started_at)
            .execute(&self.pool)
            .await
            .context("Failed to create job")?;

        debug!("Created job {}", id);

        Ok(id)
    }

    async fn create_targets(&self, job_id: Uuid, urls: &[String]) -> Result<Vec<TargetRef>> {
        let query = format!(
            "INSERT INTO {} (id, job_id, url, normalized_url, depth, metadata)
             VALUES ($1, $2, $3, $4, 0, $5)",
            self.table("targets")
        );

        let mut tx = self.pool.begin().await.context("Failed to begin target transaction")?;
        let mut refs = Vec::with_capacity(urls.len());

        for (index, url) in urls.iter().enumerate() {
            let id = Uuid::new_v4();
            sqlx::query(&query)
                .bind(id)
                .bind(job_id)
                .bind(url)
                .bind(url)
                .bind(Json(TargetMetadata { index }))
                .execute(&mut *tx)
                .await
                .context(format!("Failed to create target for URL: {}", url))?;
            refs.push(TargetRef { id, url: url.clone() });
        }

        // Dropping the transaction on an early return rolls it back
        tx.commit().await.context("Failed to commit targets")?;

        debug!("Created {} targets for job {}", refs.len(), job_id);

        Ok(refs)
    }

    async fn create_attempt(&self, job_id: Uuid, target_id: Uuid, attempt: &NewAttempt) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let query = format!(
            "INSERT INTO {} (id, job_id, target_id, url, method, status_code, duration_ms, bytes,
                             request_headers, response_headers, timings, error, error_kind)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            self.table("requests")
        );

        sqlx::query(&query)
            .bind(id)
            .bind(job_id)
            .bind(target_id)
            .bind(&attempt.url)
            .bind(&attempt.method)
            .bind(attempt.status_code.map(i32::from))
            .bind(attempt.duration_ms as i64)
            .bind(attempt.bytes.map(|b| b as i64))
            .bind(Json(&attempt.request_headers))
            .bind(attempt.response_headers.as_ref().map(Json))
            .bind(Json(&attempt.timings))
            .bind(attempt.error.as_deref())
            .bind(attempt.error_kind.map(|k| k.as_str()))
            .execute(&self.pool)
            .await
            .context("Failed to create request attempt")?;

        Ok(id)
    }

    async fn create_result(&self, job_id: Uuid, target_id: Uuid, result: &NewResult) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let query = format!(
            "INSERT INTO {} (id, job_id, target_id, url, content_type, charset, raw_html, raw_text,
                             structured, metadata, hash)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            self.table("results")
        );

        sqlx::query(&query)
            .bind(id)
            .bind(job_id)
            .bind(target_id)
            .bind(&result.url)
            .bind(result.content_type.as_deref())
            .bind(result.charset.as_deref())
            .bind(&result.raw_html)
            .bind(&result.raw_text)
            .bind(Json(&result.structured))
            .bind(Json(&result.metadata))
            .bind(&result.fingerprint)
            .execute(&self.pool)
            .await
            .context("Failed to create result")?;

        debug!("Stored result for URL: {}", result.url);

        Ok(id)
    }

    async fn create_error(&self, job_id: Uuid, target_id: Uuid, error: &NewError) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let query = format!(
            "INSERT INTO {} (id, job_id, target_id, request_id, code, message, details)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.table("errors")
        );

        sqlx::query(&query)
            .bind(id)
            .bind(job_id)
            .bind(target_id)
            .bind(error.request_id)
            .bind(&error.code)
            .bind(&error.message)
            .bind(Json(&error.details))
            .execute(&self.pool)
            .await
            .context("Failed to create error record")?;

        Ok(id)
    }

    async fn update_target(&self, target_id: Uuid, update: &TargetUpdate) -> Result<()> {
        let query = format!(
            "UPDATE {} SET last_status = $2, last_scraped_at = $3 WHERE id = $1",
            self.table("targets")
        );

        sqlx::query(&query)
            .bind(target_id)
            .bind(i32::from(update.last_status))
            .bind(update.last_scraped_at)
            .execute(&self.pool)
            .await
            .context("Failed to update target")?;

        Ok(())
    }

    async fn update_job(&self, job_id: Uuid, completion: &JobCompletion) -> Result<()> {
        let query = format!(
            "UPDATE {} SET status = $2, stats = $3, last_run_at = $4, completed_at = $5 WHERE id = $1",
            self.table("jobs")
        );

        let updated = sqlx::query(&query)
            .bind(job_id)
            .bind(completion.status.as_str())
            .bind(Json(&completion.stats))
            .bind(completion.last_run_at)
            .bind(completion.completed_at)
            .execute(&self.pool)
            .await
            .context("Failed to update job")?;

        if updated.rows_affected() == 0 {
            anyhow::bail!("Job not found: {}", job_id);
        }

        debug!("Job {} finished as {}", job_id, completion.status);

        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        debug!("PostgreSQL pool closed");
    }
}
