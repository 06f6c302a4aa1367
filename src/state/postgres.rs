//! Postgres-backed store
//!
//! Schema is created lazily on first use. Maps and lists are JSONB,
//! embeddings are `REAL[]`; vector similarity is computed in-process.

use super::{stale_cutoff, FeedbackStore, PatternStore, QueryLogStore};
use crate::error::PipelineError;
use crate::models::{
    EntityMap, FeedbackEvent, FeedbackKind, FeedbackStatus, QueryLogEntry, QueryPattern,
};
use crate::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS query_patterns (
      pattern_id UUID PRIMARY KEY,
      query_text TEXT NOT NULL,
      query_hash TEXT NOT NULL,
      decomposed_query JSONB NOT NULL DEFAULT '{}'::jsonb,
      entities JSONB NOT NULL DEFAULT '{}'::jsonb,
      intent TEXT,
      embedding REAL[],
      success_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
      usage_count BIGINT NOT NULL DEFAULT 0,
      confidence DOUBLE PRECISION NOT NULL DEFAULT 0,
      variations JSONB NOT NULL DEFAULT '[]'::jsonb,
      corrections JSONB NOT NULL DEFAULT '[]'::jsonb,
      version INTEGER NOT NULL DEFAULT 1,
      is_active BOOLEAN NOT NULL DEFAULT TRUE,
      merged_into UUID,
      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
      last_used_at TIMESTAMPTZ
    );
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_query_patterns_active_hash
    ON query_patterns (query_hash) WHERE is_active;
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS query_feedback (
      feedback_id UUID PRIMARY KEY,
      query_log_id UUID NOT NULL,
      pattern_id UUID,
      kind TEXT NOT NULL,
      rating SMALLINT,
      helpful BOOLEAN,
      correction_text TEXT,
      status TEXT NOT NULL DEFAULT 'pending',
      error TEXT,
      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
      processed_at TIMESTAMPTZ,
      claimed_at TIMESTAMPTZ
    );
    "#,
    r#"
    ALTER TABLE query_feedback ADD COLUMN IF NOT EXISTS claimed_at TIMESTAMPTZ;
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_query_feedback_status_time
    ON query_feedback (status, created_at);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS query_logs (
      log_id UUID PRIMARY KEY,
      session_id TEXT,
      query TEXT NOT NULL,
      intent TEXT,
      category TEXT,
      entities JSONB NOT NULL DEFAULT '{}'::jsonb,
      method TEXT NOT NULL,
      pattern_id UUID,
      latency_ms BIGINT NOT NULL,
      success BOOLEAN NOT NULL,
      result_count BIGINT NOT NULL DEFAULT 0,
      error TEXT,
      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_query_logs_time
    ON query_logs (created_at);
    "#,
];

const PATTERN_COLUMNS: &str = "pattern_id, query_text, query_hash, decomposed_query, entities, intent, \
     embedding, success_rate, usage_count, confidence, variations, corrections, version, \
     is_active, merged_into, created_at, updated_at, last_used_at";

const FEEDBACK_COLUMNS: &str = "feedback_id, query_log_id, pattern_id, kind, rating, helpful, \
     correction_text, status, error, created_at, processed_at";

const LOG_COLUMNS: &str = "log_id, session_id, query, intent, category, entities, method, \
     pattern_id, latency_ms, success, result_count, error, created_at";

/// Postgres implementation of every store trait
pub struct PgStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)?;
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                PipelineError::DatabaseError(format!("Failed to initialize pipeline schema: {}", e))
            })?;
        Ok(())
    }
}

fn db_err(context: &str, e: sqlx::Error) -> PipelineError {
    PipelineError::DatabaseError(format!("{}: {}", context, e))
}

fn json_list(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

fn list_from_json(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn map_from_json(value: Value) -> EntityMap {
    match value {
        Value::Object(map) => map,
        _ => EntityMap::new(),
    }
}

fn pattern_from_row(row: &PgRow) -> Result<QueryPattern> {
    Ok(QueryPattern {
        pattern_id: row.try_get("pattern_id")?,
        query_text: row.try_get("query_text")?,
        query_hash: row.try_get("query_hash")?,
        decomposed_query: row.try_get("decomposed_query")?,
        entities: map_from_json(row.try_get("entities")?),
        intent: row.try_get("intent")?,
        embedding: row.try_get("embedding")?,
        success_rate: row.try_get("success_rate")?,
        usage_count: row.try_get("usage_count")?,
        confidence: row.try_get("confidence")?,
        variations: list_from_json(row.try_get("variations")?),
        corrections: list_from_json(row.try_get("corrections")?),
        version: row.try_get("version")?,
        is_active: row.try_get("is_active")?,
        merged_into: row.try_get("merged_into")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

fn feedback_from_row(row: &PgRow) -> Result<FeedbackEvent> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let rating: Option<i16> = row.try_get("rating")?;

    Ok(FeedbackEvent {
        feedback_id: row.try_get("feedback_id")?,
        query_log_id: row.try_get("query_log_id")?,
        pattern_id: row.try_get("pattern_id")?,
        kind: FeedbackKind::parse(&kind)
            .ok_or_else(|| PipelineError::DatabaseError(format!("Unknown feedback kind: {}", kind)))?,
        rating: rating.and_then(|r| u8::try_from(r).ok()),
        helpful: row.try_get("helpful")?,
        correction_text: row.try_get("correction_text")?,
        status: FeedbackStatus::parse(&status)
            .ok_or_else(|| PipelineError::DatabaseError(format!("Unknown feedback status: {}", status)))?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

fn log_from_row(row: &PgRow) -> Result<QueryLogEntry> {
    Ok(QueryLogEntry {
        log_id: row.try_get("log_id")?,
        session_id: row.try_get("session_id")?,
        query: row.try_get("query")?,
        intent: row.try_get("intent")?,
        category: row.try_get("category")?,
        entities: row.try_get("entities")?,
        method: row.try_get("method")?,
        pattern_id: row.try_get("pattern_id")?,
        latency_ms: row.try_get("latency_ms")?,
        success: row.try_get("success")?,
        result_count: row.try_get("result_count")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait::async_trait]
impl PatternStore for PgStore {
    async fn insert_pattern(&self, pattern: &QueryPattern) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(&format!(
            "INSERT INTO query_patterns ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) \
             ON CONFLICT DO NOTHING",
            PATTERN_COLUMNS
        ))
        .bind(pattern.pattern_id)
        .bind(&pattern.query_text)
        .bind(&pattern.query_hash)
        .bind(&pattern.decomposed_query)
        .bind(Value::Object(pattern.entities.clone()))
        .bind(&pattern.intent)
        .bind(&pattern.embedding)
        .bind(pattern.success_rate)
        .bind(pattern.usage_count)
        .bind(pattern.confidence)
        .bind(json_list(&pattern.variations))
        .bind(json_list(&pattern.corrections))
        .bind(pattern.version)
        .bind(pattern.is_active)
        .bind(pattern.merged_into)
        .bind(pattern.created_at)
        .bind(pattern.updated_at)
        .bind(pattern.last_used_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to insert pattern", e))?;

        Ok(())
    }

    async fn update_pattern(&self, pattern: &QueryPattern) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            UPDATE query_patterns SET
              query_text = $2, decomposed_query = $3, entities = $4, intent = $5,
              embedding = $6, success_rate = $7, usage_count = $8, confidence = $9,
              variations = $10, corrections = $11, version = $12, is_active = $13,
              merged_into = $14, updated_at = $15, last_used_at = $16
            WHERE pattern_id = $1
            "#,
        )
        .bind(pattern.pattern_id)
        .bind(&pattern.query_text)
        .bind(&pattern.decomposed_query)
        .bind(Value::Object(pattern.entities.clone()))
        .bind(&pattern.intent)
        .bind(&pattern.embedding)
        .bind(pattern.success_rate)
        .bind(pattern.usage_count)
        .bind(pattern.confidence)
        .bind(json_list(&pattern.variations))
        .bind(json_list(&pattern.corrections))
        .bind(pattern.version)
        .bind(pattern.is_active)
        .bind(pattern.merged_into)
        .bind(pattern.updated_at)
        .bind(pattern.last_used_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to update pattern", e))?;

        Ok(())
    }

    async fn get_pattern(&self, pattern_id: Uuid) -> Result<Option<QueryPattern>> {
        self.ensure_schema().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM query_patterns WHERE pattern_id = $1",
            PATTERN_COLUMNS
        ))
        .bind(pattern_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("Failed to load pattern", e))?;

        row.as_ref().map(pattern_from_row).transpose()
    }

    async fn find_by_hash(&self, query_hash: &str) -> Result<Option<QueryPattern>> {
        self.ensure_schema().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM query_patterns WHERE query_hash = $1 AND is_active LIMIT 1",
            PATTERN_COLUMNS
        ))
        .bind(query_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("Failed to look up pattern hash", e))?;

        row.as_ref().map(pattern_from_row).transpose()
    }

    async fn active_patterns(&self) -> Result<Vec<QueryPattern>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM query_patterns WHERE is_active ORDER BY created_at ASC",
            PATTERN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to load active patterns", e))?;

        rows.iter().map(pattern_from_row).collect()
    }

    async fn deactivate_pattern(&self, pattern_id: Uuid, merged_into: Option<Uuid>) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            "UPDATE query_patterns SET is_active = FALSE, merged_into = $2, updated_at = NOW() \
             WHERE pattern_id = $1",
        )
        .bind(pattern_id)
        .bind(merged_into)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to deactivate pattern", e))?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl FeedbackStore for PgStore {
    async fn insert_feedback(&self, event: &FeedbackEvent) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(&format!(
            "INSERT INTO query_feedback ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            FEEDBACK_COLUMNS
        ))
        .bind(event.feedback_id)
        .bind(event.query_log_id)
        .bind(event.pattern_id)
        .bind(event.kind.as_str())
        .bind(event.rating.map(i16::from))
        .bind(event.helpful)
        .bind(&event.correction_text)
        .bind(event.status.as_str())
        .bind(&event.error)
        .bind(event.created_at)
        .bind(event.processed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to insert feedback", e))?;

        Ok(())
    }

    async fn get_feedback(&self, feedback_id: Uuid) -> Result<Option<FeedbackEvent>> {
        self.ensure_schema().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM query_feedback WHERE feedback_id = $1",
            FEEDBACK_COLUMNS
        ))
        .bind(feedback_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("Failed to load feedback", e))?;

        row.as_ref().map(feedback_from_row).transpose()
    }

    async fn claim_feedback(&self, feedback_id: Uuid) -> Result<bool> {
        self.ensure_schema().await?;

        let result = sqlx::query(
            "UPDATE query_feedback SET status = 'processing', claimed_at = NOW() \
             WHERE feedback_id = $1 AND status IN ('pending', 'failed')",
        )
        .bind(feedback_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to claim feedback", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(&self, feedback_id: Uuid) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            "UPDATE query_feedback SET status = 'processed', error = NULL, processed_at = NOW(), claimed_at = NULL \
             WHERE feedback_id = $1",
        )
        .bind(feedback_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to mark feedback processed", e))?;

        Ok(())
    }

    async fn mark_failed(&self, feedback_id: Uuid, error: &str) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            "UPDATE query_feedback SET status = 'failed', error = $2, claimed_at = NULL WHERE feedback_id = $1",
        )
        .bind(feedback_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to mark feedback failed", e))?;

        Ok(())
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize> {
        self.ensure_schema().await?;
        let cutoff = stale_cutoff(older_than)?;

        let result = sqlx::query(
            "UPDATE query_feedback SET status = 'pending', claimed_at = NULL \
             WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at < $1)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to reclaim stale feedback", e))?;

        Ok(result.rows_affected() as usize)
    }

    async fn list_by_status(&self, status: FeedbackStatus, limit: usize) -> Result<Vec<FeedbackEvent>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM query_feedback WHERE status = $1 ORDER BY created_at ASC LIMIT $2",
            FEEDBACK_COLUMNS
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to list feedback", e))?;

        rows.iter().map(feedback_from_row).collect()
    }
}

#[async_trait::async_trait]
impl QueryLogStore for PgStore {
    async fn append_log(&self, entry: &QueryLogEntry) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(&format!(
            "INSERT INTO query_logs ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            LOG_COLUMNS
        ))
        .bind(entry.log_id)
        .bind(&entry.session_id)
        .bind(&entry.query)
        .bind(&entry.intent)
        .bind(&entry.category)
        .bind(&entry.entities)
        .bind(&entry.method)
        .bind(entry.pattern_id)
        .bind(entry.latency_ms)
        .bind(entry.success)
        .bind(entry.result_count)
        .bind(&entry.error)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to append query log", e))?;

        Ok(())
    }

    async fn logs_since(&self, since: DateTime<Utc>) -> Result<Vec<QueryLogEntry>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM query_logs WHERE created_at >= $1 ORDER BY created_at ASC",
            LOG_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to load query logs", e))?;

        rows.iter().map(log_from_row).collect()
    }
}
