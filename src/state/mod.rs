//! State persistence layer
//!
//! Pattern table (mutable, soft-delete only), feedback table (append-only
//! apart from the processing status) and the query log (append-only).
//! In-memory for development and tests; Postgres in `postgres`.

pub mod postgres;

use crate::config;
use crate::models::{FeedbackEvent, FeedbackStatus, QueryLogEntry, QueryPattern};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub use postgres::PgStore;

/// Trait for pattern persistence
#[async_trait::async_trait]
pub trait PatternStore: Send + Sync {
    async fn insert_pattern(&self, pattern: &QueryPattern) -> Result<()>;
    async fn update_pattern(&self, pattern: &QueryPattern) -> Result<()>;
    async fn get_pattern(&self, pattern_id: Uuid) -> Result<Option<QueryPattern>>;
    /// Active pattern with this normalized-text hash
    async fn find_by_hash(&self, query_hash: &str) -> Result<Option<QueryPattern>>;
    async fn active_patterns(&self) -> Result<Vec<QueryPattern>>;
    /// Soft delete; rows are never removed
    async fn deactivate_pattern(&self, pattern_id: Uuid, merged_into: Option<Uuid>) -> Result<()>;
}

/// Trait for feedback persistence
#[async_trait::async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn insert_feedback(&self, event: &FeedbackEvent) -> Result<()>;
    async fn get_feedback(&self, feedback_id: Uuid) -> Result<Option<FeedbackEvent>>;
    /// Atomically move a pending or failed row to processing.
    /// Returns false when the row is missing, already claimed or processed.
    async fn claim_feedback(&self, feedback_id: Uuid) -> Result<bool>;
    async fn mark_processed(&self, feedback_id: Uuid) -> Result<()>;
    async fn mark_failed(&self, feedback_id: Uuid, error: &str) -> Result<()>;
    /// Return processing rows claimed longer than `older_than` ago (or with no
    /// claim time) to pending. Returns how many rows were released.
    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize>;
    /// Oldest first
    async fn list_by_status(&self, status: FeedbackStatus, limit: usize) -> Result<Vec<FeedbackEvent>>;
}

/// Trait for the query log
#[async_trait::async_trait]
pub trait QueryLogStore: Send + Sync {
    async fn append_log(&self, entry: &QueryLogEntry) -> Result<()>;
    /// Entries created at or after `since`, oldest first
    async fn logs_since(&self, since: DateTime<Utc>) -> Result<Vec<QueryLogEntry>>;
}

/// Store handles shared by the learning loop and analytics
#[derive(Clone)]
pub struct Stores {
    pub patterns: Arc<dyn PatternStore>,
    pub feedback: Arc<dyn FeedbackStore>,
    pub logs: Arc<dyn QueryLogStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            patterns: store.clone(),
            feedback: store.clone(),
            logs: store,
        }
    }

    /// Postgres when `POSTGRES_URL`/`DATABASE_URL` is set and valid, else in-memory
    pub fn from_env() -> Self {
        if let Some(url) = config::database_url() {
            match PgStore::connect_lazy(&url) {
                Ok(store) => {
                    info!("Pipeline store backend: postgres");
                    let store = Arc::new(store);
                    return Self {
                        patterns: store.clone(),
                        feedback: store.clone(),
                        logs: store,
                    };
                }
                Err(error) => {
                    warn!(
                        "Failed to initialize postgres store, falling back to in-memory: {}",
                        error
                    );
                }
            }
        }

        info!("Pipeline store backend: in-memory");
        Self::in_memory()
    }
}

/// Claims made before this instant count as abandoned
pub(crate) fn stale_cutoff(older_than: Duration) -> Result<DateTime<Utc>> {
    let age = chrono::Duration::from_std(older_than)
        .map_err(|e| crate::PipelineError::ValidationError(format!("Invalid claim timeout: {}", e)))?;
    Ok(Utc::now() - age)
}

/// In-memory store for development
pub struct InMemoryStore {
    patterns: Arc<RwLock<HashMap<Uuid, QueryPattern>>>,
    feedback: Arc<RwLock<HashMap<Uuid, FeedbackEvent>>>,
    claimed_at: Arc<RwLock<HashMap<Uuid, DateTime<Utc>>>>,
    logs: Arc<RwLock<Vec<QueryLogEntry>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            patterns: Arc::new(RwLock::new(HashMap::new())),
            feedback: Arc::new(RwLock::new(HashMap::new())),
            claimed_at: Arc::new(RwLock::new(HashMap::new())),
            logs: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PatternStore for InMemoryStore {
    async fn insert_pattern(&self, pattern: &QueryPattern) -> Result<()> {
        let mut patterns = self.patterns.write().await;
        patterns.insert(pattern.pattern_id, pattern.clone());
        Ok(())
    }

    async fn update_pattern(&self, pattern: &QueryPattern) -> Result<()> {
        let mut patterns = self.patterns.write().await;
        patterns.insert(pattern.pattern_id, pattern.clone());
        Ok(())
    }

    async fn get_pattern(&self, pattern_id: Uuid) -> Result<Option<QueryPattern>> {
        let patterns = self.patterns.read().await;
        Ok(patterns.get(&pattern_id).cloned())
    }

    async fn find_by_hash(&self, query_hash: &str) -> Result<Option<QueryPattern>> {
        let patterns = self.patterns.read().await;
        Ok(patterns
            .values()
            .find(|p| p.is_active && p.query_hash == query_hash)
            .cloned())
    }

    async fn active_patterns(&self) -> Result<Vec<QueryPattern>> {
        let patterns = self.patterns.read().await;
        let mut active: Vec<QueryPattern> = patterns.values().filter(|p| p.is_active).cloned().collect();
        active.sort_by_key(|p| p.created_at);
        Ok(active)
    }

    async fn deactivate_pattern(&self, pattern_id: Uuid, merged_into: Option<Uuid>) -> Result<()> {
        let mut patterns = self.patterns.write().await;
        if let Some(pattern) = patterns.get_mut(&pattern_id) {
            pattern.is_active = false;
            pattern.merged_into = merged_into;
            pattern.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FeedbackStore for InMemoryStore {
    async fn insert_feedback(&self, event: &FeedbackEvent) -> Result<()> {
        let mut feedback = self.feedback.write().await;
        feedback.insert(event.feedback_id, event.clone());
        Ok(())
    }

    async fn get_feedback(&self, feedback_id: Uuid) -> Result<Option<FeedbackEvent>> {
        let feedback = self.feedback.read().await;
        Ok(feedback.get(&feedback_id).cloned())
    }

    async fn claim_feedback(&self, feedback_id: Uuid) -> Result<bool> {
        let mut feedback = self.feedback.write().await;
        match feedback.get_mut(&feedback_id) {
            Some(event)
                if matches!(event.status, FeedbackStatus::Pending | FeedbackStatus::Failed) =>
            {
                event.status = FeedbackStatus::Processing;
                self.claimed_at.write().await.insert(feedback_id, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_processed(&self, feedback_id: Uuid) -> Result<()> {
        let mut feedback = self.feedback.write().await;
        if let Some(event) = feedback.get_mut(&feedback_id) {
            event.status = FeedbackStatus::Processed;
            event.error = None;
            event.processed_at = Some(Utc::now());
        }
        self.claimed_at.write().await.remove(&feedback_id);
        Ok(())
    }

    async fn mark_failed(&self, feedback_id: Uuid, error: &str) -> Result<()> {
        let mut feedback = self.feedback.write().await;
        if let Some(event) = feedback.get_mut(&feedback_id) {
            event.status = FeedbackStatus::Failed;
            event.error = Some(error.to_string());
        }
        self.claimed_at.write().await.remove(&feedback_id);
        Ok(())
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize> {
        let cutoff = stale_cutoff(older_than)?;
        let mut feedback = self.feedback.write().await;
        let mut claimed_at = self.claimed_at.write().await;

        let mut released = 0;
        for event in feedback.values_mut() {
            if event.status != FeedbackStatus::Processing {
                continue;
            }
            let stale = claimed_at
                .get(&event.feedback_id)
                .map_or(true, |claimed| *claimed < cutoff);
            if stale {
                event.status = FeedbackStatus::Pending;
                claimed_at.remove(&event.feedback_id);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn list_by_status(&self, status: FeedbackStatus, limit: usize) -> Result<Vec<FeedbackEvent>> {
        let feedback = self.feedback.read().await;
        let mut events: Vec<FeedbackEvent> = feedback
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        events.truncate(limit);
        Ok(events)
    }
}

#[async_trait::async_trait]
impl QueryLogStore for InMemoryStore {
    async fn append_log(&self, entry: &QueryLogEntry) -> Result<()> {
        let mut logs = self.logs.write().await;
        logs.push(entry.clone());
        Ok(())
    }

    async fn logs_since(&self, since: DateTime<Utc>) -> Result<Vec<QueryLogEntry>> {
        let logs = self.logs.read().await;
        Ok(logs.iter().filter(|e| e.created_at >= since).cloned().collect())
    }
}
