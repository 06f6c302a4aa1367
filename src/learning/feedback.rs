//! Feedback Loop
//!
//! Usage signals are persisted first, then applied to their pattern by a
//! background worker after a debounce delay. Each feedback id is applied at
//! most once: an in-process in-flight set rejects concurrent triggers and the
//! store's claim transition rejects work already done by another process.
//! The worker also sweeps the backlog at startup and periodically: abandoned
//! claims are released, pending rows the timers missed are drained and failed
//! rows are retried.

use super::learner::{FeedbackSample, PatternLearner};
use crate::config::FeedbackConfig;
use crate::error::PipelineError;
use crate::models::{FeedbackEvent, FeedbackKind, FeedbackStatus};
use crate::state::{stale_cutoff, FeedbackStore};
use crate::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

enum WorkerCommand {
    Schedule(Uuid),
    Shutdown,
}

/// Shared state used by callers and by the worker task
struct FeedbackCore {
    store: Arc<dyn FeedbackStore>,
    learner: Arc<PatternLearner>,
    config: FeedbackConfig,
    in_flight: Mutex<HashSet<Uuid>>,
}

pub struct FeedbackLoop {
    core: Arc<FeedbackCore>,
    sender: Option<mpsc::UnboundedSender<WorkerCommand>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FeedbackLoop {
    /// Starts the debounce worker when auto-processing is enabled.
    /// Must be called inside a tokio runtime.
    pub fn new(
        store: Arc<dyn FeedbackStore>,
        learner: Arc<PatternLearner>,
        config: FeedbackConfig,
    ) -> Self {
        let auto_process = config.auto_process;
        let core = Arc::new(FeedbackCore {
            store,
            learner,
            config,
            in_flight: Mutex::new(HashSet::new()),
        });

        let (sender, worker) = if auto_process {
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = tokio::spawn(run_worker(core.clone(), rx));
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        Self {
            core,
            sender,
            worker: Mutex::new(worker),
        }
    }

    // =============================
    // Ingestion
    // =============================

    pub async fn record_implicit(
        &self,
        query_log_id: Uuid,
        pattern_id: Option<Uuid>,
        kind: FeedbackKind,
        correction_text: Option<String>,
    ) -> Result<FeedbackEvent> {
        if kind == FeedbackKind::Explicit {
            return Err(PipelineError::ValidationError(
                "Explicit feedback must be recorded with a rating".to_string(),
            ));
        }

        let signal = kind.implicit_signal();
        let event = new_event(
            query_log_id,
            pattern_id,
            kind,
            signal.map(|(rating, _)| rating),
            signal.map(|(_, helpful)| helpful),
            correction_text,
        )?;

        self.persist_and_schedule(event).await
    }

    pub async fn record_explicit(
        &self,
        query_log_id: Uuid,
        pattern_id: Option<Uuid>,
        rating: Option<i64>,
        helpful: Option<bool>,
        correction_text: Option<String>,
    ) -> Result<FeedbackEvent> {
        let rating = match rating {
            Some(value) if (1..=5).contains(&value) => Some(value as u8),
            Some(value) => {
                return Err(PipelineError::ValidationError(format!(
                    "Rating {} outside 1..=5",
                    value
                )));
            }
            None => None,
        };
        if rating.is_none() && helpful.is_none() {
            return Err(PipelineError::ValidationError(
                "Explicit feedback needs a rating or a helpful flag".to_string(),
            ));
        }

        let event = new_event(
            query_log_id,
            pattern_id,
            FeedbackKind::Explicit,
            rating,
            helpful,
            correction_text,
        )?;

        self.persist_and_schedule(event).await
    }

    async fn persist_and_schedule(&self, event: FeedbackEvent) -> Result<FeedbackEvent> {
        self.core.store.insert_feedback(&event).await.map_err(|e| {
            error!(feedback_id = %event.feedback_id, error = %e, "Failed to persist feedback");
            e
        })?;

        debug!(
            feedback_id = %event.feedback_id,
            kind = event.kind.as_str(),
            pattern_id = ?event.pattern_id,
            "Feedback recorded"
        );

        if event.pattern_id.is_some() && has_signal(&event) {
            self.schedule(event.feedback_id);
        }
        Ok(event)
    }

    /// (Re)start the debounce timer of a feedback id
    pub fn schedule(&self, feedback_id: Uuid) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(WorkerCommand::Schedule(feedback_id)).is_err() {
            warn!(feedback_id = %feedback_id, "Feedback worker stopped, update not scheduled");
        }
    }

    // =============================
    // Processing
    // =============================

    /// Apply one feedback event; `Ok(false)` when skipped or already handled
    pub async fn process_feedback(&self, feedback_id: Uuid) -> Result<bool> {
        self.core.process_feedback(feedback_id).await
    }

    /// Drain pending feedback, skipping ids already in flight
    pub async fn process_pending_batch(&self) -> Result<usize> {
        self.core.drain(FeedbackStatus::Pending).await
    }

    /// Reprocess rows whose previous attempt failed
    pub async fn retry_failed(&self) -> Result<usize> {
        self.core.drain(FeedbackStatus::Failed).await
    }

    /// Release abandoned claims, then apply overdue pending and failed rows
    pub async fn sweep(&self) -> Result<usize> {
        self.core.sweep().await
    }

    /// Stop the worker; pending debounce timers are dropped and their rows
    /// are picked up by the next sweep
    pub async fn shutdown(&self) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Feedback worker ended abnormally");
            }
        }
    }
}

impl FeedbackCore {
    async fn process_feedback(&self, feedback_id: Uuid) -> Result<bool> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(feedback_id) {
                debug!(feedback_id = %feedback_id, "Feedback already in flight");
                return Ok(false);
            }
        }

        let result = self.apply(feedback_id).await;
        self.in_flight.lock().await.remove(&feedback_id);
        result
    }

    async fn apply(&self, feedback_id: Uuid) -> Result<bool> {
        if !self.store.claim_feedback(feedback_id).await? {
            debug!(feedback_id = %feedback_id, "Feedback already claimed or processed");
            return Ok(false);
        }

        let Some(event) = self.store.get_feedback(feedback_id).await? else {
            return Ok(false);
        };

        let (Some(pattern_id), Some(sample)) = (event.pattern_id, sample_of(&event)) else {
            self.store.mark_processed(feedback_id).await?;
            return Ok(false);
        };

        match self.learner.update_pattern_feedback(pattern_id, sample).await {
            Ok(_) => {
                self.store.mark_processed(feedback_id).await?;
                info!(feedback_id = %feedback_id, pattern_id = %pattern_id, "Feedback applied");
                Ok(true)
            }
            Err(e) => {
                error!(feedback_id = %feedback_id, error = %e, "Feedback processing failed");
                if let Err(mark_err) = self.store.mark_failed(feedback_id, &e.to_string()).await {
                    error!(feedback_id = %feedback_id, error = %mark_err, "Failed to mark feedback failed");
                }
                Err(e)
            }
        }
    }

    async fn drain(&self, status: FeedbackStatus) -> Result<usize> {
        let events = self
            .store
            .list_by_status(status, self.config.batch_size)
            .await?;
        self.apply_all(events, status).await
    }

    async fn sweep(&self) -> Result<usize> {
        let released = self.store.reclaim_stale(self.config.claim_timeout).await?;
        if released > 0 {
            warn!(released = released, "Released abandoned feedback claims");
        }

        // Younger pending rows still have a debounce timer running
        let cutoff = stale_cutoff(self.config.debounce)?;
        let overdue: Vec<FeedbackEvent> = self
            .store
            .list_by_status(FeedbackStatus::Pending, self.config.batch_size)
            .await?
            .into_iter()
            .filter(|event| event.created_at <= cutoff)
            .collect();

        let applied = self.apply_all(overdue, FeedbackStatus::Pending).await?;
        Ok(applied + self.drain(FeedbackStatus::Failed).await?)
    }

    async fn apply_all(&self, events: Vec<FeedbackEvent>, status: FeedbackStatus) -> Result<usize> {
        let mut applied = 0;
        for event in events {
            if self.in_flight.lock().await.contains(&event.feedback_id) {
                continue;
            }
            match self.process_feedback(event.feedback_id).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => warn!(feedback_id = %event.feedback_id, error = %e, "Skipping failed feedback"),
            }
        }

        if applied > 0 {
            info!(applied = applied, status = status.as_str(), "Feedback batch processed");
        }
        Ok(applied)
    }
}

/// Debounce worker: one deadline per feedback id, re-scheduling resets it
async fn run_worker(core: Arc<FeedbackCore>, mut rx: mpsc::UnboundedReceiver<WorkerCommand>) {
    let mut deadlines: HashMap<Uuid, Instant> = HashMap::new();
    // First tick fires immediately, so the backlog is swept at startup
    let mut sweep = tokio::time::interval(core.config.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let next = deadlines.values().min().copied();

        tokio::select! {
            _ = sweep.tick() => {
                if let Err(e) = core.sweep().await {
                    warn!(error = %e, "Feedback sweep failed");
                }
            }
            command = rx.recv() => match command {
                Some(WorkerCommand::Schedule(id)) => {
                    deadlines.insert(id, Instant::now() + core.config.debounce);
                }
                Some(WorkerCommand::Shutdown) | None => break,
            },
            _ = wait_until(next) => {
                let now = Instant::now();
                let due: Vec<Uuid> = deadlines
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();

                for id in due {
                    deadlines.remove(&id);
                    if let Err(e) = core.process_feedback(id).await {
                        warn!(feedback_id = %id, error = %e, "Scheduled feedback update failed");
                    }
                }
            }
        }
    }

    debug!(dropped = deadlines.len(), "Feedback worker stopped");
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn new_event(
    query_log_id: Uuid,
    pattern_id: Option<Uuid>,
    kind: FeedbackKind,
    rating: Option<u8>,
    helpful: Option<bool>,
    correction_text: Option<String>,
) -> Result<FeedbackEvent> {
    if query_log_id.is_nil() {
        return Err(PipelineError::ValidationError("Query log id is required".to_string()));
    }

    Ok(FeedbackEvent {
        feedback_id: Uuid::new_v4(),
        query_log_id,
        pattern_id: pattern_id.filter(|id| !id.is_nil()),
        kind,
        rating,
        helpful,
        correction_text: correction_text.filter(|c| !c.trim().is_empty()),
        status: FeedbackStatus::Pending,
        error: None,
        created_at: Utc::now(),
        processed_at: None,
    })
}

fn has_signal(event: &FeedbackEvent) -> bool {
    event.rating.is_some() || event.helpful.is_some()
}

/// success = rating ≥ 4, else the helpful flag
fn sample_of(event: &FeedbackEvent) -> Option<FeedbackSample> {
    if !has_signal(event) {
        return None;
    }
    let success = match event.rating {
        Some(rating) => rating >= 4,
        None => event.helpful.unwrap_or(false),
    };
    Some(FeedbackSample {
        success,
        rating: event.rating,
        helpful: event.helpful,
        correction: event.correction_text.clone(),
    })
}
