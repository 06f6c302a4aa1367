//! Session registry
//!
//! Each session is wrapped in its own `tokio::sync::Mutex`. Holding that lock
//! for the duration of a request keeps turns of one session in arrival order
//! while different sessions proceed concurrently.

use super::store::ConversationContext;
use crate::extractor::EntityExtractor;
use crate::slots::{SlotFiller, SlotFillingManager};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Analytics row of the last resolved turn, for attributing implicit feedback
#[derive(Debug, Clone)]
pub struct LastResolution {
    pub query: String,
    pub query_log_id: Uuid,
    pub pattern_id: Option<Uuid>,
}

/// Everything the cascade mutates for one conversation
pub struct Session {
    pub context: ConversationContext,
    pub slots: Box<dyn SlotFiller>,
    pub last_resolution: Option<LastResolution>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(context: ConversationContext, slots: Box<dyn SlotFiller>) -> Self {
        Self {
            context,
            slots,
            last_resolution: None,
            last_active: Utc::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.context.session_id
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}

/// Host-owned map of session id → session
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<Session>>>>>,
    extractor: Arc<EntityExtractor>,
    window_size: usize,
}

impl SessionRegistry {
    pub fn new(extractor: Arc<EntityExtractor>, window_size: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            extractor,
            window_size,
        }
    }

    /// Get or create the session for `session_id`
    pub async fn session(&self, session_id: &str) -> Arc<Mutex<Session>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                return session.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id = session_id, "Creating conversation session");
                Arc::new(Mutex::new(Session::new(
                    ConversationContext::new(session_id, self.window_size),
                    Box::new(SlotFillingManager::new(self.extractor.clone())),
                )))
            })
            .clone()
    }

    /// Lock the session for one request and mark it active.
    ///
    /// A session evicted between lookup and locking is replaced by a fresh
    /// one, so the turn is never written to a detached session.
    pub async fn lock(&self, session_id: &str) -> OwnedMutexGuard<Session> {
        loop {
            let session = self.session(session_id).await;
            let mut guard = session.clone().lock_owned().await;

            let registered = self
                .sessions
                .read()
                .await
                .get(session_id)
                .is_some_and(|current| Arc::ptr_eq(current, &session));
            if registered {
                guard.touch();
                return guard;
            }
            debug!(session_id = session_id, "Session evicted before lock, recreating");
        }
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop sessions idle longer than `max_idle`
    ///
    /// Sessions currently locked by a request are in use and always kept.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - max_idle;

        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| match session.try_lock() {
            Ok(guard) => guard.last_active >= cutoff,
            Err(_) => true,
        });

        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted = evicted, remaining = sessions.len(), "Evicted idle sessions");
        }
        evicted
    }

    /// Periodically evict sessions idle longer than `max_idle`.
    /// Must be called inside a tokio runtime.
    pub fn spawn_eviction(self: &Arc<Self>, max_idle: Duration, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.evict_idle(max_idle).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityMap;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(EntityExtractor::new()), 5)
    }

    #[tokio::test]
    async fn test_session_get_or_create() {
        let registry = registry();
        let a = registry.session("a").await;
        let again = registry.session("a").await;
        assert!(Arc::ptr_eq(&a, &again));

        registry.session("b").await;
        assert_eq!(registry.len().await, 2);

        assert!(registry.remove("a").await);
        assert!(!registry.remove("a").await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_same_session_is_serialized() {
        let registry = Arc::new(registry());
        let mut handles = Vec::new();

        for i in 0..10 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let session = registry.session("shared").await;
                let mut guard = session.lock().await;
                guard.context.add_turn(&format!("q{}", i), None, &EntityMap::new(), "ok");
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let session = registry.session("shared").await;
        let guard = session.lock().await;
        assert_eq!(guard.context.len(), 5);
        assert_eq!(guard.context.window_size(), 5);
    }

    #[tokio::test]
    async fn test_lock_touches_session() {
        let registry = registry();
        {
            let session = registry.session("a").await;
            session.lock().await.last_active = Utc::now() - chrono::Duration::hours(2);
        }

        let guard = registry.lock("a").await;
        assert!(guard.last_active > Utc::now() - chrono::Duration::minutes(1));
        drop(guard);

        assert_eq!(registry.evict_idle(Duration::from_secs(3600)).await, 0);
    }

    #[tokio::test]
    async fn test_lock_after_eviction_uses_registered_session() {
        let registry = registry();
        let stale = registry.session("a").await;
        stale.lock().await.last_active = Utc::now() - chrono::Duration::hours(2);
        assert_eq!(registry.evict_idle(Duration::from_secs(3600)).await, 1);

        let mut guard = registry.lock("a").await;
        guard.context.add_turn("hello", None, &EntityMap::new(), "hi");
        drop(guard);

        // the turn lives in the registered session, not the evicted one
        let current = registry.session("a").await;
        assert!(!Arc::ptr_eq(&current, &stale));
        assert_eq!(current.lock().await.context.len(), 1);
        assert!(stale.lock().await.context.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_eviction() {
        let registry = Arc::new(registry());
        {
            let idle = registry.session("idle").await;
            idle.lock().await.last_active = Utc::now() - chrono::Duration::hours(2);
        }
        registry.session("fresh").await;

        let task = registry.spawn_eviction(Duration::from_secs(3600), Duration::from_secs(60));
        tokio::task::yield_now().await;
        assert_eq!(registry.len().await, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.len().await, 1);
        task.abort();
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_busy_sessions() {
        let registry = registry();
        {
            let idle = registry.session("idle").await;
            idle.lock().await.last_active = Utc::now() - chrono::Duration::hours(2);
        }
        let busy = registry.session("busy").await;
        let mut busy_guard = busy.lock().await;
        busy_guard.last_active = Utc::now() - chrono::Duration::hours(2);

        let evicted = registry.evict_idle(Duration::from_secs(3600)).await;
        assert_eq!(evicted, 1);
        assert_eq!(registry.len().await, 1);
        drop(busy_guard);
    }
}
