//! Pipeline configuration
//!
//! All thresholds below are tuned business constants. Defaults match the
//! production values; `from_env` only overrides operational knobs.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Rewrite confidence at or above which a direct route is honoured
pub const DIRECT_ROUTE_THRESHOLD: f32 = 0.85;

/// Conversation window configuration
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Number of turns kept per session
    pub window_size: usize,
    /// Sessions untouched for this long are dropped by the host
    pub session_idle_ttl: Duration,
    pub eviction_interval: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            session_idle_ttl: Duration::from_secs(30 * 60),
            eviction_interval: Duration::from_secs(60),
        }
    }
}

/// Confidence thresholds for the classification cascade
#[derive(Debug, Clone)]
pub struct CascadeThresholds {
    /// Minimum similarity returned by embedding search
    pub search_floor: f32,
    /// Number of exemplar matches requested
    pub search_top_k: usize,
    pub high: f32,
    pub medium: f32,
    /// Minimum confidence for a slot answer to be accepted
    pub slot_answer: f32,
    pub direct_route: f32,
}

impl Default for CascadeThresholds {
    fn default() -> Self {
        Self {
            search_floor: 0.60,
            search_top_k: 3,
            high: 0.87,
            medium: 0.72,
            slot_answer: 0.80,
            direct_route: DIRECT_ROUTE_THRESHOLD,
        }
    }
}

/// Pattern learning configuration
#[derive(Debug, Clone)]
pub struct PatternConfig {
    /// Cosine similarity for near-duplicate / match detection
    pub similarity_threshold: f64,
    /// Word-overlap fallback when embeddings are unavailable
    pub text_similarity_threshold: f64,
    /// Minimum Jaccard overlap of entity keys for a match
    pub entity_overlap_threshold: f64,
    pub max_corrections: usize,
    pub max_variations: usize,
    /// Word overlap below which a decomposition counts as materially changed
    pub material_change_threshold: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            text_similarity_threshold: 0.70,
            entity_overlap_threshold: 0.70,
            max_corrections: 10,
            max_variations: 20,
            material_change_threshold: 0.80,
        }
    }
}

/// Feedback loop configuration
#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    pub auto_process: bool,
    pub debounce: Duration,
    pub batch_size: usize,
    /// Period of the backlog sweep run by the worker
    pub sweep_interval: Duration,
    /// Processing claims older than this are considered abandoned
    pub claim_timeout: Duration,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            auto_process: true,
            debounce: Duration::from_secs(5),
            batch_size: 50,
            sweep_interval: Duration::from_secs(60),
            claim_timeout: Duration::from_secs(300),
        }
    }
}

/// Query analytics configuration
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub cache_ttl: Duration,
    /// Nesting depth after which payloads are truncated
    pub max_depth: usize,
    /// Data points required before a daily trend is reported
    pub trend_min_points: usize,
    pub top_errors: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            max_depth: 10,
            trend_min_points: 7,
            top_errors: 5,
        }
    }
}

/// Completion service usage
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub model: String,
    pub embedding_model: String,
    pub max_tokens: u32,
    pub wording_temperature: f32,
    pub fallback_temperature: f32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            embedding_model: "text-embedding-004".to_string(),
            max_tokens: 1024,
            wording_temperature: 0.3,
            fallback_temperature: 0.7,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub context: ContextConfig,
    pub thresholds: CascadeThresholds,
    pub patterns: PatternConfig,
    pub feedback: FeedbackConfig,
    pub analytics: AnalyticsConfig,
    pub completion: CompletionConfig,
}

impl PipelineConfig {
    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.context.window_size =
            env_or("CONTEXT_WINDOW_SIZE", config.context.window_size).max(1);
        config.context.session_idle_ttl = Duration::from_secs(env_or(
            "SESSION_IDLE_TTL_SECS",
            config.context.session_idle_ttl.as_secs(),
        ));
        config.context.eviction_interval = Duration::from_secs(
            env_or("SESSION_EVICTION_SECS", config.context.eviction_interval.as_secs()).max(1),
        );
        config.feedback.auto_process =
            env_or("FEEDBACK_AUTO_PROCESS", config.feedback.auto_process);
        config.feedback.debounce = Duration::from_millis(env_or(
            "FEEDBACK_DEBOUNCE_MS",
            config.feedback.debounce.as_millis() as u64,
        ));
        config.feedback.sweep_interval = Duration::from_secs(
            env_or("FEEDBACK_SWEEP_SECS", config.feedback.sweep_interval.as_secs()).max(1),
        );
        config.feedback.claim_timeout = Duration::from_secs(env_or(
            "FEEDBACK_CLAIM_TIMEOUT_SECS",
            config.feedback.claim_timeout.as_secs(),
        ));
        config.analytics.cache_ttl = Duration::from_secs(env_or(
            "ANALYTICS_CACHE_TTL_SECS",
            config.analytics.cache_ttl.as_secs(),
        ));

        if let Ok(model) = env::var("GEMINI_MODEL") {
            if !model.trim().is_empty() {
                config.completion.model = model;
            }
        }
        if let Ok(model) = env::var("GEMINI_EMBEDDING_MODEL") {
            if !model.trim().is_empty() {
                config.completion.embedding_model = model;
            }
        }

        config
    }
}

/// Database URL if a durable store is configured
pub fn database_url() -> Option<String> {
    env::var("POSTGRES_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .ok()
        .filter(|url| !url.trim().is_empty())
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparseable {}={:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
