//! Query analytics
//!
//! Append-only logging of every resolved query plus windowed reporting.
//! `track_query` never fails the caller: unserializable payloads and store
//! errors are logged and reported as `None`.

pub mod serializer;

use crate::config::AnalyticsConfig;
use crate::models::{DailyPoint, ErrorCount, QueryLogEntry, QueryStats, ResolutionMethod};
use crate::state::QueryLogStore;
use crate::{PipelineError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub use serializer::{safe_serialize, Payload, SerializeError};

/// Object keys probed, in order, for a list of results
const RESULT_LIST_KEYS: [&str; 6] = ["results", "items", "data", "transactions", "cards", "rows"];
const RESULT_COUNT_KEYS: [&str; 3] = ["count", "total", "result_count"];

/// Reporting window
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeRange {
    Hour,
    #[default]
    Day,
    Week,
    Month,
    All,
}

impl TimeRange {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "hour" | "1h" => Some(TimeRange::Hour),
            "day" | "24h" | "1d" => Some(TimeRange::Day),
            "week" | "7d" => Some(TimeRange::Week),
            "month" | "30d" => Some(TimeRange::Month),
            "all" => Some(TimeRange::All),
            _ => None,
        }
    }

    /// Start of the window relative to `now`
    pub fn since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeRange::Hour => now - ChronoDuration::hours(1),
            TimeRange::Day => now - ChronoDuration::days(1),
            TimeRange::Week => now - ChronoDuration::days(7),
            TimeRange::Month => now - ChronoDuration::days(30),
            TimeRange::All => DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Optional equality filters applied to the window
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StatsFilters {
    pub intent: Option<String>,
    pub method: Option<String>,
    pub category: Option<String>,
}

impl StatsFilters {
    fn matches(&self, entry: &QueryLogEntry) -> bool {
        let intent_ok = self
            .intent
            .as_ref()
            .map_or(true, |i| entry.intent.as_deref() == Some(i.as_str()));
        let method_ok = self.method.as_ref().map_or(true, |m| &entry.method == m);
        let category_ok = self
            .category
            .as_ref()
            .map_or(true, |c| entry.category.as_deref() == Some(c.as_str()));
        intent_ok && method_ok && category_ok
    }
}

/// Everything recorded about one resolved query
#[derive(Debug, Clone)]
pub struct TrackRequest {
    pub session_id: Option<String>,
    pub query: String,
    pub intent: Option<String>,
    pub category: Option<String>,
    pub entities: Payload,
    /// Whatever the resolution produced; only its shape is inspected
    pub result: Payload,
    pub method: ResolutionMethod,
    pub pattern_id: Option<Uuid>,
    pub latency_ms: i64,
    pub success: bool,
    pub error: Option<String>,
}

struct CachedStats {
    generation: u64,
    computed_at: Instant,
    stats: QueryStats,
}

pub struct QueryAnalytics {
    store: Arc<dyn QueryLogStore>,
    config: AnalyticsConfig,
    cache: RwLock<HashMap<(TimeRange, StatsFilters), CachedStats>>,
    /// Bumped on every tracked query; cached stats from older generations are stale
    generation: AtomicU64,
}

impl QueryAnalytics {
    pub fn new(store: Arc<dyn QueryLogStore>, config: AnalyticsConfig) -> Self {
        Self {
            store,
            config,
            cache: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Append one log row. Returns the row id, or `None` when nothing was written.
    pub async fn track_query(&self, request: TrackRequest) -> Option<Uuid> {
        let entities = match safe_serialize(&request.entities, self.config.max_depth) {
            Ok(value) => value,
            Err(e) => {
                warn!(query = %request.query, error = %e, "Dropping analytics entry: entities not serializable");
                return None;
            }
        };
        let result = match safe_serialize(&request.result, self.config.max_depth) {
            Ok(value) => value,
            Err(e) => {
                warn!(query = %request.query, error = %e, "Dropping analytics entry: result not serializable");
                return None;
            }
        };

        let entry = QueryLogEntry {
            log_id: Uuid::new_v4(),
            session_id: request.session_id,
            query: request.query,
            intent: request.intent,
            category: request.category,
            entities,
            method: request.method.as_str().to_string(),
            pattern_id: request.pattern_id,
            latency_ms: request.latency_ms.max(0),
            success: request.success,
            result_count: infer_result_count(&result),
            error: request.error,
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.append_log(&entry).await {
            error!(query = %entry.query, error = %e, "Failed to write analytics entry");
            return None;
        }

        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache.write().await.clear();

        debug!(
            log_id = %entry.log_id,
            intent = ?entry.intent,
            method = %entry.method,
            latency_ms = entry.latency_ms,
            result_count = entry.result_count,
            "Query tracked"
        );
        Some(entry.log_id)
    }

    /// Aggregates over the window, served from cache while fresh
    pub async fn get_query_stats(&self, range: TimeRange, filters: StatsFilters) -> Result<QueryStats> {
        let key = (range, filters);
        let generation = self.generation.load(Ordering::SeqCst);

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&key) {
                if cached.generation == generation && cached.computed_at.elapsed() < self.config.cache_ttl {
                    return Ok(cached.stats.clone());
                }
            }
        }

        let now = Utc::now();
        let entries: Vec<QueryLogEntry> = self
            .store
            .logs_since(range.since(now))
            .await
            .map_err(|e| PipelineError::AnalyticsError(format!("failed to read query log: {}", e)))?
            .into_iter()
            .filter(|entry| key.1.matches(entry))
            .collect();

        let stats = compute_stats(&entries, &self.config, now);

        // A query tracked while computing makes this result stale already
        if self.generation.load(Ordering::SeqCst) == generation {
            self.cache.write().await.insert(
                key,
                CachedStats {
                    generation,
                    computed_at: Instant::now(),
                    stats: stats.clone(),
                },
            );
        }

        Ok(stats)
    }
}

/// Number of results in whatever shape the resolution produced
pub fn infer_result_count(result: &Value) -> i64 {
    match result {
        Value::Null => 0,
        Value::Array(items) => items.len() as i64,
        Value::String(text) => i64::from(!text.trim().is_empty()),
        Value::Object(map) => {
            if let Some(items) = RESULT_LIST_KEYS.iter().find_map(|k| map.get(*k).and_then(Value::as_array)) {
                return items.len() as i64;
            }
            RESULT_COUNT_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_i64))
                .map(|n| n.max(0))
                .unwrap_or(1)
        }
        Value::Bool(_) | Value::Number(_) => 1,
    }
}

/// Nearest-rank percentile over an ascending slice
fn percentile(sorted: &[i64], p: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((p * (sorted.len() - 1) as f64).round() as usize).min(sorted.len() - 1);
    sorted[idx]
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn compute_stats(entries: &[QueryLogEntry], config: &AnalyticsConfig, now: DateTime<Utc>) -> QueryStats {
    let total = entries.len();
    let successes = entries.iter().filter(|e| e.success).count();

    let mut latencies: Vec<i64> = entries.iter().map(|e| e.latency_ms).collect();
    latencies.sort_unstable();
    let avg_latency_ms = ratio(latencies.iter().sum::<i64>().max(0) as usize, total);

    let mut intent_distribution = BTreeMap::new();
    let mut method_distribution = BTreeMap::new();
    let mut errors: HashMap<&str, usize> = HashMap::new();
    for entry in entries {
        let intent = entry.intent.clone().unwrap_or_else(|| "unknown".to_string());
        *intent_distribution.entry(intent).or_insert(0) += 1;
        *method_distribution.entry(entry.method.clone()).or_insert(0) += 1;
        if let Some(error) = entry.error.as_deref() {
            *errors.entry(error).or_insert(0) += 1;
        }
    }

    let mut top_errors: Vec<ErrorCount> = errors
        .into_iter()
        .map(|(error, count)| ErrorCount { error: error.to_string(), count })
        .collect();
    top_errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error.cmp(&b.error)));
    top_errors.truncate(config.top_errors);

    let with_pattern = entries.iter().filter(|e| e.pattern_id.is_some()).count();

    QueryStats {
        total_queries: total,
        success_rate: ratio(successes, total),
        avg_latency_ms,
        median_latency_ms: percentile(&latencies, 0.50),
        p95_latency_ms: percentile(&latencies, 0.95),
        p99_latency_ms: percentile(&latencies, 0.99),
        intent_distribution,
        method_distribution,
        pattern_usage_rate: ratio(with_pattern, total),
        top_errors,
        daily_trend: (total >= config.trend_min_points).then(|| daily_trend(entries)),
        generated_at: now,
    }
}

fn daily_trend(entries: &[QueryLogEntry]) -> Vec<DailyPoint> {
    // (queries, successes, latency sum) per day
    let mut days: BTreeMap<chrono::NaiveDate, (usize, usize, i64)> = BTreeMap::new();
    for entry in entries {
        let bucket = days.entry(entry.created_at.date_naive()).or_insert((0, 0, 0));
        bucket.0 += 1;
        bucket.1 += usize::from(entry.success);
        bucket.2 += entry.latency_ms;
    }

    days.into_iter()
        .map(|(date, (queries, successes, latency))| DailyPoint {
            date: date.format("%Y-%m-%d").to_string(),
            queries,
            success_rate: ratio(successes, queries),
            avg_latency_ms: latency as f64 / queries as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    fn request(intent: &str, latency_ms: i64, success: bool) -> TrackRequest {
        TrackRequest {
            session_id: Some("s1".into()),
            query: format!("query for {}", intent),
            intent: Some(intent.into()),
            category: Some("TASK".into()),
            entities: Payload::from(json!({"merchant": "costco"})),
            result: Payload::from("Your payment is due on the 15th."),
            method: ResolutionMethod::LocalHandler,
            pattern_id: None,
            latency_ms,
            success,
            error: (!success).then(|| "handler failed".to_string()),
        }
    }

    fn analytics() -> QueryAnalytics {
        QueryAnalytics::new(Arc::new(InMemoryStore::new()), AnalyticsConfig::default())
    }

    #[tokio::test]
    async fn test_circular_entities_are_not_tracked() {
        let analytics = analytics();
        let node = Payload::shared(Payload::Map(Vec::new()));
        if let Payload::Shared(inner) = &node {
            *inner.lock().unwrap() = Payload::Map(vec![("parent".into(), node.clone())]);
        }

        let mut req = request("payment_reminder", 10, true);
        req.entities = node;
        assert!(analytics.track_query(req).await.is_none());

        let stats = analytics.get_query_stats(TimeRange::All, StatsFilters::default()).await.unwrap();
        assert_eq!(stats.total_queries, 0);
    }

    struct FailingLog;

    #[async_trait]
    impl QueryLogStore for FailingLog {
        async fn append_log(&self, _entry: &QueryLogEntry) -> Result<()> {
            Err(PipelineError::DatabaseError("connection refused".into()))
        }

        async fn logs_since(&self, _since: DateTime<Utc>) -> Result<Vec<QueryLogEntry>> {
            Err(PipelineError::DatabaseError("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed_on_track() {
        let analytics = QueryAnalytics::new(Arc::new(FailingLog), AnalyticsConfig::default());
        assert!(analytics.track_query(request("greeting", 5, true)).await.is_none());

        let err = analytics
            .get_query_stats(TimeRange::Day, StatsFilters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AnalyticsError(_)));
    }

    #[tokio::test]
    async fn test_stats_aggregates() {
        let analytics = analytics();
        for latency in [10, 20, 30, 40, 50, 60, 70, 80, 90, 100] {
            analytics.track_query(request("payment_reminder", latency, true)).await.unwrap();
        }
        let mut with_pattern = request("card_recommendation", 200, false);
        with_pattern.pattern_id = Some(Uuid::new_v4());
        with_pattern.method = ResolutionMethod::IntentHint;
        analytics.track_query(with_pattern).await.unwrap();

        let stats = analytics.get_query_stats(TimeRange::Day, StatsFilters::default()).await.unwrap();
        assert_eq!(stats.total_queries, 11);
        assert!((stats.success_rate - 10.0 / 11.0).abs() < 1e-9);
        assert_eq!(stats.median_latency_ms, 60);
        assert_eq!(stats.p99_latency_ms, 200);
        assert!((stats.avg_latency_ms - 750.0 / 11.0).abs() < 1e-9);
        assert_eq!(stats.intent_distribution["payment_reminder"], 10);
        assert_eq!(stats.method_distribution["intent_hint"], 1);
        assert!((stats.pattern_usage_rate - 1.0 / 11.0).abs() < 1e-9);
        assert_eq!(stats.top_errors, vec![ErrorCount { error: "handler failed".into(), count: 1 }]);

        let trend = stats.daily_trend.unwrap();
        assert_eq!(trend.iter().map(|p| p.queries).sum::<usize>(), 11);
    }

    #[tokio::test]
    async fn test_trend_requires_minimum_points() {
        let analytics = analytics();
        for _ in 0..6 {
            analytics.track_query(request("greeting", 5, true)).await.unwrap();
        }
        let stats = analytics.get_query_stats(TimeRange::Day, StatsFilters::default()).await.unwrap();
        assert!(stats.daily_trend.is_none());

        analytics.track_query(request("greeting", 5, true)).await.unwrap();
        let stats = analytics.get_query_stats(TimeRange::Day, StatsFilters::default()).await.unwrap();
        assert!(stats.daily_trend.is_some());
    }

    #[tokio::test]
    async fn test_filters_apply() {
        let analytics = analytics();
        analytics.track_query(request("greeting", 5, true)).await.unwrap();
        analytics.track_query(request("payment_reminder", 5, true)).await.unwrap();

        let filters = StatsFilters { intent: Some("greeting".into()), ..Default::default() };
        let stats = analytics.get_query_stats(TimeRange::Day, filters).await.unwrap();
        assert_eq!(stats.total_queries, 1);
    }

    /// Counts reads so cache hits are observable
    struct CountingLog {
        inner: InMemoryStore,
        reads: Mutex<usize>,
    }

    #[async_trait]
    impl QueryLogStore for CountingLog {
        async fn append_log(&self, entry: &QueryLogEntry) -> Result<()> {
            self.inner.append_log(entry).await
        }

        async fn logs_since(&self, since: DateTime<Utc>) -> Result<Vec<QueryLogEntry>> {
            *self.reads.lock().unwrap() += 1;
            self.inner.logs_since(since).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl_and_invalidation() {
        let store = Arc::new(CountingLog { inner: InMemoryStore::new(), reads: Mutex::new(0) });
        let analytics = QueryAnalytics::new(store.clone(), AnalyticsConfig::default());
        analytics.track_query(request("greeting", 5, true)).await.unwrap();

        let first = analytics.get_query_stats(TimeRange::Day, StatsFilters::default()).await.unwrap();
        let second = analytics.get_query_stats(TimeRange::Day, StatsFilters::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(*store.reads.lock().unwrap(), 1);

        // different key, separate entry
        analytics.get_query_stats(TimeRange::Week, StatsFilters::default()).await.unwrap();
        assert_eq!(*store.reads.lock().unwrap(), 2);

        // new query invalidates
        analytics.track_query(request("greeting", 5, true)).await.unwrap();
        let third = analytics.get_query_stats(TimeRange::Day, StatsFilters::default()).await.unwrap();
        assert_eq!(third.total_queries, 2);
        assert_eq!(*store.reads.lock().unwrap(), 3);

        // TTL expiry
        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        analytics.get_query_stats(TimeRange::Day, StatsFilters::default()).await.unwrap();
        assert_eq!(*store.reads.lock().unwrap(), 4);
    }

    #[test]
    fn test_result_count_shapes() {
        assert_eq!(infer_result_count(&json!(null)), 0);
        assert_eq!(infer_result_count(&json!([1, 2, 3])), 3);
        assert_eq!(infer_result_count(&json!({"transactions": [1, 2]})), 2);
        assert_eq!(infer_result_count(&json!({"count": 7})), 7);
        assert_eq!(infer_result_count(&json!({"response": "ok"})), 1);
        assert_eq!(infer_result_count(&json!("")), 0);
        assert_eq!(infer_result_count(&json!("text")), 1);
    }

    #[test]
    fn test_percentile_rounding() {
        let sorted = [10, 20, 30, 40];
        assert_eq!(percentile(&sorted, 0.5), 30);
        assert_eq!(percentile(&sorted, 0.99), 40);
        assert_eq!(percentile(&[], 0.5), 0);
    }
}
