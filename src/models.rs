//! Core data models shared across the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Structured slot bindings (entity key → value)
pub type EntityMap = serde_json::Map<String, serde_json::Value>;

/// Opaque per-user data handed through to local handlers
pub type UserData = serde_json::Value;

//
// ================= Enums =================
//

/// Coarse routing category produced by the category gate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryCategory {
    Task,
    Guidance,
    Chat,
}

/// Similarity band of the top intent match
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn from_similarity(similarity: f32, high: f32, medium: f32) -> Self {
        if similarity >= high {
            ConfidenceBand::High
        } else if similarity >= medium {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }

    /// Whether the local handler output is trusted for this band
    pub fn runs_handler(&self) -> bool {
        matches!(self, ConfidenceBand::High | ConfidenceBand::Medium)
    }
}

/// How a query was finally resolved (analytics `method` column)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    SlotFill,
    DirectRoute,
    LocalHandler,
    LocalHandlerVerbatim,
    IntentHint,
    LlmFallback,
    Error,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMethod::SlotFill => "slot_fill",
            ResolutionMethod::DirectRoute => "direct_route",
            ResolutionMethod::LocalHandler => "local_handler",
            ResolutionMethod::LocalHandlerVerbatim => "local_handler_verbatim",
            ResolutionMethod::IntentHint => "intent_hint",
            ResolutionMethod::LlmFallback => "llm_fallback",
            ResolutionMethod::Error => "error",
        }
    }

    /// Resolved by a local handler rather than free text generation
    pub fn used_handler(&self) -> bool {
        matches!(
            self,
            ResolutionMethod::SlotFill
                | ResolutionMethod::DirectRoute
                | ResolutionMethod::LocalHandler
                | ResolutionMethod::LocalHandlerVerbatim
        )
    }
}

impl fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for QueryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryCategory::Task => "TASK",
            QueryCategory::Guidance => "GUIDANCE",
            QueryCategory::Chat => "CHAT",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Rewrite =================
//

/// Classification shortcut emitted by a high-confidence rewrite rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectRoute {
    pub intent: String,
    pub action: String,
    pub entities: EntityMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewriteResult {
    pub rewritten_query: String,
    /// Always within [0, 1]
    pub confidence: f32,
    pub reason: String,
    /// Only present when `confidence >= DIRECT_ROUTE_THRESHOLD`
    pub direct_route: Option<DirectRoute>,
}

//
// ================= Search =================
//

/// Embedding search hit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentMatch {
    pub intent_id: String,
    pub similarity: f32,
    pub example_query: String,
}

//
// ================= Completion =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// `None` uses the client's configured model
    pub model: Option<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1024,
            model: None,
        }
    }
}

//
// ================= Handler I/O =================
//

/// Local handler result: plain text or an object carrying a `response` field
/// plus the records it was built from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandlerOutput {
    Text(String),
    Structured {
        response: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
}

impl HandlerOutput {
    /// What analytics records as the result of the query
    pub fn result_payload(&self) -> serde_json::Value {
        match self {
            HandlerOutput::Text(text) => serde_json::Value::String(text.clone()),
            HandlerOutput::Structured { data: Some(data), .. } => data.clone(),
            HandlerOutput::Structured { response, data: None } => {
                serde_json::Value::String(response.clone())
            }
        }
    }

    pub fn into_text(self) -> String {
        match self {
            HandlerOutput::Text(text) => text,
            HandlerOutput::Structured { response, .. } => response,
        }
    }
}

//
// ================= Learning =================
//

/// Learned query shape with running statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPattern {
    pub pattern_id: Uuid,
    /// Normalized query text
    pub query_text: String,
    pub query_hash: String,
    pub decomposed_query: serde_json::Value,
    pub entities: EntityMap,
    pub intent: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub success_rate: f64,
    pub usage_count: i64,
    pub confidence: f64,
    pub variations: Vec<String>,
    pub corrections: Vec<String>,
    pub version: i32,
    pub is_active: bool,
    /// Survivor id once soft-deactivated by a merge
    pub merged_into: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Kind of usage signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Explicit,
    Abandonment,
    Correction,
    Reformulation,
    Navigation,
    Timeout,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::Explicit => "explicit",
            FeedbackKind::Abandonment => "abandonment",
            FeedbackKind::Correction => "correction",
            FeedbackKind::Reformulation => "reformulation",
            FeedbackKind::Navigation => "navigation",
            FeedbackKind::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "explicit" => Some(FeedbackKind::Explicit),
            "abandonment" => Some(FeedbackKind::Abandonment),
            "correction" => Some(FeedbackKind::Correction),
            "reformulation" => Some(FeedbackKind::Reformulation),
            "navigation" => Some(FeedbackKind::Navigation),
            "timeout" => Some(FeedbackKind::Timeout),
            _ => None,
        }
    }

    /// Fixed (rating, helpful) pair of an implicit signal; `None` carries no signal
    pub fn implicit_signal(&self) -> Option<(u8, bool)> {
        match self {
            FeedbackKind::Abandonment => Some((1, false)),
            FeedbackKind::Correction => Some((2, false)),
            FeedbackKind::Reformulation => Some((3, false)),
            FeedbackKind::Navigation => Some((4, true)),
            FeedbackKind::Timeout | FeedbackKind::Explicit => None,
        }
    }
}

/// Durable processing state of a feedback row
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl FeedbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackStatus::Pending => "pending",
            FeedbackStatus::Processing => "processing",
            FeedbackStatus::Processed => "processed",
            FeedbackStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(FeedbackStatus::Pending),
            "processing" => Some(FeedbackStatus::Processing),
            "processed" => Some(FeedbackStatus::Processed),
            "failed" => Some(FeedbackStatus::Failed),
            _ => None,
        }
    }
}

/// One usage signal (append-only apart from its status)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub feedback_id: Uuid,
    pub query_log_id: Uuid,
    pub pattern_id: Option<Uuid>,
    pub kind: FeedbackKind,
    /// 1..=5
    pub rating: Option<u8>,
    pub helpful: Option<bool>,
    pub correction_text: Option<String>,
    pub status: FeedbackStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

//
// ================= Analytics =================
//

/// Append-only audit record of one resolved query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub log_id: Uuid,
    pub session_id: Option<String>,
    pub query: String,
    pub intent: Option<String>,
    pub category: Option<String>,
    /// Cycle-safe serialized entities
    pub entities: serde_json::Value,
    pub method: String,
    pub pattern_id: Option<Uuid>,
    pub latency_ms: i64,
    pub success: bool,
    pub result_count: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorCount {
    pub error: String,
    pub count: usize,
}

/// One day bucket of the trend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyPoint {
    /// `YYYY-MM-DD` (UTC)
    pub date: String,
    pub queries: usize,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

/// Windowed aggregate over the query log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryStats {
    pub total_queries: usize,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub median_latency_ms: i64,
    pub p95_latency_ms: i64,
    pub p99_latency_ms: i64,
    pub intent_distribution: std::collections::BTreeMap<String, usize>,
    pub method_distribution: std::collections::BTreeMap<String, usize>,
    /// Share of queries that matched a learned pattern
    pub pattern_usage_rate: f64,
    pub top_errors: Vec<ErrorCount>,
    /// Absent until enough data points exist
    pub daily_trend: Option<Vec<DailyPoint>>,
    pub generated_at: DateTime<Utc>,
}

//
// ================= Final Result =================
//

/// Detailed outcome of one `process_query` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub response: String,
    pub intent: Option<String>,
    pub method: ResolutionMethod,
    pub category: Option<QueryCategory>,
    pub similarity: Option<f32>,
    pub pattern_id: Option<Uuid>,
    /// Id of the analytics row, if it was written
    pub query_log_id: Option<Uuid>,
}

/// Clamp a score into [0, 1]; NaN collapses to 0
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
