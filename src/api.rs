//! REST API host for the query pipeline
//!
//! Owns the session registry: each request locks its session for the whole
//! cascade, so turns of one session apply in arrival order.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analytics::{QueryAnalytics, StatsFilters, TimeRange};
use crate::cascade::QueryPipeline;
use crate::context::SessionRegistry;
use crate::error::PipelineError;
use crate::learning::FeedbackLoop;
use crate::models::FeedbackKind;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    /// Passed through to local handlers untouched
    pub user_data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FeedbackRequest {
    pub query_log_id: String,
    pub pattern_id: Option<String>,
    /// `explicit` (default) or an implicit kind such as `abandonment`
    pub kind: Option<String>,
    /// Range-checked by the feedback loop
    pub rating: Option<i64>,
    pub helpful: Option<bool>,
    pub correction: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StatsParams {
    pub range: Option<String>,
    pub intent: Option<String>,
    pub method: Option<String>,
    pub category: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<QueryPipeline>,
    pub sessions: Arc<SessionRegistry>,
    pub feedback: Option<Arc<FeedbackLoop>>,
    pub analytics: Option<Arc<QueryAnalytics>>,
}

/// =============================
/// Helpers
/// =============================

fn stable_session_id(input: &str) -> String {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    format!("session-{}", hex::encode(&hash[..8]))
}

fn session_id_for(req: &QueryRequest) -> String {
    match (req.session_id.as_deref(), req.user_id.as_deref()) {
        (Some(id), _) if !id.trim().is_empty() => id.trim().to_string(),
        (_, Some(user)) if !user.trim().is_empty() => stable_session_id(user.trim()),
        _ => stable_session_id("anonymous-user"),
    }
}

fn parse_uuid(value: &str, field: &str) -> Result<Uuid, PipelineError> {
    Uuid::parse_str(value.trim())
        .map_err(|_| PipelineError::ValidationError(format!("{} is not a valid id", field)))
}

fn error_status(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::ValidationError(_) => StatusCode::BAD_REQUEST,
        e if e.is_external() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "sessions": state.sessions.len().await,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Query Endpoint
/// =============================

async fn run_query(
    State(state): State<ApiState>,
    Json(req): Json<QueryRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Query must not be empty".into())),
        );
    }

    let session_id = session_id_for(&req);
    let user_data = req.user_data.clone().unwrap_or_else(|| {
        serde_json::json!({ "user_id": req.user_id })
    });

    info!(session_id = %session_id, "Received query request");

    let mut session = state.sessions.lock(&session_id).await;
    let outcome = state
        .pipeline
        .process_query_detailed(&req.query, &user_data, &mut session)
        .await;
    drop(session);

    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "session_id": session_id,
            "response": outcome.response,
            "intent": outcome.intent,
            "method": outcome.method,
            "category": outcome.category,
            "similarity": outcome.similarity,
            "pattern_id": outcome.pattern_id,
            "query_log_id": outcome.query_log_id,
        }))),
    )
}

/// =============================
/// Feedback Endpoint
/// =============================

async fn submit_feedback(
    State(state): State<ApiState>,
    Json(req): Json<FeedbackRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(feedback) = state.feedback.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error("Feedback is not enabled".into())),
        );
    };

    let result = async {
        let query_log_id = parse_uuid(&req.query_log_id, "query_log_id")?;
        let pattern_id = req
            .pattern_id
            .as_deref()
            .map(|id| parse_uuid(id, "pattern_id"))
            .transpose()?;

        let kind = match req.kind.as_deref() {
            None => FeedbackKind::Explicit,
            Some(raw) => FeedbackKind::parse(raw.trim()).ok_or_else(|| {
                PipelineError::ValidationError(format!("Unknown feedback kind '{}'", raw))
            })?,
        };

        match kind {
            FeedbackKind::Explicit => {
                feedback
                    .record_explicit(query_log_id, pattern_id, req.rating, req.helpful, req.correction.clone())
                    .await
            }
            implicit => {
                feedback
                    .record_implicit(query_log_id, pattern_id, implicit, req.correction.clone())
                    .await
            }
        }
    }
    .await;

    match result {
        Ok(event) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "feedback_id": event.feedback_id,
                "status": event.status,
            }))),
        ),
        Err(e) => {
            warn!(error = %e, "Feedback rejected");
            (error_status(&e), Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// =============================
/// Stats Endpoint
/// =============================

async fn query_stats(
    State(state): State<ApiState>,
    Query(params): Query<StatsParams>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(analytics) = state.analytics.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error("Analytics is not enabled".into())),
        );
    };

    let range = match params.range.as_deref() {
        None => TimeRange::default(),
        Some(raw) => match TimeRange::parse(raw) {
            Some(range) => range,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ApiResponse::error(format!("Unknown range '{}'", raw))),
                )
            }
        },
    };
    let filters = StatsFilters {
        intent: params.intent,
        method: params.method,
        category: params.category,
    };

    match analytics.get_query_stats(range, filters).await {
        Ok(stats) => (StatusCode::OK, Json(ApiResponse::success(stats))),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/query", post(run_query))
        .route("/api/feedback", post(submit_feedback))
        .route("/api/stats", get(query_stats))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalyticsConfig, FeedbackConfig, PatternConfig, PipelineConfig};
    use crate::handlers::FnHandler;
    use crate::learning::PatternLearner;
    use crate::models::HandlerOutput;
    use crate::services::fakes::FixedSearch;
    use crate::state::InMemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> ApiState {
        let store = Arc::new(InMemoryStore::new());
        let learner = Arc::new(PatternLearner::new(store.clone(), None, PatternConfig::default()));
        let feedback = Arc::new(FeedbackLoop::new(
            store.clone(),
            learner.clone(),
            FeedbackConfig {
                auto_process: false,
                ..Default::default()
            },
        ));
        let analytics = Arc::new(QueryAnalytics::new(store, AnalyticsConfig::default()));

        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(Arc::new(FixedSearch::single("payment_reminder", 0.93)))
            .handler(Arc::new(FnHandler::new("payment_reminder", |_, _, _| {
                Ok(HandlerOutput::Text("Due on the 15th.".into()))
            })))
            .learner(learner)
            .feedback(feedback.clone())
            .analytics(analytics.clone())
            .build();

        ApiState {
            sessions: Arc::new(SessionRegistry::new(pipeline.extractor(), 5)),
            pipeline: Arc::new(pipeline),
            feedback: Some(feedback),
            analytics: Some(analytics),
        }
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_query_feedback_and_stats() {
        let state = state();
        let router = create_router(state.clone());

        let (status, body) = call(
            router.clone(),
            post_json("/api/query", serde_json::json!({"query": "when is my payment due", "session_id": "abc"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["response"], "Due on the 15th.");
        assert_eq!(body["data"]["session_id"], "abc");
        assert_eq!(state.sessions.len().await, 1);

        let log_id = body["data"]["query_log_id"].as_str().unwrap().to_string();
        let (status, body) = call(
            router.clone(),
            post_json("/api/feedback", serde_json::json!({"query_log_id": log_id, "rating": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "pending");

        let request = Request::builder().uri("/api/stats?range=day").body(Body::empty()).unwrap();
        let (status, body) = call(router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total_queries"], 1);
    }

    #[tokio::test]
    async fn test_invalid_feedback_is_bad_request() {
        let router = create_router(state());

        let (status, body) = call(
            router.clone(),
            post_json(
                "/api/feedback",
                serde_json::json!({"query_log_id": Uuid::new_v4().to_string(), "rating": 9}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = call(
            router.clone(),
            post_json(
                "/api/feedback",
                serde_json::json!({"query_log_id": Uuid::new_v4().to_string(), "rating": 300}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap_or_default().contains("300"));

        let (status, _) = call(
            router,
            post_json("/api/feedback", serde_json::json!({"query_log_id": "not-a-uuid", "rating": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let router = create_router(state());
        let (status, _) = call(router, post_json("/api/query", serde_json::json!({"query": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_session_id_derivation() {
        let req = QueryRequest {
            query: "hi".into(),
            session_id: None,
            user_id: Some("u1".into()),
            user_data: None,
        };
        assert_eq!(session_id_for(&req), session_id_for(&req.clone()));
        assert!(session_id_for(&req).starts_with("session-"));
    }
}
