//! Classification cascade
//!
//! SLOT_FILL → REWRITE → DIRECT_ROUTE? → EXTRACT → CATEGORY_GATE →
//! EMBEDDING_SEARCH → CONFIDENCE_BAND → HANDLER / FALLBACK → CONTEXT_UPDATE
//!
//! `process_query` never fails. Any error inside the cascade becomes one fixed
//! apology, and the turn is then not recorded in the conversation.

pub mod prompts;
pub mod signals;

use crate::analytics::{Payload, QueryAnalytics, TrackRequest};
use crate::catalog::IntentCatalog;
use crate::classifier::CategoryGate;
use crate::config::PipelineConfig;
use crate::context::{LastResolution, Session};
use crate::error::PipelineError;
use crate::extractor::EntityExtractor;
use crate::handlers::{HandlerRegistry, LocalHandler};
use crate::learning::{FeedbackLoop, LearnRequest, PatternLearner};
use crate::models::{
    CompletionOptions, ConfidenceBand, EntityMap, FeedbackKind, IntentMatch, QueryCategory, QueryOutcome,
    ResolutionMethod, UserData,
};
use crate::rewriter::{should_direct_route, QueryRewriter};
use crate::services::{CompletionService, EmbeddingService};
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use prompts::{fallback_messages, wording_messages};
use signals::detect_implicit_feedback;

/// Returned when the cascade itself fails
pub const APOLOGY: &str = "Sorry, I couldn't understand that. Could you please rephrase your question?";

/// Returned when free-text generation is unavailable
pub const UNAVAILABLE_REPLY: &str =
    "Sorry, I'm having trouble answering that right now. Please try again in a moment.";

const FOLLOW_UP_FALLBACK: &str = "Could you give me a bit more detail?";

/// How one query was answered, before it is recorded
struct Resolution {
    response: String,
    intent: Option<String>,
    method: ResolutionMethod,
    category: Option<QueryCategory>,
    similarity: Option<f32>,
    entities: EntityMap,
    /// Handler payload, when a handler produced the answer
    result: Option<Value>,
    pattern_id: Option<Uuid>,
    embedding: Option<Vec<f32>>,
    success: bool,
    /// Degradation worth reporting even though the user got an answer
    error: Option<String>,
    /// Present when the query should be learned as a pattern
    decomposition: Option<Value>,
}

impl Resolution {
    fn new(response: String, method: ResolutionMethod) -> Self {
        Self {
            response,
            intent: None,
            method,
            category: None,
            similarity: None,
            entities: EntityMap::new(),
            result: None,
            pattern_id: None,
            embedding: None,
            success: true,
            error: None,
            decomposition: None,
        }
    }
}

#[derive(Default)]
struct SearchOutcome {
    embedding: Option<Vec<f32>>,
    matches: Vec<IntentMatch>,
    error: Option<String>,
}

/// Final wording of handler output
struct Presented {
    text: String,
    method: ResolutionMethod,
    error: Option<String>,
}

// =============================
// Builder
// =============================

pub struct QueryPipelineBuilder {
    config: PipelineConfig,
    catalog: IntentCatalog,
    extractor: Option<Arc<EntityExtractor>>,
    embeddings: Option<Arc<dyn EmbeddingService>>,
    completion: Option<Arc<dyn CompletionService>>,
    handlers: HandlerRegistry,
    learner: Option<Arc<PatternLearner>>,
    feedback: Option<Arc<FeedbackLoop>>,
    analytics: Option<Arc<QueryAnalytics>>,
}

impl QueryPipelineBuilder {
    pub fn catalog(mut self, catalog: IntentCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn extractor(mut self, extractor: Arc<EntityExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn embeddings(mut self, embeddings: Arc<dyn EmbeddingService>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    pub fn completion(mut self, completion: Arc<dyn CompletionService>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn LocalHandler>) -> Self {
        self.handlers.register(handler);
        self
    }

    /// Handler serving one direct-route action of its intent
    pub fn action_handler(mut self, action: &str, handler: Arc<dyn LocalHandler>) -> Self {
        self.handlers.register_action(action, handler);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn learner(mut self, learner: Arc<PatternLearner>) -> Self {
        self.learner = Some(learner);
        self
    }

    pub fn feedback(mut self, feedback: Arc<FeedbackLoop>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn analytics(mut self, analytics: Arc<QueryAnalytics>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn build(self) -> QueryPipeline {
        QueryPipeline {
            gate: CategoryGate::new(self.completion.clone()),
            extractor: self.extractor.unwrap_or_else(|| Arc::new(EntityExtractor::new())),
            rewriter: QueryRewriter::new(),
            config: self.config,
            catalog: self.catalog,
            embeddings: self.embeddings,
            completion: self.completion,
            handlers: self.handlers,
            learner: self.learner,
            feedback: self.feedback,
            analytics: self.analytics,
        }
    }
}

// =============================
// Pipeline
// =============================

/// Query-understanding pipeline; one instance serves every session
pub struct QueryPipeline {
    config: PipelineConfig,
    catalog: IntentCatalog,
    extractor: Arc<EntityExtractor>,
    rewriter: QueryRewriter,
    gate: CategoryGate,
    embeddings: Option<Arc<dyn EmbeddingService>>,
    completion: Option<Arc<dyn CompletionService>>,
    handlers: HandlerRegistry,
    learner: Option<Arc<PatternLearner>>,
    feedback: Option<Arc<FeedbackLoop>>,
    analytics: Option<Arc<QueryAnalytics>>,
}

impl QueryPipeline {
    pub fn builder(config: PipelineConfig) -> QueryPipelineBuilder {
        QueryPipelineBuilder {
            config,
            catalog: IntentCatalog::new(),
            extractor: None,
            embeddings: None,
            completion: None,
            handlers: HandlerRegistry::new(),
            learner: None,
            feedback: None,
            analytics: None,
        }
    }

    /// Shared with the session registry so slot answers parse the same way
    pub fn extractor(&self) -> Arc<EntityExtractor> {
        self.extractor.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Answer one query; never fails
    pub async fn process_query(&self, query: &str, user_data: &UserData, session: &mut Session) -> String {
        self.process_query_detailed(query, user_data, session).await.response
    }

    /// Answer one query and report how it was resolved
    pub async fn process_query_detailed(
        &self,
        query: &str,
        user_data: &UserData,
        session: &mut Session,
    ) -> QueryOutcome {
        let started = Instant::now();
        session.touch();
        let session_id = session.session_id().to_string();

        info!(session_id = %session_id, query = %query, "Processing query");

        match self.resolve(query, user_data, session).await {
            Ok(resolution) => {
                // === CONTEXT_UPDATE ===
                session.context.add_turn(
                    query,
                    resolution.intent.as_deref(),
                    &resolution.entities,
                    &resolution.response,
                );

                let latency_ms = started.elapsed().as_millis() as i64;
                let query_log_id = self.track(&session_id, query, &resolution, latency_ms).await;

                self.record_implicit_feedback(session, query, resolution.intent.as_deref())
                    .await;
                session.last_resolution = query_log_id.map(|query_log_id| LastResolution {
                    query: query.to_string(),
                    query_log_id,
                    pattern_id: resolution.pattern_id,
                });

                self.learn_in_background(query, &resolution);

                info!(
                    session_id = %session_id,
                    intent = ?resolution.intent,
                    method = %resolution.method,
                    similarity = ?resolution.similarity,
                    latency_ms = latency_ms,
                    "Query resolved"
                );

                QueryOutcome {
                    response: resolution.response,
                    intent: resolution.intent,
                    method: resolution.method,
                    category: resolution.category,
                    similarity: resolution.similarity,
                    pattern_id: resolution.pattern_id,
                    query_log_id,
                }
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Cascade failed, returning apology");

                let mut failed = Resolution::new(APOLOGY.to_string(), ResolutionMethod::Error);
                failed.success = false;
                failed.error = Some(e.to_string());
                let latency_ms = started.elapsed().as_millis() as i64;
                let query_log_id = self.track(&session_id, query, &failed, latency_ms).await;

                QueryOutcome {
                    response: APOLOGY.to_string(),
                    intent: None,
                    method: ResolutionMethod::Error,
                    category: None,
                    similarity: None,
                    pattern_id: None,
                    query_log_id,
                }
            }
        }
    }

    async fn resolve(&self, query: &str, user_data: &UserData, session: &mut Session) -> Result<Resolution> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PipelineError::ValidationError("Query is empty".to_string()));
        }
        let thresholds = &self.config.thresholds;

        // === SLOT_FILL ===
        if let Some(resolution) = self.continue_slot_filling(query, user_data, session).await? {
            return Ok(resolution);
        }

        // === REWRITE ===
        let active = session.context.active_context();
        let rewrite = self.rewriter.rewrite(query, &active);
        if rewrite.confidence > 0.0 {
            debug!(
                rewritten = %rewrite.rewritten_query,
                confidence = rewrite.confidence,
                reason = %rewrite.reason,
                "Query rewritten with context"
            );
        }

        // === DIRECT_ROUTE ===
        if should_direct_route(&rewrite) {
            if let Some(route) = &rewrite.direct_route {
                if let Some(handler) = self.handlers.get_for_route(&route.intent, &route.action) {
                    let mut entities = active.entities.clone();
                    entities.extend(route.entities.clone());

                    // Intent-level handlers read the requested action from here
                    let mut handler_entities = entities.clone();
                    handler_entities.insert("action".to_string(), Value::String(route.action.clone()));

                    let output = handler.handle(&handler_entities, user_data, query).await?;
                    let result = output.result_payload();
                    session.context.consume_action(&route.action);

                    info!(intent = %route.intent, action = %route.action, "Direct route taken");

                    let mut resolution = Resolution::new(output.into_text(), ResolutionMethod::DirectRoute);
                    resolution.result = Some(result);
                    resolution.intent = Some(route.intent.clone());
                    resolution.category = self.catalog.category_of(&route.intent);
                    resolution.entities = entities;
                    return Ok(resolution);
                }
                warn!(
                    intent = %route.intent,
                    action = %route.action,
                    "No handler for direct route, continuing cascade"
                );
            }
        }

        // === EXTRACT ===
        let mut entities = self.extractor.extract(&rewrite.rewritten_query).to_entity_map();
        if rewrite.confidence > 0.0 {
            for (key, value) in &active.entities {
                entities.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        // === CATEGORY_GATE ===
        let gate = self.gate.classify(&rewrite.rewritten_query).await;
        let allowed = self.catalog.allowed_intents(gate.category);
        debug!(category = %gate.category, source = ?gate.source, "Category gate decided");

        // === EMBEDDING_SEARCH ===
        // The raw query is embedded; the rewrite only feeds extraction and the gate
        let search = self.search(query, allowed).await;
        let pattern_id = self.lookup_pattern(query, &entities, search.embedding.as_deref()).await;

        let Some(top) = search.matches.first().cloned() else {
            debug!("No exemplar match, using free-text fallback");
            let mut resolution = self.fallback(query, None).await;
            resolution.category = Some(gate.category);
            resolution.entities = entities;
            resolution.pattern_id = pattern_id;
            resolution.error = resolution.error.or(search.error);
            return Ok(resolution);
        };

        // === CONFIDENCE_BAND ===
        let band = ConfidenceBand::from_similarity(top.similarity, thresholds.high, thresholds.medium);
        debug!(intent = %top.intent_id, similarity = top.similarity, band = ?band, "Top exemplar match");

        if band.runs_handler() {
            if let Some(handler) = self.handlers.get(&top.intent_id) {
                let required = handler.required_slots();
                if required.iter().any(|slot| !entities.contains_key(slot)) {
                    let question =
                        session
                            .slots
                            .ask_question("missing_slot", &top.intent_id, &required, entities.clone());
                    debug!(intent = %top.intent_id, "Asking for missing slots");

                    let mut resolution = Resolution::new(question, ResolutionMethod::SlotFill);
                    resolution.intent = Some(top.intent_id.clone());
                    resolution.category = Some(gate.category);
                    resolution.similarity = Some(top.similarity);
                    resolution.entities = entities;
                    resolution.pattern_id = pattern_id;
                    return Ok(resolution);
                }

                let output = handler.handle(&entities, user_data, query).await?;
                let result = output.result_payload();
                let presented = self.present(query, &top.intent_id, output.into_text()).await;

                let decomposition = json!({
                    "intent": top.intent_id,
                    "category": gate.category,
                    "rewritten_query": rewrite.rewritten_query,
                    "entities": entities,
                });

                let mut resolution = Resolution::new(presented.text, presented.method);
                resolution.intent = Some(top.intent_id.clone());
                resolution.category = Some(gate.category);
                resolution.similarity = Some(top.similarity);
                resolution.entities = entities;
                resolution.result = Some(result);
                resolution.pattern_id = pattern_id;
                resolution.embedding = search.embedding;
                resolution.error = presented.error;
                resolution.decomposition = Some(decomposition);
                return Ok(resolution);
            }
            warn!(intent = %top.intent_id, "No local handler registered, using intent hint");
        }

        // === FALLBACK ===
        let mut resolution = self.fallback(query, Some(&top.intent_id)).await;
        resolution.intent = Some(top.intent_id.clone());
        resolution.category = Some(gate.category);
        resolution.similarity = Some(top.similarity);
        resolution.entities = entities;
        resolution.pattern_id = pattern_id;
        Ok(resolution)
    }

    /// Interpret the query as the answer to a pending question.
    /// `None` means the cascade continues; an unconvincing answer clears the question.
    async fn continue_slot_filling(
        &self,
        query: &str,
        user_data: &UserData,
        session: &mut Session,
    ) -> Result<Option<Resolution>> {
        if !session.slots.has_pending_question() {
            return Ok(None);
        }

        let answer = match session.slots.extract_answer(query) {
            Some(answer) if answer.confidence >= self.config.thresholds.slot_answer => answer,
            other => {
                debug!(
                    confidence = ?other.map(|a| a.confidence),
                    "Query is not a slot answer, leaving slot filling"
                );
                session.slots.clear();
                return Ok(None);
            }
        };

        debug!(slot = %answer.slot_name, "Slot filled");
        session.slots.fill_slot(answer)?;

        if !session.slots.all_slots_filled() {
            let question = session
                .slots
                .current_question()
                .unwrap_or_else(|| FOLLOW_UP_FALLBACK.to_string());
            return Ok(Some(Resolution::new(question, ResolutionMethod::SlotFill)));
        }

        let ready = session.slots.ready_intent().ok_or_else(|| {
            PipelineError::SlotFillingError("Slots are filled but no intent is ready".to_string())
        })?;
        session.slots.clear();

        let handler = self
            .handlers
            .get(&ready.intent)
            .ok_or_else(|| PipelineError::HandlerNotFound(ready.intent.clone()))?;
        let output = handler.handle(&ready.entities, user_data, query).await?;
        let result = output.result_payload();
        let presented = self.present(query, &ready.intent, output.into_text()).await;

        info!(intent = %ready.intent, "Slot filling complete, intent executed");

        let mut resolution = Resolution::new(presented.text, ResolutionMethod::SlotFill);
        resolution.category = self.catalog.category_of(&ready.intent);
        resolution.intent = Some(ready.intent);
        resolution.entities = ready.entities;
        resolution.result = Some(result);
        resolution.error = presented.error;
        Ok(Some(resolution))
    }

    // =============================
    // Collaborator calls
    // =============================

    async fn search(&self, query: &str, allowed: &[String]) -> SearchOutcome {
        let Some(service) = &self.embeddings else {
            return SearchOutcome::default();
        };
        let thresholds = &self.config.thresholds;

        let vector = match service.embed(query).await {
            Ok(Some(vector)) => vector,
            Ok(None) => return SearchOutcome::default(),
            Err(e) => {
                warn!(error = %e, "Query embedding failed, using free-text fallback");
                return SearchOutcome {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        match service
            .search(&vector, thresholds.search_floor, thresholds.search_top_k, allowed)
            .await
        {
            Ok(matches) => SearchOutcome {
                embedding: Some(vector),
                matches,
                error: None,
            },
            Err(e) => {
                warn!(error = %e, "Exemplar search failed, using free-text fallback");
                SearchOutcome {
                    embedding: Some(vector),
                    matches: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn lookup_pattern(&self, query: &str, entities: &EntityMap, embedding: Option<&[f32]>) -> Option<Uuid> {
        let learner = self.learner.as_ref()?;
        match learner.find_matching_pattern(query, entities, embedding).await {
            Ok(Some(found)) => {
                debug!(
                    pattern_id = %found.pattern.pattern_id,
                    similarity = found.similarity,
                    "Matched learned pattern"
                );
                Some(found.pattern.pattern_id)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Pattern lookup failed");
                None
            }
        }
    }

    /// Critical intents verbatim, everything else reworded
    async fn present(&self, query: &str, intent: &str, handler_text: String) -> Presented {
        if self.catalog.is_critical(intent) {
            return Presented {
                text: handler_text,
                method: ResolutionMethod::LocalHandlerVerbatim,
                error: None,
            };
        }

        let Some(completion) = &self.completion else {
            return Presented {
                text: handler_text,
                method: ResolutionMethod::LocalHandler,
                error: None,
            };
        };

        let options = CompletionOptions {
            temperature: self.config.completion.wording_temperature,
            max_tokens: self.config.completion.max_tokens,
            model: None,
        };
        match completion
            .complete(&wording_messages(query, intent, &handler_text), &options)
            .await
        {
            Ok(reply) if !reply.trim().is_empty() => Presented {
                text: reply.trim().to_string(),
                method: ResolutionMethod::LocalHandler,
                error: None,
            },
            Ok(_) => Presented {
                text: handler_text,
                method: ResolutionMethod::LocalHandler,
                error: None,
            },
            Err(e) => {
                warn!(intent = intent, error = %e, "Wording failed, returning handler output");
                Presented {
                    text: handler_text,
                    method: ResolutionMethod::LocalHandler,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Free-text answer; with a hint for a low-confidence match
    async fn fallback(&self, query: &str, intent_hint: Option<&str>) -> Resolution {
        let method = if intent_hint.is_some() {
            ResolutionMethod::IntentHint
        } else {
            ResolutionMethod::LlmFallback
        };

        let Some(completion) = &self.completion else {
            let mut resolution = Resolution::new(UNAVAILABLE_REPLY.to_string(), method);
            resolution.success = false;
            return resolution;
        };

        let options = CompletionOptions {
            temperature: self.config.completion.fallback_temperature,
            max_tokens: self.config.completion.max_tokens,
            model: None,
        };
        match completion.complete(&fallback_messages(query, intent_hint), &options).await {
            Ok(reply) if !reply.trim().is_empty() => Resolution::new(reply.trim().to_string(), method),
            Ok(_) => {
                let mut resolution = Resolution::new(UNAVAILABLE_REPLY.to_string(), method);
                resolution.success = false;
                resolution.error = Some("empty completion".to_string());
                resolution
            }
            Err(e) => {
                warn!(error = %e, "Fallback completion failed");
                let mut resolution = Resolution::new(UNAVAILABLE_REPLY.to_string(), method);
                resolution.success = false;
                resolution.error = Some(e.to_string());
                resolution
            }
        }
    }

    // =============================
    // Observability & learning
    // =============================

    async fn track(&self, session_id: &str, query: &str, resolution: &Resolution, latency_ms: i64) -> Option<Uuid> {
        let analytics = self.analytics.as_ref()?;
        analytics
            .track_query(TrackRequest {
                session_id: Some(session_id.to_string()),
                query: query.to_string(),
                intent: resolution.intent.clone(),
                category: resolution.category.map(|c| c.to_string()),
                entities: Payload::from(Value::Object(resolution.entities.clone())),
                result: match &resolution.result {
                    Some(result) => Payload::from(result.clone()),
                    None => Payload::Text(resolution.response.clone()),
                },
                method: resolution.method,
                pattern_id: resolution.pattern_id,
                latency_ms,
                success: resolution.success,
                error: resolution.error.clone(),
            })
            .await
    }

    /// What this query says about the previous answer
    async fn record_implicit_feedback(&self, session: &Session, query: &str, intent: Option<&str>) {
        let (Some(feedback), Some(last)) = (&self.feedback, &session.last_resolution) else {
            return;
        };
        let Some(kind) = detect_implicit_feedback(query, &last.query, intent) else {
            return;
        };

        let correction = (kind == FeedbackKind::Correction).then(|| query.to_string());
        if let Err(e) = feedback
            .record_implicit(last.query_log_id, last.pattern_id, kind, correction)
            .await
        {
            warn!(kind = kind.as_str(), error = %e, "Failed to record implicit feedback");
        }
    }

    /// Handler-backed answers are learned off the request path
    fn learn_in_background(&self, query: &str, resolution: &Resolution) {
        let (Some(learner), Some(decomposition)) = (&self.learner, &resolution.decomposition) else {
            return;
        };
        if !resolution.success {
            return;
        }

        let learner = learner.clone();
        let request = LearnRequest {
            query: query.to_string(),
            decomposed_query: decomposition.clone(),
            entities: resolution.entities.clone(),
            intent: resolution.intent.clone(),
            embedding: resolution.embedding.clone(),
        };

        tokio::spawn(async move {
            match learner.learn_pattern(request).await {
                Ok(outcome) => debug!(
                    pattern_id = %outcome.pattern.pattern_id,
                    created = outcome.created,
                    "Pattern learned"
                ),
                Err(e) => warn!(error = %e, "Background pattern learning failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{StatsFilters, TimeRange};
    use crate::config::{AnalyticsConfig, FeedbackConfig, PatternConfig};
    use crate::context::ConversationContext;
    use crate::handlers::FnHandler;
    use crate::models::{FeedbackStatus, HandlerOutput};
    use crate::services::fakes::{FixedSearch, RecordingCompletion};
    use crate::slots::SlotFillingManager;
    use crate::state::{FeedbackStore, InMemoryStore, PatternStore, QueryLogStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session() -> Session {
        Session::new(
            ConversationContext::new("s1", 5),
            Box::new(SlotFillingManager::new(Arc::new(EntityExtractor::new()))),
        )
    }

    fn text_handler(intent: &str, reply: &'static str) -> Arc<dyn LocalHandler> {
        Arc::new(FnHandler::new(intent, move |_, _, _| Ok(HandlerOutput::Text(reply.to_string()))))
    }

    fn counting_handler(intent: &str, reply: &'static str, calls: Arc<AtomicUsize>) -> Arc<dyn LocalHandler> {
        Arc::new(FnHandler::new(intent, move |_, _, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutput::Text(reply.to_string()))
        }))
    }

    fn user() -> UserData {
        json!({"user_id": "u1"})
    }

    #[tokio::test]
    async fn test_high_confidence_critical_intent_is_verbatim() {
        let completion = Arc::new(RecordingCompletion::replying("reworded"));
        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(Arc::new(FixedSearch::single("payment_reminder", 0.91)))
            .completion(completion.clone())
            .handler(text_handler("payment_reminder", "Your Chase payment of $120 is due on March 15."))
            .build();

        let mut session = session();
        let outcome = pipeline
            .process_query_detailed("when is my payment due", &user(), &mut session)
            .await;

        assert_eq!(outcome.response, "Your Chase payment of $120 is due on March 15.");
        assert_eq!(outcome.method, ResolutionMethod::LocalHandlerVerbatim);
        assert_eq!(outcome.intent.as_deref(), Some("payment_reminder"));
        assert_eq!(outcome.category, Some(QueryCategory::Task));
        assert_eq!(completion.call_count(), 0);
        assert_eq!(session.context.len(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_skips_handler_and_sends_intent_hint() {
        let completion = Arc::new(RecordingCompletion::replying("A warehouse rewards card usually works best."));
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(Arc::new(FixedSearch::single("card_recommendation", 0.65)))
            .completion(completion.clone())
            .handler(counting_handler("card_recommendation", "Use your Amex Gold.", calls.clone()))
            .build();

        let mut session = session();
        let outcome = pipeline
            .process_query_detailed("which card should i use at costco", &user(), &mut session)
            .await;

        assert_eq!(outcome.method, ResolutionMethod::IntentHint);
        assert_eq!(outcome.response, "A warehouse rewards card usually works best.");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(completion.call_count(), 1);

        let prompt = completion.last_user_message();
        assert!(prompt.contains("card_recommendation"));
        assert!(!prompt.contains("Amex Gold"));
        let options = completion.last_options.lock().unwrap().clone().unwrap();
        assert!((options.temperature - 0.7).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_medium_confidence_rewords_handler_output() {
        let completion = Arc::new(RecordingCompletion::replying("Here you go: use your Amex Gold."));
        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(Arc::new(FixedSearch::single("card_recommendation", 0.75)))
            .completion(completion.clone())
            .handler(text_handler("card_recommendation", "Use your Amex Gold."))
            .build();

        let mut session = session();
        let outcome = pipeline
            .process_query_detailed("which card should i use at costco", &user(), &mut session)
            .await;

        assert_eq!(outcome.method, ResolutionMethod::LocalHandler);
        assert_eq!(outcome.response, "Here you go: use your Amex Gold.");
        assert!(completion.last_user_message().contains("Use your Amex Gold."));
        let options = completion.last_options.lock().unwrap().clone().unwrap();
        assert!((options.temperature - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_wording_failure_returns_handler_text() {
        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(Arc::new(FixedSearch::single("card_recommendation", 0.9)))
            .completion(Arc::new(RecordingCompletion::failing()))
            .handler(text_handler("card_recommendation", "Use your Amex Gold."))
            .build();

        let mut session = session();
        let reply = pipeline
            .process_query("which card should i use at costco", &user(), &mut session)
            .await;
        assert_eq!(reply, "Use your Amex Gold.");
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_completion() {
        let completion = Arc::new(RecordingCompletion::replying("Generic answer"));
        let search = Arc::new(FixedSearch::failing());
        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(search.clone())
            .completion(completion.clone())
            .build();

        let mut session = session();
        let outcome = pipeline
            .process_query_detailed("which card should i use at costco", &user(), &mut session)
            .await;

        assert_eq!(outcome.method, ResolutionMethod::LlmFallback);
        assert_eq!(outcome.response, "Generic answer");
        assert_eq!(search.searches.load(Ordering::SeqCst), 0);
        assert_eq!(completion.last_user_message(), "which card should i use at costco");
    }

    #[tokio::test]
    async fn test_completion_failure_on_fallback_is_apology() {
        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(Arc::new(FixedSearch::returning(Vec::new())))
            .completion(Arc::new(RecordingCompletion::failing()))
            .build();

        let mut session = session();
        let reply = pipeline.process_query("which card should i use at costco", &user(), &mut session).await;
        assert_eq!(reply, UNAVAILABLE_REPLY);
    }

    #[tokio::test]
    async fn test_direct_route_skips_classification() {
        let search = Arc::new(FixedSearch::single("card_recommendation", 0.91));
        let compare: Arc<dyn LocalHandler> = Arc::new(FnHandler::new("card_recommendation", |entities, _, _| {
            let merchant = entities.get("merchant").and_then(Value::as_str).unwrap_or("?");
            Ok(HandlerOutput::Structured {
                response: format!("Strategy comparison for {}", merchant),
                data: None,
            })
        }));

        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(search.clone())
            .handler(text_handler(
                "card_recommendation",
                "Use your Amex Gold at Costco. Want me to compare all strategies?",
            ))
            .action_handler("compare_strategies", compare)
            .build();

        let mut session = session();
        pipeline
            .process_query("which card should i use at costco", &user(), &mut session)
            .await;
        assert_eq!(search.searches.load(Ordering::SeqCst), 1);

        let outcome = pipeline
            .process_query_detailed("compare all strategies", &user(), &mut session)
            .await;

        assert_eq!(outcome.method, ResolutionMethod::DirectRoute);
        assert_eq!(outcome.response, "Strategy comparison for costco");
        assert_eq!(search.searches.load(Ordering::SeqCst), 1);
        assert!(!session.context.pending_actions().iter().any(|a| a == "compare_strategies"));
        assert_eq!(session.context.len(), 2);
    }

    #[tokio::test]
    async fn test_direct_route_tells_intent_handler_the_action() {
        let general: Arc<dyn LocalHandler> = Arc::new(FnHandler::new("card_recommendation", |entities, _, _| {
            let merchant = entities.get("merchant").and_then(Value::as_str).unwrap_or("?");
            let reply = match entities.get("action").and_then(Value::as_str) {
                Some(action) => format!("Running {} for {}", action, merchant),
                None => "Use your Amex Gold at Costco. Want me to compare all strategies?".to_string(),
            };
            Ok(HandlerOutput::Text(reply))
        }));
        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(Arc::new(FixedSearch::single("card_recommendation", 0.91)))
            .handler(general)
            .build();

        let mut session = session();
        let first = pipeline
            .process_query_detailed("which card should i use at costco", &user(), &mut session)
            .await;
        assert!(first.response.starts_with("Use your Amex Gold"));

        let outcome = pipeline
            .process_query_detailed("compare all strategies", &user(), &mut session)
            .await;
        assert_eq!(outcome.method, ResolutionMethod::DirectRoute);
        assert_eq!(outcome.response, "Running compare_strategies for costco");
        assert!(!session.context.active_context().entities.contains_key("action"));
    }

    #[tokio::test]
    async fn test_structured_handler_output_sets_result_count() {
        let store = Arc::new(InMemoryStore::new());
        let analytics = Arc::new(QueryAnalytics::new(store.clone(), AnalyticsConfig::default()));
        let search: Arc<dyn LocalHandler> = Arc::new(FnHandler::new("transaction_search", |_, _, _| {
            Ok(HandlerOutput::Structured {
                response: "Found 3 transactions at Starbucks.".to_string(),
                data: Some(json!([{"amount": 5.5}, {"amount": 6.25}, {"amount": 4.75}])),
            })
        }));
        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(Arc::new(FixedSearch::single("transaction_search", 0.9)))
            .handler(search)
            .analytics(analytics)
            .build();

        let mut session = session();
        let outcome = pipeline
            .process_query_detailed("find my transactions at starbucks", &user(), &mut session)
            .await;
        assert_eq!(outcome.response, "Found 3 transactions at Starbucks.");

        let logs = store
            .logs_since(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].result_count, 3);
    }

    #[tokio::test]
    async fn test_missing_slots_are_asked_then_filled() {
        let split: Arc<dyn LocalHandler> = Arc::new(
            FnHandler::new("split_payment", |entities, _, _| {
                let amount = entities.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
                let ways = entities.get("split_count").and_then(Value::as_u64).unwrap_or(1);
                Ok(HandlerOutput::Text(format!("${:.2} each", amount / ways as f64)))
            })
            .with_required_slots(&["amount", "split_count"]),
        );
        let search = Arc::new(FixedSearch::single("split_payment", 0.9));
        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(search.clone())
            .handler(split)
            .build();

        let mut session = session();
        let first = pipeline
            .process_query_detailed("how should i split a purchase", &user(), &mut session)
            .await;
        assert_eq!(first.method, ResolutionMethod::SlotFill);
        assert_eq!(first.response, "How much is the amount?");

        let second = pipeline.process_query("$900", &user(), &mut session).await;
        assert_eq!(second, "How many ways should I split it?");

        let third = pipeline.process_query_detailed("three", &user(), &mut session).await;
        assert_eq!(third.response, "$300.00 each");
        assert_eq!(third.intent.as_deref(), Some("split_payment"));
        assert!(!session.slots.has_pending_question());
        assert_eq!(search.searches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unrelated_reply_abandons_slot_filling() {
        let split: Arc<dyn LocalHandler> = Arc::new(
            FnHandler::new("split_payment", |_, _, _| Ok(HandlerOutput::Text("split".into())))
                .with_required_slots(&["amount"]),
        );
        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(Arc::new(FixedSearch::routed(&[
                ("split", "split_payment", 0.9),
                ("payment due", "payment_reminder", 0.93),
            ])))
            .handler(split)
            .handler(text_handler("payment_reminder", "Your payment is due on the 15th."))
            .build();

        let mut session = session();
        let asked = pipeline
            .process_query_detailed("how should i split a purchase", &user(), &mut session)
            .await;
        assert_eq!(asked.method, ResolutionMethod::SlotFill);
        assert!(session.slots.has_pending_question());

        let outcome = pipeline
            .process_query_detailed("when is my payment due", &user(), &mut session)
            .await;
        assert!(!session.slots.has_pending_question());
        assert_eq!(outcome.method, ResolutionMethod::LocalHandlerVerbatim);
        assert_eq!(outcome.intent.as_deref(), Some("payment_reminder"));
        assert_eq!(outcome.response, "Your payment is due on the 15th.");
        assert_eq!(session.context.len(), 2);
    }

    #[tokio::test]
    async fn test_handler_error_returns_apology_without_recording_turn() {
        let failing: Arc<dyn LocalHandler> = Arc::new(FnHandler::new("payment_reminder", |_, _, _| {
            Err(PipelineError::HandlerError("upstream down".into()))
        }));
        let analytics = Arc::new(QueryAnalytics::new(
            Arc::new(InMemoryStore::new()),
            AnalyticsConfig::default(),
        ));
        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(Arc::new(FixedSearch::single("payment_reminder", 0.95)))
            .handler(failing)
            .analytics(analytics.clone())
            .build();

        let mut session = session();
        let outcome = pipeline
            .process_query_detailed("when is my payment due", &user(), &mut session)
            .await;

        assert_eq!(outcome.response, APOLOGY);
        assert_eq!(outcome.method, ResolutionMethod::Error);
        assert!(session.context.is_empty());
        assert!(outcome.query_log_id.is_some());

        let stats = analytics
            .get_query_stats(TimeRange::Day, StatsFilters::default())
            .await
            .unwrap();
        assert_eq!(stats.method_distribution.get("error"), Some(&1));
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_empty_query_is_apology() {
        let pipeline = QueryPipeline::builder(PipelineConfig::default()).build();
        let mut session = session();
        assert_eq!(pipeline.process_query("   ", &user(), &mut session).await, APOLOGY);
    }

    #[tokio::test]
    async fn test_learning_and_implicit_feedback() {
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
        let analytics = Arc::new(QueryAnalytics::new(store.clone(), AnalyticsConfig::default()));

        let pipeline = QueryPipeline::builder(PipelineConfig::default())
            .embeddings(Arc::new(FixedSearch::single("spending_summary", 0.9)))
            .handler(text_handler("spending_summary", "You spent $412 on dining."))
            .learner(learner)
            .feedback(feedback)
            .analytics(analytics)
            .build();

        let mut session = session();
        pipeline
            .process_query("how much did i spend on dining", &user(), &mut session)
            .await;

        // background learning
        let mut learned = Vec::new();
        for _ in 0..50 {
            learned = store.active_patterns().await.unwrap();
            if !learned.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(learned.len(), 1);
        assert_eq!(learned[0].intent.as_deref(), Some("spending_summary"));

        let second = pipeline
            .process_query_detailed("how much did i spend on dining", &user(), &mut session)
            .await;
        assert_eq!(second.pattern_id, Some(learned[0].pattern_id));

        pipeline.process_query("no, i meant groceries", &user(), &mut session).await;

        let pending = store.list_by_status(FeedbackStatus::Pending, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, FeedbackKind::Correction);
        assert_eq!(pending[0].pattern_id, Some(learned[0].pattern_id));
        assert_eq!(pending[0].query_log_id, second.query_log_id.unwrap());
        assert_eq!(pending[0].correction_text.as_deref(), Some("no, i meant groceries"));
    }
}
