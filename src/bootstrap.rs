//! Component wiring shared by the binaries

use crate::analytics::QueryAnalytics;
use crate::cascade::QueryPipeline;
use crate::catalog::IntentCatalog;
use crate::config::PipelineConfig;
use crate::context::SessionRegistry;
use crate::embeddings::{ExemplarIndex, LexicalEmbedder};
use crate::gemini::GeminiClient;
use crate::handlers::HandlerRegistry;
use crate::learning::{FeedbackLoop, PatternLearner};
use crate::services::{CompletionService, Embedder};
use crate::state::Stores;
use crate::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Long-lived services of one pipeline instance
pub struct Components {
    pub pipeline: Arc<QueryPipeline>,
    pub sessions: Arc<SessionRegistry>,
    pub feedback: Arc<FeedbackLoop>,
    pub analytics: Arc<QueryAnalytics>,
}

/// Build every service from configuration and the environment.
///
/// Without `GEMINI_API_KEY` the exemplar index uses the lexical embedder and
/// no completion service is attached. Must run inside a tokio runtime.
pub async fn assemble(
    config: PipelineConfig,
    catalog: IntentCatalog,
    handlers: HandlerRegistry,
) -> Result<Components> {
    let gemini = GeminiClient::from_env(&config.completion)?.map(Arc::new);

    let embedder: Arc<dyn Embedder> = match &gemini {
        Some(client) => client.clone(),
        None => {
            warn!("GEMINI_API_KEY not set, using lexical embeddings and no completion service");
            Arc::new(LexicalEmbedder::new())
        }
    };

    let index = Arc::new(ExemplarIndex::from_catalog(embedder.clone(), &catalog).await);
    let stores = Stores::from_env();

    let learner = Arc::new(PatternLearner::new(
        stores.patterns.clone(),
        Some(embedder),
        config.patterns.clone(),
    ));
    let feedback = Arc::new(FeedbackLoop::new(
        stores.feedback.clone(),
        learner.clone(),
        config.feedback.clone(),
    ));
    let analytics = Arc::new(QueryAnalytics::new(stores.logs.clone(), config.analytics.clone()));

    let mut builder = QueryPipeline::builder(config.clone())
        .catalog(catalog)
        .embeddings(index)
        .handlers(handlers)
        .learner(learner)
        .feedback(feedback.clone())
        .analytics(analytics.clone());
    if let Some(client) = gemini {
        let completion: Arc<dyn CompletionService> = client;
        builder = builder.completion(completion);
    }
    let pipeline = builder.build();

    let sessions = Arc::new(SessionRegistry::new(pipeline.extractor(), config.context.window_size));

    info!(
        window_size = config.context.window_size,
        auto_feedback = config.feedback.auto_process,
        "Pipeline assembled"
    );

    Ok(Components {
        pipeline: Arc::new(pipeline),
        sessions,
        feedback,
        analytics,
    })
}
