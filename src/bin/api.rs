use financial_query_pipeline::{
    api::{start_server, ApiState},
    bootstrap::assemble,
    catalog::IntentCatalog,
    handlers::{HandlerRegistry, HttpHandler},
    PipelineConfig,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Financial Query Pipeline - API Server");
    info!("Port: {}", api_port);

    let catalog = IntentCatalog::new();
    let mut handlers = HandlerRegistry::new();
    match HttpHandler::from_env(&catalog.intents()) {
        Some(remote) => {
            for handler in remote {
                handlers.register(Arc::new(handler));
            }
            info!(handlers = handlers.list().len(), "Remote handlers registered");
        }
        None => warn!("FINANCIAL_API_BASE_URL not set, every query falls back to free text"),
    }

    let config = PipelineConfig::from_env();
    let components = assemble(config.clone(), catalog, handlers).await?;
    components
        .sessions
        .spawn_eviction(config.context.session_idle_ttl, config.context.eviction_interval);

    let state = ApiState {
        pipeline: components.pipeline,
        sessions: components.sessions,
        feedback: Some(components.feedback),
        analytics: Some(components.analytics),
    };

    info!("Pipeline initialized, starting API server");
    start_server(state, api_port).await?;

    Ok(())
}
