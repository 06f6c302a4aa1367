//! Financial Query Pipeline
//!
//! Conversational query understanding for a personal-finance assistant:
//! - Tracks per-session conversation state and rewrites follow-ups with context
//! - Extracts structured entities deterministically
//! - Classifies through a cascade of slot filling, direct routes, a category
//!   gate and confidence-banded exemplar search
//! - Learns query patterns from usage feedback and reports query analytics
//!
//! CASCADE:
//! SLOT_FILL → REWRITE → DIRECT_ROUTE? → CATEGORY_GATE → EMBEDDING_SEARCH →
//! CONFIDENCE_BAND → HANDLER / FALLBACK → CONTEXT_UPDATE

pub mod analytics;
pub mod api;
pub mod bootstrap;
pub mod cascade;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod gemini;
pub mod handlers;
pub mod learning;
pub mod models;
pub mod rewriter;
pub mod services;
pub mod slots;
pub mod state;

pub use error::{PipelineError, Result};

// Re-export common types
pub use models::*;
pub use cascade::{QueryPipeline, QueryPipelineBuilder};
pub use config::PipelineConfig;
pub use context::{Session, SessionRegistry};
