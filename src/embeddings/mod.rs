//! Exemplar index
//!
//! In-memory vector store of exemplar queries per intent. Search is a linear
//! cosine scan, which is plenty for a catalog of a few hundred exemplars.

use crate::catalog::IntentCatalog;
use crate::models::IntentMatch;
use crate::services::{Embedder, EmbeddingService};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct Exemplar {
    intent_id: String,
    query: String,
    vector: Vec<f32>,
}

/// Cosine similarity; 0 for empty, mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Hashed bag-of-words embedder for offline development
///
/// Only lexical overlap is captured; use a model-backed embedder in production.
pub struct LexicalEmbedder {
    dimensions: usize,
}

impl LexicalEmbedder {
    pub fn new() -> Self {
        Self { dimensions: 256 }
    }

    fn bucket(&self, token: &str) -> usize {
        // FNV-1a
        let hash = token
            .bytes()
            .fold(0xcbf29ce484222325u64, |acc, b| (acc ^ b as u64).wrapping_mul(0x100000001b3));
        (hash % self.dimensions as u64) as usize
    }
}

impl Default for LexicalEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for LexicalEmbedder {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Ok(None);
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for token in tokens {
            vector[self.bucket(token)] += 1.0;
        }
        Ok(Some(vector))
    }
}

/// Exemplar-backed embedding service
pub struct ExemplarIndex {
    embedder: Arc<dyn Embedder>,
    exemplars: RwLock<Vec<Exemplar>>,
}

impl ExemplarIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            exemplars: RwLock::new(Vec::new()),
        }
    }

    /// Index every exemplar of the catalog; exemplars that fail to embed are skipped
    pub async fn from_catalog(embedder: Arc<dyn Embedder>, catalog: &IntentCatalog) -> Self {
        let index = Self::new(embedder);
        let mut indexed = 0usize;

        for (intent, query) in catalog.exemplars() {
            match index.add_exemplar(intent, query).await {
                Ok(true) => indexed += 1,
                Ok(false) => warn!(intent = %intent, "Exemplar produced no embedding"),
                Err(e) => warn!(intent = %intent, error = %e, "Failed to embed exemplar"),
            }
        }

        info!(exemplars = indexed, "Exemplar index built");
        index
    }

    /// Returns false when the embedder produced no vector
    pub async fn add_exemplar(&self, intent_id: &str, query: &str) -> Result<bool> {
        let Some(vector) = self.embedder.embed(query).await? else {
            return Ok(false);
        };

        self.exemplars.write().await.push(Exemplar {
            intent_id: intent_id.to_string(),
            query: query.to_string(),
            vector,
        });
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.exemplars.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.exemplars.read().await.is_empty()
    }
}

#[async_trait]
impl EmbeddingService for ExemplarIndex {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        self.embedder.embed(text).await
    }

    async fn search(
        &self,
        vector: &[f32],
        floor: f32,
        k: usize,
        allowed_intents: &[String],
    ) -> Result<Vec<IntentMatch>> {
        let exemplars = self.exemplars.read().await;

        let mut hits: Vec<IntentMatch> = exemplars
            .iter()
            .filter(|e| allowed_intents.is_empty() || allowed_intents.iter().any(|i| i == &e.intent_id))
            .map(|e| IntentMatch {
                intent_id: e.intent_id.clone(),
                similarity: cosine_similarity(vector, &e.vector).clamp(0.0, 1.0) as f32,
                example_query: e.query.clone(),
            })
            .filter(|m| m.similarity >= floor)
            .collect();

        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(k);
        Ok(hits)
    }
}
