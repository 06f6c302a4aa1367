//! Pattern Learner
//!
//! Persists, matches and evolves learned query → decomposition patterns.
//! Matching prefers vector similarity and falls back to word overlap when no
//! embedding is available.

use super::pattern::{entity_key_overlap, normalize_query, push_capped, query_hash, word_overlap};
use crate::config::PatternConfig;
use crate::embeddings::cosine_similarity;
use crate::error::PipelineError;
use crate::models::{clamp_unit, EntityMap, QueryPattern};
use crate::services::Embedder;
use crate::state::PatternStore;
use crate::Result;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Confidence of a freshly learned, not yet validated pattern
const INITIAL_CONFIDENCE: f64 = 0.5;

/// A resolved query to learn from
#[derive(Debug, Clone)]
pub struct LearnRequest {
    pub query: String,
    pub decomposed_query: Value,
    pub entities: EntityMap,
    pub intent: Option<String>,
    /// Reused when the caller already embedded the query
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct LearnOutcome {
    pub pattern: QueryPattern,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern: QueryPattern,
    pub similarity: f64,
}

/// One feedback observation for a pattern
#[derive(Debug, Clone, Default)]
pub struct FeedbackSample {
    pub success: bool,
    /// 1..=5
    pub rating: Option<u8>,
    pub helpful: Option<bool>,
    pub correction: Option<String>,
}

pub struct PatternLearner {
    store: Arc<dyn PatternStore>,
    embedder: Option<Arc<dyn Embedder>>,
    config: PatternConfig,
}

impl PatternLearner {
    pub fn new(
        store: Arc<dyn PatternStore>,
        embedder: Option<Arc<dyn Embedder>>,
        config: PatternConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Embedding failures degrade to text matching
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(text).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(error = %e, "Pattern embedding failed, using text similarity");
                None
            }
        }
    }

    // =============================
    // Learning
    // =============================

    pub async fn learn_pattern(&self, request: LearnRequest) -> Result<LearnOutcome> {
        let normalized = normalize_query(&request.query);
        if normalized.is_empty() {
            return Err(PipelineError::ValidationError("Cannot learn an empty query".to_string()));
        }
        let hash = query_hash(&normalized);

        let embedding = match request.embedding.clone() {
            Some(vector) => Some(vector),
            None => self.embed(&normalized).await,
        };

        if let Some(mut existing) = self.store.find_by_hash(&hash).await? {
            self.observe(&mut existing, &normalized, &request, embedding);
            self.store.update_pattern(&existing).await?;
            debug!(pattern_id = %existing.pattern_id, "Pattern reused by hash");
            return Ok(LearnOutcome {
                pattern: existing,
                created: false,
            });
        }

        if let Some(mut near) = self
            .nearest(&normalized, embedding.as_deref(), request.intent.as_deref())
            .await?
        {
            self.observe(&mut near, &normalized, &request, embedding);
            self.store.update_pattern(&near).await?;
            debug!(
                pattern_id = %near.pattern_id,
                version = near.version,
                "Pattern updated with new variation"
            );
            return Ok(LearnOutcome {
                pattern: near,
                created: false,
            });
        }

        let now = Utc::now();
        let pattern = QueryPattern {
            pattern_id: Uuid::new_v4(),
            query_text: normalized,
            query_hash: hash,
            decomposed_query: request.decomposed_query,
            entities: request.entities,
            intent: request.intent,
            embedding,
            success_rate: 1.0,
            usage_count: 1,
            confidence: INITIAL_CONFIDENCE,
            variations: Vec::new(),
            corrections: Vec::new(),
            version: 1,
            is_active: true,
            merged_into: None,
            created_at: now,
            updated_at: now,
            last_used_at: Some(now),
        };
        self.store.insert_pattern(&pattern).await?;

        info!(pattern_id = %pattern.pattern_id, intent = ?pattern.intent, "New query pattern learned");
        Ok(LearnOutcome {
            pattern,
            created: true,
        })
    }

    /// Near-duplicate by vector, else by word overlap; intents must agree
    async fn nearest(
        &self,
        normalized: &str,
        embedding: Option<&[f32]>,
        intent: Option<&str>,
    ) -> Result<Option<QueryPattern>> {
        let candidates = self.store.active_patterns().await?;

        let scored = candidates
            .into_iter()
            .filter(|p| match (intent, p.intent.as_deref()) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            })
            .filter_map(|p| {
                let score = self.similarity(normalized, embedding, &p)?;
                Some((p, score))
            });

        Ok(scored
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(pattern, _)| pattern))
    }

    /// Similarity if it clears the threshold of the method used
    fn similarity(&self, normalized: &str, embedding: Option<&[f32]>, pattern: &QueryPattern) -> Option<f64> {
        match (embedding, pattern.embedding.as_deref()) {
            (Some(a), Some(b)) => {
                let score = cosine_similarity(a, b);
                (score >= self.config.similarity_threshold).then_some(score)
            }
            _ => {
                let score = word_overlap(normalized, &pattern.query_text);
                (score >= self.config.text_similarity_threshold).then_some(score)
            }
        }
    }

    /// Fold a new observation into an existing pattern
    fn observe(
        &self,
        pattern: &mut QueryPattern,
        normalized: &str,
        request: &LearnRequest,
        embedding: Option<Vec<f32>>,
    ) {
        let now = Utc::now();
        pattern.usage_count += 1;
        pattern.last_used_at = Some(now);
        pattern.updated_at = now;

        if normalized != pattern.query_text
            && push_capped(&mut pattern.variations, normalized.to_string(), self.config.max_variations)
        {
            pattern.version += 1;
        }

        let old = pattern.decomposed_query.to_string().to_lowercase();
        let new = request.decomposed_query.to_string().to_lowercase();
        let changed = word_overlap(&tokens(&old), &tokens(&new)) < self.config.material_change_threshold;
        if changed && !request.decomposed_query.is_null() {
            pattern.decomposed_query = request.decomposed_query.clone();
            pattern.entities = request.entities.clone();
            pattern.version += 1;
            if embedding.is_some() {
                pattern.embedding = embedding;
            }
            debug!(pattern_id = %pattern.pattern_id, "Pattern decomposition refreshed");
        } else if pattern.embedding.is_none() {
            pattern.embedding = embedding;
        }
    }

    // =============================
    // Matching
    // =============================

    /// Best active pattern for the query whose entity keys also agree
    pub async fn find_matching_pattern(
        &self,
        query: &str,
        entities: &EntityMap,
        embedding: Option<&[f32]>,
    ) -> Result<Option<PatternMatch>> {
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return Ok(None);
        }

        if let Some(pattern) = self.store.find_by_hash(&query_hash(&normalized)).await? {
            if entity_key_overlap(entities, &pattern.entities) >= self.config.entity_overlap_threshold {
                return Ok(Some(PatternMatch {
                    pattern,
                    similarity: 1.0,
                }));
            }
        }

        let mut scored: Vec<(QueryPattern, f64)> = self
            .store
            .active_patterns()
            .await?
            .into_iter()
            .filter_map(|p| {
                let score = self.similarity(&normalized, embedding, &p)?;
                Some((p, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        for (pattern, similarity) in scored {
            let overlap = entity_key_overlap(entities, &pattern.entities);
            if overlap < self.config.entity_overlap_threshold {
                debug!(
                    pattern_id = %pattern.pattern_id,
                    similarity = similarity,
                    overlap = overlap,
                    "Pattern rejected on entity overlap"
                );
                continue;
            }
            return Ok(Some(PatternMatch { pattern, similarity }));
        }

        Ok(None)
    }

    // =============================
    // Feedback & merging
    // =============================

    pub async fn update_pattern_feedback(
        &self,
        pattern_id: Uuid,
        sample: FeedbackSample,
    ) -> Result<QueryPattern> {
        if pattern_id.is_nil() {
            return Err(PipelineError::ValidationError("Pattern id is required".to_string()));
        }
        if let Some(rating) = sample.rating {
            if !(1..=5).contains(&rating) {
                return Err(PipelineError::ValidationError(format!(
                    "Rating {} outside 1..=5",
                    rating
                )));
            }
        }

        let mut pattern = self.store.get_pattern(pattern_id).await?.ok_or_else(|| {
            PipelineError::ValidationError(format!("Unknown pattern {}", pattern_id))
        })?;

        let n = pattern.usage_count.max(0) as f64;
        let outcome = if sample.success { 1.0 } else { 0.0 };
        pattern.success_rate = clamp_unit((pattern.success_rate * n + outcome) / (n + 1.0));

        pattern.confidence = clamp_unit(match sample.rating {
            Some(rating) => {
                let satisfaction = (rating as f64 - 1.0) / 4.0;
                0.6 * pattern.success_rate + 0.4 * satisfaction
            }
            None => {
                let helpful = if sample.helpful.unwrap_or(sample.success) { 1.0 } else { 0.0 };
                0.7 * pattern.success_rate + 0.3 * helpful
            }
        });

        if let Some(correction) = sample.correction.filter(|c| !c.trim().is_empty()) {
            pattern.corrections.push(correction);
            if pattern.corrections.len() > self.config.max_corrections {
                let excess = pattern.corrections.len() - self.config.max_corrections;
                pattern.corrections.drain(..excess);
            }
        }

        pattern.usage_count += 1;
        pattern.updated_at = Utc::now();
        self.store.update_pattern(&pattern).await?;

        debug!(
            pattern_id = %pattern_id,
            success_rate = pattern.success_rate,
            confidence = pattern.confidence,
            "Pattern feedback applied"
        );
        Ok(pattern)
    }

    /// Merge into the most used pattern; the rest are soft-deactivated
    pub async fn merge_patterns(&self, pattern_ids: &[Uuid]) -> Result<QueryPattern> {
        let unique: Vec<Uuid> = {
            let mut seen = HashSet::new();
            pattern_ids.iter().copied().filter(|id| seen.insert(*id)).collect()
        };
        if unique.len() < 2 {
            return Err(PipelineError::ValidationError(
                "At least two distinct patterns are required to merge".to_string(),
            ));
        }

        let mut patterns = Vec::with_capacity(unique.len());
        for id in &unique {
            let pattern = self
                .store
                .get_pattern(*id)
                .await?
                .ok_or_else(|| PipelineError::ValidationError(format!("Unknown pattern {}", id)))?;
            patterns.push(pattern);
        }

        // Highest usage wins, earliest created on ties
        patterns.sort_by(|a, b| {
            b.usage_count
                .cmp(&a.usage_count)
                .then(a.created_at.cmp(&b.created_at))
        });
        let mut survivor = patterns.remove(0);

        let total_usage: i64 = survivor.usage_count.max(0)
            + patterns.iter().map(|p| p.usage_count.max(0)).sum::<i64>();
        let weighted: f64 = survivor.success_rate * survivor.usage_count.max(0) as f64
            + patterns
                .iter()
                .map(|p| p.success_rate * p.usage_count.max(0) as f64)
                .sum::<f64>();
        survivor.success_rate = if total_usage > 0 {
            clamp_unit(weighted / total_usage as f64)
        } else {
            let all = patterns.len() as f64 + 1.0;
            clamp_unit((survivor.success_rate + patterns.iter().map(|p| p.success_rate).sum::<f64>()) / all)
        };
        survivor.usage_count = total_usage;

        for other in &patterns {
            let mut incoming = vec![other.query_text.clone()];
            incoming.extend(other.variations.iter().cloned());
            for variation in incoming {
                if variation != survivor.query_text {
                    push_capped(&mut survivor.variations, variation, self.config.max_variations);
                }
            }
            for correction in &other.corrections {
                push_capped(&mut survivor.corrections, correction.clone(), self.config.max_corrections);
            }
        }

        survivor.version += 1;
        survivor.updated_at = Utc::now();
        self.store.update_pattern(&survivor).await?;

        for other in &patterns {
            self.store
                .deactivate_pattern(other.pattern_id, Some(survivor.pattern_id))
                .await?;
        }

        info!(
            survivor = %survivor.pattern_id,
            merged = patterns.len(),
            "Query patterns merged"
        );
        Ok(survivor)
    }
}

/// Alphanumeric tokens of a serialized decomposition
fn tokens(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
