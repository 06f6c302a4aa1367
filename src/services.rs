//! External collaborator contracts
//!
//! The cascade only talks to models through these traits. Production uses the
//! Gemini client and the exemplar index; tests swap in the fakes below.

use crate::models::{ChatMessage, CompletionOptions, IntentMatch};
use crate::Result;
use async_trait::async_trait;

/// Chat completion
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Result<String>;
}

/// Text → vector
#[async_trait]
pub trait Embedder: Send + Sync {
    /// `None` when the model produced no vector for the text
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>>;
}

/// Embedding plus exemplar search
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>>;

    /// Matches at or above `floor`, restricted to `allowed_intents`, best first
    async fn search(
        &self,
        vector: &[f32],
        floor: f32,
        k: usize,
        allowed_intents: &[String],
    ) -> Result<Vec<IntentMatch>>;
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::error::PipelineError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Completion fake that records every call
    pub struct RecordingCompletion {
        reply: Option<String>,
        pub calls: AtomicUsize,
        pub last_messages: Mutex<Vec<ChatMessage>>,
        pub last_options: Mutex<Option<CompletionOptions>>,
    }

    impl RecordingCompletion {
        pub fn replying(reply: &str) -> Self {
            Self {
                reply: Some(reply.to_string()),
                calls: AtomicUsize::new(0),
                last_messages: Mutex::new(Vec::new()),
                last_options: Mutex::new(None),
            }
        }

        pub fn failing() -> Self {
            Self {
                reply: None,
                calls: AtomicUsize::new(0),
                last_messages: Mutex::new(Vec::new()),
                last_options: Mutex::new(None),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn last_user_message(&self) -> String {
            self.last_messages
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|m| m.role == crate::models::ChatRole::User)
                .map(|m| m.content.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl CompletionService for RecordingCompletion {
        async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_messages.lock().unwrap() = messages.to_vec();
            *self.last_options.lock().unwrap() = Some(options.clone());
            self.reply
                .clone()
                .ok_or_else(|| PipelineError::LlmError("completion unavailable".to_string()))
        }
    }

    /// Deterministic bag-of-words embedder
    pub struct HashEmbedder;

    pub fn hash_vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; 64];
        for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let bucket = word.bytes().fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize)) % 64;
            vector[bucket] += 1.0;
        }
        vector
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
            if text.trim().is_empty() {
                return Ok(None);
            }
            Ok(Some(hash_vector(text)))
        }
    }

    /// Embedding service returning preset matches
    pub struct FixedSearch {
        matches: Vec<IntentMatch>,
        /// Keyword-selected matches; the last embedded text picks the route
        routes: Vec<(String, IntentMatch)>,
        fail: bool,
        pub searches: AtomicUsize,
        pub embedded: Mutex<Vec<String>>,
    }

    impl FixedSearch {
        pub fn returning(matches: Vec<IntentMatch>) -> Self {
            Self {
                matches,
                routes: Vec::new(),
                fail: false,
                searches: AtomicUsize::new(0),
                embedded: Mutex::new(Vec::new()),
            }
        }

        pub fn single(intent: &str, similarity: f32) -> Self {
            Self::returning(vec![IntentMatch {
                intent_id: intent.to_string(),
                similarity,
                example_query: format!("example for {}", intent),
            }])
        }

        /// First route whose keyword occurs in the query wins
        pub fn routed(routes: &[(&str, &str, f32)]) -> Self {
            let mut search = Self::returning(Vec::new());
            search.routes = routes
                .iter()
                .map(|(keyword, intent, similarity)| {
                    (
                        keyword.to_string(),
                        IntentMatch {
                            intent_id: intent.to_string(),
                            similarity: *similarity,
                            example_query: format!("example for {}", intent),
                        },
                    )
                })
                .collect();
            search
        }

        pub fn failing() -> Self {
            Self {
                matches: Vec::new(),
                routes: Vec::new(),
                fail: true,
                searches: AtomicUsize::new(0),
                embedded: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingService for FixedSearch {
        async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
            self.embedded.lock().unwrap().push(text.to_string());
            if self.fail {
                return Err(PipelineError::EmbeddingError("embedding unavailable".to_string()));
            }
            Ok(Some(hash_vector(text)))
        }

        async fn search(
            &self,
            _vector: &[f32],
            floor: f32,
            k: usize,
            allowed_intents: &[String],
        ) -> Result<Vec<IntentMatch>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            let routed: Vec<IntentMatch> = match self.embedded.lock().unwrap().last() {
                Some(query) if !self.routes.is_empty() => self
                    .routes
                    .iter()
                    .find(|(keyword, _)| query.to_lowercase().contains(keyword.as_str()))
                    .map(|(_, found)| vec![found.clone()])
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            let candidates = if self.routes.is_empty() { &self.matches } else { &routed };
            Ok(candidates
                .iter()
                .filter(|m| m.similarity >= floor)
                .filter(|m| allowed_intents.is_empty() || allowed_intents.contains(&m.intent_id))
                .take(k)
                .cloned()
                .collect())
        }
    }
}
