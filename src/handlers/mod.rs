//! Local handler trait and registry
//!
//! Handlers turn (entities, user data, raw query) into response text or a
//! `{ "response": ... }` object. They are keyed by intent id, and optionally
//! by `(intent, action)` for direct routes.

pub mod http;

use crate::models::{EntityMap, HandlerOutput, UserData};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub use http::HttpHandler;

/// Trait for a single intent handler
#[async_trait]
pub trait LocalHandler: Send + Sync {
    fn intent(&self) -> &str;

    /// Slots that must be bound before the handler can run
    fn required_slots(&self) -> Vec<String> {
        Vec::new()
    }

    async fn handle(
        &self,
        entities: &EntityMap,
        user_data: &UserData,
        raw_query: &str,
    ) -> Result<HandlerOutput>;
}

type HandlerFn = dyn Fn(&EntityMap, &UserData, &str) -> Result<HandlerOutput> + Send + Sync;

/// Handler backed by a synchronous closure
pub struct FnHandler {
    intent: String,
    required: Vec<String>,
    func: Box<HandlerFn>,
}

impl FnHandler {
    pub fn new<F>(intent: &str, func: F) -> Self
    where
        F: Fn(&EntityMap, &UserData, &str) -> Result<HandlerOutput> + Send + Sync + 'static,
    {
        Self {
            intent: intent.to_string(),
            required: Vec::new(),
            func: Box::new(func),
        }
    }

    pub fn with_required_slots(mut self, slots: &[&str]) -> Self {
        self.required = slots.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[async_trait]
impl LocalHandler for FnHandler {
    fn intent(&self) -> &str {
        &self.intent
    }

    fn required_slots(&self) -> Vec<String> {
        self.required.clone()
    }

    async fn handle(
        &self,
        entities: &EntityMap,
        user_data: &UserData,
        raw_query: &str,
    ) -> Result<HandlerOutput> {
        (self.func)(entities, user_data, raw_query)
    }
}

/// Handler registry for intent and route lookups
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn LocalHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn LocalHandler>) {
        self.handlers.insert(handler.intent().to_string(), handler);
    }

    /// Register a handler that only serves one direct-route action
    pub fn register_action(&mut self, action: &str, handler: Arc<dyn LocalHandler>) {
        self.handlers
            .insert(route_key(handler.intent(), action), handler);
    }

    pub fn get(&self, intent: &str) -> Option<Arc<dyn LocalHandler>> {
        self.handlers.get(intent).cloned()
    }

    /// `(intent, action)` handler, else the intent's general handler
    pub fn get_for_route(&self, intent: &str, action: &str) -> Option<Arc<dyn LocalHandler>> {
        self.handlers
            .get(&route_key(intent, action))
            .or_else(|| self.handlers.get(intent))
            .cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn route_key(intent: &str, action: &str) -> String {
    format!("{}:{}", intent, action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(reply: &'static str) -> impl Fn(&EntityMap, &UserData, &str) -> Result<HandlerOutput> {
        move |_, _, _| Ok(HandlerOutput::Text(reply.to_string()))
    }

    #[tokio::test]
    async fn test_route_lookup_prefers_action() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(FnHandler::new("card_recommendation", text("general"))));
        registry.register_action(
            "compare_strategies",
            Arc::new(FnHandler::new("card_recommendation", text("comparison"))),
        );

        let handler = registry.get_for_route("card_recommendation", "compare_strategies").unwrap();
        let out = handler.handle(&EntityMap::new(), &json!({}), "q").await.unwrap();
        assert_eq!(out.into_text(), "comparison");

        let handler = registry.get_for_route("card_recommendation", "show_alternatives").unwrap();
        let out = handler.handle(&EntityMap::new(), &json!({}), "q").await.unwrap();
        assert_eq!(out.into_text(), "general");

        assert!(registry.get_for_route("greeting", "anything").is_none());
    }

    #[test]
    fn test_required_slots() {
        let handler = FnHandler::new("split_payment", text("ok")).with_required_slots(&["amount"]);
        assert_eq!(handler.required_slots(), vec!["amount".to_string()]);
    }
}
