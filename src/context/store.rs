//! Conversation state for one session
//!
//! Sliding window of resolved turns, the merged "current topic" entity
//! bindings, and call-to-action offers the bot made but the user has not
//! taken up yet.

use crate::models::EntityMap;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Words that open a continuation of the previous turn
const CONTINUATION_PREFIXES: &[&str] = &[
    "and", "also", "what about", "how about", "but", "then", "so", "or", "plus", "instead",
];

/// Words that refer back to something already said
const ANAPHORIC_WORDS: &[&str] = &[
    "it", "that", "this", "those", "these", "them", "they", "one", "ones", "same",
];

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank you", "thx", "bye", "goodbye", "good morning",
    "good afternoon", "good evening", "good night", "see you", "cheers",
];

lazy_static! {
    /// Bot response phrasing → offered action
    static ref CTA_ACTIONS: Vec<(Regex, &'static str)> = [
        (r"\bcompare (?:all )?(?:the |your )?(?:card )?strateg(?:y|ies)\b", "compare_strategies"),
        (r"\b(?:see|show you|view) (?:some )?(?:alternatives|alternative cards|other (?:cards|options))\b", "show_alternatives"),
        (r"\bset (?:up )?(?:a )?(?:payment )?reminder\b", "set_reminder"),
        (r"\b(?:see|view|build) (?:a |your )?(?:payoff|payment) plan\b", "show_payoff_plan"),
        (r"\bsplit (?:this|the|that) (?:payment|purchase|charge)\b", "split_payment"),
        (r"\b(?:see|view|review) (?:your )?(?:recent )?(?:transactions|spending)\b", "view_transactions"),
        (r"\badd (?:a |another |your )?(?:new )?card\b", "add_card"),
        (r"\b(?:budget|savings) (?:plan|tips)\b", "show_budget_tips"),
    ]
    .iter()
    .map(|(pattern, action)| (Regex::new(pattern).expect("valid CTA pattern"), *action))
    .collect();
}

/// One resolved exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_id: Uuid,
    pub query: String,
    pub intent: Option<String>,
    pub entities: EntityMap,
    pub response: String,
    pub timestamp: DateTime<Utc>,
}

/// Read-only snapshot handed to the rewriter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveContext {
    pub last_intent: Option<String>,
    pub last_query: Option<String>,
    pub entities: EntityMap,
    pub pending_actions: Vec<String>,
    /// Whether the most recent query was itself a follow-up
    pub is_follow_up: bool,
    pub turn_count: usize,
}

/// Per-session sliding-window state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    window_size: usize,
    history: VecDeque<ConversationTurn>,
    active_entities: EntityMap,
    pending_actions: Vec<String>,
    last_was_follow_up: bool,
}

impl ConversationContext {
    pub fn new(session_id: impl Into<String>, window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            session_id: session_id.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            window_size,
            history: VecDeque::with_capacity(window_size + 1),
            active_entities: EntityMap::new(),
            pending_actions: Vec::new(),
            last_was_follow_up: false,
        }
    }

    /// Record a resolved turn
    ///
    /// Evicts the oldest turn past the window, merges entities (new values
    /// override the same key) and registers actions offered by the response.
    pub fn add_turn(
        &mut self,
        query: &str,
        intent: Option<&str>,
        entities: &EntityMap,
        response: &str,
    ) {
        self.last_was_follow_up = !self.history.is_empty() && self.is_follow_up(query);

        self.history.push_back(ConversationTurn {
            turn_id: Uuid::new_v4(),
            query: query.to_string(),
            intent: intent.map(str::to_string),
            entities: entities.clone(),
            response: response.to_string(),
            timestamp: Utc::now(),
        });
        while self.history.len() > self.window_size {
            self.history.pop_front();
        }

        for (key, value) in entities {
            self.active_entities.insert(key.clone(), value.clone());
        }

        for action in detect_actions(response) {
            if !self.pending_actions.iter().any(|a| a == action) {
                self.pending_actions.push(action.to_string());
            }
        }

        self.updated_at = Utc::now();
    }

    /// Continuation word, then anaphoric reference, then a short non-greeting
    pub fn is_follow_up(&self, query: &str) -> bool {
        let text = query
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '\'' || c.is_whitespace() { c } else { ' ' })
            .collect::<String>();
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            return false;
        }
        let text = tokens.join(" ");

        if CONTINUATION_PREFIXES.iter().any(|w| starts_with_phrase(&text, w)) {
            return true;
        }

        if tokens.iter().any(|t| ANAPHORIC_WORDS.contains(t)) {
            return true;
        }

        tokens.len() <= 3 && !GREETINGS.iter().any(|g| starts_with_phrase(&text, g))
    }

    pub fn active_context(&self) -> ActiveContext {
        let last = self.history.back();
        ActiveContext {
            last_intent: last.and_then(|t| t.intent.clone()),
            last_query: last.map(|t| t.query.clone()),
            entities: self.active_entities.clone(),
            pending_actions: self.pending_actions.clone(),
            is_follow_up: self.last_was_follow_up,
            turn_count: self.history.len(),
        }
    }

    /// Remove an offered action once it has been taken up
    pub fn consume_action(&mut self, action: &str) -> bool {
        let before = self.pending_actions.len();
        self.pending_actions.retain(|a| a != action);
        before != self.pending_actions.len()
    }

    pub fn clear_entities(&mut self) {
        self.active_entities.clear();
        self.updated_at = Utc::now();
    }

    /// Drop all state but keep the session identity
    pub fn reset(&mut self) {
        self.history.clear();
        self.active_entities.clear();
        self.pending_actions.clear();
        self.last_was_follow_up = false;
        self.updated_at = Utc::now();
    }

    pub fn history(&self) -> impl DoubleEndedIterator<Item = &ConversationTurn> {
        self.history.iter()
    }

    pub fn last_turn(&self) -> Option<&ConversationTurn> {
        self.history.back()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn pending_actions(&self) -> &[String] {
        &self.pending_actions
    }

    pub fn entities(&self) -> &EntityMap {
        &self.active_entities
    }
}

fn starts_with_phrase(text: &str, phrase: &str) -> bool {
    text == phrase
        || text
            .strip_prefix(phrase)
            .map(|rest| rest.starts_with(' '))
            .unwrap_or(false)
}

/// Actions offered by a bot response, in table order
pub fn detect_actions(response: &str) -> Vec<&'static str> {
    let text = response.to_lowercase();
    CTA_ACTIONS
        .iter()
        .filter(|(regex, _)| regex.is_match(&text))
        .map(|(_, action)| *action)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entities(value: serde_json::Value) -> EntityMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_window_fifo_eviction() {
        let mut ctx = ConversationContext::new("s1", 5);
        for i in 0..8 {
            ctx.add_turn(&format!("question {}", i), Some("help"), &EntityMap::new(), "ok");
            assert!(ctx.len() <= 5);
        }
        assert_eq!(ctx.len(), 5);
        assert_eq!(ctx.history().next().unwrap().query, "question 3");
        assert_eq!(ctx.last_turn().unwrap().query, "question 7");
    }

    #[test]
    fn test_entity_merge_overrides_by_key() {
        let mut ctx = ConversationContext::new("s1", 5);
        ctx.add_turn("q1", None, &entities(json!({"a": 1})), "r");
        ctx.add_turn("q2", None, &entities(json!({"b": 2})), "r");
        assert_eq!(serde_json::Value::Object(ctx.entities().clone()), json!({"a": 1, "b": 2}));

        ctx.add_turn("q3", None, &entities(json!({"a": 3})), "r");
        assert_eq!(serde_json::Value::Object(ctx.entities().clone()), json!({"a": 3, "b": 2}));
    }

    #[test]
    fn test_pending_actions_detected_and_deduped() {
        let mut ctx = ConversationContext::new("s1", 5);
        ctx.add_turn("best card for costco", Some("card_recommendation"), &EntityMap::new(),
            "Use your Double Cash. Would you like to see alternatives or compare all strategies?");
        ctx.add_turn("hmm", Some("card_recommendation"), &EntityMap::new(),
            "I can also show you other cards.");

        assert_eq!(ctx.pending_actions(), &["compare_strategies", "show_alternatives"]);
        assert!(ctx.consume_action("show_alternatives"));
        assert!(!ctx.consume_action("show_alternatives"));
        assert_eq!(ctx.pending_actions(), &["compare_strategies"]);
    }

    #[test]
    fn test_follow_up_detection_order() {
        let ctx = ConversationContext::new("s1", 5);
        assert!(ctx.is_follow_up("and for dining out at restaurants near me?"));
        assert!(ctx.is_follow_up("what about target"));
        assert!(ctx.is_follow_up("can you explain why that card is better for me"));
        assert!(ctx.is_follow_up("yes please"));
        assert!(!ctx.is_follow_up("hi there"));
        assert!(!ctx.is_follow_up("thank you"));
        assert!(!ctx.is_follow_up("which card should i use at costco for groceries"));
        assert!(!ctx.is_follow_up("   "));
    }

    #[test]
    fn test_active_context_is_a_snapshot() {
        let mut ctx = ConversationContext::new("s1", 5);
        assert!(ctx.active_context().last_intent.is_none());

        ctx.add_turn("best card for costco", Some("card_recommendation"),
            &entities(json!({"merchant": "costco"})), "Use Double Cash.");
        let snapshot = ctx.active_context();
        assert_eq!(snapshot.last_intent.as_deref(), Some("card_recommendation"));
        assert_eq!(snapshot.last_query.as_deref(), Some("best card for costco"));
        assert!(!snapshot.is_follow_up);

        ctx.add_turn("what about target", Some("card_recommendation"),
            &entities(json!({"merchant": "target"})), "Use Freedom.");
        assert!(ctx.active_context().is_follow_up);
        // earlier snapshot unaffected
        assert_eq!(snapshot.entities.get("merchant"), Some(&json!("costco")));
    }

    #[test]
    fn test_reset() {
        let mut ctx = ConversationContext::new("s1", 5);
        ctx.add_turn("q", Some("help"), &entities(json!({"a": 1})),
            "Want to set a reminder?");
        ctx.reset();
        assert!(ctx.is_empty());
        assert!(ctx.entities().is_empty());
        assert!(ctx.pending_actions().is_empty());
    }
}
