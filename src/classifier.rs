//! Category Gate
//!
//! Routes a query into TASK, GUIDANCE or CHAT before exemplar search:
//! - Fast path: static keyword lists, no external call
//! - Slow path: one completion call at temperature 0
//! Anything unparseable lands in TASK.

use crate::models::{ChatMessage, CompletionOptions, QueryCategory};
use crate::services::CompletionService;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Static keyword lists
const TASK_KEYWORDS: &[&str] = &[
    // Payments
    "payment due", "due date", "remind me", "reminder", "split", "pay my",
    // Spending data
    "spent", "spend on", "spending", "transactions", "purchases", "tagged",
    // Card data
    "balance", "apr", "annual fee", "credit limit", "my cards", "which card",
    "best card", "card should i use", "card for",
    // Navigation
    "go to", "open the", "take me to", "add a card", "add card", "add a new card",
];

const GUIDANCE_KEYWORDS: &[&str] = &[
    "pay off", "debt", "budget", "save money", "saving", "savings", "advice",
    "tips", "avalanche", "snowball", "credit score", "improve my", "overspending",
    "should i", "how do i get out",
];

const CHAT_KEYWORDS: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank you", "how are you", "what can you do",
    "who are you", "bye", "goodbye", "good morning", "good evening",
];

lazy_static! {
    static ref TASK_PATTERN: Regex = keyword_regex(TASK_KEYWORDS);
    static ref GUIDANCE_PATTERN: Regex = keyword_regex(GUIDANCE_KEYWORDS);
    static ref CHAT_PATTERN: Regex = keyword_regex(CHAT_KEYWORDS);
}

fn keyword_regex(keywords: &[&str]) -> Regex {
    let alternation = keywords
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"\b(?:{})\b", alternation)).expect("valid keyword regex")
}

const GATE_PROMPT: &str = r#"You route messages for a personal-finance assistant.

Categories:
- TASK: the user wants data or an action (card data, spending, payments, reminders, navigation)
- GUIDANCE: the user wants advice or education about money, debt, budgeting or credit
- CHAT: greetings, thanks, small talk, questions about the assistant

Reply with exactly one word: TASK, GUIDANCE or CHAT."#;

/// Where the gate decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateSource {
    Keyword,
    Llm,
    /// LLM missing, failed or unparseable
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub category: QueryCategory,
    pub source: GateSource,
}

/// Category gate
pub struct CategoryGate {
    completion: Option<Arc<dyn CompletionService>>,
}

impl CategoryGate {
    pub fn new(completion: Option<Arc<dyn CompletionService>>) -> Self {
        Self { completion }
    }

    /// Keyword shortcut; ties resolve TASK, then GUIDANCE, then CHAT
    pub fn fast_path(query: &str) -> Option<QueryCategory> {
        let text = query.to_lowercase();

        let scores = [
            (QueryCategory::Task, TASK_PATTERN.find_iter(&text).count()),
            (QueryCategory::Guidance, GUIDANCE_PATTERN.find_iter(&text).count()),
            (QueryCategory::Chat, CHAT_PATTERN.find_iter(&text).count()),
        ];

        let mut best: Option<(QueryCategory, usize)> = None;
        for (category, score) in scores {
            if score == 0 {
                continue;
            }
            match best {
                Some((_, top)) if top >= score => {}
                _ => best = Some((category, score)),
            }
        }
        best.map(|(category, _)| category)
    }

    pub async fn classify(&self, query: &str) -> GateDecision {
        if let Some(category) = Self::fast_path(query) {
            debug!(category = %category, "Category gate keyword hit");
            return GateDecision {
                category,
                source: GateSource::Keyword,
            };
        }

        let Some(completion) = &self.completion else {
            return default_decision();
        };

        let messages = [ChatMessage::system(GATE_PROMPT), ChatMessage::user(query)];
        let options = CompletionOptions {
            temperature: 0.0,
            max_tokens: 8,
            model: None,
        };

        match completion.complete(&messages, &options).await {
            Ok(reply) => match parse_category(&reply) {
                Some(category) => {
                    debug!(category = %category, "Category gate LLM decision");
                    GateDecision {
                        category,
                        source: GateSource::Llm,
                    }
                }
                None => {
                    warn!(reply = %reply, "Unparseable category gate reply, defaulting to TASK");
                    default_decision()
                }
            },
            Err(e) => {
                warn!(error = %e, "Category gate call failed, defaulting to TASK");
                default_decision()
            }
        }
    }
}

fn default_decision() -> GateDecision {
    GateDecision {
        category: QueryCategory::Task,
        source: GateSource::Default,
    }
}

/// First category word in the reply
fn parse_category(reply: &str) -> Option<QueryCategory> {
    reply
        .to_uppercase()
        .split(|c: char| !c.is_ascii_alphabetic())
        .find_map(|word| match word {
            "TASK" => Some(QueryCategory::Task),
            "GUIDANCE" => Some(QueryCategory::Guidance),
            "CHAT" => Some(QueryCategory::Chat),
            _ => None,
        })
}
