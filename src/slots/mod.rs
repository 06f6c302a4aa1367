//! Slot filling
//!
//! A short sub-dialogue that collects missing parameters before an intent
//! runs. At most one question is pending per session.

use crate::error::PipelineError;
use crate::extractor::EntityExtractor;
use crate::models::EntityMap;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Interpreted answer to the pending question
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotAnswer {
    pub slot_name: String,
    pub value: Value,
    pub confidence: f32,
}

/// Intent whose slots are complete
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyIntent {
    pub intent: String,
    pub entities: EntityMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub question_type: String,
    pub target_intent: String,
    pub required_slots: Vec<String>,
    pub draft: EntityMap,
    pub asked_at: DateTime<Utc>,
}

impl PendingQuestion {
    fn next_missing(&self) -> Option<&str> {
        self.required_slots
            .iter()
            .find(|slot| !self.draft.contains_key(slot.as_str()))
            .map(|s| s.as_str())
    }
}

/// Slot-filling collaborator contract
pub trait SlotFiller: Send + Sync {
    fn has_pending_question(&self) -> bool;
    fn extract_answer(&self, query: &str) -> Option<SlotAnswer>;
    fn fill_slot(&mut self, answer: SlotAnswer) -> Result<()>;
    fn all_slots_filled(&self) -> bool;
    fn ready_intent(&self) -> Option<ReadyIntent>;
    /// Open a question for `target_intent`; returns the question text
    fn ask_question(
        &mut self,
        question_type: &str,
        target_intent: &str,
        slots: &[String],
        draft: EntityMap,
    ) -> String;
    /// Text of the question for the next missing slot
    fn current_question(&self) -> Option<String>;
    fn clear(&mut self);
}

/// Default in-process slot filler backed by the entity extractor
pub struct SlotFillingManager {
    extractor: Arc<EntityExtractor>,
    pending: Option<PendingQuestion>,
}

impl SlotFillingManager {
    pub fn new(extractor: Arc<EntityExtractor>) -> Self {
        Self {
            extractor,
            pending: None,
        }
    }

    pub fn pending(&self) -> Option<&PendingQuestion> {
        self.pending.as_ref()
    }
}

impl SlotFiller for SlotFillingManager {
    fn has_pending_question(&self) -> bool {
        self.pending
            .as_ref()
            .map(|p| p.next_missing().is_some())
            .unwrap_or(false)
    }

    fn extract_answer(&self, query: &str) -> Option<SlotAnswer> {
        let pending = self.pending.as_ref()?;
        let slot = pending.next_missing()?;
        let text = query.trim().to_lowercase();
        if text.is_empty() || looks_like_new_question(&text) {
            return None;
        }

        let entities = self.extractor.extract(&text);
        let (value, confidence) = match slot {
            "amount" => match entities.amount {
                Some(amount) => (json!(amount), 0.95),
                None => (json!(text.trim_start_matches('$').replace(',', "").parse::<f64>().ok()?), 0.85),
            },
            "merchant" => match entities.merchant {
                Some(merchant) => (json!(merchant), 0.9),
                None => (json!(text), 0.6),
            },
            "category" => (json!(entities.category?), 0.9),
            "card_name" | "card" => match entities.card_name {
                Some(card) => (json!(card), 0.9),
                None => (json!(text), 0.6),
            },
            "timeframe" | "date" => (serde_json::to_value(entities.timeframe?).ok()?, 0.85),
            "split_count" | "count" => (json!(parse_count(&text)?), 0.9),
            _ => (json!(text), 0.5),
        };

        debug!(slot = slot, confidence = confidence, "Slot answer interpreted");

        Some(SlotAnswer {
            slot_name: slot.to_string(),
            value,
            confidence,
        })
    }

    fn fill_slot(&mut self, answer: SlotAnswer) -> Result<()> {
        let pending = self.pending.as_mut().ok_or_else(|| {
            PipelineError::SlotFillingError("No pending question to fill".to_string())
        })?;

        if !pending.required_slots.iter().any(|s| s == &answer.slot_name) {
            return Err(PipelineError::SlotFillingError(format!(
                "Slot '{}' is not requested by {}",
                answer.slot_name, pending.target_intent
            )));
        }

        pending.draft.insert(answer.slot_name, answer.value);
        Ok(())
    }

    fn all_slots_filled(&self) -> bool {
        self.pending
            .as_ref()
            .map(|p| p.next_missing().is_none())
            .unwrap_or(false)
    }

    fn ready_intent(&self) -> Option<ReadyIntent> {
        let pending = self.pending.as_ref()?;
        if pending.next_missing().is_some() {
            return None;
        }
        Some(ReadyIntent {
            intent: pending.target_intent.clone(),
            entities: pending.draft.clone(),
        })
    }

    fn ask_question(
        &mut self,
        question_type: &str,
        target_intent: &str,
        slots: &[String],
        draft: EntityMap,
    ) -> String {
        self.pending = Some(PendingQuestion {
            question_type: question_type.to_string(),
            target_intent: target_intent.to_string(),
            required_slots: slots.to_vec(),
            draft,
            asked_at: Utc::now(),
        });
        self.current_question()
            .unwrap_or_else(|| "Could you give me a bit more detail?".to_string())
    }

    fn current_question(&self) -> Option<String> {
        let slot = self.pending.as_ref()?.next_missing()?;
        Some(question_for(slot))
    }

    fn clear(&mut self) {
        self.pending = None;
    }
}

fn looks_like_new_question(text: &str) -> bool {
    const OPENERS: &[&str] = &["what", "which", "how", "when", "why", "show", "can", "should"];
    let tokens: Vec<&str> = text.split_whitespace().collect();
    tokens.len() > 4 && tokens.first().map(|t| OPENERS.contains(t)).unwrap_or(false)
}

fn parse_count(text: &str) -> Option<u32> {
    const WORDS: &[(&str, u32)] = &[
        ("two", 2), ("three", 3), ("four", 4), ("five", 5), ("six", 6),
        ("seven", 7), ("eight", 8), ("nine", 9), ("ten", 10), ("twelve", 12),
    ];

    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .find_map(|token| {
            token.parse::<u32>().ok().or_else(|| {
                WORDS.iter().find(|(w, _)| *w == token).map(|(_, n)| *n)
            })
        })
}

fn question_for(slot: &str) -> String {
    match slot {
        "amount" => "How much is the amount?".to_string(),
        "merchant" => "Which store or merchant is this for?".to_string(),
        "category" => "Which spending category do you mean?".to_string(),
        "card_name" | "card" => "Which card should I use?".to_string(),
        "timeframe" | "date" => "For what time period?".to_string(),
        "split_count" | "count" => "How many ways should I split it?".to_string(),
        other => format!("What should I use for {}?", other.replace('_', " ")),
    }
}
