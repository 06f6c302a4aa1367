//! Intent catalog
//!
//! Which intents each gated category may resolve to, the exemplar queries
//! used to seed the embedding index, and the intents whose handler output
//! is returned verbatim.

use crate::models::QueryCategory;
use std::collections::{HashMap, HashSet};

const TASK_INTENTS: &[&str] = &[
    "card_recommendation",
    "card_data_query",
    "payment_reminder",
    "split_payment",
    "spending_summary",
    "transaction_search",
    "navigate",
    "add_card",
];

const GUIDANCE_INTENTS: &[&str] = &[
    "debt_guidance",
    "money_coaching",
    "budget_advice",
    "credit_education",
];

const CHAT_INTENTS: &[&str] = &["greeting", "small_talk", "help"];

/// Handler output for these intents carries exact figures or tables
const CRITICAL_INTENTS: &[&str] = &[
    "card_data_query",
    "payment_reminder",
    "split_payment",
    "spending_summary",
];

const EXEMPLARS: &[(&str, &str)] = &[
    ("card_recommendation", "which card should I use at costco"),
    ("card_recommendation", "best card for groceries"),
    ("card_recommendation", "what card gives the most points for gas"),
    ("card_data_query", "what is the apr on my sapphire card"),
    ("card_data_query", "show my cards with zero balance"),
    ("card_data_query", "which cards have no annual fee"),
    ("payment_reminder", "when is my payment due"),
    ("payment_reminder", "remind me to pay my chase card"),
    ("split_payment", "split my payment across two cards"),
    ("split_payment", "how should I split a $900 purchase"),
    ("spending_summary", "how much did I spend on dining last month"),
    ("spending_summary", "total spending this week"),
    ("transaction_search", "find transactions tagged as travel"),
    ("transaction_search", "show my amazon purchases"),
    ("navigate", "go to the wallet screen"),
    ("add_card", "add a new credit card"),
    ("debt_guidance", "how do I pay off my credit card debt"),
    ("debt_guidance", "should I use avalanche or snowball"),
    ("money_coaching", "how can I stop overspending"),
    ("money_coaching", "tips to save more money"),
    ("budget_advice", "help me build a monthly budget"),
    ("credit_education", "what is a grace period"),
    ("credit_education", "how does credit utilization affect my score"),
    ("greeting", "hello there"),
    ("small_talk", "how are you today"),
    ("help", "what can you do"),
];

/// Category → allowed intents, exemplars and critical intents
#[derive(Debug, Clone)]
pub struct IntentCatalog {
    allowed: HashMap<QueryCategory, Vec<String>>,
    exemplars: Vec<(String, String)>,
    critical: HashSet<String>,
}

impl IntentCatalog {
    pub fn new() -> Self {
        let mut allowed = HashMap::new();
        allowed.insert(QueryCategory::Task, to_owned(TASK_INTENTS));
        allowed.insert(QueryCategory::Guidance, to_owned(GUIDANCE_INTENTS));
        allowed.insert(QueryCategory::Chat, to_owned(CHAT_INTENTS));

        Self {
            allowed,
            exemplars: EXEMPLARS
                .iter()
                .map(|(intent, query)| (intent.to_string(), query.to_string()))
                .collect(),
            critical: CRITICAL_INTENTS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replace the allowed intents of one category
    pub fn with_category(mut self, category: QueryCategory, intents: &[&str]) -> Self {
        self.allowed.insert(category, to_owned(intents));
        self
    }

    pub fn with_critical(mut self, intents: &[&str]) -> Self {
        self.critical = intents.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn allowed_intents(&self, category: QueryCategory) -> &[String] {
        self.allowed
            .get(&category)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Every intent of every category, sorted
    pub fn intents(&self) -> Vec<&str> {
        let mut intents: Vec<&str> = self.allowed.values().flatten().map(|s| s.as_str()).collect();
        intents.sort_unstable();
        intents.dedup();
        intents
    }

    pub fn is_critical(&self, intent: &str) -> bool {
        self.critical.contains(intent)
    }

    pub fn exemplars(&self) -> &[(String, String)] {
        &self.exemplars
    }

    pub fn category_of(&self, intent: &str) -> Option<QueryCategory> {
        self.allowed
            .iter()
            .find(|(_, intents)| intents.iter().any(|i| i == intent))
            .map(|(category, _)| *category)
    }
}

impl Default for IntentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn to_owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_exemplar_has_a_category() {
        let catalog = IntentCatalog::new();
        for (intent, _) in catalog.exemplars() {
            assert!(catalog.category_of(intent).is_some(), "orphan exemplar {}", intent);
        }
    }

    #[test]
    fn test_critical_intents() {
        let catalog = IntentCatalog::new();
        assert!(catalog.is_critical("card_data_query"));
        assert!(!catalog.is_critical("money_coaching"));

        let catalog = catalog.with_critical(&["money_coaching"]);
        assert!(catalog.is_critical("money_coaching"));
    }

    #[test]
    fn test_intents_lists_all_categories() {
        let catalog = IntentCatalog::new();
        let intents = catalog.intents();
        assert_eq!(intents.len(), 15);
        assert!(intents.contains(&"greeting"));
        assert!(intents.contains(&"debt_guidance"));
    }
}
