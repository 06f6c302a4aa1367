//! Entity Extractor
//!
//! Deterministic text → structured slots. Every extraction family runs
//! independently, with one exception: merchant matching skips any phrase
//! already claimed as a keyword of the detected category.

pub mod amount;
pub mod semantic;
pub mod tables;

use crate::models::EntityMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use semantic::{Aggregation, BalanceFilter, CompoundOperator};
pub use tables::{KeywordTable, ScreenRegistry};

const MAX_TAG_LEN: usize = 32;

/// Words that never name a card in "my X card"
const GENERIC_CARD_WORDS: &[&str] = &[
    "credit", "debit", "new", "best", "other", "this", "that", "first", "main",
    "old", "primary", "only", "favorite", "every", "each", "which", "a",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Timeframe {
    pub period: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
}

/// Structured slots for one utterance
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractedEntities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<Timeframe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub amounts: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_filter: Option<BalanceFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer_value: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub is_distinct: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinct_field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compound_operator: Option<CompoundOperator>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub implicit_compound: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ExtractedEntities {
    /// Flatten into the key → value map carried by turns and handlers
    pub fn to_entity_map(&self) -> EntityMap {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => EntityMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &ExtractedEntities::default()
    }
}

lazy_static! {
    static ref TIMEFRAMES: Vec<(Regex, &'static str, Option<u32>)> = [
        (r"\btoday\b", "today", Some(1)),
        (r"\byesterday\b", "yesterday", Some(1)),
        (r"\bthis week\b", "this_week", Some(7)),
        (r"\b(last|past|previous) week\b", "last_week", Some(7)),
        (r"\bnext week\b", "next_week", Some(7)),
        (r"\bthis month\b", "this_month", Some(30)),
        (r"\b(last|past|previous) month\b", "last_month", Some(30)),
        (r"\bnext month\b", "next_month", Some(30)),
        (r"\b(this year|year to date|ytd)\b", "this_year", Some(365)),
        (r"\b(last|past|previous) year\b", "last_year", Some(365)),
    ]
    .iter()
    .map(|(pattern, period, days)| {
        (Regex::new(pattern).expect("valid timeframe pattern"), *period, *days)
    })
    .collect();

    static ref RELATIVE_PAST: Regex = Regex::new(
        r"\b(?:last|past|previous)\s+(\d+)\s+(day|week|month)s?\b"
    )
    .expect("valid relative past regex");
    static ref RELATIVE_FUTURE: Regex = Regex::new(
        r"\b(?:in|within|next)\s+(\d+)\s+(day|week|month)s?\b"
    )
    .expect("valid relative future regex");

    static ref CARD_CAPTURE: Regex = Regex::new(
        r"\b(?:my|the)\s+([a-z][a-z0-9' ]{1,30}?)\s+card\b"
    )
    .expect("valid card capture regex");

    static ref NAVIGATION: Regex = Regex::new(
        r"\b(?:go to|open|take me to|navigate to|switch to|bring up|jump to)\s+(?:the\s+|my\s+)?(.+?)(?:\s+(?:screen|page|tab|section))?\s*[.!?]*$"
    )
    .expect("valid navigation regex");
    static ref SCREEN_SUFFIX: Regex = Regex::new(
        r"\b([a-z ]+?)\s+(?:screen|page|tab)\b"
    )
    .expect("valid screen suffix regex");

    static ref TAG_PHRASE: Regex = Regex::new(
        r"\btag(?:ged)?\s+(?:as|with)\s+([a-z0-9_\- ,]+?)(?:\s+(?:from|in|for|on|during|this|last)\b|[^a-z0-9_\- ,]|$)"
    )
    .expect("valid tag phrase regex");
    static ref TAG_LIST: Regex = Regex::new(
        r"\btags?\s*:\s*([a-z0-9_\-, ]+)"
    )
    .expect("valid tag list regex");
    static ref HASHTAG: Regex = Regex::new(r"#([a-z0-9_\-]+)").expect("valid hashtag regex");
    static ref TAG_SEPARATOR: Regex = Regex::new(r"\s*,\s*|\s+and\s+").expect("valid tag separator");
}

/// Deterministic entity extractor
pub struct EntityExtractor {
    categories: KeywordTable,
    merchants: KeywordTable,
    cards: KeywordTable,
    screens: ScreenRegistry,
}

impl EntityExtractor {
    pub fn new() -> Self {
        Self {
            categories: KeywordTable::from_groups(tables::CATEGORY_KEYWORDS),
            merchants: KeywordTable::from_pairs(tables::MERCHANT_KEYWORDS),
            cards: KeywordTable::from_pairs(tables::CARD_KEYWORDS),
            screens: ScreenRegistry::default(),
        }
    }

    /// Use caller-supplied tables (static configuration)
    pub fn with_tables(
        categories: KeywordTable,
        merchants: KeywordTable,
        cards: KeywordTable,
        screens: ScreenRegistry,
    ) -> Self {
        Self {
            categories,
            merchants,
            cards,
            screens,
        }
    }

    /// Extract all slot families from a query
    pub fn extract(&self, query: &str) -> ExtractedEntities {
        let text = normalize(query);
        let mut entities = ExtractedEntities::default();

        // Category first, merchant must not re-claim its keyword
        let category_hit = self.categories.find(&text);
        entities.category = category_hit.map(|hit| hit.value.clone());
        entities.merchant = self
            .merchants
            .find_all(&text)
            .find(|hit| match category_hit {
                Some(category) => !self.categories.is_keyword_of(&hit.phrase, &category.value),
                None => true,
            })
            .map(|hit| hit.value.clone());

        entities.card_name = self.extract_card(&text);
        entities.screen = self.extract_screen(&text);
        entities.timeframe = extract_timeframe(&text);

        entities.amounts = amount::parse_amounts(&text);
        if entities.amounts.is_empty() {
            entities.amounts = amount::money_tokens(&text);
        }
        entities.amount = entities.amounts.first().copied();

        entities.tags = extract_tags(&text);

        entities.query_type = semantic::query_type(&text).map(str::to_string);
        entities.attribute = semantic::attribute(&text).map(str::to_string);
        entities.modifier = semantic::modifier(&text).map(str::to_string);
        entities.action = semantic::action(&text).map(str::to_string);
        entities.balance_filter = semantic::balance_filter(&text);
        entities.network_value = semantic::network(&text).map(str::to_string);
        entities.issuer_value = semantic::issuer(&text).map(str::to_string);

        if let Some(field) = semantic::distinct_field(&text) {
            entities.is_distinct = true;
            entities.distinct_field = Some(field.to_string());
        }

        let indicators = semantic::filter_indicator_count(
            &text,
            entities.network_value.is_some(),
            entities.issuer_value.is_some(),
            entities.balance_filter.is_some(),
            entities.category.is_some(),
        );
        if let Some((operator, implicit)) = semantic::compound_operator(&text, indicators) {
            entities.compound_operator = Some(operator);
            entities.implicit_compound = implicit;
        }

        entities.group_by = semantic::group_by(&text);
        entities.aggregation = semantic::aggregation(&text);

        debug!(query = %query, entities = ?entities, "Entities extracted");

        entities
    }

    fn extract_card(&self, text: &str) -> Option<String> {
        if let Some(hit) = self.cards.find(text) {
            return Some(hit.value.clone());
        }

        let caps = CARD_CAPTURE.captures(text)?;
        let name = caps.get(1)?.as_str().trim();
        let first_word = name.split_whitespace().next().unwrap_or("");
        if name.is_empty() || GENERIC_CARD_WORDS.contains(&first_word) {
            return None;
        }
        Some(title_case(name))
    }

    fn extract_screen(&self, text: &str) -> Option<String> {
        if let Some(caps) = NAVIGATION.captures(text) {
            if let Some(screen) = caps.get(1).and_then(|m| self.screens.resolve(m.as_str())) {
                return Some(screen.to_string());
            }
        }

        let caps = SCREEN_SUFFIX.captures(text)?;
        let phrase = caps.get(1)?.as_str();
        self.screens
            .aliases()
            .into_iter()
            .find(|(alias, _)| phrase.ends_with(alias))
            .map(|(_, id)| id.to_string())
    }
}

impl Default for EntityExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(query: &str) -> String {
    query
        .to_lowercase()
        .replace(['\u{2019}', '\u{2018}'], "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn extract_timeframe(text: &str) -> Option<Timeframe> {
    if let Some(caps) = RELATIVE_PAST.captures(text) {
        let n: u32 = caps[1].parse().ok()?;
        let unit = &caps[2];
        return Some(Timeframe {
            period: format!("last_{}_{}s", n, unit),
            days: Some(n.saturating_mul(unit_days(unit))),
        });
    }

    if let Some(caps) = RELATIVE_FUTURE.captures(text) {
        let n: u32 = caps[1].parse().ok()?;
        let unit = &caps[2];
        return Some(Timeframe {
            period: format!("next_{}_{}s", n, unit),
            days: Some(n.saturating_mul(unit_days(unit))),
        });
    }

    TIMEFRAMES
        .iter()
        .find(|(regex, _, _)| regex.is_match(text))
        .map(|(_, period, days)| Timeframe {
            period: period.to_string(),
            days: *days,
        })
}

fn unit_days(unit: &str) -> u32 {
    match unit {
        "week" => 7,
        "month" => 30,
        _ => 1,
    }
}

/// Union of the three tag syntaxes, deduplicated and sanitized
fn extract_tags(text: &str) -> Vec<String> {
    let mut raw: Vec<String> = Vec::new();

    for caps in TAG_PHRASE.captures_iter(text) {
        if let Some(list) = caps.get(1) {
            raw.extend(TAG_SEPARATOR.split(list.as_str()).map(str::to_string));
        }
    }
    for caps in TAG_LIST.captures_iter(text) {
        if let Some(list) = caps.get(1) {
            raw.extend(list.as_str().split(',').map(str::to_string));
        }
    }
    for caps in HASHTAG.captures_iter(text) {
        if let Some(tag) = caps.get(1) {
            raw.push(tag.as_str().to_string());
        }
    }

    let mut tags: Vec<String> = Vec::new();
    for tag in raw.iter().filter_map(|t| sanitize_tag(t)) {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

fn sanitize_tag(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_TAG_LEN)
        .collect();

    let cleaned = cleaned.trim_matches('-').to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
