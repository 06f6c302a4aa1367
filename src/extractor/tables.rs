//! Static keyword tables and the navigation screen registry
//!
//! Tables are compiled once per extractor. Candidate phrases are ordered
//! longest-first so multi-word phrases win over their substrings
//! ("grocery shopping" before "shopping").

use regex::Regex;
use tracing::warn;

pub const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("groceries", &["groceries", "grocery", "grocery shopping", "grocery store", "food shopping", "supermarket", "supermarkets"]),
    ("dining", &["dining", "dining out", "restaurant", "restaurants", "food", "eating out", "takeout", "take out", "coffee", "fast food"]),
    ("gas", &["gas", "gas station", "gas stations", "fuel", "gasoline"]),
    ("travel", &["travel", "flight", "flights", "airfare", "airline", "airlines", "hotel", "hotels", "vacation"]),
    ("transportation", &["transportation", "uber", "lyft", "rideshare", "ride share", "transit", "parking", "tolls"]),
    ("entertainment", &["entertainment", "movies", "movie theater", "concerts", "tickets", "games"]),
    ("streaming", &["streaming", "streaming services", "netflix", "spotify", "hulu", "subscriptions"]),
    ("shopping", &["shopping", "online shopping", "retail", "clothes", "clothing"]),
    ("utilities", &["utilities", "utility", "utility bills", "electric", "electricity", "internet", "phone bill", "water bill"]),
    ("healthcare", &["healthcare", "health care", "medical", "doctor", "dental", "hospital"]),
    ("drugstores", &["drugstore", "drugstores", "drug store", "pharmacy", "pharmacies"]),
    ("home_improvement", &["home improvement", "hardware store", "hardware"]),
    ("insurance", &["insurance", "car insurance", "health insurance", "auto insurance"]),
    ("education", &["education", "tuition", "textbooks", "school"]),
];

pub const MERCHANT_KEYWORDS: &[(&str, &str)] = &[
    ("costco", "costco"),
    ("walmart", "walmart"),
    ("target", "target"),
    ("amazon", "amazon"),
    ("whole foods", "whole foods"),
    ("trader joe's", "trader joe's"),
    ("trader joes", "trader joe's"),
    ("kroger", "kroger"),
    ("safeway", "safeway"),
    ("starbucks", "starbucks"),
    ("mcdonald's", "mcdonald's"),
    ("mcdonalds", "mcdonald's"),
    ("chipotle", "chipotle"),
    ("doordash", "doordash"),
    ("uber eats", "uber eats"),
    ("uber", "uber"),
    ("lyft", "lyft"),
    ("shell", "shell"),
    ("chevron", "chevron"),
    ("exxon", "exxon"),
    ("netflix", "netflix"),
    ("spotify", "spotify"),
    ("home depot", "home depot"),
    ("lowe's", "lowe's"),
    ("best buy", "best buy"),
    ("apple store", "apple"),
    ("delta", "delta"),
    ("southwest", "southwest"),
    ("airbnb", "airbnb"),
    ("marriott", "marriott"),
    ("cvs", "cvs"),
    ("walgreens", "walgreens"),
];

pub const CARD_KEYWORDS: &[(&str, &str)] = &[
    ("sapphire preferred", "Chase Sapphire Preferred"),
    ("sapphire reserve", "Chase Sapphire Reserve"),
    ("sapphire", "Chase Sapphire"),
    ("freedom unlimited", "Chase Freedom Unlimited"),
    ("freedom flex", "Chase Freedom Flex"),
    ("amex gold", "Amex Gold"),
    ("gold card", "Amex Gold"),
    ("amex platinum", "Amex Platinum"),
    ("platinum card", "Amex Platinum"),
    ("blue cash preferred", "Amex Blue Cash Preferred"),
    ("blue cash everyday", "Amex Blue Cash Everyday"),
    ("venture x", "Capital One Venture X"),
    ("venture", "Capital One Venture"),
    ("quicksilver", "Capital One Quicksilver"),
    ("savor", "Capital One Savor"),
    ("double cash", "Citi Double Cash"),
    ("custom cash", "Citi Custom Cash"),
    ("discover it", "Discover It"),
    ("active cash", "Wells Fargo Active Cash"),
];

pub const DEFAULT_SCREENS: &[(&str, &[&str])] = &[
    ("dashboard", &["dashboard", "home", "home screen", "overview"]),
    ("wallet", &["wallet", "cards", "my cards", "card list"]),
    ("transactions", &["transactions", "transaction history", "activity"]),
    ("budget", &["budget", "budgets", "budget planner"]),
    ("payments", &["payments", "payment schedule", "bills"]),
    ("rewards", &["rewards", "rewards center"]),
    ("settings", &["settings", "preferences", "account settings"]),
    ("profile", &["profile", "my profile", "account"]),
];

#[derive(Debug, Clone)]
pub struct KeywordEntry {
    pub phrase: String,
    pub value: String,
    regex: Regex,
}

/// Phrase → canonical value table, matched longest phrase first
#[derive(Debug, Clone, Default)]
pub struct KeywordTable {
    entries: Vec<KeywordEntry>,
}

impl KeywordTable {
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let mut entries: Vec<KeywordEntry> = pairs
            .iter()
            .filter_map(|(phrase, value)| compile_entry(phrase, value))
            .collect();

        entries.sort_by(|a, b| b.phrase.len().cmp(&a.phrase.len()));
        Self { entries }
    }

    /// Build from grouped `(value, phrases)` rows
    pub fn from_groups(groups: &[(&str, &[&str])]) -> Self {
        let pairs: Vec<(&str, &str)> = groups
            .iter()
            .flat_map(|(value, phrases)| phrases.iter().map(move |p| (*p, *value)))
            .collect();
        Self::from_pairs(&pairs)
    }

    /// First (longest) entry whose phrase occurs in `text`
    pub fn find(&self, text: &str) -> Option<&KeywordEntry> {
        self.entries.iter().find(|entry| entry.regex.is_match(text))
    }

    /// All matching entries, longest first
    pub fn find_all<'a>(&'a self, text: &'a str) -> impl Iterator<Item = &'a KeywordEntry> + 'a {
        self.entries.iter().filter(move |entry| entry.regex.is_match(text))
    }

    /// Whether `phrase` is one of the keywords mapped to `value`
    pub fn is_keyword_of(&self, phrase: &str, value: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.value == value && entry.phrase == phrase)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn compile_entry(phrase: &str, value: &str) -> Option<KeywordEntry> {
    let phrase = phrase.trim().to_lowercase();
    if phrase.is_empty() {
        return None;
    }

    match Regex::new(&format!(r"\b{}\b", regex::escape(&phrase))) {
        Ok(regex) => Some(KeywordEntry {
            phrase,
            value: value.to_string(),
            regex,
        }),
        Err(e) => {
            warn!("Skipping keyword {:?}: {}", phrase, e);
            None
        }
    }
}

/// Screen id → spoken aliases
#[derive(Debug, Clone)]
pub struct ScreenRegistry {
    screens: Vec<(String, Vec<String>)>,
}

impl ScreenRegistry {
    pub fn new(screens: &[(&str, &[&str])]) -> Self {
        Self {
            screens: screens
                .iter()
                .map(|(id, aliases)| {
                    (
                        id.to_string(),
                        aliases.iter().map(|a| a.to_lowercase()).collect(),
                    )
                })
                .collect(),
        }
    }

    /// Resolve a spoken target ("my cards", "transaction history") to a screen id
    pub fn resolve(&self, target: &str) -> Option<&str> {
        let target = target.trim().trim_end_matches(|c: char| !c.is_alphanumeric());
        self.screens
            .iter()
            .find(|(id, aliases)| id == target || aliases.iter().any(|a| a == target))
            .map(|(id, _)| id.as_str())
    }

    /// Aliases across all screens, longest first
    pub fn aliases(&self) -> Vec<(&str, &str)> {
        let mut all: Vec<(&str, &str)> = self
            .screens
            .iter()
            .flat_map(|(id, aliases)| aliases.iter().map(move |a| (a.as_str(), id.as_str())))
            .collect();
        all.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        all
    }
}

impl Default for ScreenRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SCREENS)
    }
}
