//! Semantic slot detection
//!
//! Each detector walks an ordered pattern table and returns the first hit.
//! Table order encodes specificity: the more specific phrase is always
//! listed before the generic one it contains.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BalanceFilter {
    ZeroBalance,
    WithBalance,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompoundOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Aggregation {
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Ordered (pattern, value) table
struct SlotTable(Vec<(Regex, &'static str)>);

impl SlotTable {
    fn new(rows: &[(&str, &'static str)]) -> Self {
        SlotTable(
            rows.iter()
                .map(|(pattern, value)| {
                    (Regex::new(pattern).expect("valid slot pattern"), *value)
                })
                .collect(),
        )
    }

    fn first(&self, text: &str) -> Option<&'static str> {
        self.0
            .iter()
            .find(|(regex, _)| regex.is_match(text))
            .map(|(_, value)| *value)
    }
}

lazy_static! {
    static ref QUERY_TYPES: SlotTable = SlotTable::new(&[
        (r"\b(compare|comparison|versus|vs\.?|difference between)\b", "compare"),
        (r"\b(how many|count|number of)\b", "count"),
        (r"\b(how much|total|sum of)\b", "sum"),
        (r"\b(which|list|show|display|what are)\b", "list"),
        (r"\b(when|what is|what's|whats|tell me)\b", "lookup"),
        (r"\b(should i|recommend|best)\b", "recommendation"),
    ]);

    static ref ATTRIBUTES: SlotTable = SlotTable::new(&[
        (r"\bgrace period\b", "grace_period"),
        (r"\bforeign transaction fees?\b", "foreign_transaction_fee"),
        (r"\bbalance transfer fees?\b", "balance_transfer_fee"),
        (r"\bannual fees?\b", "annual_fee"),
        (r"\blate fees?\b", "late_fee"),
        (r"\b(intro|introductory) (apr|rate)\b", "intro_apr"),
        (r"\b(apr|interest rate|interest)\b", "apr"),
        (r"\b(available credit|credit available)\b", "available_credit"),
        (r"\bcredit limits?\b", "credit_limit"),
        (r"\bstatement balances?\b", "statement_balance"),
        (r"\b(minimum payment|min payment|minimum due)\b", "minimum_payment"),
        (r"\b(due date|payment due|due)\b", "due_date"),
        (r"\b(sign ?up bonus|welcome bonus|welcome offer)\b", "signup_bonus"),
        (r"\b(reward rate|cash ?back|points|rewards|multiplier)\b", "rewards"),
        (r"\b(expiration|expiry|expires|expiring)\b", "expiration_date"),
        (r"\butilization\b", "utilization"),
        (r"\blimits?\b", "credit_limit"),
        (r"\bbalances?\b", "balance"),
        (r"\bgrace\b", "grace_period"),
        (r"\bnetworks?\b", "network"),
        (r"\b(issuers?|banks?)\b", "issuer"),
    ]);

    static ref MODIFIERS: SlotTable = SlotTable::new(&[
        (r"\b(most recent|newest|latest)\b", "newest"),
        (r"\boldest\b", "oldest"),
        (r"\b(highest|most|largest|biggest|maximum|longest)\b", "highest"),
        (r"\b(lowest|least|smallest|cheapest|shortest)\b", "lowest"),
    ]);

    static ref ACTIONS: SlotTable = SlotTable::new(&[
        (r"\b(pay off|pay down|pay)\b", "pay"),
        (r"\b(split|divide)\b", "split"),
        (r"\b(remind|reminder|alert me)\b", "set_reminder"),
        (r"\b(add|link|connect)\b", "add"),
        (r"\b(remove|delete|unlink)\b", "remove"),
        (r"\b(update|change|edit|rename)\b", "update"),
        (r"\b(compare)\b", "compare"),
        (r"\b(go to|open|navigate|take me)\b", "navigate"),
        (r"\b(show|list|display|view|see)\b", "show"),
    ]);

    static ref NETWORKS: SlotTable = SlotTable::new(&[
        (r"\bamerican express\b", "Amex"),
        (r"\bamex\b", "Amex"),
        (r"\bvisa\b", "Visa"),
        (r"\b(mastercard|master card)\b", "Mastercard"),
        (r"\bdiscover\b", "Discover"),
    ]);

    static ref ISSUERS: SlotTable = SlotTable::new(&[
        (r"\bchase\b", "Chase"),
        (r"\b(citi|citibank)\b", "Citi"),
        (r"\bcapital one\b", "Capital One"),
        (r"\bwells fargo\b", "Wells Fargo"),
        (r"\b(bank of america|bofa)\b", "Bank of America"),
        (r"\bus bank\b", "US Bank"),
        (r"\bbarclays\b", "Barclays"),
        (r"\bamerican express\b", "Amex"),
        (r"\bamex\b", "Amex"),
        (r"\bdiscover\b", "Discover"),
    ]);

    static ref ZERO_BALANCE: Regex = Regex::new(
        r"(?:\b(?:zero|no|0)|\$0)\s+balances?\b|\bbalances? of (?:zero\b|0\b|\$0)|\bpaid off\b|\bwithout (?:a |any )?balances?\b"
    )
    .expect("valid zero balance regex");
    static ref WITH_BALANCE: Regex = Regex::new(
        r"\b(with|have|has|having|carry|carrying)\s+(a |an |any |some )?(outstanding )?balances?\b|\bunpaid balances?\b"
    )
    .expect("valid with balance regex");

    static ref DISTINCT: Regex = Regex::new(
        r"\b(distinct|unique|different)\s+(issuers?|banks?|networks?|categories|merchants?|cards?)\b|\bwhich\s+(issuers|banks|networks)\s+(do i have|am i using|are)\b"
    )
    .expect("valid distinct regex");

    static ref EXPLICIT_OR: Regex = Regex::new(r"\bor\b").expect("valid or regex");
    static ref EXPLICIT_AND: Regex = Regex::new(r"\b(and|both|as well as)\b").expect("valid and regex");
    static ref NO_ANNUAL_FEE: Regex = Regex::new(r"\bno annual fees?\b").expect("valid annual fee regex");
    static ref NUMERIC_COMPARATOR: Regex = Regex::new(
        r"\b(under|below|over|above|less than|more than|greater than|at least|at most)\s+\$?\d"
    )
    .expect("valid comparator regex");

    static ref GROUP_BY: Regex = Regex::new(
        r"\b(?:group(?:ed)?|broken down|break(?:ing)? (?:it )?down|split|sorted)\s+by\s+(category|merchant|card|month|week|day|issuer|network|tag)s?\b|\b(?:per|by|for each|each)\s+(category|merchant|card|month|week|day|issuer|network|tag)\b"
    )
    .expect("valid group by regex");

    static ref AGGREGATE_OPERATIONS: SlotTable = SlotTable::new(&[
        (r"\b(average|avg|mean)\b", "avg"),
        (r"\b(total|sum|combined|altogether|in total)\b", "sum"),
        (r"\b(how many|count|number of)\b", "count"),
        (r"\b(maximum|max|highest|largest)\b", "max"),
        (r"\b(minimum|min|lowest|smallest)\b", "min"),
    ]);

    static ref AGGREGATE_FIELDS: SlotTable = SlotTable::new(&[
        (r"\bcredit limits?\b", "credit_limit"),
        (r"\bannual fees?\b", "annual_fee"),
        (r"\b(apr|interest)\b", "apr"),
        (r"\bbalances?\b", "balance"),
        (r"\b(spend|spent|spending|purchases|transactions)\b", "amount"),
        (r"\b(rewards|points|cash ?back)\b", "rewards"),
        (r"\bcards?\b", "cards"),
    ]);
}

pub fn query_type(text: &str) -> Option<&'static str> {
    QUERY_TYPES.first(text)
}

pub fn attribute(text: &str) -> Option<&'static str> {
    ATTRIBUTES.first(text)
}

/// "longest" and "shortest" are remapped onto highest / lowest
pub fn modifier(text: &str) -> Option<&'static str> {
    MODIFIERS.first(text)
}

pub fn action(text: &str) -> Option<&'static str> {
    ACTIONS.first(text)
}

pub fn network(text: &str) -> Option<&'static str> {
    NETWORKS.first(text)
}

pub fn issuer(text: &str) -> Option<&'static str> {
    ISSUERS.first(text)
}

/// Zero-balance phrasing is checked first; `with_balance` is only
/// reported when no zero-balance phrase is present.
pub fn balance_filter(text: &str) -> Option<BalanceFilter> {
    if ZERO_BALANCE.is_match(text) {
        Some(BalanceFilter::ZeroBalance)
    } else if WITH_BALANCE.is_match(text) {
        Some(BalanceFilter::WithBalance)
    } else {
        None
    }
}

/// Distinct-value query ("which issuers do I have", "unique networks").
/// Returns the field the distinct values are taken over.
pub fn distinct_field(text: &str) -> Option<&'static str> {
    let caps = DISTINCT.captures(text)?;
    let noun = caps.get(2).or_else(|| caps.get(3))?.as_str();

    let field = match noun.trim_end_matches('s') {
        "issuer" | "bank" => "issuer",
        "network" => "network",
        "categorie" | "category" => "category",
        "merchant" => "merchant",
        _ => "card_name",
    };
    Some(field)
}

/// Count of independent filter indicators in the query
pub fn filter_indicator_count(
    text: &str,
    has_network: bool,
    has_issuer: bool,
    has_balance_filter: bool,
    has_category: bool,
) -> usize {
    [
        has_network,
        has_issuer,
        has_balance_filter,
        has_category,
        NO_ANNUAL_FEE.is_match(text),
        NUMERIC_COMPARATOR.is_match(text),
    ]
    .iter()
    .filter(|flag| **flag)
    .count()
}

/// Compound operator: explicit "or"/"and" when at least one filter is
/// present, else implicit AND once two or more filters co-occur.
/// Returns the operator and whether it was inferred.
pub fn compound_operator(text: &str, indicators: usize) -> Option<(CompoundOperator, bool)> {
    if indicators == 0 {
        return None;
    }

    if EXPLICIT_OR.is_match(text) {
        return Some((CompoundOperator::Or, false));
    }
    if EXPLICIT_AND.is_match(text) && indicators >= 2 {
        return Some((CompoundOperator::And, false));
    }
    if indicators >= 2 {
        return Some((CompoundOperator::And, true));
    }
    None
}

pub fn group_by(text: &str) -> Option<String> {
    let caps = GROUP_BY.captures(text)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
}

/// Aggregation operation with its optional target field
pub fn aggregation(text: &str) -> Option<Aggregation> {
    let operation = AGGREGATE_OPERATIONS.first(text)?;
    Some(Aggregation {
        operation: operation.to_string(),
        field: AGGREGATE_FIELDS.first(text).map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specific_attribute_before_generic() {
        assert_eq!(attribute("how long is the grace period"), Some("grace_period"));
        assert_eq!(attribute("is there any grace"), Some("grace_period"));
        assert_eq!(attribute("balance transfer fee on citi"), Some("balance_transfer_fee"));
        assert_eq!(attribute("what's my intro apr"), Some("intro_apr"));
        assert_eq!(attribute("what's my apr"), Some("apr"));
        assert_eq!(attribute("statement balance"), Some("statement_balance"));
    }

    #[test]
    fn test_modifier_remaps() {
        assert_eq!(modifier("card with the longest grace period"), Some("highest"));
        assert_eq!(modifier("shortest grace period"), Some("lowest"));
        assert_eq!(modifier("most recent transaction"), Some("newest"));
    }

    #[test]
    fn test_american_express_is_amex() {
        assert_eq!(network("my american express card"), Some("Amex"));
        assert_eq!(network("amex cards"), Some("Amex"));
        assert_eq!(network("visa or mastercard"), Some("Visa"));
    }

    #[test]
    fn test_balance_filter_exclusive() {
        assert_eq!(balance_filter("cards with zero balance"), Some(BalanceFilter::ZeroBalance));
        assert_eq!(balance_filter("cards with a balance"), Some(BalanceFilter::WithBalance));
        assert_eq!(balance_filter("cards that are paid off"), Some(BalanceFilter::ZeroBalance));
        assert_eq!(balance_filter("show my cards"), None);
    }

    #[test]
    fn test_distinct_requires_strong_signal() {
        assert_eq!(distinct_field("which issuers do i have"), Some("issuer"));
        assert_eq!(distinct_field("list the unique networks"), Some("network"));
        assert_eq!(distinct_field("show my cards"), None);
    }

    #[test]
    fn test_implicit_and() {
        let text = "visa cards with no annual fee";
        let indicators = filter_indicator_count(text, true, false, false, false);
        assert_eq!(indicators, 2);
        assert_eq!(compound_operator(text, indicators), Some((CompoundOperator::And, true)));
    }

    #[test]
    fn test_explicit_or() {
        let text = "visa or mastercard cards";
        assert_eq!(compound_operator(text, 1), Some((CompoundOperator::Or, false)));
    }

    #[test]
    fn test_grouping_and_aggregation() {
        assert_eq!(group_by("spending broken down by category"), Some("category".to_string()));
        assert_eq!(group_by("total per month"), Some("month".to_string()));

        let agg = aggregation("average balance across my cards").unwrap();
        assert_eq!(agg.operation, "avg");
        assert_eq!(agg.field.as_deref(), Some("balance"));
    }
}
