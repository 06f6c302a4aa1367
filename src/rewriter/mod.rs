//! Query Rewriter
//!
//! Turns a context-dependent utterance into a self-contained query. Rules are
//! tried in the order of [`RULE_ORDER`] and the first match wins; that order
//! is part of the contract and must not be rearranged.

use crate::config::DIRECT_ROUTE_THRESHOLD;
use crate::context::ActiveContext;
use crate::extractor::amount::parse_amount;
use crate::models::{DirectRoute, EntityMap, RewriteResult};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

/// One rewrite rule family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteRule {
    CompareStrategies,
    ShowAlternatives,
    WhyNot,
    PronounReference,
    Affirmative,
    Repeat,
    WhatAbout,
    DebtGuidanceFollowUp,
    MoneyCoachingFollowUp,
    SplitPaymentFollowUp,
    CardDataFollowUp,
    ConjunctionPassthrough,
}

/// Declared evaluation order
pub const RULE_ORDER: [RewriteRule; 12] = [
    RewriteRule::CompareStrategies,
    RewriteRule::ShowAlternatives,
    RewriteRule::WhyNot,
    RewriteRule::PronounReference,
    RewriteRule::Affirmative,
    RewriteRule::Repeat,
    RewriteRule::WhatAbout,
    RewriteRule::DebtGuidanceFollowUp,
    RewriteRule::MoneyCoachingFollowUp,
    RewriteRule::SplitPaymentFollowUp,
    RewriteRule::CardDataFollowUp,
    RewriteRule::ConjunctionPassthrough,
];

impl RewriteRule {
    pub fn confidence(&self) -> f32 {
        match self {
            RewriteRule::CompareStrategies => 0.98,
            RewriteRule::ShowAlternatives => 0.90,
            RewriteRule::WhyNot => 0.85,
            RewriteRule::PronounReference => 0.80,
            RewriteRule::Affirmative => 0.75,
            RewriteRule::Repeat => 0.70,
            RewriteRule::WhatAbout => 0.75,
            RewriteRule::DebtGuidanceFollowUp => 0.80,
            RewriteRule::MoneyCoachingFollowUp => 0.75,
            RewriteRule::SplitPaymentFollowUp => 0.85,
            RewriteRule::CardDataFollowUp => 0.80,
            RewriteRule::ConjunctionPassthrough => 0.50,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            RewriteRule::CompareStrategies => "compare_strategies_follow_up",
            RewriteRule::ShowAlternatives => "show_alternatives_follow_up",
            RewriteRule::WhyNot => "rejection_explanation",
            RewriteRule::PronounReference => "pronoun_resolution",
            RewriteRule::Affirmative => "affirmative_pending_action",
            RewriteRule::Repeat => "repeat_previous",
            RewriteRule::WhatAbout => "entity_substitution",
            RewriteRule::DebtGuidanceFollowUp => "debt_guidance_follow_up",
            RewriteRule::MoneyCoachingFollowUp => "money_coaching_follow_up",
            RewriteRule::SplitPaymentFollowUp => "split_payment_follow_up",
            RewriteRule::CardDataFollowUp => "card_data_follow_up",
            RewriteRule::ConjunctionPassthrough => "conjunction_passthrough",
        }
    }

    /// Intent the previous turn must have resolved to, if the rule is bound to one
    fn required_intent(&self) -> Option<&'static str> {
        match self {
            RewriteRule::CompareStrategies
            | RewriteRule::ShowAlternatives
            | RewriteRule::WhyNot => Some("card_recommendation"),
            RewriteRule::DebtGuidanceFollowUp => Some("debt_guidance"),
            RewriteRule::MoneyCoachingFollowUp => Some("money_coaching"),
            RewriteRule::SplitPaymentFollowUp => Some("split_payment"),
            RewriteRule::CardDataFollowUp => Some("card_data_query"),
            _ => None,
        }
    }

    /// Rewritten text plus optional route when the rule applies
    fn apply(&self, text: &str, ctx: &ActiveContext) -> Option<(String, Option<DirectRoute>)> {
        let last_intent = ctx.last_intent.as_deref()?;
        if let Some(required) = self.required_intent() {
            if required != last_intent {
                return None;
            }
        }

        match self {
            RewriteRule::CompareStrategies => {
                if !COMPARE.is_match(text) {
                    return None;
                }
                let rewritten = match entity_str(&ctx.entities, "merchant") {
                    Some(merchant) => format!("compare all card strategies for {}", merchant),
                    None => "compare all card strategies".to_string(),
                };
                Some((rewritten, Some(route(last_intent, "compare_strategies", ctx.entities.clone()))))
            }

            RewriteRule::ShowAlternatives => {
                if !ALTERNATIVES.is_match(text) {
                    return None;
                }
                let rewritten = match entity_str(&ctx.entities, "merchant") {
                    Some(merchant) => format!("show alternative cards for {}", merchant),
                    None => "show alternative cards".to_string(),
                };
                Some((rewritten, Some(route(last_intent, "show_alternatives", ctx.entities.clone()))))
            }

            RewriteRule::WhyNot => {
                let caps = WHY_NOT.captures(text)?;
                let rejected = caps.get(1)?.as_str().trim().to_string();
                let rewritten = match entity_str(&ctx.entities, "merchant") {
                    Some(merchant) => format!("explain why {} was not recommended for {}", rejected, merchant),
                    None => format!("explain why {} was not recommended", rejected),
                };
                let mut entities = ctx.entities.clone();
                entities.insert("rejected_card".to_string(), json!(rejected));
                Some((rewritten, Some(route(last_intent, "explain_rejection", entities))))
            }

            RewriteRule::PronounReference => {
                let referent = referent(&ctx.entities)?;
                let found = PRONOUN.find(text)?;
                let rewritten = format!("{}{}{}", &text[..found.start()], referent, &text[found.end()..]);
                Some((rewritten, None))
            }

            RewriteRule::Affirmative => {
                if !AFFIRMATIVE.is_match(text) {
                    return None;
                }
                let action = ctx.pending_actions.last()?;
                let mut rewritten = action_phrase(action);
                if let Some(merchant) = entity_str(&ctx.entities, "merchant") {
                    rewritten.push_str(" for ");
                    rewritten.push_str(&merchant);
                }
                Some((rewritten, None))
            }

            RewriteRule::Repeat => {
                if !REPEAT.is_match(text) {
                    return None;
                }
                Some((ctx.last_query.clone()?, None))
            }

            RewriteRule::WhatAbout => {
                let caps = WHAT_ABOUT.captures(text)?;
                let subject = caps.get(1)?.as_str().trim();
                if subject.is_empty() || subject.split_whitespace().count() > 3 {
                    return None;
                }
                let last_query = ctx.last_query.as_deref()?.to_lowercase();
                Some((substitute_entity(&last_query, &ctx.entities, subject), None))
            }

            RewriteRule::DebtGuidanceFollowUp => {
                if !DEBT_FOLLOW_UP.is_match(text) {
                    return None;
                }
                Some((format!("{} for paying off my credit card debt", text), None))
            }

            RewriteRule::MoneyCoachingFollowUp => {
                if !COACHING_FOLLOW_UP.is_match(text) {
                    return None;
                }
                Some((format!("{} about saving money and spending habits", text), None))
            }

            RewriteRule::SplitPaymentFollowUp => {
                if !SPLIT_FOLLOW_UP.is_match(text) {
                    return None;
                }
                let mut entities = ctx.entities.clone();
                if let Some(amount) = parse_amount(text) {
                    entities.insert("amount".to_string(), json!(amount));
                }
                if let Some(count) = SPLIT_COUNT.captures(text).and_then(|c| c.get(1)) {
                    if let Some(n) = count_value(count.as_str()) {
                        entities.insert("split_count".to_string(), json!(n));
                    }
                }
                let rewritten = format!("recalculate the split payment: {}", text);
                Some((rewritten, Some(route(last_intent, "recalculate_split", entities))))
            }

            RewriteRule::CardDataFollowUp => {
                let caps = CARD_ATTRIBUTE.captures(text)?;
                let attribute = caps.get(1)?.as_str();
                let subject = entity_str(&ctx.entities, "card_name")
                    .unwrap_or_else(|| "my cards".to_string());
                Some((format!("what is the {} on {}", attribute, subject), None))
            }

            RewriteRule::ConjunctionPassthrough => {
                let caps = CONJUNCTION.captures(text)?;
                let rest = caps.get(1)?.as_str().trim();
                if rest.is_empty() {
                    return None;
                }
                Some((rest.to_string(), None))
            }
        }
    }
}

lazy_static! {
    static ref COMPARE: Regex = Regex::new(
        r"\bcompare\b.*\b(?:strateg(?:y|ies)|all|them|options|cards)\b|\bside by side\b"
    )
    .expect("valid compare regex");
    static ref ALTERNATIVES: Regex = Regex::new(
        r"\b(?:alternatives?|other (?:cards|options)|something else|another card|(?:second|next) best)\b"
    )
    .expect("valid alternatives regex");
    static ref WHY_NOT: Regex = Regex::new(
        r"^why (?:not|didn't you (?:pick|recommend|suggest|choose)|isn't it|wasn't it) (?:my |the )?(.+?)(?: card)?$"
    )
    .expect("valid why-not regex");
    static ref PRONOUN: Regex = Regex::new(
        r"\b(?:that one|this one|that card|this card|it|them|those)\b"
    )
    .expect("valid pronoun regex");
    static ref AFFIRMATIVE: Regex = Regex::new(
        r"^(?:yes|yeah|yep|yup|sure|ok|okay|please|do it|go ahead|sounds good|let's do it|absolutely)(?: please| do it| go ahead| sure)?$"
    )
    .expect("valid affirmative regex");
    static ref REPEAT: Regex = Regex::new(
        r"^(?:again|repeat(?: that)?|same(?: thing)?(?: again)?|do (?:that|it) again|one more time|say that again)$"
    )
    .expect("valid repeat regex");
    static ref WHAT_ABOUT: Regex = Regex::new(r"^(?:what|how) about (.+)$").expect("valid what-about regex");
    static ref DEBT_FOLLOW_UP: Regex = Regex::new(
        r"\b(?:avalanche|snowball|which (?:one|method|strategy)|pay (?:off )?first|how long|interest saved|consolidat\w*|balance transfer)\b"
    )
    .expect("valid debt follow-up regex");
    static ref COACHING_FOLLOW_UP: Regex = Regex::new(
        r"\b(?:more tips|another tip|what else|how (?:do|can) i start|give me (?:an )?example|more ideas|tell me more)\b"
    )
    .expect("valid coaching follow-up regex");
    static ref SPLIT_FOLLOW_UP: Regex = Regex::new(
        r"\b(?:instead|what if|make it|change (?:it|the amount)|evenly|(?:\d+|two|three|four|five) ways)\b"
    )
    .expect("valid split follow-up regex");
    static ref SPLIT_COUNT: Regex = Regex::new(r"\b(\d+|two|three|four|five) ways\b").expect("valid split count regex");
    static ref CARD_ATTRIBUTE: Regex = Regex::new(
        r"^(?:and |also )?(?:the |its |my )?(apr|annual fee|balance|credit limit|due date|rewards?|grace period|minimum payment|utilization)\??$"
    )
    .expect("valid card attribute regex");
    static ref CONJUNCTION: Regex = Regex::new(r"^(?:and|also|plus|or|but)\b,?(.*)$").expect("valid conjunction regex");
}

fn route(intent: &str, action: &str, entities: EntityMap) -> DirectRoute {
    DirectRoute {
        intent: intent.to_string(),
        action: action.to_string(),
        entities,
    }
}

fn entity_str(entities: &EntityMap, key: &str) -> Option<String> {
    entities
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

/// Most specific bound entity a pronoun can refer to
fn referent(entities: &EntityMap) -> Option<String> {
    ["card_name", "merchant", "category"]
        .iter()
        .find_map(|key| entity_str(entities, key))
}

fn action_phrase(action: &str) -> String {
    match action {
        "compare_strategies" => "compare all card strategies",
        "show_alternatives" => "show alternative cards",
        "set_reminder" => "set a payment reminder",
        "show_payoff_plan" => "show my debt payoff plan",
        "split_payment" => "split this payment across my cards",
        "view_transactions" => "show my recent transactions",
        "add_card" => "add a new card",
        "show_budget_tips" => "give me budget tips",
        other => return other.replace('_', " "),
    }
    .to_string()
}

/// Swap the previously bound entity value in `last_query` for `subject`
fn substitute_entity(last_query: &str, entities: &EntityMap, subject: &str) -> String {
    for key in ["merchant", "category", "card_name", "issuer_value", "network_value"] {
        if let Some(value) = entity_str(entities, key) {
            let value = value.to_lowercase();
            if let Some(pos) = last_query.find(&value) {
                return format!("{}{}{}", &last_query[..pos], subject, &last_query[pos + value.len()..]);
            }
        }
    }
    format!("{} for {}", last_query, subject)
}

fn count_value(token: &str) -> Option<u32> {
    match token {
        "two" => Some(2),
        "three" => Some(3),
        "four" => Some(4),
        "five" => Some(5),
        n => n.parse().ok(),
    }
}

fn normalize(query: &str) -> String {
    query
        .trim()
        .trim_end_matches(|c: char| matches!(c, '?' | '!' | '.'))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Rule-cascade rewriter
#[derive(Debug, Clone, Default)]
pub struct QueryRewriter;

impl QueryRewriter {
    pub fn new() -> Self {
        Self
    }

    pub fn rewrite(&self, query: &str, ctx: &ActiveContext) -> RewriteResult {
        if ctx.last_intent.is_none() {
            return no_match(query);
        }

        let text = normalize(query);
        if text.is_empty() {
            return no_match(query);
        }

        for rule in RULE_ORDER {
            if let Some((rewritten, route)) = rule.apply(&text, ctx) {
                let confidence = rule.confidence();
                // A route never leaves a rule below the direct-route threshold
                let direct_route = route.filter(|_| confidence >= DIRECT_ROUTE_THRESHOLD);

                debug!(
                    rule = rule.reason(),
                    confidence = confidence,
                    direct_route = direct_route.is_some(),
                    "Query rewritten"
                );

                return RewriteResult {
                    rewritten_query: rewritten,
                    confidence,
                    reason: rule.reason().to_string(),
                    direct_route,
                };
            }
        }

        no_match(query)
    }
}

fn no_match(query: &str) -> RewriteResult {
    RewriteResult {
        rewritten_query: query.to_string(),
        confidence: 0.0,
        reason: "no_match".to_string(),
        direct_route: None,
    }
}

/// True iff the rewrite is confident enough and carries a route
pub fn should_direct_route(result: &RewriteResult) -> bool {
    result.confidence >= DIRECT_ROUTE_THRESHOLD && result.direct_route.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(intent: &str, entities: Value) -> ActiveContext {
        ActiveContext {
            last_intent: Some(intent.to_string()),
            last_query: Some("which card should i use at costco".to_string()),
            entities: entities.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_context_leaves_query_unchanged() {
        let rewriter = QueryRewriter::new();
        let result = rewriter.rewrite("compare all strategies", &ActiveContext::default());
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.rewritten_query, "compare all strategies");
        assert!(result.direct_route.is_none());
    }

    #[test]
    fn test_compare_strategies_direct_route() {
        let rewriter = QueryRewriter::new();
        let result = rewriter.rewrite(
            "compare all strategies",
            &ctx("card_recommendation", json!({"merchant": "costco"})),
        );
        assert_eq!(result.rewritten_query, "compare all card strategies for costco");
        assert_eq!(result.confidence, 0.98);

        let route = result.direct_route.clone().unwrap();
        assert_eq!(route.intent, "card_recommendation");
        assert_eq!(route.action, "compare_strategies");
        assert_eq!(Value::Object(route.entities), json!({"merchant": "costco"}));
        assert!(should_direct_route(&result));
    }

    #[test]
    fn test_direct_route_boundary() {
        let route = Some(DirectRoute {
            intent: "split_payment".into(),
            action: "recalculate_split".into(),
            entities: EntityMap::new(),
        });
        let mut result = RewriteResult {
            rewritten_query: "q".into(),
            confidence: 0.85,
            reason: "test".into(),
            direct_route: route,
        };
        assert!(should_direct_route(&result));

        result.confidence = 0.8499;
        assert!(!should_direct_route(&result));

        result.confidence = 0.99;
        result.direct_route = None;
        assert!(!should_direct_route(&result));
    }

    #[test]
    fn test_rule_order_compare_before_pronoun() {
        // "compare them" also contains a pronoun; the compare rule is earlier
        let rewriter = QueryRewriter::new();
        let result = rewriter.rewrite(
            "compare them",
            &ctx("card_recommendation", json!({"merchant": "costco", "card_name": "Freedom"})),
        );
        assert_eq!(result.reason, "compare_strategies_follow_up");
    }

    #[test]
    fn test_why_not_routes_rejection() {
        let rewriter = QueryRewriter::new();
        let result = rewriter.rewrite(
            "Why not my Sapphire card?",
            &ctx("card_recommendation", json!({"merchant": "costco"})),
        );
        assert_eq!(result.confidence, 0.85);
        assert_eq!(result.rewritten_query, "explain why sapphire was not recommended for costco");
        let route = result.direct_route.unwrap();
        assert_eq!(route.action, "explain_rejection");
        assert_eq!(route.entities.get("rejected_card"), Some(&json!("sapphire")));
    }

    #[test]
    fn test_pronoun_resolution_has_no_route() {
        let rewriter = QueryRewriter::new();
        let result = rewriter.rewrite(
            "what's the annual fee on it",
            &ctx("card_data_query", json!({"card_name": "Sapphire Preferred"})),
        );
        assert_eq!(result.confidence, 0.80);
        assert_eq!(result.rewritten_query, "what's the annual fee on Sapphire Preferred");
        assert!(result.direct_route.is_none());
    }

    #[test]
    fn test_affirmative_uses_pending_action() {
        let rewriter = QueryRewriter::new();
        let mut context = ctx("payment_reminder", json!({}));
        context.pending_actions = vec!["set_reminder".to_string()];
        let result = rewriter.rewrite("yes please", &context);
        assert_eq!(result.confidence, 0.75);
        assert_eq!(result.rewritten_query, "set a payment reminder");

        context.pending_actions.clear();
        let result = rewriter.rewrite("yes please", &context);
        assert_ne!(result.reason, "affirmative_pending_action");
    }

    #[test]
    fn test_repeat_replays_last_query() {
        let rewriter = QueryRewriter::new();
        let result = rewriter.rewrite("same again", &ctx("card_recommendation", json!({})));
        assert_eq!(result.confidence, 0.70);
        assert_eq!(result.rewritten_query, "which card should i use at costco");
    }

    #[test]
    fn test_what_about_substitutes_entity() {
        let rewriter = QueryRewriter::new();
        let result = rewriter.rewrite(
            "what about target?",
            &ctx("card_recommendation", json!({"merchant": "costco"})),
        );
        assert_eq!(result.confidence, 0.75);
        assert_eq!(result.rewritten_query, "which card should i use at target");
        assert!(result.direct_route.is_none());
    }

    #[test]
    fn test_split_follow_up_recalculates() {
        let rewriter = QueryRewriter::new();
        let result = rewriter.rewrite(
            "make it $1200 three ways",
            &ctx("split_payment", json!({"amount": 900.0})),
        );
        assert_eq!(result.confidence, 0.85);
        let route = result.direct_route.unwrap();
        assert_eq!(route.action, "recalculate_split");
        assert_eq!(route.entities.get("amount"), Some(&json!(1200.0)));
        assert_eq!(route.entities.get("split_count"), Some(&json!(3)));
    }

    #[test]
    fn test_intent_bound_family_requires_last_intent() {
        let rewriter = QueryRewriter::new();
        let result = rewriter.rewrite("which method is faster, avalanche", &ctx("debt_guidance", json!({})));
        assert_eq!(result.reason, "debt_guidance_follow_up");
        assert_eq!(result.confidence, 0.80);

        let result = rewriter.rewrite("which method is faster, avalanche", &ctx("greeting", json!({})));
        assert_ne!(result.reason, "debt_guidance_follow_up");
    }

    #[test]
    fn test_conjunction_passthrough_and_no_match() {
        let rewriter = QueryRewriter::new();
        let result = rewriter.rewrite("and show my budget", &ctx("help", json!({})));
        assert_eq!(result.confidence, 0.50);
        assert_eq!(result.rewritten_query, "show my budget");

        let result = rewriter.rewrite("show my budget", &ctx("help", json!({})));
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.rewritten_query, "show my budget");
    }
}
