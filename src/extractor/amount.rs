//! Shared money-amount parser
//!
//! `parse_amounts` understands explicit money expressions ("$1,250.50",
//! "$2k", "300 dollars", "1.5 grand"). `money_tokens` is the generic
//! fallback for bare numbers that are formatted like money ("1,200", "45.99").

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref CURRENCY_SYMBOL: Regex = Regex::new(
        r"\$\s?(\d{1,3}(?:,\d{3})+|\d+)(\.\d{1,2})?\s*(k|m|thousand|grand|million)?\b"
    )
    .expect("valid currency regex");
    static ref CURRENCY_WORD: Regex = Regex::new(
        r"\b(\d{1,3}(?:,\d{3})+|\d+)(\.\d+)?\s*(k|thousand|grand|million)?\s*(?:dollars|bucks|usd)\b"
    )
    .expect("valid currency word regex");
    static ref SCALED_NUMBER: Regex = Regex::new(
        r"\b(\d+)(\.\d+)?\s*(k|grand)\b"
    )
    .expect("valid scaled number regex");
    static ref MONEY_TOKEN: Regex = Regex::new(
        r"\b(\d{1,3}(?:,\d{3})+(?:\.\d{1,2})?|\d+\.\d{2})\b"
    )
    .expect("valid money token regex");
}

/// Explicit money amounts in order of appearance
pub fn parse_amounts(text: &str) -> Vec<f64> {
    let lower = text.to_lowercase();
    let mut spans: Vec<(usize, usize, f64)> = Vec::new();

    for regex in [&*CURRENCY_SYMBOL, &*CURRENCY_WORD, &*SCALED_NUMBER] {
        for caps in regex.captures_iter(&lower) {
            let Some(whole) = caps.get(0) else { continue };
            if spans
                .iter()
                .any(|(start, end, _)| whole.start() < *end && *start < whole.end())
            {
                continue;
            }

            let integer = caps.get(1).map(|m| m.as_str()).unwrap_or("0");
            let fraction = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let Some(mut value) = parse_number(integer, fraction) else { continue };
            value *= multiplier(caps.get(3).map(|m| m.as_str()));

            spans.push((whole.start(), whole.end(), value));
        }
    }

    spans.sort_by_key(|(start, _, _)| *start);
    spans.into_iter().map(|(_, _, value)| value).collect()
}

/// First explicit money amount
pub fn parse_amount(text: &str) -> Option<f64> {
    parse_amounts(text).into_iter().next()
}

/// Bare numeric tokens that look like money
pub fn money_tokens(text: &str) -> Vec<f64> {
    MONEY_TOKEN
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok())
        .collect()
}

fn parse_number(integer: &str, fraction: &str) -> Option<f64> {
    format!("{}{}", integer.replace(',', ""), fraction)
        .parse::<f64>()
        .ok()
}

fn multiplier(suffix: Option<&str>) -> f64 {
    match suffix {
        Some("k") | Some("thousand") | Some("grand") => 1_000.0,
        Some("m") | Some("million") => 1_000_000.0,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_symbol() {
        assert_eq!(parse_amount("split $1,250.50 across cards"), Some(1250.5));
        assert_eq!(parse_amount("I have $2k left"), Some(2000.0));
    }

    #[test]
    fn test_currency_words() {
        assert_eq!(parse_amount("pay 300 dollars"), Some(300.0));
        assert_eq!(parse_amount("about 1.5 grand"), Some(1500.0));
    }

    #[test]
    fn test_multiple_amounts_in_order() {
        assert_eq!(parse_amounts("between $50 and $200"), vec![50.0, 200.0]);
    }

    #[test]
    fn test_no_amount_for_timeframes() {
        assert_eq!(parse_amount("in 30 days"), None);
        assert!(money_tokens("in 30 days").is_empty());
    }

    #[test]
    fn test_money_token_fallback() {
        assert_eq!(money_tokens("charge of 1,200 on visa"), vec![1200.0]);
        assert_eq!(money_tokens("the 45.99 one"), vec![45.99]);
    }
}
