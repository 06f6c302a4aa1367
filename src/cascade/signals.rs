//! Implicit feedback detection between consecutive turns

use crate::learning::pattern::{normalize_query, word_overlap};
use crate::models::FeedbackKind;

const CORRECTION_OPENERS: &[&str] = &[
    "no ", "no,", "nope", "not that", "that's wrong", "that is wrong", "wrong", "i meant",
    "i mean ", "actually i", "that's not what",
];

/// Word overlap with the previous query above which a new query is a rephrase
const REFORMULATION_OVERLAP: f64 = 0.5;

/// Signal the new query implies about the previous answer, if any
pub fn detect_implicit_feedback(
    query: &str,
    previous_query: &str,
    resolved_intent: Option<&str>,
) -> Option<FeedbackKind> {
    let current = normalize_query(query);
    let previous = normalize_query(previous_query);
    if current.is_empty() || previous.is_empty() {
        return None;
    }

    let lowered = query.trim().to_lowercase();
    if CORRECTION_OPENERS.iter().any(|opener| lowered.starts_with(opener)) {
        return Some(FeedbackKind::Correction);
    }

    if current != previous && word_overlap(&current, &previous) >= REFORMULATION_OVERLAP {
        return Some(FeedbackKind::Reformulation);
    }

    // Moving on to a screen after an answer means the answer was usable
    if resolved_intent == Some("navigate") {
        return Some(FeedbackKind::Navigation);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correction() {
        assert_eq!(
            detect_implicit_feedback("no, I meant my chase card", "apr on my amex", None),
            Some(FeedbackKind::Correction)
        );
    }

    #[test]
    fn test_reformulation() {
        assert_eq!(
            detect_implicit_feedback(
                "how much did i spend at costco last month",
                "how much did i spend on costco",
                Some("spending_summary")
            ),
            Some(FeedbackKind::Reformulation)
        );
        // identical text is a repeat, not a rephrase
        assert_eq!(detect_implicit_feedback("show my cards", "Show my cards!", None), None);
    }

    #[test]
    fn test_navigation_and_unrelated() {
        assert_eq!(
            detect_implicit_feedback("go to the wallet screen", "best card for gas", Some("navigate")),
            Some(FeedbackKind::Navigation)
        );
        assert_eq!(detect_implicit_feedback("hello", "best card for gas", Some("greeting")), None);
    }
}
