//! Completion prompts used by the cascade

use crate::models::ChatMessage;

const WORDING_PROMPT: &str = r#"You are a personal-finance assistant turning a prepared answer into a conversational reply.

Rules:
- Keep every table, list, number, date, amount and card name exactly as given
- Add at most one short introductory sentence before the prepared answer
- Do not add facts, advice or follow-up questions that are not in the prepared answer
- Reply with the final message only"#;

const FALLBACK_PROMPT: &str = r#"You are a personal-finance assistant for a credit card and spending app.

Answer the user's message briefly and helpfully. You do not have access to the user's account data in this reply: never invent balances, transactions, due dates or card details. If the question needs account data, explain what the user can ask or where to find it in the app."#;

/// Messages asking for conversational wording around handler output
pub fn wording_messages(query: &str, intent: &str, handler_text: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(WORDING_PROMPT),
        ChatMessage::user(format!(
            "User question: {}\nIntent: {}\n\nPrepared answer:\n{}",
            query, intent, handler_text
        )),
    ]
}

/// Free-text fallback; `intent_hint` is the weak guess from a low-confidence match
pub fn fallback_messages(query: &str, intent_hint: Option<&str>) -> Vec<ChatMessage> {
    let user = match intent_hint {
        Some(intent) => format!("{}\n\n(Possibly related topic: {})", query, intent),
        None => query.to_string(),
    };
    vec![ChatMessage::system(FALLBACK_PROMPT), ChatMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatRole;

    #[test]
    fn test_fallback_hint_is_only_the_intent_name() {
        let messages = fallback_messages("which card for costco", Some("card_recommendation"));
        assert_eq!(messages[0].role, ChatRole::System);
        assert!(messages[1].content.starts_with("which card for costco"));
        assert!(messages[1].content.contains("card_recommendation"));

        let plain = fallback_messages("tell me a joke", None);
        assert_eq!(plain[1].content, "tell me a joke");
    }

    #[test]
    fn test_wording_carries_prepared_answer() {
        let table = "| Card | APR |\n|---|---|\n| Sapphire | 21.49% |";
        let messages = wording_messages("apr on my cards", "card_data_query", table);
        assert!(messages[1].content.ends_with(table));
    }
}
