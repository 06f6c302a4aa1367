use financial_query_pipeline::{
    analytics::{StatsFilters, TimeRange},
    bootstrap::assemble,
    catalog::IntentCatalog,
    handlers::{FnHandler, HandlerRegistry},
    HandlerOutput, PipelineConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SCRIPT: &[&str] = &[
    "hello there",
    "which card should I use at costco",
    "compare all strategies",
    "when is my payment due",
    "split my payment across two cards",
    "$900",
    "three",
    "how much did I spend on dining last month",
];

fn demo_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();

    handlers.register(Arc::new(FnHandler::new("greeting", |_, _, _| {
        Ok(HandlerOutput::Text("Hi! Ask me about your cards, payments or spending.".into()))
    })));

    handlers.register(Arc::new(FnHandler::new("card_recommendation", |entities, _, _| {
        let merchant = entities.get("merchant").and_then(Value::as_str).unwrap_or("that merchant");
        Ok(HandlerOutput::Text(format!(
            "Use your Amex Gold at {} for 4x points. Want me to compare all strategies?",
            merchant
        )))
    })));

    handlers.register_action(
        "compare_strategies",
        Arc::new(FnHandler::new("card_recommendation", |entities, _, _| {
            let merchant = entities.get("merchant").and_then(Value::as_str).unwrap_or("this merchant");
            Ok(HandlerOutput::Structured {
                response: format!(
                    "Strategies for {}:\n  Amex Gold         4x points\n  Chase Freedom     5% rotating\n  Citi Double Cash  2% flat",
                    merchant
                ),
                data: Some(json!([
                    { "card": "Amex Gold", "reward": "4x points" },
                    { "card": "Chase Freedom", "reward": "5% rotating" },
                    { "card": "Citi Double Cash", "reward": "2% flat" },
                ])),
            })
        })),
    );

    handlers.register(Arc::new(FnHandler::new("payment_reminder", |_, user, _| {
        let due = user.get("next_due").and_then(Value::as_str).unwrap_or("the 15th");
        Ok(HandlerOutput::Text(format!("Your next payment is due on {}.", due)))
    })));

    handlers.register(Arc::new(
        FnHandler::new("split_payment", |entities, _, _| {
            let amount = entities.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
            let ways = entities.get("split_count").and_then(Value::as_u64).unwrap_or(1).max(1);
            Ok(HandlerOutput::Text(format!(
                "Split ${:.2} into {} payments of ${:.2} each.",
                amount,
                ways,
                amount / ways as f64
            )))
        })
        .with_required_slots(&["amount", "split_count"]),
    ));

    handlers.register(Arc::new(FnHandler::new("spending_summary", |entities, _, _| {
        let category = entities.get("category").and_then(Value::as_str).unwrap_or("everything");
        Ok(HandlerOutput::Text(format!("You spent $412.80 on {} in that period.", category)))
    })));

    handlers
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Financial Query Pipeline demo starting");

    let components = assemble(PipelineConfig::from_env(), IntentCatalog::new(), demo_handlers()).await?;
    let user_data = json!({ "user_id": "demo-user", "next_due": "March 15" });

    println!("\n=== CONVERSATION ===");
    for query in SCRIPT {
        let outcome = {
            let mut session = components.sessions.lock("demo-session").await;
            components
                .pipeline
                .process_query_detailed(query, &user_data, &mut session)
                .await
        };
        println!("\nUser: {}", query);
        println!("Assistant [{}]: {}", outcome.method.as_str(), outcome.response);
    }

    let stats = components
        .analytics
        .get_query_stats(TimeRange::All, StatsFilters::default())
        .await?;
    println!("\n=== QUERY STATS ===");
    println!("{}", serde_json::to_string_pretty(&stats)?);

    components.feedback.shutdown().await;
    Ok(())
}
