//! HTTP-backed handler
//!
//! Delegates an intent to the financial API service:
//! `POST {base}/handlers/{intent}` with `{ entities, user_data, query }`.

use super::LocalHandler;
use crate::error::PipelineError;
use crate::models::{EntityMap, HandlerOutput, UserData};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;

#[derive(Clone)]
pub struct HttpHandler {
    intent: String,
    required: Vec<String>,
    client: Client,
    base_url: String,
}

impl HttpHandler {
    pub fn new(intent: &str, base_url: &str, client: Client) -> Self {
        Self {
            intent: intent.to_string(),
            required: Vec::new(),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn with_required_slots(mut self, slots: &[&str]) -> Self {
        self.required = slots.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Handlers for `intents` against `FINANCIAL_API_BASE_URL`, if configured
    pub fn from_env(intents: &[&str]) -> Option<Vec<Self>> {
        let base_url = env::var("FINANCIAL_API_BASE_URL")
            .or_else(|_| env::var("HANDLER_API_BASE_URL"))
            .ok()?;

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .ok()?;

        Some(
            intents
                .iter()
                .map(|intent| Self::new(intent, &base_url, client.clone()))
                .collect(),
        )
    }
}

#[async_trait]
impl LocalHandler for HttpHandler {
    fn intent(&self) -> &str {
        &self.intent
    }

    fn required_slots(&self) -> Vec<String> {
        self.required.clone()
    }

    async fn handle(
        &self,
        entities: &EntityMap,
        user_data: &UserData,
        raw_query: &str,
    ) -> Result<HandlerOutput> {
        let url = format!("{}/handlers/{}", self.base_url, self.intent);
        let body = json!({
            "entities": entities,
            "user_data": user_data,
            "query": raw_query,
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                PipelineError::HandlerError(format!("Handler request failed for {}: {}", self.intent, e))
            })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| PipelineError::HandlerError(format!("Invalid handler response: {}", e)))?;

        if !status.is_success() {
            return Err(PipelineError::HandlerError(format!(
                "Handler {} returned {}: {}",
                self.intent, status, body
            )));
        }

        parse_output(body)
    }
}

/// Accepts a bare string or an object with a `response` field
/// Fields beside `response` are kept as the result data
fn parse_output(body: Value) -> Result<HandlerOutput> {
    let missing = || PipelineError::HandlerError(format!("Handler response has no text: {}", body));
    match &body {
        Value::String(text) => Ok(HandlerOutput::Text(text.clone())),
        Value::Object(fields) => {
            let response = fields
                .get("response")
                .and_then(Value::as_str)
                .ok_or_else(missing)?
                .to_string();
            let mut rest = fields.clone();
            rest.remove("response");
            let data = match rest.remove("data") {
                Some(data) => Some(data),
                None if rest.is_empty() => None,
                None => Some(Value::Object(rest)),
            };
            Ok(HandlerOutput::Structured { response, data })
        }
        _ => Err(missing()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_output_shapes() {
        assert_eq!(parse_output(json!("plain")).unwrap().into_text(), "plain");
        let wrapped = parse_output(json!({"response": "wrapped", "data": [1, 2]})).unwrap();
        assert_eq!(wrapped.result_payload(), json!([1, 2]));
        assert_eq!(wrapped.into_text(), "wrapped");

        let listed = parse_output(json!({"response": "found", "transactions": [1, 2, 3]})).unwrap();
        assert_eq!(listed.result_payload(), json!({"transactions": [1, 2, 3]}));
        assert_eq!(parse_output(json!({"response": "bare"})).unwrap().result_payload(), json!("bare"));

        assert!(parse_output(json!({"rows": []})).is_err());
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let handler = HttpHandler::new("navigate", "http://localhost:9000/", Client::new());
        assert_eq!(handler.base_url, "http://localhost:9000");
        assert_eq!(handler.intent(), "navigate");
    }
}
