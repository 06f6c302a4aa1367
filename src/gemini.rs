//! Gemini API client
//!
//! Implements the completion and embedding contracts over the Gemini REST API.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::config::CompletionConfig;
use crate::error::PipelineError;
use crate::models::{ChatMessage, ChatRole, CompletionOptions};
use crate::services::{CompletionService, Embedder};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    embedding_model: String,
}

impl GeminiClient {
    pub fn new(api_key: String, config: &CompletionConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: BASE_URL.to_string(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
        })
    }

    /// Client configured from `GEMINI_API_KEY`, if set
    pub fn from_env(config: &CompletionConfig) -> crate::Result<Option<Self>> {
        match std::env::var("GEMINI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(Some(Self::new(key, config)?)),
            _ => Ok(None),
        }
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!("{}/{}:{}?key={}", self.base_url, model, method, self.api_key)
    }

    fn ensure_key(&self) -> crate::Result<()> {
        if self.api_key.is_empty() {
            return Err(PipelineError::LlmError("GEMINI_API_KEY not configured".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CompletionService for GeminiClient {
    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions) -> crate::Result<String> {
        self.ensure_key()?;

        let model = options.model.as_deref().unwrap_or(&self.model);
        let request = build_request(messages, options);

        debug!(model = model, messages = messages.len(), "Calling Gemini generateContent");

        let response = self
            .client
            .post(self.endpoint(model, "generateContent"))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                PipelineError::LlmError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(status = %status, "Gemini API error response: {}", error_text);
            return Err(PipelineError::LlmError(format!("Gemini API error {}: {}", status, error_text)));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            PipelineError::LlmError(format!("Gemini parse error: {}", e))
        })?;

        let answer = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PipelineError::LlmError("Empty response from Gemini".to_string()))?;

        if let Some(usage) = gemini_response.usage_metadata {
            debug!(
                prompt_tokens = usage.prompt_token_count,
                output_tokens = usage.candidates_token_count,
                "Gemini response received"
            );
        }

        Ok(answer)
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    async fn embed(&self, text: &str) -> crate::Result<Option<Vec<f32>>> {
        self.ensure_key()?;
        if text.trim().is_empty() {
            return Ok(None);
        }

        let request = EmbedRequest {
            model: format!("models/{}", self.embedding_model),
            content: Content {
                role: None,
                parts: vec![Part { text: text.to_string() }],
            },
        };

        let response = self
            .client
            .post(self.endpoint(&self.embedding_model, "embedContent"))
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::EmbeddingError(format!("Gemini embed error: {}", e)))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::EmbeddingError(format!("Gemini embed error: {}", error_text)));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::EmbeddingError(format!("Gemini embed parse error: {}", e)))?;

        Ok(body.embedding.map(|e| e.values).filter(|v| !v.is_empty()))
    }
}

/// System messages fold into `systemInstruction`; assistant turns map to "model"
fn build_request(messages: &[ChatMessage], options: &CompletionOptions) -> GeminiRequest {
    let system_text = messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let contents = messages
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .map(|m| Content {
            role: Some(match m.role {
                ChatRole::Assistant => "model".to_string(),
                _ => "user".to_string(),
            }),
            parts: vec![Part { text: m.content.clone() }],
        })
        .collect();

    GeminiRequest {
        contents,
        generation_config: GenerationConfig {
            temperature: options.temperature,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens: options.max_tokens,
        },
        system_instruction: (!system_text.is_empty()).then(|| SystemInstruction {
            parts: vec![Part { text: system_text }],
        }),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i32,
    #[serde(default)]
    candidates_token_count: i32,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: Content,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Option<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    #[serde(default)]
    values: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_folds_system_messages() {
        let messages = vec![
            ChatMessage::system("You route messages."),
            ChatMessage::user("best card for costco"),
            ChatMessage::assistant("Use Double Cash."),
            ChatMessage::user("why?"),
        ];
        let options = CompletionOptions {
            temperature: 0.0,
            max_tokens: 8,
            model: None,
        };

        let json = serde_json::to_value(build_request(&messages, &options)).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "You route messages.");
        assert_eq!(json["contents"].as_array().unwrap().len(), 3);
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 8);
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"TASK"}]},"finishReason":"STOP"}],
                      "usageMetadata":{"promptTokenCount":12,"candidatesTokenCount":1}}"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.candidates[0].content.parts[0].text, "TASK");
        assert_eq!(parsed.usage_metadata.unwrap().prompt_token_count, 12);

        let embed: EmbedResponse = serde_json::from_str(r#"{"embedding":{"values":[0.1,0.2]}}"#).unwrap();
        assert_eq!(embed.embedding.unwrap().values, vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn test_missing_key_is_llm_error() {
        let client = GeminiClient::new(String::new(), &CompletionConfig::default()).unwrap();
        let result = client.complete(&[ChatMessage::user("hi")], &CompletionOptions::default()).await;
        assert!(matches!(result, Err(PipelineError::LlmError(_))));
    }
}
