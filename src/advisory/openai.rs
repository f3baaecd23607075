//! OpenAI-compatible advisory backend.
//!
//! Works with any server exposing `/chat/completions` (OpenAI, vLLM,
//! Ollama, LocalAI). Every call asks for a JSON object and parses the
//! message content into the typed result.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::backend::*;
use crate::types::{BeaconError, Result};

const CATEGORY_PROMPT: &str = "You classify emergency incident reports. \
Reply with a JSON object {\"categories\": [..], \"reasoning\": \"..\"}. \
Only use names from knownCategories.";

const SUMMARY_PROMPT: &str = "You summarize emergency incident reports for dispatchers. \
Reply with a JSON object {\"summary\": \"..\"} of at most three sentences.";

const DUPLICATE_PROMPT: &str = "You detect duplicate emergency incident reports. \
Compare the report with the recent reports. Reply with a JSON object \
{\"candidateId\": \"<id>\"} naming the one describing the same event, or \
{\"candidateId\": null}.";

/// OpenAI-compatible chat completion backend
pub struct LlmAdvisoryBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl LlmAdvisoryBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| BeaconError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn auth_header(&self) -> Option<String> {
        self.api_key.as_ref().map(|k| format!("Bearer {}", k))
    }

    /// Run one JSON-mode completion and decode its content
    async fn ask<T: DeserializeOwned>(&self, system: &str, user: String) -> Result<T> {
        let chat_request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.2,
            response_format: ResponseFormatRequest {
                format_type: "json_object",
            },
            stream: false,
        };

        let mut http_request = self.client.post(self.chat_completions_url());
        if let Some(auth) = self.auth_header() {
            http_request = http_request.header(header::AUTHORIZATION, auth);
        }

        let response = http_request
            .json(&chat_request)
            .send()
            .await
            .map_err(|e| BeaconError::AdvisoryUnavailable(format!("Network error: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BeaconError::AdvisoryUnavailable(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| BeaconError::AdvisoryUnavailable(format!("Parse error: {}", e)))?;

        let content = chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BeaconError::AdvisoryUnavailable("No choices in response".into()))?;

        debug!(model = %self.model, bytes = content.len(), "Advisory completion received");

        serde_json::from_str(&content).map_err(|e| {
            BeaconError::AdvisoryUnavailable(format!("Completion is not the expected JSON: {}", e))
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormatRequest,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormatRequest {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageResponse,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Option<String>,
}

fn to_prompt<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

#[async_trait]
impl AdvisoryBackend for LlmAdvisoryBackend {
    fn id(&self) -> &str {
        &self.model
    }

    async fn suggest_categories(&self, request: &CategoryRequest) -> Result<CategorySuggestion> {
        self.ask(CATEGORY_PROMPT, to_prompt(request)?).await
    }

    async fn summarize(&self, details: &str) -> Result<Summary> {
        self.ask(SUMMARY_PROMPT, details.to_string()).await
    }

    async fn detect_duplicates(&self, request: &DuplicateRequest) -> Result<DuplicateCheck> {
        self.ask(DUPLICATE_PROMPT, to_prompt(request)?).await
    }
}
