//! Dify chat-messages client implementing [`PromptService`].

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{sse, PromptResponse, PromptService};
use crate::error::GenerationError;
use crate::pipeline::PipelineConfig;

/// Fixed query sent with every request; the workflow keys off `inputs`.
const QUERY: &str = "creator name";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    inputs: ChatInputs<'a>,
    query: &'a str,
    response_mode: &'a str,
    conversation_id: &'a str,
    user: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatInputs<'a> {
    creator_id: &'a str,
}

/// Client for a Dify application's `/v1/chat-messages` endpoint.
#[derive(Debug, Clone)]
pub struct DifyClient {
    client: Client,
    base_url: String,
    api_key: String,
    user: String,
}

impl DifyClient {
    /// Create a client for the application at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::MissingConfig` when the URL or key is blank.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        user: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        let api_key = api_key.into().trim().to_string();
        if base_url.is_empty() {
            return Err(GenerationError::MissingConfig("DIFY_URL"));
        }
        if api_key.is_empty() {
            return Err(GenerationError::MissingConfig("DIFY_API_KEY"));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Request(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_key,
            user: user.into(),
        })
    }

    /// Create a client from the prompt service settings of `config`.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, GenerationError> {
        let url = config
            .prompt_url
            .as_deref()
            .ok_or(GenerationError::MissingConfig("DIFY_URL"))?;
        let key = config
            .prompt_api_key
            .as_deref()
            .ok_or(GenerationError::MissingConfig("DIFY_API_KEY"))?;
        Self::new(url, key, &config.prompt_user, config.prompt_timeout)
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat-messages", self.base_url)
    }
}

/// Extracts the answer text from a response body, streamed or not.
pub(crate) fn answer_text(body: &str) -> String {
    if sse::is_event_stream(body) {
        return sse::collect_answer(body);
    }

    // A blocking-mode body wraps the answer in `{"answer": "..."}`.
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => match value.get("answer").and_then(|a| a.as_str()) {
            Some(answer) => answer.trim().to_string(),
            None => body.trim().to_string(),
        },
        Err(_) => body.trim().to_string(),
    }
}

#[async_trait]
impl PromptService for DifyClient {
    async fn generate(&self, creator_id: &str) -> Result<PromptResponse, GenerationError> {
        let request = ChatRequest {
            inputs: ChatInputs { creator_id },
            query: QUERY,
            response_mode: "streaming",
            conversation_id: "",
            user: &self.user,
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(GenerationError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let text = answer_text(&body);
        tracing::debug!(creator_id, chars = text.len(), "Received prompt answer");
        PromptResponse::from_text(&text)
    }
}
