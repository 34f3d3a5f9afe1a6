//! OpenAI-compatible model gateway
//!
//! One reqwest client shared by the summarization, embedding and intent
//! providers. Requests carry a short timeout; a timed-out call is reported to
//! the caller as that item's failure, never retried here.

use super::{ChunkSummary, EmbeddingProvider, IntentProvider, SummaryProvider};
use crate::memory_db::StoredMessage;
use crate::utils::TextUtils;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub request_timeout_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimension: 1536,
            request_timeout_seconds: 15,
        }
    }
}

// ===== Wire DTOs =====

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Shared HTTP client for an OpenAI-compatible API.
pub struct ModelGateway {
    config: GatewayConfig,
    http_client: reqwest::Client,
}

impl ModelGateway {
    pub fn new(config: GatewayConfig) -> Self {
        info!("Model gateway initialized with base URL: {}", config.base_url);
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .unwrap_or_default();
        Self { config, http_client }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.config.base_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.config.base_url)
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// One chat completion, returning the assistant message content.
    pub async fn chat_completion(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> anyhow::Result<String> {
        let request = ChatCompletionRequest {
            model: self.config.chat_model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            temperature: 0.1,
            max_tokens,
        };

        let response = self
            .with_auth(self.http_client.post(self.completions_url()))
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Chat completion request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Chat endpoint returned {}: {}", status, body));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse chat response: {}", e))?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("Chat endpoint returned no choices"))
    }

    /// One embedding for one text.
    pub async fn embedding(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: self.config.embedding_model.clone(),
            input: vec![text.to_string()],
        };

        let response = self
            .with_auth(self.http_client.post(self.embeddings_url()))
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Embedding request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Embedding endpoint returned {}: {}", status, body));
        }

        let embedding_response: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse embedding response: {}", e))?;
        let vector = embedding_response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("Embedding endpoint returned no data"))?;

        if vector.len() != self.config.embedding_dimension {
            return Err(anyhow::anyhow!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.config.embedding_dimension,
                vector.len()
            ));
        }
        debug!("Generated embedding (dim={})", vector.len());
        Ok(vector)
    }

    pub fn embedding_dimension(&self) -> usize {
        self.config.embedding_dimension
    }
}

// ===== Provider implementations =====

const SUMMARIZE_SYSTEM_PROMPT: &str = "You summarize a slice of a chat conversation. \
Respond with strict JSON only, no prose, matching this shape: \
{\"summary\": string, \"topics\": [string], \"entities\": [string], \
\"keywords\": [string], \"importance\": number 0-1, \"coherence\": number 0-1}. \
The summary is 2-4 sentences capturing decisions, facts and open questions.";

/// [`SummaryProvider`] over the gateway's chat endpoint. The completion must
/// be strict JSON; anything else is this window's failure.
pub struct HttpSummaryProvider {
    gateway: std::sync::Arc<ModelGateway>,
    /// Per-window input cap, in characters.
    max_input_chars: usize,
}

impl HttpSummaryProvider {
    pub fn new(gateway: std::sync::Arc<ModelGateway>) -> Self {
        Self {
            gateway,
            max_input_chars: 12000,
        }
    }

    fn render_window(&self, messages: &[StoredMessage]) -> String {
        let mut transcript = String::new();
        for message in messages {
            transcript.push_str(&format!("{}: {}\n", message.role, message.content));
        }
        TextUtils::truncate_chars(&transcript, self.max_input_chars).into_owned()
    }

    fn parse_summary(content: &str) -> anyhow::Result<ChunkSummary> {
        // Some models wrap JSON in a code fence; strip it before parsing.
        let trimmed = content
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        let summary: ChunkSummary = serde_json::from_str(trimmed)
            .map_err(|e| anyhow::anyhow!("Summary response is not valid JSON: {}", e))?;
        if summary.summary.trim().is_empty() {
            return Err(anyhow::anyhow!("Summary response has an empty summary field"));
        }
        Ok(summary.clamped())
    }
}

#[async_trait]
impl SummaryProvider for HttpSummaryProvider {
    async fn summarize(&self, messages: &[StoredMessage]) -> anyhow::Result<ChunkSummary> {
        if messages.is_empty() {
            return Err(anyhow::anyhow!("Cannot summarize an empty window"));
        }
        let transcript = self.render_window(messages);
        let content = self
            .gateway
            .chat_completion(SUMMARIZE_SYSTEM_PROMPT, &transcript, 512)
            .await?;
        Self::parse_summary(&content)
    }
}

/// [`EmbeddingProvider`] over the gateway's embeddings endpoint.
pub struct HttpEmbeddingProvider {
    gateway: std::sync::Arc<ModelGateway>,
}

impl HttpEmbeddingProvider {
    pub fn new(gateway: std::sync::Arc<ModelGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.gateway.embedding(text).await
    }

    fn dimension(&self) -> usize {
        self.gateway.embedding_dimension()
    }
}

/// [`IntentProvider`] over the gateway's chat endpoint: asks for exactly one
/// label from the given set.
pub struct HttpIntentProvider {
    gateway: std::sync::Arc<ModelGateway>,
}

impl HttpIntentProvider {
    pub fn new(gateway: std::sync::Arc<ModelGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl IntentProvider for HttpIntentProvider {
    async fn classify(&self, query: &str, labels: &[&str]) -> anyhow::Result<String> {
        let system = format!(
            "Classify the user's chat query. Answer with exactly one of these labels \
             and nothing else: {}",
            labels.join(", ")
        );
        let answer = self.gateway.chat_completion(&system, query, 8).await?;
        let answer = answer.trim().to_lowercase();
        labels
            .iter()
            .find(|label| answer == label.to_lowercase())
            .map(|label| label.to_string())
            .ok_or_else(|| anyhow::anyhow!("Model returned an unknown intent label: {}", answer))
    }
}
