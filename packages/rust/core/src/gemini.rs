//! Gemini REST client implementing [`Classifier`] and [`Embedder`].
//!
//! Classification uses `generateContent` with a JSON response MIME type and a
//! system prompt (built in, or loaded from `llm.classifier_prompt_path`).
//! Embeddings use `embedContent`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use neuramemory_shared::{ClassificationResult, LlmConfig, MemoryType, NeuraMemoryError, Result};

use crate::services::{Classifier, Embedder};

/// User-Agent string for provider requests.
const USER_AGENT: &str = concat!("NeuraMemory/", env!("CARGO_PKG_VERSION"));

/// Built-in classifier system prompt.
pub const DEFAULT_CLASSIFIER_PROMPT: &str = r#"You decide which statements from a conversation are worth remembering about the user.

Reply with a single JSON object with these fields:
- "category": one of "personal", "preference", "project", "project_milestone", "ephemeral"
- "importance": number from 0.0 (not important) to 1.0 (very important)
- "should_store": true if this belongs in long-term memory
- "key": a concise snake_case key (e.g. "name", "favorite_game", "project_neuradesk")
- "value": the fact itself
- "reason": a brief explanation

Use "project" for new projects and "project_milestone" for progress on a project the user already has.
Greetings, small talk, and passing moods are "ephemeral" with should_store false.
"#;

/// Load the classifier prompt from `path`, or fall back to the built-in prompt.
pub fn load_classifier_prompt(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => {
            let prompt =
                std::fs::read_to_string(path).map_err(|e| NeuraMemoryError::io(path, e))?;
            info!(?path, "loaded classifier prompt");
            Ok(prompt)
        }
        None => Ok(DEFAULT_CLASSIFIER_PROMPT.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

/// Classifier output before validation. Category stays a string so unknown
/// values produce a classification error instead of a serde failure.
#[derive(Debug, Deserialize)]
struct RawClassification {
    category: String,
    importance: f64,
    should_store: bool,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Validate and normalize a raw classifier reply.
///
/// A `should_store: false` reply collapses to the canonical discard result.
pub fn parse_classification(text: &str) -> Result<ClassificationResult> {
    let json = strip_code_fence(text);
    let raw: RawClassification = serde_json::from_str(json).map_err(|e| {
        NeuraMemoryError::Classification(format!(
            "invalid classifier JSON: {e} (got: {})",
            json.chars().take(200).collect::<String>()
        ))
    })?;

    let reason = raw.reason.unwrap_or_default();
    if !raw.should_store {
        return Ok(ClassificationResult::discard(reason));
    }

    let category = raw
        .category
        .parse::<MemoryType>()
        .map_err(|e| NeuraMemoryError::Classification(e.to_string()))?;

    Ok(ClassificationResult {
        category,
        importance: raw.importance.clamp(0.0, 1.0),
        should_store: true,
        key: raw.key.unwrap_or_default(),
        value: raw.value.unwrap_or_default(),
        reason,
    })
}

/// Models sometimes wrap JSON in a Markdown code fence.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map_or(trimmed, str::trim)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the Gemini generative language API.
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: String,
    temperature: f32,
    classifier_prompt: String,
}

impl GeminiClient {
    /// Build a client from config. `api_key` comes from the configured env var.
    pub fn new(config: &LlmConfig, api_key: String, classifier_prompt: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NeuraMemoryError::Network(format!("client build: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            temperature: config.temperature,
            classifier_prompt,
        })
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| NeuraMemoryError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(NeuraMemoryError::Network(format!(
                "{url}: HTTP {status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Classifier for GeminiClient {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn classify(
        &self,
        user_message: &str,
        known_facts: &str,
    ) -> Result<ClassificationResult> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = json!({
            "systemInstruction": { "parts": [{ "text": self.classifier_prompt }] },
            "contents": [{
                "role": "user",
                "parts": [{
                    "text": format!("User statement: {user_message}\nUser old facts:\n{known_facts}")
                }]
            }],
            "generationConfig": {
                "temperature": self.temperature,
                "responseMimeType": "application/json"
            }
        });

        let response: GenerateResponse = self
            .post_json(&url, &body)
            .await?
            .json()
            .await
            .map_err(|e| NeuraMemoryError::Classification(format!("invalid response: {e}")))?;

        let text: String = response
            .candidates
            .into_iter()
            .next()
            .map(|c| c.content.parts.into_iter().map(|p| p.text).collect())
            .ok_or_else(|| NeuraMemoryError::Classification("no candidates returned".into()))?;

        let result = parse_classification(&text)?;
        debug!(
            category = %result.category,
            should_store = result.should_store,
            "classification received"
        );
        Ok(result)
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    #[instrument(skip_all, fields(model = %self.embedding_model))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!(
            "{}/models/{}:embedContent",
            self.base_url, self.embedding_model
        );
        let body = json!({
            "model": format!("models/{}", self.embedding_model),
            "content": { "parts": [{ "text": text }] }
        });

        let response: EmbedResponse = self
            .post_json(&url, &body)
            .await?
            .json()
            .await
            .map_err(|e| NeuraMemoryError::Embedding(format!("invalid response: {e}")))?;

        if response.embedding.values.is_empty() {
            return Err(NeuraMemoryError::Embedding("empty embedding returned".into()));
        }
        Ok(response.embedding.values)
    }
}
