//! LLM Client: dialogue and personality generation over Gemini, an
//! OpenAI-compatible API, or Ollama.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::LlmError;
use crate::prompt;
use crate::types::{LlmRequest, LlmResponse, PersonalityData};

/// Produces one in-character line for an NPC.
///
/// Implementations may fail; callers treat any error (and an empty reply)
/// as a generation failure.
#[async_trait]
pub trait DialogueClient: Send + Sync {
    /// Generate a reply given the speaker's personality, the recent history
    /// window, and the message being answered.
    async fn generate_dialogue(
        &self,
        personality_context: &str,
        recent_history: &[String],
        latest_message: &str,
    ) -> Result<String, LlmError>;
}

/// Provider backend for generation.
#[derive(Debug, Clone)]
pub enum LlmProvider {
    /// Google Gemini REST API.
    Gemini { base_url: String, api_key: String },
    /// OpenAI-compatible chat completions API.
    OpenAiCompatible { base_url: String, api_key: String },
    /// Ollama running locally.
    Ollama { base_url: String },
    /// No backend: every call fails and callers fall back.
    None,
}

impl LlmProvider {
    /// Build a provider from its configured name.
    ///
    /// # Errors
    /// `ConfigError` for an unknown name, or a hosted provider without a key.
    pub fn from_name(
        name: &str,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, LlmError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let key = |provider: &str| {
            api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| LlmError::ConfigError(format!("{provider} requires an API key")))
        };
        match name.to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini { base_url, api_key: key("gemini")? }),
            "openai" | "openai_compatible" => Ok(Self::OpenAiCompatible {
                base_url,
                api_key: key("openai")?,
            }),
            "ollama" => Ok(Self::Ollama { base_url }),
            "none" | "" => Ok(Self::None),
            other => Err(LlmError::ConfigError(format!("unknown provider '{other}'"))),
        }
    }

    /// Short name for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Gemini { .. } => "gemini",
            Self::OpenAiCompatible { .. } => "openai",
            Self::Ollama { .. } => "ollama",
            Self::None => "none",
        }
    }
}

/// The main generation client that routes requests to the configured backend.
pub struct LlmClient {
    provider: LlmProvider,
    http: Client,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout_ms: u64,
    max_retries: u32,
}

impl LlmClient {
    /// Create a new client with dialogue sampling defaults
    /// (temperature 0.1, 150 tokens, 10 s timeout).
    #[must_use]
    pub fn new(provider: LlmProvider, model: impl Into<String>, max_retries: u32) -> Self {
        Self {
            provider,
            http: Client::new(),
            model: model.into(),
            temperature: 0.1,
            max_tokens: 150,
            timeout_ms: 10_000,
            max_retries,
        }
    }

    /// Create a client with no backend (all calls fail, callers fall back).
    #[must_use]
    pub fn none() -> Self {
        Self::new(LlmProvider::None, String::new(), 0)
    }

    /// Override dialogue sampling parameters.
    #[must_use]
    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Override the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Check if the client has a backend configured.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !matches!(self.provider, LlmProvider::None)
    }

    /// The configured provider.
    #[must_use]
    pub fn provider(&self) -> &LlmProvider {
        &self.provider
    }

    /// Generate a response.
    ///
    /// # Errors
    /// `Unavailable` with no provider; otherwise the last error after the
    /// retry budget is spent. Non-transient errors are not retried.
    pub async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        match &self.provider {
            LlmProvider::None => Err(LlmError::Unavailable("No LLM provider configured".into())),
            LlmProvider::Gemini { base_url, api_key } => {
                let url = format!("{base_url}/v1beta/models/{}:generateContent", self.model);
                let body = json!({
                    "contents": [{ "parts": [{ "text": request.combined_prompt() }] }],
                    "generationConfig": {
                        "temperature": request.temperature,
                        "maxOutputTokens": request.max_tokens,
                    }
                });
                self.post_with_retries(request, &url, Auth::GoogKey(api_key), &body, gemini_text)
                    .await
            }
            LlmProvider::OpenAiCompatible { base_url, api_key } => {
                let url = format!("{base_url}/v1/chat/completions");
                let mut messages = Vec::new();
                if !request.system.is_empty() {
                    messages.push(json!({ "role": "system", "content": request.system }));
                }
                messages.push(json!({ "role": "user", "content": request.user }));
                let body = json!({
                    "model": self.model,
                    "messages": messages,
                    "max_tokens": request.max_tokens,
                    "temperature": request.temperature,
                });
                self.post_with_retries(request, &url, Auth::Bearer(api_key), &body, openai_text)
                    .await
            }
            LlmProvider::Ollama { base_url } => {
                let url = format!("{base_url}/api/generate");
                let body = json!({
                    "model": self.model,
                    "prompt": request.combined_prompt(),
                    "stream": false,
                    "options": {
                        "temperature": request.temperature,
                        "num_predict": request.max_tokens,
                    }
                });
                self.post_with_retries(request, &url, Auth::None, &body, ollama_text)
                    .await
            }
        }
    }

    async fn post_with_retries(
        &self,
        request: &LlmRequest,
        url: &str,
        auth: Auth<'_>,
        body: &Value,
        extract: fn(&Value) -> (Option<&str>, u64),
    ) -> Result<LlmResponse, LlmError> {
        let provider = self.provider.label();
        let mut last_error = LlmError::Unavailable("no attempt made".into());

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                debug!(provider, attempt = attempt + 1, of = self.max_retries + 1, "retrying LLM call");
            }

            let mut builder = self
                .http
                .post(url)
                .json(body)
                .timeout(Duration::from_millis(request.timeout_ms));
            builder = match auth {
                Auth::Bearer(key) => builder.bearer_auth(key),
                Auth::GoogKey(key) => builder.header("x-goog-api-key", key),
                Auth::None => builder,
            };

            let start = Instant::now();
            let result = builder.send().await;
            let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

            let err = match result {
                Ok(resp) if resp.status().is_success() => {
                    let json: Value = resp
                        .json()
                        .await
                        .map_err(|e| LlmError::ParseError(e.to_string()))?;
                    let (text, tokens) = extract(&json);
                    let Some(text) = text else {
                        return Err(LlmError::ParseError(format!(
                            "{provider} response carried no text"
                        )));
                    };
                    debug!(provider, latency_ms, tokens, "LLM call complete");
                    return Ok(LlmResponse {
                        text: text.trim().to_string(),
                        tokens_generated: u32::try_from(tokens).unwrap_or(u32::MAX),
                        latency_ms,
                        model: self.model.clone(),
                    });
                }
                Ok(resp) => LlmError::Http {
                    status: resp.status().as_u16(),
                    body: resp.text().await.unwrap_or_default(),
                },
                Err(e) if e.is_timeout() => LlmError::Timeout(request.timeout_ms),
                Err(e) => LlmError::from(e),
            };

            warn!(provider, attempt = attempt + 1, error = %err, "LLM call failed");
            let retry = err.is_transient();
            last_error = err;
            if !retry {
                return Err(last_error);
            }
        }

        if self.max_retries == 0 {
            return Err(last_error);
        }
        Err(LlmError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last_error: last_error.to_string(),
        })
    }

    /// Generate a character sheet for a new NPC.
    ///
    /// Never fails: any backend or parse error yields
    /// [`PersonalityData::fallback`].
    pub async fn generate_personality(&self, description: &str) -> PersonalityData {
        let request = LlmRequest::structured(prompt::personality_prompt(description))
            .with_timeout(self.timeout_ms.max(15_000));
        let parsed = match self.generate(&request).await {
            Ok(resp) => parse_personality(&resp.text),
            Err(e) => Err(e),
        };
        match parsed {
            Ok(sheet) => {
                info!(name = %sheet.name, traits = sheet.traits.len(), "personality generated");
                sheet
            }
            Err(e) => {
                warn!(error = %e, description, "personality generation failed, using fallback");
                PersonalityData::fallback(description)
            }
        }
    }
}

#[async_trait]
impl DialogueClient for LlmClient {
    async fn generate_dialogue(
        &self,
        personality_context: &str,
        recent_history: &[String],
        latest_message: &str,
    ) -> Result<String, LlmError> {
        let (system, user) =
            prompt::dialogue_prompt(personality_context, recent_history, latest_message);
        let request = LlmRequest::dialogue(system, user)
            .with_sampling(self.temperature, self.max_tokens)
            .with_timeout(self.timeout_ms);
        let response = self.generate(&request).await?;
        if response.text.is_empty() {
            return Err(LlmError::ParseError("empty dialogue reply".into()));
        }
        Ok(response.text)
    }
}

#[derive(Clone, Copy)]
enum Auth<'a> {
    Bearer(&'a str),
    GoogKey(&'a str),
    None,
}

fn gemini_text(json: &Value) -> (Option<&str>, u64) {
    (
        json["candidates"][0]["content"]["parts"][0]["text"].as_str(),
        json["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0),
    )
}

fn openai_text(json: &Value) -> (Option<&str>, u64) {
    (
        json["choices"][0]["message"]["content"].as_str(),
        json["usage"]["completion_tokens"].as_u64().unwrap_or(0),
    )
}

fn ollama_text(json: &Value) -> (Option<&str>, u64) {
    (
        json["response"].as_str(),
        json["eval_count"].as_u64().unwrap_or(0),
    )
}

/// Parse a personality sheet out of a free-form reply.
///
/// # Errors
/// `ParseError` when no JSON object is present, it does not match the
/// sheet shape, or the name is blank.
pub fn parse_personality(text: &str) -> Result<PersonalityData, LlmError> {
    let raw = prompt::extract_json(text)
        .ok_or_else(|| LlmError::ParseError(format!("no JSON object in reply: '{text}'")))?;
    let sheet: PersonalityData = serde_json::from_str(raw)
        .map_err(|e| LlmError::ParseError(format!("JSON parse error: {e}")))?;
    if sheet.name.trim().is_empty() {
        return Err(LlmError::ParseError("personality has no name".into()));
    }
    Ok(sheet)
}
