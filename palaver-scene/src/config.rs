//! Wiring configuration into live collaborators.
//!
//! API keys never live in the TOML file; they are read from the
//! environment.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use palaver_core::config::{LlmConfig, VoiceConfig};
use palaver_llm::voice::AudioSink;
use palaver_llm::{ElevenLabsBackend, LlmClient, LlmProvider, VoiceQueue, VoiceSettings};

/// Environment variable holding the Gemini key.
pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";
/// Environment variable holding the OpenAI-compatible key.
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
/// Environment variable holding the ElevenLabs key.
pub const ELEVENLABS_API_KEY: &str = "ELEVENLABS_API_KEY";

/// Secrets for the remote services.
#[derive(Clone, Default)]
pub struct ApiKeys {
    /// Gemini.
    pub gemini: Option<String>,
    /// OpenAI-compatible endpoint.
    pub openai: Option<String>,
    /// ElevenLabs.
    pub elevenlabs: Option<String>,
}

impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeys")
            .field("gemini", &self.gemini.is_some())
            .field("openai", &self.openai.is_some())
            .field("elevenlabs", &self.elevenlabs.is_some())
            .finish()
    }
}

impl ApiKeys {
    /// Read keys from the environment. Blank values count as absent.
    #[must_use]
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            gemini: read(GEMINI_API_KEY),
            openai: read(OPENAI_API_KEY),
            elevenlabs: read(ELEVENLABS_API_KEY),
        }
    }

    fn for_provider(&self, provider: &str) -> Option<String> {
        match provider.to_ascii_lowercase().as_str() {
            "gemini" => self.gemini.clone(),
            "openai" | "openai_compatible" => self.openai.clone(),
            _ => None,
        }
    }
}

/// Build the dialogue client.
///
/// A misconfigured provider degrades to no backend: conversations then end
/// after their first generated turn instead of the scene failing to start.
#[must_use]
pub fn dialogue_client(config: &LlmConfig, keys: &ApiKeys) -> LlmClient {
    match LlmProvider::from_name(
        &config.provider,
        config.base_url.clone(),
        keys.for_provider(&config.provider),
    ) {
        Ok(provider) => {
            info!(provider = provider.label(), model = %config.model, "dialogue backend configured");
            LlmClient::new(provider, config.model.clone(), config.max_retries)
                .with_sampling(config.temperature, config.max_tokens)
                .with_timeout(config.timeout_ms)
        }
        Err(e) => {
            warn!(error = %e, "dialogue backend unavailable, running without one");
            LlmClient::none()
        }
    }
}

/// Queue tuning from configuration.
#[must_use]
pub fn voice_settings(config: &VoiceConfig) -> VoiceSettings {
    VoiceSettings {
        min_interval: Duration::from_millis(config.min_interval_ms),
        max_queue: config.max_queue,
        near_radius: config.near_radius,
        far_radius: config.far_radius,
        ducked_volume: config.ducked_volume,
    }
}

/// Start the voice worker, or return a disabled queue when synthesis is off
/// or no key is set. Must be called inside a tokio runtime when enabled.
#[must_use]
pub fn voice_queue(config: &VoiceConfig, keys: &ApiKeys, sink: Arc<dyn AudioSink>) -> VoiceQueue {
    if !config.enabled {
        info!("voice synthesis disabled by configuration");
        return VoiceQueue::disabled();
    }
    let Some(key) = keys.elevenlabs.clone() else {
        warn!("{ELEVENLABS_API_KEY} not set, voice synthesis disabled");
        return VoiceQueue::disabled();
    };
    let backend = ElevenLabsBackend::new(config.base_url.clone(), key, config.model_id.clone());
    VoiceQueue::spawn(Arc::new(backend), sink, voice_settings(config))
}
