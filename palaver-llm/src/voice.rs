//! Speech synthesis backends, voice selection, and distance attenuation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::LlmError;

/// Stock voices. A speaker always maps to the same entry.
pub const VOICE_IDS: &[&str] = &[
    "21m00Tcm4TlvDq8ikWAM",
    "AZnzlk1XvdvUeBnXmlld",
    "EXAVITQu4vr4xnSDxMaL",
    "ErXwobaYiN019PkySvjV",
    "MF3mGyEYCl7XYWbV9V6O",
    "TxGEqnHWrfWFTfGW9XjX",
    "VR6AewLTigWG4xSOukaG",
    "pNInz6obpgDQGcFmaJgB",
    "yoZ06aMxZJJ28mfd3POQ",
];

/// Pick a stable voice for a speaker id.
///
/// 31-multiplier string hash over UTF-16 units with 32-bit wraparound, so
/// ids keep the voices they had in earlier builds.
#[must_use]
pub fn voice_for_speaker(speaker_id: &str) -> &'static str {
    let hash = speaker_id.encode_utf16().fold(0i32, |h, unit| {
        h.wrapping_shl(5).wrapping_sub(h).wrapping_add(i32::from(unit))
    });
    let len = VOICE_IDS.len() as u64;
    let index = i64::from(hash).unsigned_abs() % len;
    VOICE_IDS[usize::try_from(index).unwrap_or(0)]
}

/// Playback volume for a line.
///
/// Foreground lines play at full volume. Background lines are full inside
/// `near`, silent beyond `far`, and fall off linearly between.
#[must_use]
pub fn volume_for(distance: f32, near: f32, far: f32, foreground: bool) -> f32 {
    if foreground || distance <= near {
        return 1.0;
    }
    if distance >= far || far <= near {
        return 0.0;
    }
    (1.0 - (distance - near) / (far - near)).clamp(0.0, 1.0)
}

/// Synthesized audio ready for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// Who is speaking.
    pub speaker_id: String,
    /// The line that was voiced.
    pub text: String,
    /// Encoded audio (MPEG).
    pub bytes: Vec<u8>,
    /// Playback volume in `[0, 1]`.
    pub volume: f32,
    /// Whether the line belongs to the player's conversation.
    pub foreground: bool,
}

/// Where finished clips go. Playback itself is out of scope here.
pub trait AudioSink: Send + Sync {
    /// Hand a clip to the output device.
    fn play(&self, clip: AudioClip);
}

/// A sink that only logs what it would play.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl AudioSink for LoggingSink {
    fn play(&self, clip: AudioClip) {
        info!(
            speaker = %clip.speaker_id,
            bytes = clip.bytes.len(),
            volume = clip.volume,
            foreground = clip.foreground,
            "voice clip ready"
        );
    }
}

/// A remote text-to-speech service.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Render `text` with `voice_id`.
    ///
    /// # Errors
    /// `Unauthorized` when the key is rejected; other failures as usual.
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, LlmError>;
}

/// A voice offered by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceInfo {
    /// Service voice id.
    pub voice_id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize)]
struct VoiceList {
    #[serde(default)]
    voices: Vec<VoiceInfo>,
}

/// ElevenLabs text-to-speech over HTTP.
pub struct ElevenLabsBackend {
    http: Client,
    base_url: String,
    api_key: String,
    model_id: String,
    timeout: Duration,
}

impl ElevenLabsBackend {
    /// Create a backend.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model_id: model_id.into(),
            timeout: Duration::from_secs(20),
        }
    }

    /// Voices available to this key.
    ///
    /// # Errors
    /// `Unauthorized`, `Http`, or transport errors.
    pub async fn list_voices(&self) -> Result<Vec<VoiceInfo>, LlmError> {
        let resp = self
            .http
            .get(format!("{}/voices", self.base_url))
            .header("xi-api-key", &self.api_key)
            .timeout(self.timeout)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let list: VoiceList = resp
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;
        Ok(list.voices)
    }

    /// Whether the key works and at least one voice is available.
    pub async fn test_connection(&self) -> bool {
        match self.list_voices().await {
            Ok(voices) => !voices.is_empty(),
            Err(e) => {
                debug!(error = %e, "speech connection test failed");
                false
            }
        }
    }
}

#[async_trait]
impl SpeechBackend for ElevenLabsBackend {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, LlmError> {
        let body = json!({
            "text": text,
            "model_id": self.model_id,
            "voice_settings": { "stability": 0.5, "similarity_boost": 0.5 },
        });
        let resp = self
            .http
            .post(format!("{}/text-to-speech/{voice_id}", self.base_url))
            .header("Accept", "audio/mpeg")
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    match resp.status() {
        s if s.is_success() => Ok(resp),
        StatusCode::UNAUTHORIZED => Err(LlmError::Unauthorized),
        s => Err(LlmError::Http {
            status: s.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        }),
    }
}
