//! Configuration for the Palaver scene.
//!
//! Maps directly to `palaver.toml`. Every timing constant and radius used by
//! the state machines lives here with its default, so a missing section or
//! field always falls back to the reference behaviour.

use serde::{Deserialize, Serialize};

/// Top-level Palaver configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PalaverConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// World geometry, bodies and wandering.
    #[serde(default)]
    pub world: WorldConfig,
    /// NPC↔NPC handshake protocol.
    #[serde(default)]
    pub handshake: HandshakeConfig,
    /// Dialogue exchange protocol.
    #[serde(default)]
    pub conversation: ConversationConfig,
    /// Player interaction state machine.
    #[serde(default)]
    pub player: PlayerConfig,
    /// Voice synthesis and volume falloff.
    #[serde(default)]
    pub voice: VoiceConfig,
    /// Dialogue LLM backend.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Dialogue archive persistence.
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl PalaverConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `PalaverError::Config` if the TOML is invalid or fails validation.
    pub fn from_toml(toml_str: &str) -> crate::error::Result<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| crate::PalaverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Reject ranges that would make the state machines misbehave.
    ///
    /// # Errors
    /// Returns `PalaverError::Config` naming the first offending field.
    pub fn validate(&self) -> crate::error::Result<()> {
        let bad = |msg: &str| Err(crate::PalaverError::Config(msg.to_string()));

        if self.conversation.max_messages_min == 0
            || self.conversation.max_messages_min > self.conversation.max_messages_max
        {
            return bad("conversation.max_messages_min must be in 1..=max_messages_max");
        }
        if self.conversation.turn_delay_min_ms >= self.conversation.turn_delay_max_ms {
            return bad("conversation.turn_delay_min_ms must be below turn_delay_max_ms");
        }
        if self.conversation.max_concurrent == 0 {
            return bad("conversation.max_concurrent must be at least 1");
        }
        if self.handshake.cooldown_min_ms > self.handshake.cooldown_max_ms {
            return bad("handshake.cooldown_min_ms must not exceed cooldown_max_ms");
        }
        if self.world.heading_min_ms > self.world.heading_max_ms {
            return bad("world.heading_min_ms must not exceed heading_max_ms");
        }
        if self.world.initial_npcs_min > self.world.initial_npcs_max {
            return bad("world.initial_npcs_min must not exceed initial_npcs_max");
        }
        if self.voice.near_radius >= self.voice.far_radius {
            return bad("voice.near_radius must be below far_radius");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of the human format.
    #[serde(default)]
    pub json_logs: bool,
    /// Fixed RNG seed for reproducible scenes. `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            seed: None,
        }
    }
}

/// World geometry, actor bodies and NPC wandering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// World width in units.
    #[serde(default = "default_1200")]
    pub width: f32,
    /// World height in units.
    #[serde(default = "default_800")]
    pub height: f32,
    /// Player collision radius.
    #[serde(default = "default_15")]
    pub player_radius: f32,
    /// NPC collision radius.
    #[serde(default = "default_20")]
    pub npc_radius: f32,
    /// Extra gap added to the sum of radii when separating actors.
    #[serde(default = "default_20")]
    pub collision_padding: f32,
    /// Keep-out margin from the world edge for spawning.
    #[serde(default = "default_50")]
    pub spawn_margin: f32,
    /// Samples tried before a spawn gives up.
    #[serde(default = "default_50_u32")]
    pub spawn_attempts: u32,
    /// Player speed in units per second.
    #[serde(default = "default_200")]
    pub player_speed: f32,
    /// NPC wandering speed in units per second.
    #[serde(default = "default_40")]
    pub npc_speed: f32,
    /// Minimum duration of one wandering heading.
    #[serde(default = "default_2000")]
    pub heading_min_ms: u64,
    /// Maximum duration of one wandering heading.
    #[serde(default = "default_5000")]
    pub heading_max_ms: u64,
    /// Collision resolution passes per tick.
    #[serde(default = "default_4_u32")]
    pub collision_passes: u32,
    /// Fewest NPCs in the initial roster.
    #[serde(default = "default_8_usize")]
    pub initial_npcs_min: usize,
    /// Most NPCs in the initial roster.
    #[serde(default = "default_12_usize")]
    pub initial_npcs_max: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            width: 1200.0,
            height: 800.0,
            player_radius: 15.0,
            npc_radius: 20.0,
            collision_padding: 20.0,
            spawn_margin: 50.0,
            spawn_attempts: 50,
            player_speed: 200.0,
            npc_speed: 40.0,
            heading_min_ms: 2000,
            heading_max_ms: 5000,
            collision_passes: 4,
            initial_npcs_min: 8,
            initial_npcs_max: 12,
        }
    }
}

/// NPC↔NPC handshake protocol timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Whether NPCs start conversations with each other at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Distance within which an idle NPC may be asked to talk.
    #[serde(default = "default_80")]
    pub trigger_radius: f32,
    /// Lower bound of the per-NPC interaction cooldown.
    #[serde(default = "default_10000")]
    pub cooldown_min_ms: u64,
    /// Upper bound of the per-NPC interaction cooldown.
    #[serde(default = "default_20000")]
    pub cooldown_max_ms: u64,
    /// How long the target has to accept before the request times out.
    #[serde(default = "default_3000")]
    pub request_timeout_ms: u64,
    /// Delay between a rejection and both NPCs returning to idle.
    #[serde(default = "default_2000")]
    pub reject_reset_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_radius: 80.0,
            cooldown_min_ms: 10_000,
            cooldown_max_ms: 20_000,
            request_timeout_ms: 3000,
            reject_reset_ms: 2000,
        }
    }
}

/// Dialogue exchange protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Smallest per-conversation message bound.
    #[serde(default = "default_3_u32")]
    pub max_messages_min: u32,
    /// Largest per-conversation message bound.
    #[serde(default = "default_5_u32")]
    pub max_messages_max: u32,
    /// Pause after the opening line before the listener answers.
    #[serde(default = "default_2000")]
    pub first_reply_delay_ms: u64,
    /// Lower bound (inclusive) of the pause between turns.
    #[serde(default = "default_2000")]
    pub turn_delay_min_ms: u64,
    /// Upper bound (exclusive) of the pause between turns.
    #[serde(default = "default_4000")]
    pub turn_delay_max_ms: u64,
    /// Pause after the final turn before the conversation closes.
    #[serde(default = "default_3000")]
    pub end_delay_ms: u64,
    /// History lines embedded in each generation prompt.
    #[serde(default = "default_4_usize")]
    pub history_window: usize,
    /// Maximum concurrently active conversations.
    #[serde(default = "default_2_usize")]
    pub max_concurrent: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_messages_min: 3,
            max_messages_max: 5,
            first_reply_delay_ms: 2000,
            turn_delay_min_ms: 2000,
            turn_delay_max_ms: 4000,
            end_delay_ms: 3000,
            history_window: 4,
            max_concurrent: 2,
        }
    }
}

/// Player interaction state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Distance within which the player is "near" an NPC.
    #[serde(default = "default_80")]
    pub proximity_radius: f32,
    /// Informational delay recorded when approaching starts.
    #[serde(default = "default_500")]
    pub entry_delay_ms: u64,
    /// Grace period after leaving proximity mid-conversation.
    #[serde(default = "default_2000")]
    pub exit_grace_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            proximity_radius: 80.0,
            entry_delay_ms: 500,
            exit_grace_ms: 2000,
        }
    }
}

/// Voice synthesis queue and volume falloff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Whether speech synthesis is attempted at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Speech API base URL.
    #[serde(default = "default_voice_url")]
    pub base_url: String,
    /// Speech model identifier.
    #[serde(default = "default_voice_model")]
    pub model_id: String,
    /// Minimum spacing between request starts.
    #[serde(default = "default_1000")]
    pub min_interval_ms: u64,
    /// Pending requests beyond this depth are dropped.
    #[serde(default = "default_16_usize")]
    pub max_queue: usize,
    /// Full volume inside this distance.
    #[serde(default = "default_100")]
    pub near_radius: f32,
    /// Silent beyond this distance.
    #[serde(default = "default_400")]
    pub far_radius: f32,
    /// Multiplier applied to background lines while the player is talking.
    #[serde(default = "default_0_3")]
    pub ducked_volume: f32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_voice_url(),
            model_id: default_voice_model(),
            min_interval_ms: 1000,
            max_queue: 16,
            near_radius: 100.0,
            far_radius: 400.0,
            ducked_volume: 0.3,
        }
    }
}

/// Dialogue LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider: gemini, openai, ollama, none.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Backend base URL.
    #[serde(default = "default_llm_url")]
    pub base_url: String,
    /// Model name.
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature.
    #[serde(default = "default_0_1")]
    pub temperature: f32,
    /// Maximum generated tokens per reply.
    #[serde(default = "default_150")]
    pub max_tokens: u32,
    /// Per-request timeout.
    #[serde(default = "default_10000")]
    pub timeout_ms: u64,
    /// Retries per request. Dialogue fails fast, so this defaults to zero.
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_llm_url(),
            model: default_model(),
            temperature: 0.1,
            max_tokens: 150,
            timeout_ms: 10_000,
            max_retries: 0,
        }
    }
}

/// Dialogue archive persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Whether dialogue records are stored at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Save after every finished conversation.
    #[serde(default = "default_true")]
    pub autosave: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_db_path(),
            autosave: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_provider() -> String { "gemini".to_string() }
fn default_llm_url() -> String { "https://generativelanguage.googleapis.com".to_string() }
fn default_model() -> String { "gemini-2.0-flash".to_string() }
fn default_voice_url() -> String { "https://api.elevenlabs.io/v1".to_string() }
fn default_voice_model() -> String { "eleven_monolingual_v1".to_string() }
fn default_db_path() -> String { "palaver_dialogue.db".to_string() }
fn default_0_1() -> f32 { 0.1 }
fn default_0_3() -> f32 { 0.3 }
fn default_15() -> f32 { 15.0 }
fn default_20() -> f32 { 20.0 }
fn default_40() -> f32 { 40.0 }
fn default_50() -> f32 { 50.0 }
fn default_80() -> f32 { 80.0 }
fn default_100() -> f32 { 100.0 }
fn default_200() -> f32 { 200.0 }
fn default_400() -> f32 { 400.0 }
fn default_800() -> f32 { 800.0 }
fn default_1200() -> f32 { 1200.0 }
fn default_3_u32() -> u32 { 3 }
fn default_4_u32() -> u32 { 4 }
fn default_5_u32() -> u32 { 5 }
fn default_50_u32() -> u32 { 50 }
fn default_150() -> u32 { 150 }
fn default_2_usize() -> usize { 2 }
fn default_4_usize() -> usize { 4 }
fn default_8_usize() -> usize { 8 }
fn default_12_usize() -> usize { 12 }
fn default_16_usize() -> usize { 16 }
fn default_500() -> u64 { 500 }
fn default_1000() -> u64 { 1000 }
fn default_2000() -> u64 { 2000 }
fn default_3000() -> u64 { 3000 }
fn default_4000() -> u64 { 4000 }
fn default_5000() -> u64 { 5000 }
fn default_10000() -> u64 { 10_000 }
fn default_20000() -> u64 { 20_000 }
