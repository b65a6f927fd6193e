//! # palaver-llm: Remote Generation Layer for Palaver
//!
//! Everything that leaves the process lives here:
//!   - **Dialogue generation** behind the [`DialogueClient`] trait, backed by
//!     Gemini, an OpenAI-compatible API, or a local Ollama
//!   - **Personality generation** for user-spawned NPCs, with a
//!     deterministic fallback when the backend is unreachable
//!   - **Speech synthesis** through a single-worker, rate-limited
//!     [`VoiceQueue`]
//!
//! Nothing in this crate knows about the world tick. Failures are reported
//! as [`LlmError`] and the caller decides what a failure means for the
//! conversation.

pub mod client;
pub mod error;
pub mod prompt;
pub mod queue;
pub mod types;
pub mod voice;

pub use client::{DialogueClient, LlmClient, LlmProvider};
pub use error::LlmError;
pub use queue::{VoiceQueue, VoiceSettings};
pub use types::{LlmRequest, LlmResponse, PersonalityData};
pub use voice::{AudioClip, AudioSink, ElevenLabsBackend, LoggingSink, SpeechBackend};
