//! # palaver-scene: Scene Controller for Palaver
//!
//! Wires the game-agnostic `palaver-core` components into one scene:
//!
//! ```text
//!   commands ──▶ ┌──────────────── World ────────────────┐ ──▶ SceneEvents
//!  (talk, keys)  │ SpatialField · HandshakeCoordinator    │
//!                │ ConversationEngine · Player machine    │ ──▶ VoiceQueue
//!                └───────────────┬────────────────────────┘
//!                                │ DialogueRequest   ▲ reply
//!                                ▼                   │
//!                         SceneRuntime (tokio) ── DialogueClient
//! ```
//!
//! - `world`: the synchronous tick and the command surface
//! - `runtime`: interval ticking and async dialogue dispatch
//! - `events`: the UI-facing event sink
//! - `config`: building clients and the voice queue from configuration

pub mod config;
pub mod events;
pub mod runtime;
pub mod world;

pub use events::{InteractionEvent, InteractionStage, Notice, RecordingEvents, SceneEvent, SceneEvents};
pub use runtime::SceneRuntime;
pub use world::World;
