//! # Palaver Core Library
//!
//! Game-agnostic coordination logic for characters that talk: to the
//! player, and to each other.
//!
//! - [`spatial`]: positions, collision avoidance, proximity queries, wandering
//! - [`handshake`]: how two idle NPCs agree to start a conversation
//! - [`conversation`]: the turn-by-turn exchange protocol and its teardown
//! - [`player`]: the player's idle/approaching/talking/exiting machine
//! - [`chat_input`]: keystroke capture while talking
//! - [`admission`]: the concurrent conversation cap
//!
//! ## Determinism
//!
//! Nothing here reads a clock or owns a random source. Time is passed in as
//! [`Millis`] and randomness as `&mut impl Rng`, so a seeded scene replays
//! identically.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod admission;
pub mod chat_input;
pub mod config;
pub mod conversation;
pub mod error;
pub mod handshake;
pub mod npc;
pub mod persistence;
pub mod personality;
pub mod player;
pub mod roster;
pub mod spatial;
pub mod types;

pub use config::PalaverConfig;
pub use error::PalaverError;
pub use npc::{NpcRecord, NpcRegistry};
pub use types::*;
