//! Error types for the Palaver core library.

use thiserror::Error;

use crate::types::{ActorId, ConversationId};

/// Top-level error type for all core operations.
#[derive(Error, Debug)]
pub enum PalaverError {
    /// The actor is not tracked by the spatial field or NPC registry.
    #[error("Actor not found: {0}")]
    NotFound(ActorId),

    /// Spawn sampling exhausted its attempts without a free spot.
    #[error("No valid position found after {attempts} attempts")]
    NoValidPosition {
        /// How many samples were tried.
        attempts: u32,
    },

    /// The conversation concurrency cap is reached.
    #[error("Conversation limit reached ({active}/{max} active)")]
    AdmissionRejected {
        /// Conversations currently active.
        active: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The requested state transition is not legal from the current state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A reply arrived for a conversation or turn that no longer exists.
    #[error("Stale response for {0}")]
    StaleResponse(ConversationId),

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for PalaverError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, PalaverError>;
