//! Core type definitions shared by every Palaver component.
//!
//! All identity and spatial types are serializable so the scene can persist
//! and restore them between sessions.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Simulation time in milliseconds since the scene started.
///
/// The core never reads a wall clock; every time-dependent operation takes
/// the current `Millis` as an argument so the state machines stay
/// deterministic under test.
pub type Millis = u64;

// ---------------------------------------------------------------------------
// Identity Types
// ---------------------------------------------------------------------------

/// Unique, stable identifier for an NPC.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NpcId(pub String);

impl NpcId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier for a user-spawned NPC.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("npc_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NpcId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Any actor in the scene: the singleton player or one of the NPCs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ActorId {
    /// The player-controlled avatar.
    Player,
    /// A non-player character.
    Npc(NpcId),
}

impl ActorId {
    /// The NPC id, if this actor is an NPC.
    #[must_use]
    pub fn as_npc(&self) -> Option<&NpcId> {
        match self {
            Self::Npc(id) => Some(id),
            Self::Player => None,
        }
    }
}

impl From<NpcId> for ActorId {
    fn from(id: NpcId) -> Self {
        Self::Npc(id)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Player => f.write_str("player"),
            Self::Npc(id) => write!(f, "{id}"),
        }
    }
}

/// Identifier of one conversation, unique for the lifetime of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub u64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conv#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Spatial
// ---------------------------------------------------------------------------

/// A 2D position in world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate.
    pub x: f32,
    /// Y coordinate.
    pub y: f32,
}

impl Position {
    /// Create a position.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another position.
    #[must_use]
    pub fn distance_to(self, other: Self) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Translate by a delta.
    #[must_use]
    pub fn offset(self, dx: f32, dy: f32) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1}, {:.1})", self.x, self.y)
    }
}

/// Axis-aligned world bounds, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Minimum X.
    pub min_x: f32,
    /// Minimum Y.
    pub min_y: f32,
    /// Maximum X.
    pub max_x: f32,
    /// Maximum Y.
    pub max_y: f32,
}

impl Bounds {
    /// Bounds spanning `[0, width] x [0, height]`.
    #[must_use]
    pub const fn sized(width: f32, height: f32) -> Self {
        Self {
            min_x: 0.0,
            min_y: 0.0,
            max_x: width,
            max_y: height,
        }
    }

    /// Shrink the bounds by `margin` on every side.
    #[must_use]
    pub fn inset(self, margin: f32) -> Self {
        Self {
            min_x: self.min_x + margin,
            min_y: self.min_y + margin,
            max_x: (self.max_x - margin).max(self.min_x + margin),
            max_y: (self.max_y - margin).max(self.min_y + margin),
        }
    }

    /// Whether a position lies within the bounds.
    #[must_use]
    pub fn contains(&self, p: Position) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    /// Clamp a position into the bounds.
    #[must_use]
    pub fn clamp(&self, p: Position) -> Position {
        Position::new(
            p.x.clamp(self.min_x, self.max_x),
            p.y.clamp(self.min_y, self.max_y),
        )
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self::sized(1200.0, 800.0)
    }
}
