//! NPC records, handshake status and the NPC registry.
//!
//! An [`NpcRecord`] is created at scene start (or when the user spawns one)
//! and lives until an explicit despawn. Its dialogue log is append-only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PalaverError, Result};
use crate::spatial::Wander;
use crate::types::{ActorId, Millis, NpcId};

// ---------------------------------------------------------------------------
// Handshake status
// ---------------------------------------------------------------------------

/// Where an NPC stands in the NPC↔NPC handshake protocol.
///
/// Every non-idle variant names the partner, and the partner's own status
/// names this NPC back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandshakeStatus {
    /// Free to start or receive a request.
    #[default]
    Idle,
    /// Asked `partner` to talk and is waiting for an answer.
    Requesting {
        /// The NPC that was asked.
        partner: NpcId,
    },
    /// Was asked by `partner` and must answer before `deadline`.
    Requested {
        /// The NPC that asked.
        partner: NpcId,
        /// Request timeout.
        deadline: Millis,
        /// Outcome of the acceptance draw, once made.
        decision: Option<bool>,
    },
    /// Talking with `partner`.
    Conversing {
        /// The other speaker.
        partner: NpcId,
    },
    /// The request failed; both return to idle at `reset_at`.
    Rejected {
        /// The other NPC of the failed request.
        partner: NpcId,
        /// When both reset to idle.
        reset_at: Millis,
    },
}

impl HandshakeStatus {
    /// The partner named by this status, if any.
    #[must_use]
    pub fn partner(&self) -> Option<&NpcId> {
        match self {
            Self::Idle => None,
            Self::Requesting { partner }
            | Self::Requested { partner, .. }
            | Self::Conversing { partner }
            | Self::Rejected { partner, .. } => Some(partner),
        }
    }

    /// Whether the NPC is idle.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Short label for logs and UI.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Requesting { .. } => "requesting",
            Self::Requested { .. } => "requested",
            Self::Conversing { .. } => "conversing",
            Self::Rejected { .. } => "rejected",
        }
    }
}

// ---------------------------------------------------------------------------
// Transient UI state
// ---------------------------------------------------------------------------

/// Per-NPC overlay state the renderer mirrors.
///
/// Cleared as a unit, so teardown is exhaustive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransientUi {
    /// "is typing…" indicator while a reply is pending.
    pub typing: bool,
    /// Text of the most recent speech bubble.
    pub bubble: Option<String>,
    /// Chat-active lock indicator while the player talks to this NPC.
    pub chat_lock: bool,
    /// Brief rejection signal after a failed handshake.
    pub rejection: bool,
}

impl TransientUi {
    /// Drop every overlay.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// NPC record
// ---------------------------------------------------------------------------

/// Everything the scene knows about one NPC apart from its position.
#[derive(Debug, Clone)]
pub struct NpcRecord {
    /// Stable identifier.
    pub id: NpcId,
    /// Display name.
    pub name: String,
    /// Short description ("brave warrior").
    pub description: String,
    /// Free-form personality prompt fragment.
    pub personality: String,
    /// Trait keywords.
    pub traits: Vec<String>,
    /// Append-only log of exchanged lines.
    pub dialogue: Vec<String>,
    /// Current movement intent.
    pub wander: Wander,
    /// Handshake protocol state.
    pub handshake: HandshakeStatus,
    /// Earliest time this NPC may initiate a handshake.
    pub cooldown_until: Millis,
    /// Overlay state.
    pub ui: TransientUi,
}

impl NpcRecord {
    /// Create a record with empty dialogue and an idle handshake.
    #[must_use]
    pub fn new(
        id: NpcId,
        name: impl Into<String>,
        description: impl Into<String>,
        personality: impl Into<String>,
        traits: Vec<String>,
        speed: f32,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            description: description.into(),
            personality: personality.into(),
            traits,
            dialogue: Vec::new(),
            wander: Wander::new(speed),
            handshake: HandshakeStatus::Idle,
            cooldown_until: 0,
            ui: TransientUi::default(),
        }
    }

    /// Actor id of this NPC.
    #[must_use]
    pub fn actor(&self) -> ActorId {
        ActorId::Npc(self.id.clone())
    }

    /// Append a line to the dialogue log.
    pub fn record_line(&mut self, line: impl Into<String>) {
        self.dialogue.push(line.into());
    }

    /// Snapshot for the persisted archive.
    #[must_use]
    pub fn to_record(&self) -> DialogueRecord {
        DialogueRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            personality: self.personality.clone(),
            traits: self.traits.clone(),
            dialogue: self.dialogue.clone(),
        }
    }
}

/// Derive a display name from a description: the capitalised first word,
/// or `"NPC"` for single-word descriptions.
#[must_use]
pub fn name_from_description(description: &str) -> String {
    let mut words = description.split_whitespace();
    match (words.next(), words.next()) {
        (Some(first), Some(_)) => {
            let mut chars = first.chars();
            chars.next().map_or_else(String::new, |c| {
                c.to_uppercase().chain(chars).collect::<String>()
            })
        }
        _ => "NPC".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Persisted record
// ---------------------------------------------------------------------------

/// Flat, serializable view of an NPC's identity and dialogue log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueRecord {
    /// NPC id.
    pub id: NpcId,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Personality text.
    pub personality: String,
    /// Trait keywords.
    #[serde(default)]
    pub traits: Vec<String>,
    /// Dialogue lines.
    #[serde(default)]
    pub dialogue: Vec<String>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All NPC records, keyed by id.
///
/// Backed by a `BTreeMap` so iteration order (and with it every
/// "first match wins" scan) is the ascending id order.
#[derive(Debug, Clone, Default)]
pub struct NpcRegistry {
    npcs: BTreeMap<NpcId, NpcRecord>,
}

impl NpcRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn insert(&mut self, record: NpcRecord) {
        self.npcs.insert(record.id.clone(), record);
    }

    /// Remove a record.
    pub fn remove(&mut self, id: &NpcId) -> Option<NpcRecord> {
        self.npcs.remove(id)
    }

    /// Read a record.
    #[must_use]
    pub fn get(&self, id: &NpcId) -> Option<&NpcRecord> {
        self.npcs.get(id)
    }

    /// Mutate a record.
    pub fn get_mut(&mut self, id: &NpcId) -> Option<&mut NpcRecord> {
        self.npcs.get_mut(id)
    }

    /// Read a record or fail with `NotFound`.
    ///
    /// # Errors
    /// `NotFound` if the id is unknown.
    pub fn require(&self, id: &NpcId) -> Result<&NpcRecord> {
        self.npcs
            .get(id)
            .ok_or_else(|| PalaverError::NotFound(ActorId::Npc(id.clone())))
    }

    /// Mutate a record or fail with `NotFound`.
    ///
    /// # Errors
    /// `NotFound` if the id is unknown.
    pub fn require_mut(&mut self, id: &NpcId) -> Result<&mut NpcRecord> {
        self.npcs
            .get_mut(id)
            .ok_or_else(|| PalaverError::NotFound(ActorId::Npc(id.clone())))
    }

    /// Whether the id is registered.
    #[must_use]
    pub fn contains(&self, id: &NpcId) -> bool {
        self.npcs.contains_key(id)
    }

    /// Number of NPCs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.npcs.len()
    }

    /// Whether there are no NPCs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.npcs.is_empty()
    }

    /// Ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<NpcId> {
        self.npcs.keys().cloned().collect()
    }

    /// Records in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &NpcRecord> {
        self.npcs.values()
    }

    /// Mutable records in ascending id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NpcRecord> {
        self.npcs.values_mut()
    }

    /// Check the handshake symmetry invariant.
    ///
    /// Returns the first NPC whose partner does not point back at it.
    #[must_use]
    pub fn find_asymmetric_handshake(&self) -> Option<NpcId> {
        self.npcs.values().find_map(|npc| {
            let partner = npc.handshake.partner()?;
            let back = self.npcs.get(partner).and_then(|p| p.handshake.partner());
            (back != Some(&npc.id)).then(|| npc.id.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> NpcRecord {
        NpcRecord::new(
            NpcId::from(id),
            "Ada",
            "cautious scholar",
            "A cautious scholar who loves knowledge",
            vec!["curious".into()],
            40.0,
        )
    }

    #[test]
    fn name_derivation() {
        assert_eq!(name_from_description("brave warrior"), "Brave");
        assert_eq!(name_from_description("hermit"), "NPC");
        assert_eq!(name_from_description(""), "NPC");
    }

    #[test]
    fn symmetry_check_catches_one_sided_partner() {
        let mut reg = NpcRegistry::new();
        let mut a = record("a");
        let b = record("b");
        a.handshake = HandshakeStatus::Requesting {
            partner: NpcId::from("b"),
        };
        reg.insert(a);
        reg.insert(b);
        assert_eq!(reg.find_asymmetric_handshake(), Some(NpcId::from("a")));

        reg.require_mut(&NpcId::from("b"))
            .expect("b exists")
            .handshake = HandshakeStatus::Requested {
            partner: NpcId::from("a"),
            deadline: 3000,
            decision: None,
        };
        assert_eq!(reg.find_asymmetric_handshake(), None);
    }

    #[test]
    fn record_snapshot_round_trips_through_json() {
        let mut npc = record("a");
        npc.record_line("User: hi");
        let json = serde_json::to_string(&npc.to_record()).expect("serialize");
        let back: DialogueRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.dialogue, vec!["User: hi".to_string()]);
        assert_eq!(back.id, NpcId::from("a"));
    }
}
