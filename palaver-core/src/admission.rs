//! Admission control for concurrent conversations.
//!
//! The scene allows a fixed number of conversations at once. Starting one
//! beyond the cap is rejected synchronously, never queued.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{PalaverError, Result};
use crate::types::{ActorId, ConversationId};

/// Active conversations and the actors engaged in them.
#[derive(Debug, Clone)]
pub struct ActiveConversationSet {
    capacity: usize,
    active: BTreeMap<ConversationId, Vec<ActorId>>,
}

impl ActiveConversationSet {
    /// An empty set admitting at most `capacity` conversations.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            active: BTreeMap::new(),
        }
    }

    /// Configured maximum.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of active conversations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether nothing is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Whether another conversation could start right now.
    #[must_use]
    pub fn has_room(&self) -> bool {
        self.active.len() < self.capacity
    }

    /// Fail with `AdmissionRejected` if the set is full. Never mutates.
    ///
    /// # Errors
    /// `AdmissionRejected` when at capacity.
    pub fn check(&self) -> Result<()> {
        if self.has_room() {
            Ok(())
        } else {
            Err(PalaverError::AdmissionRejected {
                active: self.active.len(),
                max: self.capacity,
            })
        }
    }

    /// Register a conversation.
    ///
    /// # Errors
    /// `AdmissionRejected` when at capacity; the set is left unchanged.
    pub fn admit(&mut self, id: ConversationId, participants: Vec<ActorId>) -> Result<()> {
        if self.active.contains_key(&id) {
            return Ok(());
        }
        self.check()?;
        debug!(conversation = %id, active = self.active.len() + 1, "conversation admitted");
        self.active.insert(id, participants);
        Ok(())
    }

    /// Release a conversation's slot. Returns whether it was present.
    pub fn release(&mut self, id: ConversationId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Whether the conversation holds a slot.
    #[must_use]
    pub fn contains(&self, id: ConversationId) -> bool {
        self.active.contains_key(&id)
    }

    /// Whether the actor takes part in any active conversation.
    #[must_use]
    pub fn is_engaged(&self, actor: &ActorId) -> bool {
        self.active.values().any(|p| p.contains(actor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NpcId;

    fn npc(id: &str) -> ActorId {
        ActorId::Npc(NpcId::from(id))
    }

    #[test]
    fn third_conversation_is_rejected_without_mutation() {
        let mut set = ActiveConversationSet::new(2);
        set.admit(ConversationId(1), vec![npc("a"), npc("b")])
            .expect("room");
        set.admit(ConversationId(2), vec![ActorId::Player, npc("c")])
            .expect("room");

        let err = set.admit(ConversationId(3), vec![npc("d"), npc("e")]);
        assert!(matches!(
            err,
            Err(PalaverError::AdmissionRejected { active: 2, max: 2 })
        ));
        assert_eq!(set.len(), 2);
        assert!(!set.is_engaged(&npc("d")));
        assert!(set.contains(ConversationId(1)));
        assert!(set.contains(ConversationId(2)));
    }

    #[test]
    fn release_frees_a_slot() {
        let mut set = ActiveConversationSet::new(1);
        set.admit(ConversationId(1), vec![npc("a")]).expect("room");
        assert!(!set.has_room());
        assert!(set.release(ConversationId(1)));
        assert!(!set.release(ConversationId(1)));
        assert!(set.has_room());
    }

    #[test]
    fn readmitting_same_id_is_a_no_op() {
        let mut set = ActiveConversationSet::new(1);
        set.admit(ConversationId(7), vec![npc("a")]).expect("room");
        set.admit(ConversationId(7), vec![npc("a")]).expect("idempotent");
        assert_eq!(set.len(), 1);
    }
}
