//! Player interaction state machine.
//!
//! ```text
//!   Idle ──near N──▶ Approaching(N) ──talk(N)──▶ Talking(N)
//!    ▲                   │                        │   ▲
//!    └──── left range ───┘              left range│   │back in range
//!                                                 ▼   │
//!                                             Exiting(N) ──grace over──▶ Idle
//! ```
//!
//! The machine only holds state and reports [`PlayerEffect`]s. The scene
//! applies them: ending conversations, closing the chat surface, emitting
//! interaction events.

use tracing::debug;

use crate::admission::ActiveConversationSet;
use crate::config::PlayerConfig;
use crate::conversation::EndReason;
use crate::error::{PalaverError, Result};
use crate::types::{ConversationId, Millis, NpcId};

/// The player's conversational state. A partner exists in every variant
/// except `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlayerMode {
    /// Not near anyone.
    #[default]
    Idle,
    /// Within proximity of `npc`.
    Approaching {
        /// NPC being approached.
        npc: NpcId,
        /// Informational entry delay deadline.
        entry_deadline: Millis,
    },
    /// In conversation with `npc`.
    Talking {
        /// Conversation partner.
        npc: NpcId,
        /// The conversation.
        conversation: ConversationId,
    },
    /// Walked out of range mid-conversation; ends at `grace_deadline`.
    Exiting {
        /// Conversation partner.
        npc: NpcId,
        /// The conversation.
        conversation: ConversationId,
        /// When the conversation is torn down.
        grace_deadline: Millis,
    },
}

impl PlayerMode {
    /// The partner NPC, if any.
    #[must_use]
    pub fn partner(&self) -> Option<&NpcId> {
        match self {
            Self::Idle => None,
            Self::Approaching { npc, .. } | Self::Talking { npc, .. } | Self::Exiting { npc, .. } => {
                Some(npc)
            }
        }
    }

    /// The player's conversation, if any.
    #[must_use]
    pub fn conversation(&self) -> Option<ConversationId> {
        match self {
            Self::Talking { conversation, .. } | Self::Exiting { conversation, .. } => {
                Some(*conversation)
            }
            Self::Idle | Self::Approaching { .. } => None,
        }
    }

    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Approaching { .. } => "approaching",
            Self::Talking { .. } => "talking",
            Self::Exiting { .. } => "exiting",
        }
    }
}

/// Something the scene must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEffect {
    /// The player is newly approaching `npc`.
    Approached(NpcId),
    /// The player started talking to `npc`.
    Engaged(NpcId),
    /// The player is no longer interacting with `npc`; close the chat surface.
    Released(NpcId),
    /// Tear down the player's conversation.
    EndConversation {
        /// Which conversation.
        conversation: ConversationId,
        /// Why.
        reason: EndReason,
    },
    /// The player walked away; the conversation survives until `deadline`.
    GraceStarted {
        /// Partner.
        npc: NpcId,
        /// Grace expiry.
        deadline: Millis,
    },
    /// The player came back in time.
    GraceCancelled(NpcId),
}

/// Owns the single [`PlayerMode`].
#[derive(Debug, Clone)]
pub struct PlayerInteractionStateMachine {
    config: PlayerConfig,
    mode: PlayerMode,
}

impl PlayerInteractionStateMachine {
    /// Start idle.
    #[must_use]
    pub fn new(config: &PlayerConfig) -> Self {
        Self {
            config: config.clone(),
            mode: PlayerMode::Idle,
        }
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> &PlayerMode {
        &self.mode
    }

    /// Proximity radius the scene should query with.
    #[must_use]
    pub fn proximity_radius(&self) -> f32 {
        self.config.proximity_radius
    }

    /// Whether movement input must be ignored.
    #[must_use]
    pub fn movement_locked(&self) -> bool {
        matches!(self.mode, PlayerMode::Talking { .. })
    }

    /// Whether chat input should be captured.
    #[must_use]
    pub fn is_talking(&self) -> bool {
        matches!(self.mode, PlayerMode::Talking { .. })
    }

    fn set(&mut self, mode: PlayerMode) {
        if self.mode != mode {
            debug!(from = self.mode.label(), to = mode.label(), partner = ?mode.partner(), "player mode changed");
        }
        self.mode = mode;
    }

    /// Feed this tick's proximity observation.
    ///
    /// `nearest` is the closest NPC within the proximity radius;
    /// `partner_in_range` says whether the current partner (if any) is
    /// still within it.
    pub fn update_proximity(
        &mut self,
        now: Millis,
        nearest: Option<&NpcId>,
        partner_in_range: bool,
    ) -> Vec<PlayerEffect> {
        let mut effects = Vec::new();
        match self.mode.clone() {
            PlayerMode::Idle => {
                if let Some(npc) = nearest {
                    self.approach(npc, now, &mut effects);
                }
            }
            PlayerMode::Approaching { npc, .. } => match nearest {
                None => {
                    effects.push(PlayerEffect::Released(npc));
                    self.set(PlayerMode::Idle);
                }
                Some(other) if *other != npc => {
                    effects.push(PlayerEffect::Released(npc));
                    self.approach(other, now, &mut effects);
                }
                Some(_) => {}
            },
            PlayerMode::Talking { npc, conversation } => {
                if !partner_in_range {
                    let deadline = now + self.config.exit_grace_ms;
                    effects.push(PlayerEffect::GraceStarted {
                        npc: npc.clone(),
                        deadline,
                    });
                    self.set(PlayerMode::Exiting {
                        npc,
                        conversation,
                        grace_deadline: deadline,
                    });
                }
            }
            PlayerMode::Exiting {
                npc,
                conversation,
                grace_deadline,
            } => {
                if partner_in_range {
                    effects.push(PlayerEffect::GraceCancelled(npc.clone()));
                    self.set(PlayerMode::Talking { npc, conversation });
                } else if let Some(other) = nearest.filter(|o| **o != npc) {
                    effects.push(PlayerEffect::EndConversation {
                        conversation,
                        reason: EndReason::PlayerLeft,
                    });
                    effects.push(PlayerEffect::Released(npc));
                    self.approach(other, now, &mut effects);
                } else if now >= grace_deadline {
                    effects.push(PlayerEffect::EndConversation {
                        conversation,
                        reason: EndReason::PlayerLeft,
                    });
                    effects.push(PlayerEffect::Released(npc));
                    self.set(PlayerMode::Idle);
                }
            }
        }
        effects
    }

    fn approach(&mut self, npc: &NpcId, now: Millis, effects: &mut Vec<PlayerEffect>) {
        effects.push(PlayerEffect::Approached(npc.clone()));
        self.set(PlayerMode::Approaching {
            npc: npc.clone(),
            entry_deadline: now + self.config.entry_delay_ms,
        });
    }

    /// Check whether `talk(npc)` may proceed. Never mutates.
    ///
    /// # Errors
    /// `InvalidTransition` unless approaching `npc`; `AdmissionRejected`
    /// when no conversation slot is free.
    pub fn check_talk(&self, npc: &NpcId, admission: &ActiveConversationSet) -> Result<()> {
        match &self.mode {
            PlayerMode::Approaching { npc: current, .. } if current == npc => admission.check(),
            PlayerMode::Talking { .. } | PlayerMode::Exiting { .. } => Err(
                PalaverError::InvalidTransition("already in a conversation".into()),
            ),
            _ => Err(PalaverError::InvalidTransition(format!(
                "not approaching {npc}"
            ))),
        }
    }

    /// Enter `Talking` once the conversation has been started.
    ///
    /// # Errors
    /// `InvalidTransition` unless approaching `npc`.
    pub fn enter_talking(
        &mut self,
        npc: &NpcId,
        conversation: ConversationId,
    ) -> Result<Vec<PlayerEffect>> {
        match &self.mode {
            PlayerMode::Approaching { npc: current, .. } if current == npc => {
                self.set(PlayerMode::Talking {
                    npc: npc.clone(),
                    conversation,
                });
                Ok(vec![PlayerEffect::Engaged(npc.clone())])
            }
            other => Err(PalaverError::InvalidTransition(format!(
                "cannot start talking from {}",
                other.label()
            ))),
        }
    }

    /// Any-state cancel. Always lands in `Idle`.
    pub fn cancel(&mut self) -> Vec<PlayerEffect> {
        let mut effects = Vec::new();
        if let Some(conversation) = self.mode.conversation() {
            effects.push(PlayerEffect::EndConversation {
                conversation,
                reason: EndReason::Cancelled,
            });
        }
        if let Some(npc) = self.mode.partner() {
            effects.push(PlayerEffect::Released(npc.clone()));
        }
        self.set(PlayerMode::Idle);
        effects
    }

    /// The engine ended `conversation` on its own (bound reached, failure,
    /// despawn). Returns to `Idle` if it was the player's.
    pub fn conversation_ended(&mut self, conversation: ConversationId) -> Vec<PlayerEffect> {
        if self.mode.conversation() != Some(conversation) {
            return Vec::new();
        }
        let effects = self
            .mode
            .partner()
            .map(|npc| vec![PlayerEffect::Released(npc.clone())])
            .unwrap_or_default();
        self.set(PlayerMode::Idle);
        effects
    }

    /// The partner NPC was despawned.
    pub fn npc_removed(&mut self, npc: &NpcId) -> Vec<PlayerEffect> {
        if self.mode.partner() == Some(npc) {
            self.cancel()
        } else {
            Vec::new()
        }
    }
}
