//! Scene events: what the surrounding UI is told.
//!
//! The [`World`](crate::world::World) holds one [`SceneEvents`] sink,
//! injected at construction. Every callback fires synchronously from inside
//! a tick or command, in the order things happened.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use palaver_core::conversation::Utterance;
use palaver_core::handshake::HandshakeSignal;
use palaver_core::npc::NpcRecord;
use palaver_core::types::NpcId;

/// How far along the player is with the NPC an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStage {
    /// The player just came within range.
    Approaching,
    /// The player is talking to the NPC.
    Talking,
}

/// Snapshot of an NPC for the interaction panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InteractionEvent {
    /// NPC id.
    pub npc_id: NpcId,
    /// Display name.
    pub name: String,
    /// Short description.
    pub description: String,
    /// Personality text.
    pub personality: String,
    /// Trait keywords.
    pub traits: Vec<String>,
    /// The NPC's dialogue log.
    pub dialogue_history: Vec<String>,
    /// Approaching or talking.
    pub stage: InteractionStage,
}

impl InteractionEvent {
    /// Build from the NPC's current record.
    #[must_use]
    pub fn from_record(record: &NpcRecord, stage: InteractionStage) -> Self {
        Self {
            npc_id: record.id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            personality: record.personality.clone(),
            traits: record.traits.clone(),
            dialogue_history: record.dialogue.clone(),
            stage,
        }
    }
}

/// Transient messages shown to the player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// `talk` refused because every conversation slot is taken.
    ConversationLimit {
        /// Conversations in progress.
        active: usize,
        /// Configured cap.
        max: usize,
    },
    /// The NPC is talking to someone else.
    NpcBusy {
        /// The NPC asked.
        npc: NpcId,
    },
    /// A new NPC could not be placed.
    SpawnFailed {
        /// Why.
        reason: String,
    },
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConversationLimit { max, .. } => {
                write!(f, "Too many conversations going on (max {max}). Try again shortly.")
            }
            Self::NpcBusy { npc } => write!(f, "{npc} is busy talking to someone else."),
            Self::SpawnFailed { reason } => write!(f, "Could not add a character: {reason}"),
        }
    }
}

/// Receives everything the UI needs to render the scene.
pub trait SceneEvents: Send + Sync {
    /// The player is newly approaching, or started talking to, an NPC.
    fn on_interaction_changed(&self, event: InteractionEvent);

    /// The player went back to idle; close any chat surface.
    fn on_chat_closed(&self);

    /// Someone said something.
    fn on_utterance(&self, utterance: &Utterance);

    /// A transient notice for the player.
    fn on_notice(&self, notice: Notice);

    /// A handshake transition between two NPCs.
    fn on_handshake(&self, _signal: &HandshakeSignal) {}

    /// An NPC's typing indicator changed.
    fn on_typing(&self, _npc: &NpcId, _active: bool) {}
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl SceneEvents for TracingEvents {
    fn on_interaction_changed(&self, event: InteractionEvent) {
        info!(npc = %event.npc_id, name = %event.name, stage = ?event.stage, "interaction");
    }

    fn on_chat_closed(&self) {
        info!("chat closed");
    }

    fn on_utterance(&self, utterance: &Utterance) {
        info!(
            conversation = %utterance.conversation,
            speaker = %utterance.speaker_name,
            foreground = utterance.foreground,
            "{}",
            utterance.text
        );
    }

    fn on_notice(&self, notice: Notice) {
        info!(%notice, "notice");
    }

    fn on_handshake(&self, signal: &HandshakeSignal) {
        debug!(?signal, "handshake");
    }
}

/// One recorded callback.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneEvent {
    /// `on_interaction_changed`.
    Interaction(InteractionEvent),
    /// `on_chat_closed`.
    ChatClosed,
    /// `on_utterance`.
    Utterance(Utterance),
    /// `on_notice`.
    Notice(Notice),
    /// `on_handshake`.
    Handshake(HandshakeSignal),
    /// `on_typing`.
    Typing {
        /// The NPC.
        npc: NpcId,
        /// Indicator state.
        active: bool,
    },
}

/// Keeps every callback in order. Used by tests and the demo transcript.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<SceneEvent>>,
}

impl RecordingEvents {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SceneEvent> {
        self.events.lock().clone()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<SceneEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// How many recorded events match.
    pub fn count(&self, pred: impl Fn(&SceneEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: SceneEvent) {
        self.events.lock().push(event);
    }
}

impl SceneEvents for RecordingEvents {
    fn on_interaction_changed(&self, event: InteractionEvent) {
        self.push(SceneEvent::Interaction(event));
    }

    fn on_chat_closed(&self) {
        self.push(SceneEvent::ChatClosed);
    }

    fn on_utterance(&self, utterance: &Utterance) {
        self.push(SceneEvent::Utterance(utterance.clone()));
    }

    fn on_notice(&self, notice: Notice) {
        self.push(SceneEvent::Notice(notice));
    }

    fn on_handshake(&self, signal: &HandshakeSignal) {
        self.push(SceneEvent::Handshake(signal.clone()));
    }

    fn on_typing(&self, npc: &NpcId, active: bool) {
        self.push(SceneEvent::Typing {
            npc: npc.clone(),
            active,
        });
    }
}
