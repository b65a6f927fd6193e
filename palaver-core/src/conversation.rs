//! Conversation engine: the turn-by-turn dialogue exchange protocol.
//!
//! One protocol shape serves both NPC↔NPC and player↔NPC conversations:
//!
//! 1. An opening line is picked from a template pool (never generated).
//! 2. Each later NPC turn is emitted as a [`DialogueRequest`] carrying a
//!    [`TurnToken`]. While the request is out the conversation is
//!    `AwaitingReply` for that speaker and nobody else may speak for them.
//! 3. [`ConversationEngine::apply_reply`] accepts the reply only if the
//!    token still matches; anything else is a stale response.
//! 4. Once the speaker's counter reaches `max_messages` the conversation
//!    ends after `end_delay_ms`.
//!
//! A generation failure ends the conversation immediately with no retry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::admission::ActiveConversationSet;
use crate::config::ConversationConfig;
use crate::error::{PalaverError, Result};
use crate::npc::{HandshakeStatus, NpcRecord, NpcRegistry};
use crate::personality::{self, GENERATION_FALLBACK_LINE};
use crate::types::{ActorId, ConversationId, Millis, NpcId};

/// Speaker label used for player lines in history and NPC logs.
pub const PLAYER_LABEL: &str = "User";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Identifies one outstanding generation request.
///
/// A reply is applied only if its token equals the conversation's current
/// `AwaitingReply` token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TurnToken {
    /// Conversation the turn belongs to.
    pub conversation: ConversationId,
    /// Monotonic turn number within the conversation.
    pub turn: u32,
    /// NPC expected to speak.
    pub speaker: NpcId,
}

/// Who takes part in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationKind {
    /// Two NPCs, initiator first.
    NpcPair {
        /// NPC that asked.
        initiator: NpcId,
        /// NPC that accepted.
        target: NpcId,
    },
    /// The player and one NPC.
    Player {
        /// The NPC the player is talking to.
        npc: NpcId,
    },
}

impl ConversationKind {
    /// Participants in speaking order of the opening.
    #[must_use]
    pub fn participants(&self) -> Vec<ActorId> {
        match self {
            Self::NpcPair { initiator, target } => {
                vec![ActorId::Npc(initiator.clone()), ActorId::Npc(target.clone())]
            }
            Self::Player { npc } => vec![ActorId::Npc(npc.clone()), ActorId::Player],
        }
    }

    /// NPC participants.
    #[must_use]
    pub fn npcs(&self) -> Vec<&NpcId> {
        match self {
            Self::NpcPair { initiator, target } => vec![initiator, target],
            Self::Player { npc } => vec![npc],
        }
    }

    /// The other participant.
    #[must_use]
    pub fn partner_of(&self, actor: &ActorId) -> Option<ActorId> {
        match (self, actor) {
            (Self::NpcPair { initiator, target }, ActorId::Npc(id)) if id == initiator => {
                Some(ActorId::Npc(target.clone()))
            }
            (Self::NpcPair { initiator, target }, ActorId::Npc(id)) if id == target => {
                Some(ActorId::Npc(initiator.clone()))
            }
            (Self::Player { npc }, ActorId::Player) => Some(ActorId::Npc(npc.clone())),
            (Self::Player { npc }, ActorId::Npc(id)) if id == npc => Some(ActorId::Player),
            _ => None,
        }
    }

    /// Whether the player takes part.
    #[must_use]
    pub fn involves_player(&self) -> bool {
        matches!(self, Self::Player { .. })
    }
}

/// Who is expected to act next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// `speaker` takes the next turn at `at`.
    Scheduled {
        /// NPC due to speak.
        speaker: NpcId,
        /// When the turn is issued.
        at: Millis,
    },
    /// A generation request for `token.speaker` is in flight.
    AwaitingReply {
        /// The outstanding request.
        token: TurnToken,
    },
    /// Waiting for the player to submit a line.
    AwaitingPlayer,
    /// The message bound was reached; closes at `at`.
    Ending {
        /// When the conversation closes.
        at: Millis,
    },
}

/// Live state of one conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    /// Identifier.
    pub id: ConversationId,
    /// Participants.
    pub kind: ConversationKind,
    /// Per-speaker message bound, drawn at start.
    pub max_messages: u32,
    /// Shared history in speaking order.
    pub history: Vec<String>,
    /// Next expected action.
    pub phase: Phase,
    /// When the conversation started.
    pub started_at: Millis,
    counts: BTreeMap<ActorId, u32>,
    last_text: String,
    turn: u32,
}

impl Conversation {
    /// Lines contributed by `actor` so far.
    #[must_use]
    pub fn count_of(&self, actor: &ActorId) -> u32 {
        self.counts.get(actor).copied().unwrap_or(0)
    }

    /// Highest per-speaker count.
    #[must_use]
    pub fn max_count(&self) -> u32 {
        self.counts.values().copied().max().unwrap_or(0)
    }

    fn bump(&mut self, actor: &ActorId) -> u32 {
        let count = self.counts.entry(actor.clone()).or_insert(0);
        *count += 1;
        *count
    }
}

/// Everything a dialogue backend needs to produce one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueRequest {
    /// Token to hand back with the reply.
    pub token: TurnToken,
    /// Speaker and listener descriptions.
    pub personality_context: String,
    /// Most recent history lines, oldest first.
    pub recent_history: Vec<String>,
    /// The line being answered.
    pub latest_message: String,
}

/// Why a conversation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The message bound was reached.
    Completed,
    /// The dialogue backend failed.
    GenerationFailed,
    /// The player cancelled.
    Cancelled,
    /// The player walked away and the grace period ran out.
    PlayerLeft,
    /// A participant was despawned.
    Despawned,
    /// A participant could not be found when its turn came.
    Aborted,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::GenerationFailed => "generation_failed",
            Self::Cancelled => "cancelled",
            Self::PlayerLeft => "player_left",
            Self::Despawned => "despawned",
            Self::Aborted => "aborted",
        })
    }
}

/// One line said aloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// Conversation it belongs to.
    pub conversation: ConversationId,
    /// Who said it.
    pub speaker: ActorId,
    /// Display name of the speaker.
    pub speaker_name: String,
    /// The words, without any speaker prefix.
    pub text: String,
    /// Whether this is the player's conversation.
    pub foreground: bool,
    /// Whether the line entered the conversation history.
    pub recorded: bool,
}

/// Summary of a finished conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndedConversation {
    /// Identifier.
    pub id: ConversationId,
    /// Participants.
    pub kind: ConversationKind,
    /// Why it ended.
    pub reason: EndReason,
    /// Lines exchanged.
    pub history_len: usize,
}

/// Things the engine did that the scene should surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    /// A conversation began.
    Started {
        /// Identifier.
        conversation: ConversationId,
        /// Participants.
        kind: ConversationKind,
    },
    /// A line was said.
    Spoke(Utterance),
    /// An NPC's typing indicator changed.
    Typing {
        /// The NPC.
        npc: NpcId,
        /// Whether it is now typing.
        active: bool,
    },
    /// A conversation ended.
    Ended(EndedConversation),
}

// ---------------------------------------------------------------------------
// Prompt context
// ---------------------------------------------------------------------------

/// Describe speaker and listener for a generation prompt.
///
/// `listener` is `None` when the speaker is answering the player.
#[must_use]
pub fn personality_context(speaker: &NpcRecord, listener: Option<&NpcRecord>) -> String {
    let mut context = format!(
        "You are {}, a {}. Personality: {}.",
        speaker.name, speaker.description, speaker.personality
    );
    if !speaker.traits.is_empty() {
        context.push_str(&format!(" Traits: {}.", speaker.traits.join(", ")));
    }
    match listener {
        Some(other) => context.push_str(&format!(
            "\nYou are talking with {}, a {}. Their personality: {}.",
            other.name, other.description, other.personality
        )),
        None => context.push_str("\nYou are talking with a traveler who walked up to you."),
    }
    context
}

fn quoted_line(name: &str, text: &str) -> String {
    format!("{name}: \"{text}\"")
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives every active conversation.
#[derive(Debug, Clone)]
pub struct ConversationEngine {
    config: ConversationConfig,
    cooldown: (Millis, Millis),
    admission: ActiveConversationSet,
    conversations: BTreeMap<ConversationId, Conversation>,
    used_greetings: BTreeMap<(NpcId, NpcId), BTreeSet<usize>>,
    next_id: u64,
    outbox: Vec<ConversationEvent>,
}

impl ConversationEngine {
    /// Create an engine. `cooldown` is the range NPCs draw a fresh
    /// handshake cooldown from when one of their conversations ends.
    #[must_use]
    pub fn new(config: &ConversationConfig, cooldown: (Millis, Millis)) -> Self {
        Self {
            config: config.clone(),
            cooldown,
            admission: ActiveConversationSet::new(config.max_concurrent),
            conversations: BTreeMap::new(),
            used_greetings: BTreeMap::new(),
            next_id: 1,
            outbox: Vec::new(),
        }
    }

    /// Admission control state.
    #[must_use]
    pub fn admission(&self) -> &ActiveConversationSet {
        &self.admission
    }

    /// A live conversation.
    #[must_use]
    pub fn get(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations.get(&id)
    }

    /// Live conversations in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }

    /// Number of live conversations.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.conversations.len()
    }

    /// Conversation `actor` takes part in, if any.
    #[must_use]
    pub fn conversation_of(&self, actor: &ActorId) -> Option<ConversationId> {
        self.conversations
            .values()
            .find(|c| c.kind.partner_of(actor).is_some())
            .map(|c| c.id)
    }

    /// Whether `actor` takes part in a live conversation.
    #[must_use]
    pub fn is_engaged(&self, actor: &ActorId) -> bool {
        self.admission.is_engaged(actor)
    }

    /// Take every event produced since the last drain.
    pub fn drain_events(&mut self) -> Vec<ConversationEvent> {
        std::mem::take(&mut self.outbox)
    }

    fn allocate_id(&mut self) -> ConversationId {
        let id = ConversationId(self.next_id);
        self.next_id += 1;
        id
    }

    fn draw_max_messages<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        rng.gen_range(self.config.max_messages_min..=self.config.max_messages_max)
    }

    /// Pick a greeting for the ordered pair, avoiding ones it already used.
    /// When every template has been used the pair's history resets.
    fn pick_greeting<R: Rng + ?Sized>(
        &mut self,
        initiator: &NpcRecord,
        target: &NpcRecord,
        rng: &mut R,
    ) -> String {
        let pool = personality::greeting_pool(&initiator.personality);
        let used = self
            .used_greetings
            .entry((initiator.id.clone(), target.id.clone()))
            .or_default();
        let mut fresh: Vec<usize> = (0..pool.len()).filter(|i| !used.contains(i)).collect();
        if fresh.is_empty() {
            debug!(initiator = %initiator.id, target = %target.id, "greeting pool exhausted, allowing repeats");
            used.clear();
            fresh = (0..pool.len()).collect();
        }
        let index = fresh.choose(rng).copied().unwrap_or(0);
        used.insert(index);
        pool.get(index)
            .map_or_else(String::new, |t| personality::render_line(t, &target.name))
    }

    // -----------------------------------------------------------------------
    // Starting
    // -----------------------------------------------------------------------

    /// Start an NPC↔NPC conversation and say the opening greeting.
    ///
    /// Both NPCs become `Conversing` with each other. The target answers
    /// after `first_reply_delay_ms`.
    ///
    /// # Errors
    /// `NotFound` for unknown NPCs, `InvalidTransition` if either is already
    /// engaged elsewhere, `AdmissionRejected` when at capacity.
    pub fn start_npc_conversation<R: Rng + ?Sized>(
        &mut self,
        npcs: &mut NpcRegistry,
        initiator: &NpcId,
        target: &NpcId,
        now: Millis,
        rng: &mut R,
    ) -> Result<ConversationId> {
        if initiator == target {
            return Err(PalaverError::InvalidTransition(format!(
                "{initiator} cannot talk to itself"
            )));
        }
        let a = npcs.require(initiator)?.clone();
        let b = npcs.require(target)?.clone();
        for (npc, other) in [(&a, target), (&b, initiator)] {
            if self.is_engaged(&npc.actor()) {
                return Err(PalaverError::InvalidTransition(format!(
                    "{} is already in a conversation",
                    npc.id
                )));
            }
            if npc.handshake.partner().is_some_and(|p| p != other) {
                return Err(PalaverError::InvalidTransition(format!(
                    "{} is negotiating with someone else",
                    npc.id
                )));
            }
        }

        let id = ConversationId(self.next_id);
        let kind = ConversationKind::NpcPair {
            initiator: initiator.clone(),
            target: target.clone(),
        };
        self.admission.admit(id, kind.participants())?;
        self.allocate_id();

        let greeting = self.pick_greeting(&a, &b, rng);
        let line = quoted_line(&a.name, &greeting);
        let mut conversation = Conversation {
            id,
            kind: kind.clone(),
            max_messages: self.draw_max_messages(rng),
            history: vec![line.clone()],
            phase: Phase::Scheduled {
                speaker: target.clone(),
                at: now + self.config.first_reply_delay_ms,
            },
            started_at: now,
            counts: BTreeMap::new(),
            last_text: greeting.clone(),
            turn: 0,
        };
        conversation.bump(&a.actor());

        {
            let rec = npcs.require_mut(initiator)?;
            rec.handshake = HandshakeStatus::Conversing {
                partner: target.clone(),
            };
            rec.record_line(line.clone());
            rec.ui.bubble = Some(greeting.clone());
        }
        {
            let rec = npcs.require_mut(target)?;
            rec.handshake = HandshakeStatus::Conversing {
                partner: initiator.clone(),
            };
            rec.record_line(line);
        }

        info!(
            conversation = %id,
            initiator = %initiator,
            target = %target,
            max_messages = conversation.max_messages,
            "npc conversation started"
        );
        self.conversations.insert(id, conversation);
        self.outbox.push(ConversationEvent::Started {
            conversation: id,
            kind,
        });
        self.outbox.push(ConversationEvent::Spoke(Utterance {
            conversation: id,
            speaker: a.actor(),
            speaker_name: a.name,
            text: greeting,
            foreground: false,
            recorded: true,
        }));
        Ok(id)
    }

    /// Start a player↔NPC conversation with the NPC's intro line.
    ///
    /// # Errors
    /// `NotFound` for an unknown NPC, `InvalidTransition` if the NPC or the
    /// player is busy, `AdmissionRejected` when at capacity.
    pub fn start_player_conversation<R: Rng + ?Sized>(
        &mut self,
        npcs: &mut NpcRegistry,
        npc: &NpcId,
        now: Millis,
        rng: &mut R,
    ) -> Result<ConversationId> {
        let record = npcs.require(npc)?;
        if self.is_engaged(&ActorId::Player) {
            return Err(PalaverError::InvalidTransition(
                "player is already in a conversation".into(),
            ));
        }
        if self.is_engaged(&record.actor()) || !record.handshake.is_idle() {
            return Err(PalaverError::InvalidTransition(format!(
                "{npc} is busy ({})",
                record.handshake.label()
            )));
        }

        let id = ConversationId(self.next_id);
        let kind = ConversationKind::Player { npc: npc.clone() };
        self.admission.admit(id, kind.participants())?;
        self.allocate_id();

        let intro = personality::intro_pool(&record.personality)
            .choose(rng)
            .map_or_else(|| personality::random_fallback(rng).to_string(), |s| (*s).to_string());
        let name = record.name.clone();
        let line = quoted_line(&name, &intro);

        let mut conversation = Conversation {
            id,
            kind: kind.clone(),
            max_messages: self.draw_max_messages(rng),
            history: vec![line.clone()],
            phase: Phase::AwaitingPlayer,
            started_at: now,
            counts: BTreeMap::new(),
            last_text: intro.clone(),
            turn: 0,
        };
        conversation.bump(&ActorId::Npc(npc.clone()));

        let rec = npcs.require_mut(npc)?;
        rec.record_line(line);
        rec.ui.chat_lock = true;
        rec.ui.bubble = Some(intro.clone());

        info!(conversation = %id, npc = %npc, max_messages = conversation.max_messages, "player conversation started");
        self.conversations.insert(id, conversation);
        self.outbox.push(ConversationEvent::Started {
            conversation: id,
            kind,
        });
        self.outbox.push(ConversationEvent::Spoke(Utterance {
            conversation: id,
            speaker: ActorId::Npc(npc.clone()),
            speaker_name: name,
            text: intro,
            foreground: true,
            recorded: true,
        }));
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Turns
    // -----------------------------------------------------------------------

    /// Record the player's line and request the NPC's answer.
    ///
    /// # Errors
    /// `InvalidTransition` when the player has no conversation, the NPC is
    /// still answering, or the message is blank. `NotFound` if the NPC
    /// vanished.
    pub fn submit_player_message(
        &mut self,
        npcs: &mut NpcRegistry,
        text: &str,
        _now: Millis,
    ) -> Result<DialogueRequest> {
        let message = text.trim();
        if message.is_empty() {
            return Err(PalaverError::InvalidTransition("empty message".into()));
        }
        let id = self
            .conversation_of(&ActorId::Player)
            .ok_or_else(|| PalaverError::InvalidTransition("player is not talking".into()))?;
        let (npc, phase) = match self.conversations.get(&id) {
            Some(c) => match &c.kind {
                ConversationKind::Player { npc } => (npc.clone(), c.phase.clone()),
                ConversationKind::NpcPair { .. } => {
                    return Err(PalaverError::InvalidTransition(
                        "player conversation expected".into(),
                    ));
                }
            },
            None => return Err(PalaverError::StaleResponse(id)),
        };
        if phase != Phase::AwaitingPlayer {
            return Err(PalaverError::InvalidTransition(format!(
                "{npc} is still answering"
            )));
        }
        npcs.require(&npc)?;

        let line = format!("{PLAYER_LABEL}: {message}");
        if let Some(conversation) = self.conversations.get_mut(&id) {
            conversation.history.push(line.clone());
            conversation.last_text = message.to_string();
            conversation.bump(&ActorId::Player);
        }
        npcs.require_mut(&npc)?.record_line(line);
        self.outbox.push(ConversationEvent::Spoke(Utterance {
            conversation: id,
            speaker: ActorId::Player,
            speaker_name: PLAYER_LABEL.to_string(),
            text: message.to_string(),
            foreground: true,
            recorded: true,
        }));
        debug!(conversation = %id, npc = %npc, "player message submitted");
        self.issue_request(npcs, id, &npc)
    }

    fn issue_request(
        &mut self,
        npcs: &mut NpcRegistry,
        id: ConversationId,
        speaker: &NpcId,
    ) -> Result<DialogueRequest> {
        let conversation = self
            .conversations
            .get(&id)
            .ok_or(PalaverError::StaleResponse(id))?;
        let speaker_rec = npcs.require(speaker)?;
        let listener = conversation
            .kind
            .partner_of(&speaker_rec.actor())
            .ok_or_else(|| PalaverError::InvalidTransition(format!("{speaker} is not in {id}")))?;
        let personality_context = match &listener {
            ActorId::Npc(other) => personality_context(speaker_rec, Some(npcs.require(other)?)),
            ActorId::Player => personality_context(speaker_rec, None),
        };
        let window = self.config.history_window;
        let start = conversation.history.len().saturating_sub(window);
        let recent_history = conversation.history[start..].to_vec();
        let latest_message = conversation.last_text.clone();

        let Some(conversation) = self.conversations.get_mut(&id) else {
            return Err(PalaverError::StaleResponse(id));
        };
        conversation.turn += 1;
        let token = TurnToken {
            conversation: id,
            turn: conversation.turn,
            speaker: speaker.clone(),
        };
        conversation.phase = Phase::AwaitingReply {
            token: token.clone(),
        };

        npcs.require_mut(speaker)?.ui.typing = true;
        self.outbox.push(ConversationEvent::Typing {
            npc: speaker.clone(),
            active: true,
        });
        debug!(conversation = %id, speaker = %speaker, turn = token.turn, "dialogue requested");
        Ok(DialogueRequest {
            token,
            personality_context,
            recent_history,
            latest_message,
        })
    }

    /// Advance timers: issue due turns and close finished conversations.
    ///
    /// Returns the generation requests to dispatch.
    pub fn tick<R: Rng + ?Sized>(
        &mut self,
        npcs: &mut NpcRegistry,
        now: Millis,
        rng: &mut R,
    ) -> Vec<DialogueRequest> {
        let due: Vec<(ConversationId, Phase)> = self
            .conversations
            .values()
            .filter_map(|c| match &c.phase {
                Phase::Scheduled { at, .. } | Phase::Ending { at } if *at <= now => {
                    Some((c.id, c.phase.clone()))
                }
                _ => None,
            })
            .collect();

        let mut requests = Vec::new();
        for (id, phase) in due {
            match phase {
                Phase::Scheduled { speaker, .. } => match self.issue_request(npcs, id, &speaker) {
                    Ok(request) => requests.push(request),
                    Err(err) => {
                        warn!(conversation = %id, speaker = %speaker, error = %err, "turn could not be issued");
                        self.end_conversation(npcs, id, EndReason::Aborted, now, rng);
                    }
                },
                Phase::Ending { .. } => {
                    self.end_conversation(npcs, id, EndReason::Completed, now, rng);
                }
                Phase::AwaitingReply { .. } | Phase::AwaitingPlayer => {}
            }
        }
        requests
    }

    /// Apply the outcome of a generation request.
    ///
    /// On success the reply is appended and the partner's turn (or the
    /// end) is scheduled. On failure the conversation ends at once; in a
    /// player conversation the NPC first says a fixed fallback line that
    /// is not recorded in history.
    ///
    /// # Errors
    /// `StaleResponse` if the conversation is gone or the token no longer
    /// matches. Nothing is mutated in that case.
    pub fn apply_reply<E, R>(
        &mut self,
        npcs: &mut NpcRegistry,
        token: &TurnToken,
        outcome: std::result::Result<String, E>,
        now: Millis,
        rng: &mut R,
    ) -> Result<()>
    where
        E: fmt::Display,
        R: Rng + ?Sized,
    {
        let id = token.conversation;
        let current = self.conversations.get(&id).map(|c| &c.phase);
        if !matches!(current, Some(Phase::AwaitingReply { token: t }) if t == token) {
            debug!(conversation = %id, speaker = %token.speaker, turn = token.turn, "stale reply discarded");
            return Err(PalaverError::StaleResponse(id));
        }

        if let Some(rec) = npcs.get_mut(&token.speaker) {
            rec.ui.typing = false;
        }
        self.outbox.push(ConversationEvent::Typing {
            npc: token.speaker.clone(),
            active: false,
        });

        let reply = match outcome {
            Ok(text) => text.trim().to_string(),
            Err(err) => {
                warn!(conversation = %id, speaker = %token.speaker, error = %err, "dialogue generation failed");
                self.fail_turn(npcs, token, now, rng);
                return Ok(());
            }
        };
        if reply.is_empty() {
            warn!(conversation = %id, speaker = %token.speaker, "empty reply treated as failure");
            self.fail_turn(npcs, token, now, rng);
            return Ok(());
        }

        let speaker_rec = npcs.require(&token.speaker)?;
        let speaker_actor = speaker_rec.actor();
        let name = speaker_rec.name.clone();
        let line = quoted_line(&name, &reply);

        let (kind, count, max) = {
            let Some(conversation) = self.conversations.get_mut(&id) else {
                return Err(PalaverError::StaleResponse(id));
            };
            conversation.history.push(line.clone());
            conversation.last_text.clone_from(&reply);
            let count = conversation.bump(&speaker_actor);
            (conversation.kind.clone(), count, conversation.max_messages)
        };

        for npc in kind.npcs() {
            if let Some(rec) = npcs.get_mut(npc) {
                rec.record_line(line.clone());
            }
        }
        if let Some(rec) = npcs.get_mut(&token.speaker) {
            rec.ui.bubble = Some(reply.clone());
        }
        self.outbox.push(ConversationEvent::Spoke(Utterance {
            conversation: id,
            speaker: speaker_actor.clone(),
            speaker_name: name,
            text: reply,
            foreground: kind.involves_player(),
            recorded: true,
        }));

        let next = if count >= max {
            Phase::Ending {
                at: now + self.config.end_delay_ms,
            }
        } else {
            match kind.partner_of(&speaker_actor) {
                Some(ActorId::Npc(partner)) => Phase::Scheduled {
                    speaker: partner,
                    at: now
                        + rng.gen_range(self.config.turn_delay_min_ms..self.config.turn_delay_max_ms),
                },
                _ => Phase::AwaitingPlayer,
            }
        };
        debug!(conversation = %id, count, max, next = ?next, "reply applied");
        if let Some(conversation) = self.conversations.get_mut(&id) {
            conversation.phase = next;
        }
        Ok(())
    }

    fn fail_turn<R: Rng + ?Sized>(
        &mut self,
        npcs: &mut NpcRegistry,
        token: &TurnToken,
        now: Millis,
        rng: &mut R,
    ) {
        let id = token.conversation;
        let is_player = self
            .conversations
            .get(&id)
            .is_some_and(|c| c.kind.involves_player());
        if is_player {
            let name = npcs
                .get(&token.speaker)
                .map_or_else(|| token.speaker.to_string(), |r| r.name.clone());
            self.outbox.push(ConversationEvent::Spoke(Utterance {
                conversation: id,
                speaker: ActorId::Npc(token.speaker.clone()),
                speaker_name: name,
                text: GENERATION_FALLBACK_LINE.to_string(),
                foreground: true,
                recorded: false,
            }));
        }
        self.end_conversation(npcs, id, EndReason::GenerationFailed, now, rng);
    }

    // -----------------------------------------------------------------------
    // Ending
    // -----------------------------------------------------------------------

    /// Tear a conversation down. Idempotent: returns `None` if it is
    /// already gone.
    ///
    /// NPC participants return to `Idle` with their overlays cleared and a
    /// fresh handshake cooldown, and the admission slot is released.
    pub fn end_conversation<R: Rng + ?Sized>(
        &mut self,
        npcs: &mut NpcRegistry,
        id: ConversationId,
        reason: EndReason,
        now: Millis,
        rng: &mut R,
    ) -> Option<EndedConversation> {
        let conversation = self.conversations.remove(&id)?;
        self.admission.release(id);

        let (lo, hi) = self.cooldown;
        for npc in conversation.kind.npcs() {
            if let Some(rec) = npcs.get_mut(npc) {
                rec.handshake = HandshakeStatus::Idle;
                rec.ui.clear();
                rec.cooldown_until = now + rng.gen_range(lo..=hi.max(lo));
            }
        }

        let ended = EndedConversation {
            id,
            kind: conversation.kind,
            reason,
            history_len: conversation.history.len(),
        };
        info!(conversation = %id, reason = %reason, lines = ended.history_len, "conversation ended");
        self.outbox.push(ConversationEvent::Ended(ended.clone()));
        Some(ended)
    }

    /// End whatever conversation `actor` is in.
    pub fn end_for_actor<R: Rng + ?Sized>(
        &mut self,
        npcs: &mut NpcRegistry,
        actor: &ActorId,
        reason: EndReason,
        now: Millis,
        rng: &mut R,
    ) -> Option<EndedConversation> {
        let id = self.conversation_of(actor)?;
        self.end_conversation(npcs, id, reason, now, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn registry() -> NpcRegistry {
        let mut reg = NpcRegistry::new();
        reg.insert(NpcRecord::new(
            NpcId::from("a"),
            "Brom",
            "brave warrior",
            "A brave warrior",
            vec![],
            40.0,
        ));
        reg.insert(NpcRecord::new(
            NpcId::from("b"),
            "Ada",
            "cautious scholar",
            "A cautious scholar",
            vec![],
            40.0,
        ));
        reg.insert(NpcRecord::new(
            NpcId::from("n"),
            "Nell",
            "cheerful merchant",
            "A cheerful merchant",
            vec![],
            40.0,
        ));
        reg
    }

    fn engine() -> ConversationEngine {
        ConversationEngine::new(&ConversationConfig::default(), (10_000, 20_000))
    }

    fn id(s: &str) -> NpcId {
        NpcId::from(s)
    }

    #[test]
    fn npc_conversation_runs_to_completion() {
        let mut reg = registry();
        let mut eng = engine();
        let mut rng = StdRng::seed_from_u64(1);
        let conv = eng
            .start_npc_conversation(&mut reg, &id("a"), &id("b"), 0, &mut rng)
            .expect("started");
        let max = eng.get(conv).expect("live").max_messages;
        assert!((3..=5).contains(&max));
        assert_eq!(reg.get(&id("a")).expect("a").dialogue.len(), 1);
        assert_eq!(reg.get(&id("b")).expect("b").dialogue.len(), 1);

        // Nothing is due before the first reply delay.
        assert!(eng.tick(&mut reg, 1999, &mut rng).is_empty());

        let mut now = 2000;
        let mut turns = 0;
        while eng.get(conv).is_some() {
            let requests = eng.tick(&mut reg, now, &mut rng);
            for req in requests {
                turns += 1;
                eng.apply_reply(&mut reg, &req.token, Ok::<_, String>("Indeed.".into()), now, &mut rng)
                    .expect("fresh token");
            }
            now += 500;
            assert!(now < 60_000, "conversation never ended");
        }

        let history_len = reg.get(&id("a")).expect("a").dialogue.len();
        assert_eq!(history_len, 1 + turns);
        for npc in ["a", "b"] {
            let rec = reg.get(&id(npc)).expect("present");
            assert!(rec.handshake.is_idle());
            assert_eq!(rec.ui, crate::npc::TransientUi::default());
            assert!(rec.cooldown_until >= now.saturating_sub(500) + 10_000);
        }
        assert!(eng.admission().is_empty());
    }

    #[test]
    fn turns_alternate_and_respect_bound() {
        let mut reg = registry();
        let mut eng = engine();
        let mut rng = StdRng::seed_from_u64(9);
        let conv = eng
            .start_npc_conversation(&mut reg, &id("a"), &id("b"), 0, &mut rng)
            .expect("started");
        let mut expected = id("b");
        let mut now = 0;
        loop {
            now += 100;
            for req in eng.tick(&mut reg, now, &mut rng) {
                assert_eq!(req.token.speaker, expected);
                expected = if expected == id("a") { id("b") } else { id("a") };
                eng.apply_reply(&mut reg, &req.token, Ok::<_, String>("Yes.".into()), now, &mut rng)
                    .expect("applied");
                if let Some(c) = eng.get(conv) {
                    assert!(c.max_count() <= c.max_messages);
                }
            }
            if eng.get(conv).is_none() {
                break;
            }
        }
    }

    #[test]
    fn failure_ends_once_and_late_reply_is_stale() {
        let mut reg = registry();
        let mut eng = engine();
        let mut rng = StdRng::seed_from_u64(2);
        let conv = eng
            .start_npc_conversation(&mut reg, &id("a"), &id("b"), 0, &mut rng)
            .expect("started");
        let req = eng.tick(&mut reg, 2000, &mut rng).pop().expect("b's turn");
        eng.apply_reply(&mut reg, &req.token, Err::<String, _>("timeout"), 2100, &mut rng)
            .expect("failure handled");

        assert!(eng.get(conv).is_none());
        let ended = eng
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, ConversationEvent::Ended(_)))
            .count();
        assert_eq!(ended, 1);
        assert!(reg.get(&id("a")).expect("a").handshake.is_idle());
        assert!(reg.get(&id("b")).expect("b").handshake.is_idle());

        let late = eng.apply_reply(&mut reg, &req.token, Ok::<_, String>("late".into()), 5000, &mut rng);
        assert!(matches!(late, Err(PalaverError::StaleResponse(_))));
        assert!(eng.tick(&mut reg, 10_000, &mut rng).is_empty());
        assert!(eng.end_conversation(&mut reg, conv, EndReason::Cancelled, 10_000, &mut rng).is_none());
    }

    #[test]
    fn player_reply_appends_and_counts() {
        let mut reg = registry();
        let mut eng = engine();
        let mut rng = StdRng::seed_from_u64(3);
        let conv = eng
            .start_player_conversation(&mut reg, &id("n"), 0, &mut rng)
            .expect("started");
        let req = eng
            .submit_player_message(&mut reg, "Hello", 100)
            .expect("submitted");
        assert_eq!(req.latest_message, "Hello");
        assert!(reg.get(&id("n")).expect("n").ui.typing);

        // A second message while the NPC is answering is refused.
        assert!(matches!(
            eng.submit_player_message(&mut reg, "Anyone?", 150),
            Err(PalaverError::InvalidTransition(_))
        ));

        let before = eng.get(conv).expect("live").count_of(&ActorId::Npc(id("n")));
        eng.apply_reply(&mut reg, &req.token, Ok::<_, String>("Greetings, traveler.".into()), 200, &mut rng)
            .expect("applied");
        let c = eng.get(conv).expect("still live");
        assert_eq!(c.history.last().map(String::as_str), Some("Nell: \"Greetings, traveler.\""));
        assert_eq!(c.count_of(&ActorId::Npc(id("n"))), before + 1);
        assert_eq!(c.phase, Phase::AwaitingPlayer);
        let log = &reg.get(&id("n")).expect("n").dialogue;
        assert_eq!(log[1], "User: Hello");
        assert_eq!(log[2], "Nell: \"Greetings, traveler.\"");
    }

    #[test]
    fn player_failure_says_fallback_then_ends() {
        let mut reg = registry();
        let mut eng = engine();
        let mut rng = StdRng::seed_from_u64(4);
        eng.start_player_conversation(&mut reg, &id("n"), 0, &mut rng)
            .expect("started");
        let req = eng.submit_player_message(&mut reg, "Hi", 10).expect("submitted");
        eng.drain_events();
        eng.apply_reply(&mut reg, &req.token, Err::<String, _>("503"), 20, &mut rng)
            .expect("handled");
        let events = eng.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            ConversationEvent::Spoke(u) if u.text == GENERATION_FALLBACK_LINE && !u.recorded
        )));
        assert!(matches!(events.last(), Some(ConversationEvent::Ended(e)) if e.reason == EndReason::GenerationFailed));
        // The fallback line never reaches the NPC log.
        assert!(
            !reg.get(&id("n"))
                .expect("n")
                .dialogue
                .iter()
                .any(|l| l.contains(GENERATION_FALLBACK_LINE))
        );
    }

    #[test]
    fn greeting_pool_resets_when_exhausted() {
        let mut reg = registry();
        let mut eng = engine();
        let mut rng = StdRng::seed_from_u64(5);
        let pool = personality::greeting_pool("A brave warrior").len();
        let mut seen = BTreeSet::new();
        for round in 0..(pool + 2) {
            let now = (round as u64) * 100_000;
            let conv = eng
                .start_npc_conversation(&mut reg, &id("a"), &id("b"), now, &mut rng)
                .expect("started");
            seen.insert(eng.get(conv).expect("live").history[0].clone());
            eng.end_conversation(&mut reg, conv, EndReason::Cancelled, now, &mut rng);
            if round + 1 == pool {
                assert_eq!(seen.len(), pool, "first pass uses every template once");
            }
        }
    }

    #[test]
    fn busy_npcs_cannot_be_double_booked() {
        let mut reg = registry();
        let mut eng = engine();
        let mut rng = StdRng::seed_from_u64(6);
        eng.start_npc_conversation(&mut reg, &id("a"), &id("b"), 0, &mut rng)
            .expect("started");
        assert!(matches!(
            eng.start_player_conversation(&mut reg, &id("a"), 0, &mut rng),
            Err(PalaverError::InvalidTransition(_))
        ));
        assert!(matches!(
            eng.start_npc_conversation(&mut reg, &id("n"), &id("b"), 0, &mut rng),
            Err(PalaverError::InvalidTransition(_))
        ));
    }

    #[test]
    fn prompt_embeds_both_profiles_and_window() {
        let mut reg = registry();
        let mut eng = engine();
        let mut rng = StdRng::seed_from_u64(7);
        eng.start_npc_conversation(&mut reg, &id("a"), &id("b"), 0, &mut rng)
            .expect("started");
        let req = eng.tick(&mut reg, 2000, &mut rng).pop().expect("turn");
        assert!(req.personality_context.contains("You are Ada"));
        assert!(req.personality_context.contains("talking with Brom"));
        assert_eq!(req.recent_history.len(), 1);
    }
}
