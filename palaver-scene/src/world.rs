//! The World: one tick that drives every core component.
//!
//! Order within a tick:
//! 1. idle NPCs wander
//! 2. collisions are resolved
//! 3. the player's proximity is observed
//! 4. the handshake protocol runs
//! 5. conversation timers fire
//!
//! Effects are surfaced through the injected [`SceneEvents`] sink as they
//! happen. Generation requests are returned to the caller, which owns the
//! async dispatch and hands replies back through [`World::apply_reply`].

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use palaver_core::chat_input::{ChatInputController, Key, KeyOutcome};
use palaver_core::config::PalaverConfig;
use palaver_core::conversation::{
    ConversationEngine, ConversationEvent, DialogueRequest, EndReason, TurnToken,
};
use palaver_core::error::{PalaverError, Result};
use palaver_core::handshake::HandshakeCoordinator;
use palaver_core::npc::NpcRegistry;
use palaver_core::persistence::{ArchiveStore, DialogueArchive};
use palaver_core::player::{PlayerEffect, PlayerInteractionStateMachine, PlayerMode};
use palaver_core::roster::{self, NpcSpec};
use palaver_core::spatial::SpatialField;
use palaver_core::types::{ActorId, ConversationId, Millis, NpcId, Position};
use palaver_llm::VoiceQueue;

use crate::events::{InteractionEvent, InteractionStage, Notice, SceneEvents};

/// Owns the scene's state. Single-threaded; wrap it in a lock to share.
pub struct World {
    config: PalaverConfig,
    now: Millis,
    rng: StdRng,
    field: SpatialField,
    npcs: NpcRegistry,
    handshake: HandshakeCoordinator,
    engine: ConversationEngine,
    player: PlayerInteractionStateMachine,
    input: ChatInputController,
    events: Arc<dyn SceneEvents>,
    voice: VoiceQueue,
    store: Option<ArchiveStore>,
}

impl World {
    /// An empty scene with the player in the middle.
    ///
    /// Seeded from `general.seed` when set.
    #[must_use]
    pub fn new(config: PalaverConfig, events: Arc<dyn SceneEvents>) -> Self {
        let rng = match config.general.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let start = Position::new(config.world.width / 2.0, config.world.height / 2.0);
        let handshake = HandshakeCoordinator::new(&config.handshake);
        let engine = ConversationEngine::new(
            &config.conversation,
            (config.handshake.cooldown_min_ms, config.handshake.cooldown_max_ms),
        );
        Self {
            field: SpatialField::from_config(&config.world, start),
            npcs: NpcRegistry::new(),
            player: PlayerInteractionStateMachine::new(&config.player),
            input: ChatInputController::new(),
            handshake,
            engine,
            rng,
            now: 0,
            events,
            voice: VoiceQueue::disabled(),
            store: None,
            config,
        }
    }

    /// Voice NPC lines through `voice`.
    #[must_use]
    pub fn with_voice(mut self, voice: VoiceQueue) -> Self {
        self.voice = voice;
        self
    }

    /// Persist dialogue logs to `store`.
    #[must_use]
    pub fn with_store(mut self, store: ArchiveStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Spawn the random starting roster. Returns how many were placed.
    pub fn populate(&mut self) -> usize {
        let ids = roster::populate(&mut self.field, &mut self.npcs, &self.config.world, &mut self.rng);
        for id in &ids {
            self.start_cooldown(id);
        }
        ids.len()
    }

    /// Refill empty dialogue logs from the attached store.
    ///
    /// # Errors
    /// Database or decode errors from the store.
    pub fn restore_dialogue(&mut self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let archive = store.load_archive()?;
        let restored = archive.restore_into(&mut self.npcs);
        info!(restored, stored = archive.len(), "dialogue restored");
        Ok(restored)
    }

    /// Snapshot of every NPC's dialogue log.
    #[must_use]
    pub fn archive(&self) -> DialogueArchive {
        DialogueArchive::from_registry(&self.npcs)
    }

    /// Write every dialogue log to the attached store.
    ///
    /// # Errors
    /// Database errors from the store.
    pub fn save(&mut self) -> Result<usize> {
        let archive = self.archive();
        match &mut self.store {
            Some(store) => {
                store.save_archive(&archive)?;
                Ok(archive.len())
            }
            None => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Scene clock.
    #[must_use]
    pub fn now(&self) -> Millis {
        self.now
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &PalaverConfig {
        &self.config
    }

    /// Actor positions.
    #[must_use]
    pub fn field(&self) -> &SpatialField {
        &self.field
    }

    /// Mutable positions for scripted scenes. Positions written here are
    /// subject to collision resolution on the next tick.
    pub fn field_mut(&mut self) -> &mut SpatialField {
        &mut self.field
    }

    /// NPC records.
    #[must_use]
    pub fn npcs(&self) -> &NpcRegistry {
        &self.npcs
    }

    /// Conversation state.
    #[must_use]
    pub fn engine(&self) -> &ConversationEngine {
        &self.engine
    }

    /// The player's mode.
    #[must_use]
    pub fn player_mode(&self) -> &PlayerMode {
        self.player.mode()
    }

    /// Chat input buffer.
    #[must_use]
    pub fn input(&self) -> &ChatInputController {
        &self.input
    }

    /// Voice output handle.
    #[must_use]
    pub fn voice(&self) -> &VoiceQueue {
        &self.voice
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance the scene by `dt_ms`. Returns generation requests to dispatch.
    pub fn tick(&mut self, dt_ms: Millis) -> Vec<DialogueRequest> {
        self.now += dt_ms;
        let now = self.now;

        self.wander(dt_ms);
        self.field.resolve_collisions();
        self.observe_proximity();

        let signals = self
            .handshake
            .tick(now, &self.field, &mut self.npcs, &mut self.engine, &mut self.rng);
        for signal in &signals {
            self.events.on_handshake(signal);
        }

        let requests = self.engine.tick(&mut self.npcs, now, &mut self.rng);
        self.flush_engine_events();
        requests
    }

    fn wander(&mut self, dt_ms: Millis) {
        let range = (self.config.world.heading_min_ms, self.config.world.heading_max_ms);
        for id in self.npcs.ids() {
            if self.engine.is_engaged(&ActorId::Npc(id.clone())) {
                continue;
            }
            let Some(rec) = self.npcs.get_mut(&id) else {
                continue;
            };
            if !rec.handshake.is_idle() {
                continue;
            }
            if let Err(err) = rec.wander.step(&id, &mut self.field, dt_ms, range, &mut self.rng) {
                warn!(npc = %id, error = %err, "wander step skipped");
            }
        }
    }

    fn observe_proximity(&mut self) {
        let radius = self.player.proximity_radius();
        let nearest = self
            .field
            .nearest_npc(&ActorId::Player, radius, |_| true)
            .map(|(id, _)| id);
        let partner_in_range = self.player.mode().partner().is_some_and(|partner| {
            self.field
                .distance(&ActorId::Player, &ActorId::Npc(partner.clone()))
                .is_ok_and(|d| d <= radius)
        });
        let effects = self
            .player
            .update_proximity(self.now, nearest.as_ref(), partner_in_range);
        self.apply_player_effects(effects);
    }

    fn apply_player_effects(&mut self, effects: Vec<PlayerEffect>) {
        for effect in effects {
            match effect {
                PlayerEffect::Approached(npc) => self.announce(&npc, InteractionStage::Approaching),
                PlayerEffect::Engaged(npc) => {
                    self.input.activate(npc.clone());
                    self.voice.set_ducked(true);
                    self.announce(&npc, InteractionStage::Talking);
                }
                PlayerEffect::Released(npc) => {
                    debug!(npc = %npc, "player released");
                    self.input.deactivate();
                    self.voice.set_ducked(false);
                    self.events.on_chat_closed();
                }
                PlayerEffect::EndConversation { conversation, reason } => {
                    self.engine
                        .end_conversation(&mut self.npcs, conversation, reason, self.now, &mut self.rng);
                }
                PlayerEffect::GraceStarted { npc, deadline } => {
                    debug!(npc = %npc, deadline, "player stepped away, grace period started");
                    self.input.deactivate();
                }
                PlayerEffect::GraceCancelled(npc) => {
                    debug!(npc = %npc, "player came back");
                    self.input.activate(npc);
                }
            }
        }
    }

    fn announce(&self, npc: &NpcId, stage: InteractionStage) {
        if let Some(rec) = self.npcs.get(npc) {
            self.events
                .on_interaction_changed(InteractionEvent::from_record(rec, stage));
        }
    }

    fn flush_engine_events(&mut self) {
        loop {
            let events = self.engine.drain_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                match event {
                    ConversationEvent::Started { conversation, kind } => {
                        debug!(conversation = %conversation, ?kind, "conversation started");
                    }
                    ConversationEvent::Spoke(utterance) => {
                        self.events.on_utterance(&utterance);
                        if let ActorId::Npc(npc) = &utterance.speaker {
                            self.speak(npc, &utterance.text, utterance.foreground);
                        }
                    }
                    ConversationEvent::Typing { npc, active } => {
                        self.events.on_typing(&npc, active);
                    }
                    ConversationEvent::Ended(ended) => {
                        let effects = self.player.conversation_ended(ended.id);
                        self.apply_player_effects(effects);
                        self.autosave(ended.kind.npcs().into_iter().cloned().collect());
                    }
                }
            }
        }
    }

    fn speak(&self, npc: &NpcId, text: &str, foreground: bool) {
        let distance = self
            .field
            .distance(&ActorId::Player, &ActorId::Npc(npc.clone()))
            .unwrap_or(f32::MAX);
        self.voice.synthesize(text, npc.as_str(), foreground, distance);
    }

    fn autosave(&self, npcs: Vec<NpcId>) {
        if !self.config.persistence.autosave {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        for id in npcs {
            if let Some(rec) = self.npcs.get(&id) {
                if let Err(err) = store.save_record(&rec.to_record()) {
                    warn!(npc = %id, error = %err, "autosave failed");
                }
            }
        }
    }

    fn start_cooldown(&mut self, id: &NpcId) {
        let until = self.handshake.next_cooldown(self.now, &mut self.rng);
        if let Some(rec) = self.npcs.get_mut(id) {
            rec.cooldown_until = until;
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Start talking to the NPC the player is approaching.
    ///
    /// # Errors
    /// `AdmissionRejected` when every slot is taken (a notice is shown),
    /// `InvalidTransition` when not approaching `npc` or the NPC is busy.
    pub fn talk(&mut self, npc: &NpcId) -> Result<ConversationId> {
        if let Err(err) = self.player.check_talk(npc, self.engine.admission()) {
            if let PalaverError::AdmissionRejected { active, max } = &err {
                self.events.on_notice(Notice::ConversationLimit {
                    active: *active,
                    max: *max,
                });
            }
            return Err(err);
        }

        let conversation = match self
            .engine
            .start_player_conversation(&mut self.npcs, npc, self.now, &mut self.rng)
        {
            Ok(id) => id,
            Err(err) => {
                match &err {
                    PalaverError::AdmissionRejected { active, max } => {
                        self.events.on_notice(Notice::ConversationLimit {
                            active: *active,
                            max: *max,
                        });
                    }
                    PalaverError::InvalidTransition(_) => {
                        self.events.on_notice(Notice::NpcBusy { npc: npc.clone() });
                    }
                    _ => {}
                }
                return Err(err);
            }
        };

        match self.player.enter_talking(npc, conversation) {
            Ok(effects) => self.apply_player_effects(effects),
            Err(err) => {
                self.engine.end_conversation(
                    &mut self.npcs,
                    conversation,
                    EndReason::Aborted,
                    self.now,
                    &mut self.rng,
                );
                self.flush_engine_events();
                return Err(err);
            }
        }
        self.flush_engine_events();
        Ok(conversation)
    }

    /// Send the player's line. Returns the request for the NPC's answer.
    ///
    /// # Errors
    /// `InvalidTransition` when not talking, the NPC is still answering,
    /// or the text is blank.
    pub fn submit_message(&mut self, text: &str) -> Result<DialogueRequest> {
        if !self.player.is_talking() {
            return Err(PalaverError::InvalidTransition(format!(
                "cannot send a message while {}",
                self.player.mode().label()
            )));
        }
        let request = self
            .engine
            .submit_player_message(&mut self.npcs, text, self.now)?;
        self.flush_engine_events();
        Ok(request)
    }

    /// Leave whatever interaction the player is in.
    pub fn cancel(&mut self) {
        let effects = self.player.cancel();
        let released = effects
            .iter()
            .any(|e| matches!(e, PlayerEffect::Released(_)));
        self.apply_player_effects(effects);
        if !released {
            self.input.deactivate();
            self.voice.set_ducked(false);
        }
        self.flush_engine_events();
    }

    /// Feed one key press to the chat input.
    ///
    /// Keys are only captured while talking; otherwise they pass through.
    /// Returns a generation request when the key submitted a line.
    ///
    /// # Errors
    /// Whatever [`World::submit_message`] reports for a submitted line.
    pub fn handle_key(&mut self, key: Key) -> Result<Option<DialogueRequest>> {
        if !self.player.is_talking() {
            return Ok(None);
        }
        match self.input.handle_key(key) {
            KeyOutcome::Submit { text, .. } => self.submit_message(&text).map(Some),
            KeyOutcome::Cancel => {
                self.cancel();
                Ok(None)
            }
            KeyOutcome::PassThrough | KeyOutcome::Consumed => Ok(None),
        }
    }

    /// Move the player by a unit-less direction scaled by speed and `dt_ms`.
    ///
    /// Ignored while talking. Returns whether the player moved.
    pub fn move_player(&mut self, dx: f32, dy: f32, dt_ms: Millis) -> bool {
        if self.player.movement_locked() {
            return false;
        }
        #[allow(clippy::cast_precision_loss)]
        let step = self.config.world.player_speed * dt_ms as f32 / 1000.0;
        let before = self.field.position_of(&ActorId::Player).ok();
        let after = self.field.move_player(dx * step, dy * step);
        before != Some(after)
    }

    /// Hand a finished generation back.
    ///
    /// # Errors
    /// `StaleResponse` when the conversation moved on or ended.
    pub fn apply_reply<E: std::fmt::Display>(
        &mut self,
        token: &TurnToken,
        outcome: std::result::Result<String, E>,
    ) -> Result<()> {
        let result = self
            .engine
            .apply_reply(&mut self.npcs, token, outcome, self.now, &mut self.rng);
        self.flush_engine_events();
        result
    }

    /// Add an NPC. Unset spec fields are derived.
    ///
    /// # Errors
    /// `NoValidPosition` (a notice is shown) or a duplicate id.
    pub fn spawn_npc(&mut self, spec: NpcSpec) -> Result<NpcId> {
        match roster::spawn(&mut self.field, &mut self.npcs, &self.config.world, spec, &mut self.rng) {
            Ok(id) => {
                self.start_cooldown(&id);
                info!(npc = %id, "npc added");
                Ok(id)
            }
            Err(err) => {
                self.events.on_notice(Notice::SpawnFailed {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Remove an NPC, ending its conversation and any handshake with it.
    ///
    /// # Errors
    /// `NotFound` for an unknown id.
    pub fn despawn_npc(&mut self, id: &NpcId) -> Result<()> {
        self.npcs.require(id)?;
        let actor = ActorId::Npc(id.clone());
        self.engine
            .end_for_actor(&mut self.npcs, &actor, EndReason::Despawned, self.now, &mut self.rng);
        self.handshake
            .forget(self.now, &mut self.npcs, id, &mut self.rng);
        let effects = self.player.npc_removed(id);
        self.apply_player_effects(effects);
        self.flush_engine_events();

        self.field.remove_npc(id);
        self.npcs.remove(id);
        info!(npc = %id, "npc removed");
        Ok(())
    }

    /// Start an NPC pair conversation directly, skipping the handshake.
    ///
    /// # Errors
    /// As `ConversationEngine::start_npc_conversation`.
    pub fn start_npc_conversation(
        &mut self,
        initiator: &NpcId,
        target: &NpcId,
    ) -> Result<ConversationId> {
        let id = self.engine.start_npc_conversation(
            &mut self.npcs,
            initiator,
            target,
            self.now,
            &mut self.rng,
        )?;
        self.flush_engine_events();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RecordingEvents, SceneEvent};

    fn world() -> (World, Arc<RecordingEvents>) {
        let mut config = PalaverConfig::default();
        config.general.seed = Some(7);
        config.handshake.enabled = false;
        let events = Arc::new(RecordingEvents::new());
        (World::new(config, events.clone()), events)
    }

    fn spawn_at(world: &mut World, id: &str, x: f32, y: f32) -> NpcId {
        world
            .spawn_npc(NpcSpec {
                id: Some(NpcId::from(id)),
                position: Some(Position::new(x, y)),
                ..NpcSpec::described("wise elder")
            })
            .expect("placed")
    }

    #[test]
    fn approaching_emits_interaction() {
        let (mut w, events) = world();
        let n = spawn_at(&mut w, "n", 660.0, 400.0);
        w.tick(16);
        assert!(matches!(w.player_mode(), PlayerMode::Approaching { npc, .. } if *npc == n));
        assert_eq!(
            events.count(|e| matches!(e, SceneEvent::Interaction(i) if i.stage == InteractionStage::Approaching)),
            1
        );
    }

    #[test]
    fn talk_locks_movement_and_captures_keys() {
        let (mut w, events) = world();
        let n = spawn_at(&mut w, "n", 660.0, 400.0);
        w.tick(16);
        w.talk(&n).expect("room");
        assert!(!w.move_player(1.0, 0.0, 100));
        assert!(w.input().is_active());
        assert!(w.voice().is_ducked());
        assert_eq!(
            events.count(|e| matches!(e, SceneEvent::Utterance(u) if u.foreground)),
            1
        );

        for c in "hi".chars() {
            assert!(w.handle_key(Key::Char(c)).expect("typed").is_none());
        }
        let request = w.handle_key(Key::Enter).expect("sent").expect("request");
        assert_eq!(request.latest_message, "hi");
    }

    #[test]
    fn escape_cancels_everything() {
        let (mut w, events) = world();
        let n = spawn_at(&mut w, "n", 660.0, 400.0);
        w.tick(16);
        let conv = w.talk(&n).expect("room");
        w.handle_key(Key::Escape).expect("cancel");
        assert_eq!(w.player_mode(), &PlayerMode::Idle);
        assert!(w.engine().get(conv).is_none());
        assert!(!w.input().is_active());
        assert!(!w.voice().is_ducked());
        assert!(events.count(|e| matches!(e, SceneEvent::ChatClosed)) >= 1);
    }

    #[test]
    fn despawn_partner_closes_chat() {
        let (mut w, events) = world();
        let n = spawn_at(&mut w, "n", 660.0, 400.0);
        w.tick(16);
        w.talk(&n).expect("room");
        w.despawn_npc(&n).expect("known");
        assert_eq!(w.player_mode(), &PlayerMode::Idle);
        assert_eq!(w.engine().active_count(), 0);
        assert!(w.npcs().get(&n).is_none());
        assert!(events.count(|e| matches!(e, SceneEvent::ChatClosed)) >= 1);
        assert!(w.despawn_npc(&n).is_err());
    }

    #[test]
    fn spawn_failure_is_a_notice() {
        let (mut w, events) = world();
        spawn_at(&mut w, "dup", 100.0, 100.0);
        let again = w.spawn_npc(NpcSpec {
            id: Some(NpcId::from("dup")),
            ..NpcSpec::described("wise elder")
        });
        assert!(again.is_err());
        assert_eq!(events.count(|e| matches!(e, SceneEvent::Notice(Notice::SpawnFailed { .. }))), 1);
    }

    #[test]
    fn populate_sets_cooldowns() {
        let (mut w, _) = world();
        let placed = w.populate();
        assert!(placed >= 8);
        assert!(w.npcs().iter().all(|n| n.cooldown_until >= 10_000));
    }
}
