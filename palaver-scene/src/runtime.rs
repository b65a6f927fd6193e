//! Scene runtime: ticks the [`World`] on a tokio interval and runs
//! dialogue generation off the tick.
//!
//! Each [`DialogueRequest`] becomes its own task. Replies come back over an
//! unbounded channel and are applied at the start of the next step, so the
//! world is only ever mutated under its lock from one place at a time and
//! never across an `.await`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use palaver_core::chat_input::Key;
use palaver_core::conversation::{DialogueRequest, TurnToken};
use palaver_core::error::{PalaverError, Result};
use palaver_core::roster::NpcSpec;
use palaver_core::types::{ConversationId, Millis, NpcId};
use palaver_llm::{DialogueClient, LlmClient, LlmError, PersonalityData};

use crate::world::World;

struct Reply {
    token: TurnToken,
    outcome: std::result::Result<String, LlmError>,
}

/// Drives a [`World`] with live dialogue generation.
pub struct SceneRuntime {
    world: Arc<Mutex<World>>,
    client: Arc<dyn DialogueClient>,
    personalities: Option<Arc<LlmClient>>,
    replies_tx: mpsc::UnboundedSender<Reply>,
    replies_rx: Mutex<mpsc::UnboundedReceiver<Reply>>,
}

impl SceneRuntime {
    /// Wrap a world and a dialogue backend.
    #[must_use]
    pub fn new(world: World, client: Arc<dyn DialogueClient>) -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Self {
            world: Arc::new(Mutex::new(world)),
            client,
            personalities: None,
            replies_tx,
            replies_rx: Mutex::new(replies_rx),
        }
    }

    /// Generate personalities for described NPCs with `client`.
    #[must_use]
    pub fn with_personality_client(mut self, client: Arc<LlmClient>) -> Self {
        self.personalities = Some(client);
        self
    }

    /// Shared handle to the world.
    #[must_use]
    pub fn world(&self) -> Arc<Mutex<World>> {
        Arc::clone(&self.world)
    }

    /// Apply finished replies, advance the world by `dt_ms`, and dispatch
    /// whatever turns came due.
    pub fn step(&self, dt_ms: Millis) {
        self.drain_replies();
        let requests = self.world.lock().tick(dt_ms);
        self.dispatch(requests);
    }

    /// Tick every `period` until `shutdown` resolves.
    pub async fn run_until<F>(&self, period: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let dt_ms = Millis::try_from(period.as_millis()).unwrap_or(Millis::MAX);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        info!(period_ms = dt_ms, "scene running");
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = interval.tick() => self.step(dt_ms),
            }
        }
        self.drain_replies();
        info!(now = self.world.lock().now(), "scene stopped");
    }

    fn drain_replies(&self) {
        let replies: Vec<Reply> = {
            let mut rx = self.replies_rx.lock();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        if replies.is_empty() {
            return;
        }
        let mut world = self.world.lock();
        for reply in replies {
            match world.apply_reply(&reply.token, reply.outcome) {
                Ok(()) => {}
                Err(PalaverError::StaleResponse(id)) => {
                    debug!(conversation = %id, turn = reply.token.turn, "late reply dropped");
                }
                Err(err) => warn!(error = %err, "reply could not be applied"),
            }
        }
    }

    fn dispatch(&self, requests: Vec<DialogueRequest>) {
        for request in requests {
            let client = Arc::clone(&self.client);
            let tx = self.replies_tx.clone();
            tokio::spawn(async move {
                let outcome = client
                    .generate_dialogue(
                        &request.personality_context,
                        &request.recent_history,
                        &request.latest_message,
                    )
                    .await;
                if let Err(e) = &outcome {
                    warn!(speaker = %request.token.speaker, error = %e, "dialogue generation failed");
                }
                // The runtime may already be gone; nothing to do then.
                let _ = tx.send(Reply {
                    token: request.token,
                    outcome,
                });
            });
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Start talking to `npc`.
    ///
    /// # Errors
    /// As [`World::talk`].
    pub fn talk(&self, npc: &NpcId) -> Result<ConversationId> {
        self.world.lock().talk(npc)
    }

    /// Send the player's line and start generating the answer.
    ///
    /// # Errors
    /// As [`World::submit_message`].
    pub fn submit_message(&self, text: &str) -> Result<()> {
        let request = self.world.lock().submit_message(text)?;
        self.dispatch(vec![request]);
        Ok(())
    }

    /// Leave the current interaction.
    pub fn cancel(&self) {
        self.world.lock().cancel();
    }

    /// Feed one key press.
    ///
    /// # Errors
    /// As [`World::handle_key`].
    pub fn handle_key(&self, key: Key) -> Result<()> {
        let request = self.world.lock().handle_key(key)?;
        self.dispatch(request.into_iter().collect());
        Ok(())
    }

    /// Add an NPC from a short description, generating its personality.
    ///
    /// # Errors
    /// As [`World::spawn_npc`].
    pub async fn spawn_described(&self, description: &str) -> Result<NpcId> {
        let sheet = match &self.personalities {
            Some(client) => client.generate_personality(description).await,
            None => PersonalityData::fallback(description),
        };
        let spec = NpcSpec {
            name: Some(sheet.name),
            personality: Some(sheet.description),
            traits: sheet.traits,
            dialogue: sheet.initial_dialogue,
            ..NpcSpec::described(description)
        };
        self.world.lock().spawn_npc(spec)
    }
}
