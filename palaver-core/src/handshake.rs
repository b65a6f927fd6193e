//! NPC↔NPC handshake protocol.
//!
//! ```text
//!            proximity + cooldown elapsed
//!   Idle ─────────────────────────────────▶ Requesting (initiator)
//!   Idle ─────────────────────────────────▶ Requested  (target, deadline)
//!
//!   Requested ── accept draw + free slot ──▶ Conversing (both)
//!   Requested ── reject draw / deadline ───▶ Rejected   (both, reset_at)
//!   Rejected  ── reset_at reached ─────────▶ Idle       (both, fresh cooldown)
//! ```
//!
//! The acceptance draw happens once, on the first tick the target evaluates
//! the request. An accepted request still needs an admission slot; if none
//! frees up before the deadline the request times out as a rejection.

use rand::Rng;
use tracing::{debug, info};

use crate::config::HandshakeConfig;
use crate::conversation::ConversationEngine;
use crate::error::PalaverError;
use crate::npc::{HandshakeStatus, NpcRegistry};
use crate::personality;
use crate::spatial::SpatialField;
use crate::types::{ActorId, ConversationId, Millis, NpcId};

/// Observable handshake transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeSignal {
    /// `initiator` asked `target`.
    Requested {
        /// Asking NPC.
        initiator: NpcId,
        /// Asked NPC.
        target: NpcId,
    },
    /// The target accepted and a conversation started.
    Accepted {
        /// Asking NPC.
        initiator: NpcId,
        /// Asked NPC.
        target: NpcId,
        /// The new conversation.
        conversation: ConversationId,
    },
    /// The request failed.
    Rejected {
        /// Asking NPC.
        initiator: NpcId,
        /// Asked NPC.
        target: NpcId,
        /// Whether the deadline expired rather than an explicit refusal.
        timed_out: bool,
    },
    /// Both NPCs returned to idle after a rejection.
    Reset {
        /// One NPC of the pair.
        a: NpcId,
        /// The other.
        b: NpcId,
    },
}

/// Runs the handshake protocol for every NPC.
#[derive(Debug, Clone)]
pub struct HandshakeCoordinator {
    config: HandshakeConfig,
}

impl HandshakeCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(config: &HandshakeConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Protocol configuration.
    #[must_use]
    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    /// A fresh cooldown deadline measured from `now`.
    pub fn next_cooldown<R: Rng + ?Sized>(&self, now: Millis, rng: &mut R) -> Millis {
        let lo = self.config.cooldown_min_ms;
        now + rng.gen_range(lo..=self.config.cooldown_max_ms.max(lo))
    }

    /// Run one protocol step: reset expired rejections, evaluate pending
    /// requests, then let eligible NPCs initiate.
    pub fn tick<R: Rng + ?Sized>(
        &self,
        now: Millis,
        field: &SpatialField,
        npcs: &mut NpcRegistry,
        engine: &mut ConversationEngine,
        rng: &mut R,
    ) -> Vec<HandshakeSignal> {
        let mut signals = Vec::new();
        self.reset_rejections(now, npcs, rng, &mut signals);
        self.evaluate_requests(now, npcs, engine, rng, &mut signals);
        if self.config.enabled {
            self.initiate(now, field, npcs, engine, &mut signals);
        }
        signals
    }

    fn reset_rejections<R: Rng + ?Sized>(
        &self,
        now: Millis,
        npcs: &mut NpcRegistry,
        rng: &mut R,
        signals: &mut Vec<HandshakeSignal>,
    ) {
        for id in npcs.ids() {
            let partner = match npcs.get(&id).map(|n| &n.handshake) {
                Some(HandshakeStatus::Rejected { partner, reset_at }) if *reset_at <= now => {
                    partner.clone()
                }
                _ => continue,
            };
            for npc in [&id, &partner] {
                let cooldown = self.next_cooldown(now, rng);
                if let Some(rec) = npcs.get_mut(npc) {
                    rec.handshake = HandshakeStatus::Idle;
                    rec.ui.rejection = false;
                    rec.cooldown_until = cooldown;
                }
            }
            debug!(a = %id, b = %partner, "handshake reset to idle");
            signals.push(HandshakeSignal::Reset { a: id, b: partner });
        }
    }

    fn evaluate_requests<R: Rng + ?Sized>(
        &self,
        now: Millis,
        npcs: &mut NpcRegistry,
        engine: &mut ConversationEngine,
        rng: &mut R,
        signals: &mut Vec<HandshakeSignal>,
    ) {
        for target in npcs.ids() {
            let Some(rec) = npcs.get_mut(&target) else {
                continue;
            };
            let HandshakeStatus::Requested {
                partner,
                deadline,
                decision,
            } = &mut rec.handshake
            else {
                continue;
            };
            let initiator = partner.clone();
            let deadline = *deadline;
            let accepted = *decision.get_or_insert_with(|| {
                let accept = personality::decide_acceptance(&rec.personality, rng);
                debug!(target = %target, initiator = %initiator, accept, "acceptance drawn");
                accept
            });

            if !accepted {
                self.reject(now, npcs, &initiator, &target, false, signals);
                continue;
            }

            if engine.admission().has_room() {
                match engine.start_npc_conversation(npcs, &initiator, &target, now, rng) {
                    Ok(conversation) => {
                        info!(initiator = %initiator, target = %target, conversation = %conversation, "handshake accepted");
                        signals.push(HandshakeSignal::Accepted {
                            initiator,
                            target,
                            conversation,
                        });
                        continue;
                    }
                    Err(PalaverError::AdmissionRejected { .. }) => {}
                    Err(err) => {
                        debug!(initiator = %initiator, target = %target, error = %err, "handshake could not start a conversation");
                        self.reject(now, npcs, &initiator, &target, false, signals);
                        continue;
                    }
                }
            }

            if now >= deadline {
                self.reject(now, npcs, &initiator, &target, true, signals);
            }
        }
    }

    fn reject(
        &self,
        now: Millis,
        npcs: &mut NpcRegistry,
        initiator: &NpcId,
        target: &NpcId,
        timed_out: bool,
        signals: &mut Vec<HandshakeSignal>,
    ) {
        let reset_at = now + self.config.reject_reset_ms;
        for (npc, partner) in [(initiator, target), (target, initiator)] {
            if let Some(rec) = npcs.get_mut(npc) {
                rec.handshake = HandshakeStatus::Rejected {
                    partner: partner.clone(),
                    reset_at,
                };
                rec.ui.rejection = true;
            }
        }
        info!(initiator = %initiator, target = %target, timed_out, "handshake rejected");
        signals.push(HandshakeSignal::Rejected {
            initiator: initiator.clone(),
            target: target.clone(),
            timed_out,
        });
    }

    fn initiate(
        &self,
        now: Millis,
        field: &SpatialField,
        npcs: &mut NpcRegistry,
        engine: &ConversationEngine,
        signals: &mut Vec<HandshakeSignal>,
    ) {
        let available = |npcs: &NpcRegistry, id: &NpcId| {
            npcs.get(id).is_some_and(|n| n.handshake.is_idle())
                && !engine.is_engaged(&ActorId::Npc(id.clone()))
        };

        for initiator in npcs.ids() {
            let ready = npcs
                .get(&initiator)
                .is_some_and(|n| n.cooldown_until <= now);
            if !ready || !available(npcs, &initiator) {
                continue;
            }
            let Some((target, distance)) = field.nearest_npc(
                &ActorId::Npc(initiator.clone()),
                self.config.trigger_radius,
                |candidate| available(npcs, candidate),
            ) else {
                continue;
            };

            if let Some(rec) = npcs.get_mut(&initiator) {
                rec.handshake = HandshakeStatus::Requesting {
                    partner: target.clone(),
                };
            }
            if let Some(rec) = npcs.get_mut(&target) {
                rec.handshake = HandshakeStatus::Requested {
                    partner: initiator.clone(),
                    deadline: now + self.config.request_timeout_ms,
                    decision: None,
                };
            }
            debug!(initiator = %initiator, target = %target, distance, "handshake requested");
            signals.push(HandshakeSignal::Requested { initiator, target });
        }
    }

    /// Return whoever was paired with `gone` to idle. Used on despawn.
    pub fn forget<R: Rng + ?Sized>(
        &self,
        now: Millis,
        npcs: &mut NpcRegistry,
        gone: &NpcId,
        rng: &mut R,
    ) {
        for id in npcs.ids() {
            let cooldown = self.next_cooldown(now, rng);
            if let Some(rec) = npcs.get_mut(&id) {
                if rec.handshake.partner() == Some(gone) {
                    rec.handshake = HandshakeStatus::Idle;
                    rec.ui.rejection = false;
                    rec.cooldown_until = cooldown;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConversationConfig;
    use crate::npc::NpcRecord;
    use crate::spatial::Body;
    use crate::types::{Bounds, Position};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    struct Fixture {
        field: SpatialField,
        npcs: NpcRegistry,
        engine: ConversationEngine,
        coordinator: HandshakeCoordinator,
    }

    fn fixture(personalities: &[(&str, &str, f32)]) -> Fixture {
        let mut field = SpatialField::new(
            Bounds::sized(1200.0, 800.0),
            20.0,
            4,
            Body {
                position: Position::new(1100.0, 700.0),
                radius: 15.0,
            },
        );
        let mut npcs = NpcRegistry::new();
        for (id, personality, x) in personalities {
            npcs.insert(NpcRecord::new(
                NpcId::from(*id),
                id.to_uppercase(),
                "villager",
                *personality,
                vec![],
                40.0,
            ));
            field.insert_npc(NpcId::from(*id), Position::new(*x, 300.0), 20.0);
        }
        let config = HandshakeConfig::default();
        Fixture {
            field,
            npcs,
            engine: ConversationEngine::new(
                &ConversationConfig::default(),
                (config.cooldown_min_ms, config.cooldown_max_ms),
            ),
            coordinator: HandshakeCoordinator::new(&config),
        }
    }

    impl Fixture {
        fn tick(&mut self, now: Millis, rng: &mut StdRng) -> Vec<HandshakeSignal> {
            let signals =
                self.coordinator
                    .tick(now, &self.field, &mut self.npcs, &mut self.engine, rng);
            assert_eq!(self.npcs.find_asymmetric_handshake(), None);
            signals
        }

        fn status(&self, id: &str) -> HandshakeStatus {
            self.npcs
                .get(&NpcId::from(id))
                .map(|n| n.handshake.clone())
                .unwrap_or_default()
        }
    }

    #[test]
    fn nearby_idle_pair_enters_request() {
        let mut fx = fixture(&[("a", "A brave warrior", 300.0), ("b", "A cautious scholar", 350.0)]);
        let mut rng = StdRng::seed_from_u64(1);
        let signals = fx.tick(0, &mut rng);
        assert_eq!(
            signals,
            vec![HandshakeSignal::Requested {
                initiator: NpcId::from("a"),
                target: NpcId::from("b"),
            }]
        );
        assert_eq!(
            fx.status("a"),
            HandshakeStatus::Requesting {
                partner: NpcId::from("b")
            }
        );
        assert!(matches!(fx.status("b"), HandshakeStatus::Requested { deadline: 3000, decision: None, .. }));
    }

    #[test]
    fn far_apart_npcs_stay_idle() {
        let mut fx = fixture(&[("a", "warrior", 100.0), ("b", "scholar", 400.0)]);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(fx.tick(0, &mut rng).is_empty());
        assert!(fx.status("a").is_idle());
    }

    #[test]
    fn cooldown_blocks_initiation() {
        let mut fx = fixture(&[("a", "warrior", 300.0), ("b", "scholar", 350.0)]);
        for id in ["a", "b"] {
            fx.npcs.get_mut(&NpcId::from(id)).expect("present").cooldown_until = 5000;
        }
        let mut rng = StdRng::seed_from_u64(1);
        assert!(fx.tick(4999, &mut rng).is_empty());
        assert!(!fx.tick(5000, &mut rng).is_empty());
    }

    #[test]
    fn accepted_request_starts_conversation() {
        // "knowledge" accepts with 0.9; try seeds until one accepts.
        for seed in 0..20 {
            let mut fx = fixture(&[("a", "warrior", 300.0), ("b", "knowledge seeker", 350.0)]);
            let mut rng = StdRng::seed_from_u64(seed);
            fx.tick(0, &mut rng);
            let signals = fx.tick(16, &mut rng);
            if let Some(HandshakeSignal::Accepted { conversation, .. }) = signals.first() {
                assert_eq!(
                    fx.status("a"),
                    HandshakeStatus::Conversing {
                        partner: NpcId::from("b")
                    }
                );
                assert!(fx.engine.get(*conversation).is_some());
                return;
            }
        }
        panic!("no seed produced an acceptance");
    }

    #[test]
    fn rejection_resets_after_delay() {
        // "mystic" accepts with 0.6; find a rejecting seed.
        for seed in 0..50 {
            let mut fx = fixture(&[("a", "warrior", 300.0), ("b", "mystic", 350.0)]);
            let mut rng = StdRng::seed_from_u64(seed);
            fx.tick(0, &mut rng);
            let signals = fx.tick(16, &mut rng);
            if !matches!(signals.first(), Some(HandshakeSignal::Rejected { timed_out: false, .. })) {
                continue;
            }
            assert!(matches!(fx.status("a"), HandshakeStatus::Rejected { reset_at: 2016, .. }));
            assert!(fx.npcs.get(&NpcId::from("b")).expect("b").ui.rejection);
            fx.tick(2015, &mut rng);
            assert!(!fx.status("b").is_idle());
            let signals = fx.tick(2016, &mut rng);
            assert!(signals.iter().any(|s| matches!(s, HandshakeSignal::Reset { .. })));
            assert!(fx.status("a").is_idle());
            assert!(fx.status("b").is_idle());
            assert!(fx.npcs.get(&NpcId::from("a")).expect("a").cooldown_until >= 12_016);
            return;
        }
        panic!("no seed produced a rejection");
    }

    #[test]
    fn accepted_request_without_slot_times_out() {
        let mut fx = fixture(&[
            ("a", "warrior", 300.0),
            ("b", "knowledge", 350.0),
            ("x", "anyone", 700.0),
            ("y", "anyone", 1000.0),
            ("z", "anyone", 100.0),
        ]);
        let mut cap = ConversationConfig::default();
        cap.max_concurrent = 1;
        fx.engine = ConversationEngine::new(&cap, (10_000, 20_000));
        let mut rng = StdRng::seed_from_u64(3);
        fx.engine
            .start_player_conversation(&mut fx.npcs, &NpcId::from("y"), 0, &mut rng)
            .expect("slot taken by the player");

        fx.tick(0, &mut rng);
        // Force an accepting decision so only the timer is in play.
        if let Some(rec) = fx.npcs.get_mut(&NpcId::from("b")) {
            if let HandshakeStatus::Requested { decision, .. } = &mut rec.handshake {
                *decision = Some(true);
            }
        }
        assert!(fx.tick(2999, &mut rng).is_empty());
        let signals = fx.tick(3000, &mut rng);
        assert!(signals.contains(&HandshakeSignal::Rejected {
            initiator: NpcId::from("a"),
            target: NpcId::from("b"),
            timed_out: true,
        }));
    }

    #[test]
    fn equidistant_targets_resolve_to_lowest_id() {
        let mut fx = fixture(&[("m", "warrior", 400.0), ("c", "x", 350.0), ("d", "x", 450.0)]);
        // Keep c from initiating first so m's choice is observable.
        fx.npcs.get_mut(&NpcId::from("c")).expect("c").cooldown_until = 99_999;
        fx.npcs.get_mut(&NpcId::from("d")).expect("d").cooldown_until = 99_999;
        let mut rng = StdRng::seed_from_u64(0);
        let signals = fx.tick(0, &mut rng);
        assert_eq!(
            signals,
            vec![HandshakeSignal::Requested {
                initiator: NpcId::from("m"),
                target: NpcId::from("c"),
            }]
        );
    }

    #[test]
    fn forgetting_a_partner_frees_the_survivor() {
        let mut fx = fixture(&[("a", "warrior", 300.0), ("b", "scholar", 350.0)]);
        let mut rng = StdRng::seed_from_u64(1);
        fx.tick(0, &mut rng);
        fx.npcs.remove(&NpcId::from("b"));
        fx.coordinator.forget(10, &mut fx.npcs, &NpcId::from("b"), &mut rng);
        assert!(fx.status("a").is_idle());
    }
}
