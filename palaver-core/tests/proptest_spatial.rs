//! Property-based tests for Palaver core invariants.
//!
//! Geometry: no overlap survives collision resolution and nobody leaves
//! the world. Protocol: handshake partners always point back at each other,
//! the conversation cap holds, and message counters stay within bounds
//! under arbitrary reply outcomes.

use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use palaver_core::config::{ConversationConfig, HandshakeConfig};
use palaver_core::conversation::ConversationEngine;
use palaver_core::handshake::HandshakeCoordinator;
use palaver_core::npc::{NpcRecord, NpcRegistry};
use palaver_core::personality;
use palaver_core::spatial::{Body, SpatialField};
use palaver_core::types::{ActorId, Bounds, NpcId, Position};

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn arb_interior() -> impl Strategy<Value = Position> {
    (200.0..1000.0f32, 200.0..600.0f32).prop_map(|(x, y)| Position::new(x, y))
}

fn arb_any() -> impl Strategy<Value = Position> {
    (-100.0..1300.0f32, -100.0..900.0f32).prop_map(|(x, y)| Position::new(x, y))
}

fn field_with(player: Position, npcs: &[Position], passes: u32) -> SpatialField {
    let mut field = SpatialField::new(
        Bounds::sized(1200.0, 800.0),
        20.0,
        passes,
        Body {
            position: player,
            radius: 15.0,
        },
    );
    for (i, p) in npcs.iter().enumerate() {
        field.insert_npc(NpcId::new(format!("npc_{i}")), *p, 20.0);
    }
    field
}

const PERSONALITIES: &[&str] = &[
    "A brave warrior",
    "A cautious scholar",
    "A wandering mystic",
    "A quiet gardener",
    "A shrewd merchant",
    "nobody in particular",
];

// ---------------------------------------------------------------------------
// Property: collision resolution leaves no overlapping pair
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn resolution_separates_every_pair(
        player in arb_interior(),
        npcs in prop::collection::vec(arb_interior(), 2..=6),
    ) {
        let mut field = field_with(player, &npcs, 256);
        field.resolve_collisions();
        prop_assert!(!field.has_overlap(1e-2));
    }
}

// ---------------------------------------------------------------------------
// Property: everyone stays within bounds
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn resolution_keeps_actors_in_bounds(
        player in arb_any(),
        npcs in prop::collection::vec(arb_any(), 0..=8),
    ) {
        let mut field = field_with(player, &npcs, 4);
        field.resolve_collisions();
        let bounds = field.bounds();
        prop_assert!(bounds.contains(field.position_of(&ActorId::Player).expect("player")));
        for i in 0..npcs.len() {
            let id = ActorId::Npc(NpcId::new(format!("npc_{i}")));
            prop_assert!(bounds.contains(field.position_of(&id).expect("tracked")));
        }
    }
}

// ---------------------------------------------------------------------------
// Property: acceptance odds are probabilities
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn acceptance_is_a_probability(text in ".{0,64}") {
        let p = personality::acceptance_probability(&text);
        prop_assert!((0.0..=1.0).contains(&p));
    }
}

// ---------------------------------------------------------------------------
// Property: protocol invariants under arbitrary reply outcomes
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn protocol_invariants_hold(
        seed in any::<u64>(),
        positions in prop::collection::vec(arb_interior(), 3..=8),
        outcomes in prop::collection::vec(any::<bool>(), 64),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut field = field_with(Position::new(50.0, 50.0), &positions, 16);
        field.resolve_collisions();

        let mut npcs = NpcRegistry::new();
        for i in 0..positions.len() {
            npcs.insert(NpcRecord::new(
                NpcId::new(format!("npc_{i}")),
                format!("NPC {i}"),
                "villager",
                PERSONALITIES[i % PERSONALITIES.len()],
                vec![],
                40.0,
            ));
        }

        let handshake = HandshakeConfig {
            trigger_radius: 200.0,
            ..HandshakeConfig::default()
        };
        let coordinator = HandshakeCoordinator::new(&handshake);
        let mut engine = ConversationEngine::new(
            &ConversationConfig::default(),
            (handshake.cooldown_min_ms, handshake.cooldown_max_ms),
        );

        let mut outcome = outcomes.iter().cycle();
        let mut now = 0;
        while now < 60_000 {
            coordinator.tick(now, &field, &mut npcs, &mut engine, &mut rng);
            for request in engine.tick(&mut npcs, now, &mut rng) {
                let ok = *outcome.next().unwrap_or(&true);
                let reply = if ok { Ok("Sure.".to_string()) } else { Err("backend down") };
                let _ = engine.apply_reply(&mut npcs, &request.token, reply, now, &mut rng);
            }

            prop_assert_eq!(npcs.find_asymmetric_handshake(), None);
            prop_assert!(engine.admission().len() <= 2);
            for conversation in engine.iter() {
                prop_assert!(conversation.max_count() <= conversation.max_messages);
            }
            now += 250;
        }
    }
}
