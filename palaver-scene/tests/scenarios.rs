//! Whole-scene scenarios driven through the `World` command surface.

use std::sync::Arc;

use palaver_core::chat_input::Key;
use palaver_core::handshake::HandshakeSignal;
use palaver_core::persistence::ArchiveStore;
use palaver_core::player::PlayerMode;
use palaver_core::roster::NpcSpec;
use palaver_core::types::{ActorId, NpcId, Position};
use palaver_core::{PalaverConfig, PalaverError};
use palaver_scene::{Notice, RecordingEvents, SceneEvent, World};

fn config() -> PalaverConfig {
    let mut config = PalaverConfig::default();
    config.general.seed = Some(42);
    config.handshake.enabled = false;
    config
}

fn scene(config: PalaverConfig) -> (World, Arc<RecordingEvents>) {
    let events = Arc::new(RecordingEvents::new());
    (World::new(config, events.clone()), events)
}

fn place(world: &mut World, id: &str, description: &str, x: f32, y: f32) -> NpcId {
    world
        .spawn_npc(NpcSpec {
            id: Some(NpcId::from(id)),
            position: Some(Position::new(x, y)),
            ..NpcSpec::described(description)
        })
        .expect("placed")
}

/// Player at the centre (600, 400), NPC 60 units to the right.
fn talking_scene() -> (World, Arc<RecordingEvents>, NpcId) {
    let (mut world, events) = scene(config());
    let n = place(&mut world, "n", "wise elder", 660.0, 400.0);
    world.tick(16);
    world.talk(&n).expect("slot free");
    (world, events, n)
}

fn move_player_to(world: &mut World, x: f32, y: f32) {
    world
        .field_mut()
        .set_position(&ActorId::Player, Position::new(x, y))
        .expect("player tracked");
}

#[test]
fn stepping_away_briefly_keeps_the_conversation() {
    let (mut world, _events, n) = talking_scene();
    let request = world.submit_message("Hello").expect("sent");
    world
        .apply_reply(&request.token, Ok::<_, String>("Greetings, traveler.".into()))
        .expect("applied");
    let conv = world.player_mode().conversation().expect("talking");
    let history_before = world.engine().get(conv).expect("live").history.clone();
    let count_before = world
        .engine()
        .get(conv)
        .expect("live")
        .count_of(&ActorId::Npc(n.clone()));

    move_player_to(&mut world, 300.0, 400.0);
    world.tick(100);
    assert!(matches!(world.player_mode(), PlayerMode::Exiting { .. }));

    world.tick(1500);
    move_player_to(&mut world, 600.0, 400.0);
    world.tick(100);

    assert_eq!(
        world.player_mode(),
        &PlayerMode::Talking {
            npc: n.clone(),
            conversation: conv
        }
    );
    let after = world.engine().get(conv).expect("still live");
    assert_eq!(after.history, history_before);
    assert_eq!(after.count_of(&ActorId::Npc(n)), count_before);
}

#[test]
fn staying_away_past_grace_ends_the_conversation() {
    let (mut world, events, n) = talking_scene();
    let conv = world.player_mode().conversation().expect("talking");

    move_player_to(&mut world, 300.0, 400.0);
    world.tick(100);
    world.tick(1000);
    assert!(world.engine().get(conv).is_some());
    world.tick(1000);

    assert_eq!(world.player_mode(), &PlayerMode::Idle);
    assert!(world.engine().get(conv).is_none());
    assert!(world.npcs().get(&n).expect("n").handshake.is_idle());
    assert!(events.count(|e| matches!(e, SceneEvent::ChatClosed)) >= 1);
    assert!(!world.voice().is_ducked());
}

#[test]
fn keys_pass_through_while_stepping_away() {
    let (mut world, events, n) = talking_scene();
    let conv = world.player_mode().conversation().expect("talking");
    let history_before = world.engine().get(conv).expect("live").history.clone();

    move_player_to(&mut world, 300.0, 400.0);
    world.tick(100);
    assert!(matches!(world.player_mode(), PlayerMode::Exiting { .. }));
    assert!(!world.input().is_active());

    for c in "hey".chars() {
        assert!(world.handle_key(Key::Char(c)).expect("ignored").is_none());
    }
    assert!(world.handle_key(Key::Enter).expect("ignored").is_none());
    assert!(world.handle_key(Key::Left).expect("ignored").is_none());
    assert!(matches!(
        world.submit_message("hey"),
        Err(PalaverError::InvalidTransition(_))
    ));
    assert_eq!(world.engine().get(conv).expect("live").history, history_before);
    assert_eq!(
        events.count(|e| matches!(e, SceneEvent::Utterance(u) if u.text == "hey")),
        0
    );

    move_player_to(&mut world, 600.0, 400.0);
    world.tick(100);
    assert_eq!(world.input().target(), Some(&n));
    assert!(world.input().buffer().is_empty());
    for c in "hi".chars() {
        world.handle_key(Key::Char(c)).expect("typed");
    }
    let request = world.handle_key(Key::Enter).expect("sent").expect("request");
    assert_eq!(request.latest_message, "hi");
}

#[test]
fn generation_failure_ends_once_and_late_reply_is_ignored() {
    let (mut world, events, n) = talking_scene();
    let conv = world.player_mode().conversation().expect("talking");
    let request = world.submit_message("Hello").expect("sent");
    events.take();

    world
        .apply_reply(&request.token, Err::<String, _>("HTTP 503"))
        .expect("failure applied");

    let recorded = events.take();
    let fallback: Vec<_> = recorded
        .iter()
        .filter_map(|e| match e {
            SceneEvent::Utterance(u) => Some(u),
            _ => None,
        })
        .collect();
    assert_eq!(fallback.len(), 1);
    assert!(!fallback[0].recorded);
    assert_eq!(
        recorded.iter().filter(|e| matches!(e, SceneEvent::ChatClosed)).count(),
        1
    );

    assert!(world.engine().get(conv).is_none());
    assert_eq!(world.player_mode(), &PlayerMode::Idle);
    let rec = world.npcs().get(&n).expect("n");
    assert!(rec.handshake.is_idle());
    assert!(!rec.ui.typing);

    let late = world.apply_reply(&request.token, Ok::<_, String>("Too late".into()));
    assert!(matches!(late, Err(PalaverError::StaleResponse(_))));
    for _ in 0..50 {
        assert!(world.tick(100).is_empty());
    }
    assert!(events.take().iter().all(|e| !matches!(e, SceneEvent::Utterance(_))));
}

#[test]
fn third_conversation_is_refused_with_a_notice() {
    let (mut world, events) = scene(config());
    let a = place(&mut world, "a", "brave warrior", 100.0, 100.0);
    let b = place(&mut world, "b", "cautious scholar", 170.0, 100.0);
    let c = place(&mut world, "c", "quiet gardener", 100.0, 700.0);
    let d = place(&mut world, "d", "shrewd merchant", 170.0, 700.0);
    let n = place(&mut world, "n", "wise elder", 660.0, 400.0);

    let first = world.start_npc_conversation(&a, &b).expect("first");
    let second = world.start_npc_conversation(&c, &d).expect("second");
    world.tick(16);
    assert!(matches!(world.player_mode(), PlayerMode::Approaching { npc, .. } if *npc == n));

    let refused = world.talk(&n);
    assert!(matches!(refused, Err(PalaverError::AdmissionRejected { active: 2, max: 2 })));
    assert_eq!(
        events.count(|e| matches!(e, SceneEvent::Notice(Notice::ConversationLimit { .. }))),
        1
    );
    assert!(matches!(world.player_mode(), PlayerMode::Approaching { .. }));
    assert!(world.engine().get(first).is_some());
    assert!(world.engine().get(second).is_some());
    assert!(!world.input().is_active());
}

#[test]
fn talking_to_a_busy_npc_is_refused() {
    let (mut world, events) = scene(config());
    let a = place(&mut world, "a", "brave warrior", 660.0, 400.0);
    let b = place(&mut world, "b", "cautious scholar", 730.0, 400.0);
    world.start_npc_conversation(&a, &b).expect("started");
    world.tick(16);

    assert!(world.talk(&a).is_err());
    assert_eq!(
        events.count(|e| matches!(e, SceneEvent::Notice(Notice::NpcBusy { .. }))),
        1
    );
}

#[test]
fn idle_neighbours_start_talking_on_their_own() {
    let mut config = config();
    config.handshake.enabled = true;
    config.handshake.cooldown_min_ms = 0;
    config.handshake.cooldown_max_ms = 0;
    config.world.npc_speed = 0.0;
    let (mut world, events) = scene(config);
    place(&mut world, "a", "brave warrior", 100.0, 100.0);
    place(&mut world, "b", "cautious scholar", 170.0, 100.0);

    for _ in 0..300 {
        for request in world.tick(100) {
            let _ = world.apply_reply(&request.token, Ok::<_, String>("Indeed.".into()));
        }
    }

    assert!(events.count(|e| matches!(e, SceneEvent::Handshake(HandshakeSignal::Requested { .. }))) >= 1);
    assert!(events.count(|e| matches!(e, SceneEvent::Handshake(HandshakeSignal::Accepted { .. }))) >= 1);
    assert!(events.count(|e| matches!(e, SceneEvent::Utterance(u) if !u.foreground)) >= 2);
    assert!(world.npcs().find_asymmetric_handshake().is_none());
}

#[test]
fn finished_conversations_are_saved() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("dialogue.db");
    let store = ArchiveStore::open(&path).expect("open");

    let (world, _events) = scene(config());
    let mut world = world.with_store(store);
    let n = place(&mut world, "n", "wise elder", 660.0, 400.0);
    world.tick(16);
    world.talk(&n).expect("slot free");
    world.cancel();

    let reader = ArchiveStore::open(&path).expect("reopen");
    let saved = reader.load_record(&n).expect("query").expect("saved");
    assert_eq!(saved.dialogue.len(), 1);
    assert_eq!(world.save().expect("saved all"), 1);
}

#[test]
fn despawn_ends_npc_pair_for_both() {
    let (mut world, _events) = scene(config());
    let a = place(&mut world, "a", "brave warrior", 100.0, 100.0);
    let b = place(&mut world, "b", "cautious scholar", 170.0, 100.0);
    let conv = world.start_npc_conversation(&a, &b).expect("started");

    world.despawn_npc(&a).expect("known");
    assert!(world.engine().get(conv).is_none());
    let rec = world.npcs().get(&b).expect("b stays");
    assert!(rec.handshake.is_idle());
    assert!(world.field().position_of(&ActorId::Npc(a)).is_err());
}
