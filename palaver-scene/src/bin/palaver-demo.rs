//! Headless demo: populates a scene, walks the player up to the nearest
//! NPC, says hello and lets the world run for a while.
//!
//! ```text
//! palaver-demo [--config palaver.toml] [--seconds 30] [--seed 7] [--json]
//! ```
//!
//! Dialogue uses whichever provider the config names; without an API key
//! every reply falls back and conversations end after the first turn.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use palaver_core::PalaverConfig;
use palaver_core::persistence::ArchiveStore;
use palaver_core::player::PlayerMode;
use palaver_core::types::ActorId;
use palaver_llm::LoggingSink;
use palaver_scene::config::{ApiKeys, dialogue_client, voice_queue};
use palaver_scene::events::TracingEvents;
use palaver_scene::{SceneRuntime, World};

const TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    seconds: Option<u64>,
    seed: Option<u64>,
    json: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config = Some(it.next().context("--config needs a path")?.into()),
            "--seconds" => {
                let v = it.next().context("--seconds needs a value")?;
                args.seconds = Some(v.parse().context("--seconds must be a number")?);
            }
            "--seed" => {
                let v = it.next().context("--seed needs a value")?;
                args.seed = Some(v.parse().context("--seed must be a number")?);
            }
            "--json" => args.json = true,
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("palaver_core={level},palaver_llm={level},palaver_scene={level},palaver_demo={level}").into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let mut config = match &args.config {
        Some(path) => PalaverConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PalaverConfig::default(),
    };
    if args.seed.is_some() {
        config.general.seed = args.seed;
    }
    config.validate().context("invalid configuration")?;
    init_tracing(&config.general.log_level, args.json || config.general.json_logs);

    info!("Starting Palaver demo");

    let keys = ApiKeys::from_env();
    let client = Arc::new(dialogue_client(&config.llm, &keys));
    if !client.is_available() {
        warn!("no dialogue provider configured; NPCs will use fallback lines");
    }
    let voice = voice_queue(&config.voice, &keys, Arc::new(LoggingSink));

    let mut world = World::new(config.clone(), Arc::new(TracingEvents)).with_voice(voice.clone());
    if config.persistence.enabled {
        let store = ArchiveStore::open(&config.persistence.path)
            .with_context(|| format!("opening {}", config.persistence.path))?;
        world = world.with_store(store);
    }
    let placed = world.populate();
    let restored = world.restore_dialogue()?;
    info!(placed, restored, "scene populated");

    let runtime = SceneRuntime::new(world, client.clone()).with_personality_client(client);
    let visitor = runtime.spawn_described("travelling bard").await?;
    info!(npc = %visitor, "visitor arrived");

    walk_to_nearest(&runtime).await;
    let partner = match runtime.world().lock().player_mode() {
        PlayerMode::Approaching { npc, .. } => Some(npc.clone()),
        _ => None,
    };
    match partner {
        Some(npc) => match runtime.talk(&npc) {
            Ok(_) => runtime.submit_message("Hello there!")?,
            Err(err) => warn!(npc = %npc, error = %err, "could not start talking"),
        },
        None => warn!("nobody within reach"),
    }

    let seconds = args.seconds.unwrap_or(30);
    runtime
        .run_until(TICK, async {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
            }
        })
        .await;

    voice.shutdown();
    let saved = runtime.world().lock().save()?;
    info!(saved, stats = ?voice.stats(), "demo finished");
    Ok(())
}

/// Steer the player toward the closest NPC until it is in reach or ten
/// seconds pass.
async fn walk_to_nearest(runtime: &SceneRuntime) {
    let world = runtime.world();
    for _ in 0..200 {
        let direction = {
            let w = world.lock();
            if matches!(w.player_mode(), PlayerMode::Approaching { .. }) {
                return;
            }
            let Some((npc, _)) = w.field().nearest_npc(&ActorId::Player, f32::MAX, |_| true) else {
                return;
            };
            let (Ok(from), Ok(to)) = (
                w.field().position_of(&ActorId::Player),
                w.field().position_of(&ActorId::Npc(npc)),
            ) else {
                return;
            };
            let (dx, dy) = (to.x - from.x, to.y - from.y);
            let len = dx.hypot(dy).max(f32::EPSILON);
            (dx / len, dy / len)
        };
        #[allow(clippy::cast_possible_truncation)]
        let dt = TICK.as_millis() as u64;
        world.lock().move_player(direction.0, direction.1, dt);
        runtime.step(dt);
        tokio::time::sleep(TICK).await;
    }
}
