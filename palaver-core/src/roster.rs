//! NPC population: the random starting roster and user-spawned NPCs.

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::WorldConfig;
use crate::error::{PalaverError, Result};
use crate::npc::{NpcRecord, NpcRegistry, name_from_description};
use crate::personality::{DESCRIPTION_POOL, random_traits};
use crate::spatial::SpatialField;
use crate::types::{NpcId, Position};

/// Everything needed to create one NPC. Unset fields are derived.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NpcSpec {
    /// Fixed id; generated when absent.
    #[serde(default)]
    pub id: Option<NpcId>,
    /// Display name; derived from the description when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Short description.
    pub description: String,
    /// Personality text; derived from the description when absent.
    #[serde(default)]
    pub personality: Option<String>,
    /// Trait keywords.
    #[serde(default)]
    pub traits: Vec<String>,
    /// Lines the NPC starts with.
    #[serde(default)]
    pub dialogue: Vec<String>,
    /// Spawn position; sampled when absent.
    #[serde(default)]
    pub position: Option<Position>,
}

impl NpcSpec {
    /// A spec with only a description.
    #[must_use]
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}

/// Default personality text for a description.
#[must_use]
pub fn default_personality(description: &str) -> String {
    format!("A {description} with a unique personality")
}

/// Place and register one NPC.
///
/// # Errors
/// `NoValidPosition` if no free spot is found, `InvalidTransition` if the
/// id is already taken.
pub fn spawn<R: Rng + ?Sized>(
    field: &mut SpatialField,
    npcs: &mut NpcRegistry,
    config: &WorldConfig,
    spec: NpcSpec,
    rng: &mut R,
) -> Result<NpcId> {
    let id = spec.id.unwrap_or_else(NpcId::generate);
    if npcs.contains(&id) {
        return Err(PalaverError::InvalidTransition(format!("{id} already exists")));
    }
    let position = match spec.position {
        Some(p) => p,
        None => field.find_unoccupied_spawn(
            config.spawn_attempts,
            config.spawn_margin,
            config.npc_radius,
            rng,
        )?,
    };
    let name = spec
        .name
        .unwrap_or_else(|| name_from_description(&spec.description));
    let personality = spec
        .personality
        .unwrap_or_else(|| default_personality(&spec.description));

    let mut record = NpcRecord::new(
        id.clone(),
        name,
        spec.description,
        personality,
        spec.traits,
        config.npc_speed,
    );
    record.dialogue = spec.dialogue;

    field.insert_npc(id.clone(), position, config.npc_radius);
    debug!(npc = %id, name = %record.name, position = %position, "npc spawned");
    npcs.insert(record);
    Ok(id)
}

/// Populate the starting roster: `initial_npcs_min..=initial_npcs_max`
/// NPCs named `NPC {n}` with random descriptions and traits.
///
/// NPCs that cannot be placed are skipped.
pub fn populate<R: Rng + ?Sized>(
    field: &mut SpatialField,
    npcs: &mut NpcRegistry,
    config: &WorldConfig,
    rng: &mut R,
) -> Vec<NpcId> {
    let count = rng.gen_range(config.initial_npcs_min..=config.initial_npcs_max);
    let mut spawned = Vec::with_capacity(count);
    for n in 1..=count {
        let description = DESCRIPTION_POOL
            .choose(rng)
            .copied()
            .unwrap_or("friendly traveler");
        let spec = NpcSpec {
            id: Some(NpcId::new(format!("npc_{n}"))),
            name: Some(format!("NPC {n}")),
            description: description.to_string(),
            personality: Some(default_personality(description)),
            traits: random_traits(rng),
            dialogue: Vec::new(),
            position: None,
        };
        match spawn(field, npcs, config, spec, rng) {
            Ok(id) => spawned.push(id),
            Err(err) => warn!(n, error = %err, "skipping npc"),
        }
    }
    info!(requested = count, spawned = spawned.len(), "roster populated");
    spawned
}
