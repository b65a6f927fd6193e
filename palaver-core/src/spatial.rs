//! Spatial field: actor positions, collision avoidance and proximity queries.
//!
//! The field is the single writer of positions. Everything else reads
//! through [`SpatialField::position_of`] or the proximity helpers.
//!
//! ## Collision model
//!
//! Every actor is a disc. Two actors overlap when their centres are closer
//! than `radius_a + radius_b + padding`. Resolution pushes *both* actors of
//! an overlapping pair apart by half the shortfall each, including
//! player↔NPC pairs, and re-clamps everyone into the world bounds.

use std::collections::BTreeMap;
use std::f32::consts::TAU;

use rand::Rng;
use tracing::debug;

use crate::config::WorldConfig;
use crate::error::{PalaverError, Result};
use crate::types::{ActorId, Bounds, Millis, NpcId, Position};

/// Overshoot added to every push so resolved pairs land strictly apart.
const SEPARATION_SLACK: f32 = 1e-3;

/// Below this distance two centres are treated as coincident.
const COINCIDENT_EPSILON: f32 = 1e-4;

/// A collidable disc.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Body {
    /// Centre.
    pub position: Position,
    /// Collision radius.
    pub radius: f32,
}

/// Positions of the player and all NPCs.
#[derive(Debug, Clone)]
pub struct SpatialField {
    bounds: Bounds,
    padding: f32,
    max_passes: u32,
    player: Body,
    npcs: BTreeMap<NpcId, Body>,
}

impl SpatialField {
    /// Create a field holding only the player.
    #[must_use]
    pub fn new(bounds: Bounds, padding: f32, max_passes: u32, player: Body) -> Self {
        let player = Body {
            position: bounds.clamp(player.position),
            ..player
        };
        Self {
            bounds,
            padding,
            max_passes: max_passes.max(1),
            player,
            npcs: BTreeMap::new(),
        }
    }

    /// Create a field from world configuration with the player at `start`.
    #[must_use]
    pub fn from_config(config: &WorldConfig, start: Position) -> Self {
        Self::new(
            Bounds::sized(config.width, config.height),
            config.collision_padding,
            config.collision_passes,
            Body {
                position: start,
                radius: config.player_radius,
            },
        )
    }

    /// World bounds.
    #[must_use]
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Track a new NPC body. Replaces any existing body with the same id.
    pub fn insert_npc(&mut self, id: NpcId, position: Position, radius: f32) {
        let position = self.bounds.clamp(position);
        self.npcs.insert(id, Body { position, radius });
    }

    /// Stop tracking an NPC.
    pub fn remove_npc(&mut self, id: &NpcId) -> Option<Body> {
        self.npcs.remove(id)
    }

    /// Whether the actor is tracked.
    #[must_use]
    pub fn contains(&self, actor: &ActorId) -> bool {
        match actor {
            ActorId::Player => true,
            ActorId::Npc(id) => self.npcs.contains_key(id),
        }
    }

    /// Tracked NPC ids in ascending order.
    pub fn npc_ids(&self) -> impl Iterator<Item = &NpcId> {
        self.npcs.keys()
    }

    /// Number of tracked NPCs.
    #[must_use]
    pub fn npc_count(&self) -> usize {
        self.npcs.len()
    }

    /// Body of an actor.
    ///
    /// # Errors
    /// `NotFound` if the actor is not tracked.
    pub fn body_of(&self, actor: &ActorId) -> Result<Body> {
        match actor {
            ActorId::Player => Ok(self.player),
            ActorId::Npc(id) => self
                .npcs
                .get(id)
                .copied()
                .ok_or_else(|| PalaverError::NotFound(actor.clone())),
        }
    }

    /// Position of an actor.
    ///
    /// # Errors
    /// `NotFound` if the actor is not tracked.
    pub fn position_of(&self, actor: &ActorId) -> Result<Position> {
        self.body_of(actor).map(|b| b.position)
    }

    /// Overwrite an actor's position (clamped to bounds).
    ///
    /// # Errors
    /// `NotFound` if the actor is not tracked.
    pub fn set_position(&mut self, actor: &ActorId, position: Position) -> Result<()> {
        let position = self.bounds.clamp(position);
        match actor {
            ActorId::Player => {
                self.player.position = position;
                Ok(())
            }
            ActorId::Npc(id) => match self.npcs.get_mut(id) {
                Some(body) => {
                    body.position = position;
                    Ok(())
                }
                None => Err(PalaverError::NotFound(actor.clone())),
            },
        }
    }

    /// Euclidean distance between two actors.
    ///
    /// # Errors
    /// `NotFound` if either actor is not tracked.
    pub fn distance(&self, a: &ActorId, b: &ActorId) -> Result<f32> {
        Ok(self.position_of(a)?.distance_to(self.position_of(b)?))
    }

    /// Minimum centre distance for two bodies to not overlap.
    #[must_use]
    pub fn required_separation(&self, a: &Body, b: &Body) -> f32 {
        a.radius + b.radius + self.padding
    }

    /// Move the player by a delta, clamped to bounds.
    pub fn move_player(&mut self, dx: f32, dy: f32) -> Position {
        self.player.position = self.bounds.clamp(self.player.position.offset(dx, dy));
        self.player.position
    }

    /// Whether a disc at `position` would sit inside the bounds without
    /// overlapping any actor other than `exclude`.
    #[must_use]
    pub fn is_free(&self, position: Position, radius: f32, exclude: Option<&ActorId>) -> bool {
        if !self.bounds.contains(position) {
            return false;
        }
        let probe = Body { position, radius };
        let clear_of = |body: &Body| {
            position.distance_to(body.position) >= self.required_separation(&probe, body)
        };

        if exclude != Some(&ActorId::Player) && !clear_of(&self.player) {
            return false;
        }
        self.npcs.iter().all(|(id, body)| {
            matches!(exclude, Some(ActorId::Npc(ex)) if ex == id) || clear_of(body)
        })
    }

    /// Push apart every overlapping pair, then clamp into bounds.
    ///
    /// Repeats up to the configured pass budget until a pass finds no
    /// overlap. Returns the number of pair pushes performed.
    pub fn resolve_collisions(&mut self) -> usize {
        let mut ids: Vec<ActorId> = Vec::with_capacity(self.npcs.len() + 1);
        let mut bodies: Vec<Body> = Vec::with_capacity(self.npcs.len() + 1);
        ids.push(ActorId::Player);
        bodies.push(self.player);
        for (id, body) in &self.npcs {
            ids.push(ActorId::Npc(id.clone()));
            bodies.push(*body);
        }

        let mut pushes = 0;
        for _ in 0..self.max_passes {
            let mut moved = false;
            for i in 0..bodies.len() {
                for j in (i + 1)..bodies.len() {
                    let required = self.required_separation(&bodies[i], &bodies[j]);
                    let a = bodies[i].position;
                    let b = bodies[j].position;
                    let dist = a.distance_to(b);
                    if dist >= required {
                        continue;
                    }

                    let (ux, uy) = if dist < COINCIDENT_EPSILON {
                        // Deterministic per-pair axis so stacked actors fan out.
                        let angle = (i * 7 + j * 13) as f32;
                        (angle.cos(), angle.sin())
                    } else {
                        ((b.x - a.x) / dist, (b.y - a.y) / dist)
                    };
                    let half = (required - dist) / 2.0 + SEPARATION_SLACK;

                    bodies[i].position = self.bounds.clamp(a.offset(-ux * half, -uy * half));
                    bodies[j].position = self.bounds.clamp(b.offset(ux * half, uy * half));
                    pushes += 1;
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }

        for (id, body) in ids.iter().zip(bodies) {
            match id {
                ActorId::Player => self.player.position = body.position,
                ActorId::Npc(npc) => {
                    if let Some(slot) = self.npcs.get_mut(npc) {
                        slot.position = body.position;
                    }
                }
            }
        }

        if pushes > 0 {
            debug!(pushes, "collisions resolved");
        }
        pushes
    }

    /// Whether any pair of actors currently overlaps (beyond `tolerance`).
    #[must_use]
    pub fn has_overlap(&self, tolerance: f32) -> bool {
        let bodies: Vec<Body> = std::iter::once(self.player)
            .chain(self.npcs.values().copied())
            .collect();
        bodies.iter().enumerate().any(|(i, a)| {
            bodies[i + 1..].iter().any(|b| {
                a.position.distance_to(b.position) < self.required_separation(a, b) - tolerance
            })
        })
    }

    /// Sample a free spawn point for a disc of `radius`.
    ///
    /// # Errors
    /// `NoValidPosition` once `max_attempts` samples all collide. Callers
    /// treat this as a soft failure and skip the spawn.
    pub fn find_unoccupied_spawn<R: Rng + ?Sized>(
        &self,
        max_attempts: u32,
        margin: f32,
        radius: f32,
        rng: &mut R,
    ) -> Result<Position> {
        let area = self.bounds.inset(margin);
        for _ in 0..max_attempts {
            let candidate = Position::new(
                rng.gen_range(area.min_x..=area.max_x),
                rng.gen_range(area.min_y..=area.max_y),
            );
            if self.is_free(candidate, radius, None) {
                return Ok(candidate);
            }
        }
        Err(PalaverError::NoValidPosition {
            attempts: max_attempts,
        })
    }

    /// Nearest NPC within `radius` of `origin` that passes `filter`.
    ///
    /// NPCs are visited in ascending id order and only a strictly closer
    /// candidate replaces the current best, so equidistant ties resolve to
    /// the lowest id.
    pub fn nearest_npc<F>(&self, origin: &ActorId, radius: f32, mut filter: F) -> Option<(NpcId, f32)>
    where
        F: FnMut(&NpcId) -> bool,
    {
        let from = self.position_of(origin).ok()?;
        let mut best: Option<(NpcId, f32)> = None;
        for (id, body) in &self.npcs {
            if origin.as_npc() == Some(id) || !filter(id) {
                continue;
            }
            let dist = from.distance_to(body.position);
            if dist > radius {
                continue;
            }
            if best.as_ref().is_none_or(|(_, d)| dist < *d) {
                best = Some((id.clone(), dist));
            }
        }
        best
    }
}

// ---------------------------------------------------------------------------
// Wandering
// ---------------------------------------------------------------------------

/// Result of one wandering step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveOutcome {
    /// The NPC advanced to the new position.
    Moved(Position),
    /// The target spot was invalid; the NPC stayed put and will re-pick.
    Blocked,
}

/// An NPC's current movement intent.
#[derive(Debug, Clone, PartialEq)]
pub struct Wander {
    /// Heading in radians.
    pub heading: f32,
    /// Speed in units per second.
    pub speed: f32,
    /// Time left on the current heading.
    pub remaining_ms: Millis,
    /// Force a new heading on the next step.
    pub repick: bool,
}

impl Wander {
    /// A fresh intent that picks its first heading on the next step.
    #[must_use]
    pub fn new(speed: f32) -> Self {
        Self {
            heading: 0.0,
            speed,
            remaining_ms: 0,
            repick: true,
        }
    }

    /// Pick a uniformly random heading and a duration in `[min_ms, max_ms]`.
    pub fn repick<R: Rng + ?Sized>(&mut self, min_ms: Millis, max_ms: Millis, rng: &mut R) {
        self.heading = rng.gen_range(0.0..TAU);
        self.remaining_ms = rng.gen_range(min_ms..=max_ms);
        self.repick = false;
    }

    /// Advance one NPC by `dt_ms` along its heading.
    ///
    /// An invalid target (out of bounds or overlapping) aborts the move
    /// without sliding and forces a re-pick next step.
    ///
    /// # Errors
    /// `NotFound` if the NPC is not tracked by the field.
    pub fn step<R: Rng + ?Sized>(
        &mut self,
        id: &NpcId,
        field: &mut SpatialField,
        dt_ms: Millis,
        heading_range: (Millis, Millis),
        rng: &mut R,
    ) -> Result<MoveOutcome> {
        if self.repick || self.remaining_ms == 0 {
            self.repick(heading_range.0, heading_range.1, rng);
        }
        self.remaining_ms = self.remaining_ms.saturating_sub(dt_ms);

        let actor = ActorId::Npc(id.clone());
        let body = field.body_of(&actor)?;
        let step = self.speed * dt_ms as f32 / 1000.0;
        let target = body
            .position
            .offset(self.heading.cos() * step, self.heading.sin() * step);

        if field.is_free(target, body.radius, Some(&actor)) {
            field.set_position(&actor, target)?;
            Ok(MoveOutcome::Moved(target))
        } else {
            self.repick = true;
            Ok(MoveOutcome::Blocked)
        }
    }
}
