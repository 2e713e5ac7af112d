// Copyright 2023 drey7925
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use rustc_hash::FxHasher;
use thiserror::Error;
use uuid::Uuid;

use crate::constants::CHUNK_EDGE;

/// Stable identifier of a world. Unlike the display name, this survives renames and reloads.
#[derive(PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct WorldId(pub Uuid);
impl WorldId {
    pub fn from_halves(high: i64, low: i64) -> WorldId {
        WorldId(Uuid::from_u64_pair(high as u64, low as u64))
    }
    /// The (most significant, least significant) halves of the id, as stored in the block table.
    pub fn as_halves(&self) -> (i64, i64) {
        let (high, low) = self.0.as_u64_pair();
        (high as i64, low as i64)
    }
    pub fn random() -> WorldId {
        WorldId(Uuid::new_v4())
    }
}
impl Debug for WorldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "world:{}", self.0)
    }
}
impl Display for WorldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}
impl FromStr for WorldId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(WorldId(Uuid::parse_str(s)?))
    }
}

/// A handle to a world that is currently loaded by the host, as handed out by a world resolver.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LoadedWorld {
    id: WorldId,
    name: Arc<str>,
}
impl LoadedWorld {
    /// Fails with [InvalidReason::WorldNameBlank] for an empty or whitespace-only name, the
    /// same check that validating a [Location] applies.
    pub fn new(id: WorldId, name: impl Into<Arc<str>>) -> Result<LoadedWorld, InvalidReason> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(InvalidReason::WorldNameBlank);
        }
        Ok(LoadedWorld { id, name })
    }
    pub fn id(&self) -> WorldId {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
}
impl Debug for LoadedWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// What the host knows about the world of a location. Every field may be missing or stale;
/// validation into a [BlockCoordinate] decides whether it can be used.
#[derive(Clone, Debug, Default)]
pub struct WorldRef {
    pub id: Option<WorldId>,
    pub name: Option<String>,
    pub loaded: bool,
}
impl From<&LoadedWorld> for WorldRef {
    fn from(world: &LoadedWorld) -> Self {
        WorldRef {
            id: Some(world.id),
            name: Some(world.name.to_string()),
            loaded: true,
        }
    }
}

/// An unvalidated block location, as supplied by the hosting engine.
#[derive(Clone, Debug)]
pub struct Location {
    pub world: Option<WorldRef>,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}
impl Location {
    pub fn new(world: Option<WorldRef>, x: i32, y: i32, z: i32) -> Location {
        Location { world, x, y, z }
    }
    pub fn in_world(world: &LoadedWorld, x: i32, y: i32, z: i32) -> Location {
        Location {
            world: Some(world.into()),
            x,
            y,
            z,
        }
    }
}

/// Why a location cannot be turned into a protectable coordinate.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidReason {
    #[error("LOCATION_NULL: no location was supplied")]
    LocationNull,
    #[error("WORLD_NULL: the location has no world")]
    WorldNull,
    #[error("WORLD_NOT_LOADED: the location's world is not loaded")]
    WorldNotLoaded,
    #[error("WORLD_NAME_BLANK: the location's world has a null or blank name")]
    WorldNameBlank,
    #[error("WORLD_ID_NULL: the location's world has no id")]
    WorldIdNull,
}
impl InvalidReason {
    /// Stable short code, suitable for log aggregation.
    pub fn code(&self) -> &'static str {
        match self {
            InvalidReason::LocationNull => "LOCATION_NULL",
            InvalidReason::WorldNull => "WORLD_NULL",
            InvalidReason::WorldNotLoaded => "WORLD_NOT_LOADED",
            InvalidReason::WorldNameBlank => "WORLD_NAME_BLANK",
            InvalidReason::WorldIdNull => "WORLD_ID_NULL",
        }
    }
}

/// The identity of one protectable block: a world and an integer position within it.
///
/// Values of this type have always passed validation: they are produced either from a
/// [LoadedWorld] handle or by validating a [Location]. The chunk coordinates are derived
/// from x and z on construction and cannot be set independently.
///
/// Note that the impls of PartialOrd and Ord are meant for tiebreaking (e.g. for sorted data
/// structures) and don't have a lot of semantic meaning on their own.
#[derive(Clone, Copy)]
pub struct BlockCoordinate {
    world: WorldId,
    x: i32,
    y: i32,
    z: i32,
    chunk_x: i32,
    chunk_z: i32,
}
impl BlockCoordinate {
    pub fn at(world: &LoadedWorld, x: i32, y: i32, z: i32) -> BlockCoordinate {
        Self::derive(world.id, x, y, z)
    }

    /// Validates a location that may be entirely absent.
    pub fn validate(location: Option<&Location>) -> Result<BlockCoordinate, InvalidReason> {
        match location {
            Some(location) => location.try_into(),
            None => Err(InvalidReason::LocationNull),
        }
    }

    #[inline]
    fn derive(world: WorldId, x: i32, y: i32, z: i32) -> BlockCoordinate {
        BlockCoordinate {
            world,
            x,
            y,
            z,
            chunk_x: x.div_euclid(CHUNK_EDGE),
            chunk_z: z.div_euclid(CHUNK_EDGE),
        }
    }

    #[inline]
    pub fn world(&self) -> WorldId {
        self.world
    }
    #[inline]
    pub fn x(&self) -> i32 {
        self.x
    }
    #[inline]
    pub fn y(&self) -> i32 {
        self.y
    }
    #[inline]
    pub fn z(&self) -> i32 {
        self.z
    }
    #[inline]
    pub fn chunk_x(&self) -> i32 {
        self.chunk_x
    }
    #[inline]
    pub fn chunk_z(&self) -> i32 {
        self.chunk_z
    }
    #[inline]
    pub fn chunk(&self) -> ChunkKey {
        ChunkKey {
            world: self.world,
            x: self.chunk_x,
            z: self.chunk_z,
        }
    }

    /// Same world, shifted by the given deltas. Returns None on i32 overflow.
    pub fn try_delta(&self, x: i32, y: i32, z: i32) -> Option<BlockCoordinate> {
        let x = self.x.checked_add(x)?;
        let y = self.y.checked_add(y)?;
        let z = self.z.checked_add(z)?;
        Some(Self::derive(self.world, x, y, z))
    }

    /// Squared euclidean distance, computed in i64 so that it cannot overflow.
    /// Coordinates in different worlds are infinitely far apart.
    pub fn distance_squared(&self, other: &BlockCoordinate) -> Option<i64> {
        if self.world != other.world {
            return None;
        }
        let dx = self.x as i64 - other.x as i64;
        let dy = self.y as i64 - other.y as i64;
        let dz = self.z as i64 - other.z as i64;
        Some(dx * dx + dy * dy + dz * dz)
    }

    /// True if x and z are both within `radius` of the origin's. Y is ignored.
    pub fn within_square(&self, origin: &BlockCoordinate, radius: u32) -> bool {
        self.world == origin.world
            && self.x.abs_diff(origin.x) <= radius
            && self.z.abs_diff(origin.z) <= radius
    }
}

impl TryFrom<&Location> for BlockCoordinate {
    type Error = InvalidReason;

    fn try_from(location: &Location) -> std::result::Result<Self, Self::Error> {
        let world = location.world.as_ref().ok_or(InvalidReason::WorldNull)?;
        if !world.loaded {
            return Err(InvalidReason::WorldNotLoaded);
        }
        match world.name.as_deref() {
            Some(name) if !name.trim().is_empty() => {}
            _ => return Err(InvalidReason::WorldNameBlank),
        }
        let id = world.id.ok_or(InvalidReason::WorldIdNull)?;
        Ok(Self::derive(id, location.x, location.y, location.z))
    }
}

// Identity is (world, x, y, z). The chunk fields are a pure function of x and z.
impl PartialEq for BlockCoordinate {
    fn eq(&self, other: &Self) -> bool {
        self.world == other.world && self.x == other.x && self.y == other.y && self.z == other.z
    }
}
impl Eq for BlockCoordinate {}
impl Hash for BlockCoordinate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.world.hash(state);
        self.x.hash(state);
        self.y.hash(state);
        self.z.hash(state);
    }
}
impl PartialOrd for BlockCoordinate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for BlockCoordinate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.world
            .cmp(&other.world)
            .then(self.x.cmp(&other.x))
            .then(self.z.cmp(&other.z))
            .then(self.y.cmp(&other.y))
    }
}
impl Debug for BlockCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "[{}, {}, {} in {}]",
            self.x, self.y, self.z, self.world
        ))
    }
}

/// Represents a column of blocks belonging to one chunk of one world.
///
/// Each coordinate spans 16 blocks, covering the range [chunk.x * 16, chunk.x * 16 + 15].
/// There is no vertical component: a chunk spans the full height of the world.
#[derive(PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct ChunkKey {
    pub world: WorldId,
    pub x: i32,
    pub z: i32,
}
impl ChunkKey {
    pub fn new(world: WorldId, x: i32, z: i32) -> ChunkKey {
        ChunkKey { world, x, z }
    }
    /// Returns true if the given block falls into this chunk.
    pub fn contains(&self, coord: &BlockCoordinate) -> bool {
        coord.world == self.world && coord.chunk_x == self.x && coord.chunk_z == self.z
    }
    /// A hash function for ChunkKey that keeps close chunks together. Stable only within a
    /// process; do not persist it.
    pub fn coarse_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.world.hash(&mut hasher);
        (self.x >> 4).hash(&mut hasher);
        (self.z >> 4).hash(&mut hasher);
        hasher.finish()
    }
}
impl Debug for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("chunk[{}, {} in {}]", self.x, self.z, self.world))
    }
}
impl FromStr for ChunkKey {
    type Err = anyhow::Error;

    /// Parses `world_uuid,x,z`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let pieces: Vec<_> = s.split(',').collect();
        if pieces.len() != 3 {
            bail!("Wrong number of components");
        };
        Ok(ChunkKey::new(
            pieces[0].trim().parse()?,
            pieces[1].trim().parse()?,
            pieces[2].trim().parse()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> LoadedWorld {
        LoadedWorld::new(WorldId::random(), "overworld").unwrap()
    }

    #[test]
    fn chunk_is_floor_division() {
        let w = world();
        let c = BlockCoordinate::at(&w, -1, 64, 15);
        assert_eq!((c.chunk_x(), c.chunk_z()), (-1, 0));
        let c = BlockCoordinate::at(&w, -16, 0, -17);
        assert_eq!((c.chunk_x(), c.chunk_z()), (-1, -2));
        let c = BlockCoordinate::at(&w, 16, 0, 31);
        assert_eq!((c.chunk_x(), c.chunk_z()), (1, 1));
    }

    #[test]
    fn delta_rederives_chunk() {
        let w = world();
        let c = BlockCoordinate::at(&w, 15, 3, 0).try_delta(1, 0, -1).unwrap();
        assert_eq!(c.chunk(), ChunkKey::new(w.id(), 1, -1));
        assert!(BlockCoordinate::at(&w, i32::MAX, 0, 0)
            .try_delta(1, 0, 0)
            .is_none());
    }

    #[test]
    fn validation_reasons() {
        let w = world();
        assert_eq!(
            BlockCoordinate::validate(None).unwrap_err(),
            InvalidReason::LocationNull
        );
        assert_eq!(
            BlockCoordinate::validate(Some(&Location::new(None, 1, 2, 3))).unwrap_err(),
            InvalidReason::WorldNull
        );

        let mut unloaded = WorldRef::from(&w);
        unloaded.loaded = false;
        assert_eq!(
            BlockCoordinate::try_from(&Location::new(Some(unloaded), 1, 2, 3)).unwrap_err(),
            InvalidReason::WorldNotLoaded
        );

        let mut blank = WorldRef::from(&w);
        blank.name = Some("  ".to_string());
        assert_eq!(
            BlockCoordinate::try_from(&Location::new(Some(blank), 1, 2, 3)).unwrap_err(),
            InvalidReason::WorldNameBlank
        );

        let mut no_id = WorldRef::from(&w);
        no_id.id = None;
        let err = BlockCoordinate::try_from(&Location::new(Some(no_id), 1, 2, 3)).unwrap_err();
        assert_eq!(err, InvalidReason::WorldIdNull);
        assert_eq!(err.code(), "WORLD_ID_NULL");

        let ok = BlockCoordinate::try_from(&Location::in_world(&w, 1, 2, 3)).unwrap();
        assert_eq!(ok, BlockCoordinate::at(&w, 1, 2, 3));
    }

    #[test]
    fn loaded_world_needs_a_name() {
        for name in ["", " \t "] {
            assert_eq!(
                LoadedWorld::new(WorldId::random(), name).unwrap_err(),
                InvalidReason::WorldNameBlank
            );
        }
        assert_eq!(world().name(), "overworld");
    }

    #[test]
    fn identity_is_world_and_position() {
        let a = world();
        let b = world();
        assert_ne!(BlockCoordinate::at(&a, 1, 2, 3), BlockCoordinate::at(&b, 1, 2, 3));
        assert_eq!(
            BlockCoordinate::at(&a, 1, 2, 3).distance_squared(&BlockCoordinate::at(&a, 4, 2, 7)),
            Some(25)
        );
        assert_eq!(
            BlockCoordinate::at(&a, 1, 2, 3).distance_squared(&BlockCoordinate::at(&b, 1, 2, 3)),
            None
        );
    }

    #[test]
    fn world_id_halves_roundtrip() {
        let id = WorldId::random();
        let (high, low) = id.as_halves();
        assert_eq!(WorldId::from_halves(high, low), id);
    }

    #[test]
    fn parse_chunk_key() {
        let id = WorldId::random();
        let key: ChunkKey = format!("{id}, -3, 7").parse().unwrap();
        assert_eq!(key, ChunkKey::new(id, -3, 7));
        assert!("nope,1".parse::<ChunkKey>().is_err());
    }
}
