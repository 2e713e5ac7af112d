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

//! Expansion of a single clicked block into the connected road it belongs to.

use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use crate::coordinates::BlockCoordinate;

/// Read access to the materials of the world the selection runs in.
pub trait MaterialSource {
    type Material;
    /// Returns the material at the coordinate, or None if it cannot be read right now
    /// (e.g. the block is not loaded). Unreadable blocks are treated as ineligible.
    fn material_at(&self, coord: BlockCoordinate) -> Option<Self::Material>;
}

impl<M, F> MaterialSource for F
where
    F: Fn(BlockCoordinate) -> Option<M>,
{
    type Material = M;

    fn material_at(&self, coord: BlockCoordinate) -> Option<M> {
        self(coord)
    }
}

// Same Y level only
const HORIZONTAL_NEIGHBORS: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

/// Breadth-first selection of a horizontally connected region of eligible blocks.
#[derive(Clone, Copy, Debug)]
pub struct FloodFillSelector {
    spread_distance: u32,
}
impl FloodFillSelector {
    pub fn new(spread_distance: u32) -> FloodFillSelector {
        FloodFillSelector { spread_distance }
    }

    pub fn spread_distance(&self) -> u32 {
        self.spread_distance
    }

    fn in_range(&self, start: &BlockCoordinate, candidate: &BlockCoordinate) -> bool {
        let limit = (self.spread_distance as i64) * (self.spread_distance as i64);
        match start.distance_squared(candidate) {
            Some(distance) => distance < limit,
            None => false,
        }
    }

    /// Returns every block reachable from `start` through north/south/east/west steps on
    /// eligible blocks, each strictly closer than the spread distance to `start`.
    ///
    /// The start block itself is subject to the same checks; an ineligible start yields an
    /// empty selection.
    pub fn select<S, P>(
        &self,
        start: BlockCoordinate,
        materials: &S,
        is_eligible: P,
    ) -> FxHashSet<BlockCoordinate>
    where
        S: MaterialSource + ?Sized,
        P: Fn(&S::Material) -> bool,
    {
        let mut selected = FxHashSet::default();
        let mut queue = VecDeque::new();
        queue.push_back(start);

        while let Some(coord) = queue.pop_front() {
            if selected.contains(&coord) || !self.in_range(&start, &coord) {
                continue;
            }
            match materials.material_at(coord) {
                Some(material) if is_eligible(&material) => {}
                _ => continue,
            }
            selected.insert(coord);

            for (dx, dz) in HORIZONTAL_NEIGHBORS {
                if let Some(neighbor) = coord.try_delta(dx, 0, dz) {
                    if !selected.contains(&neighbor) {
                        queue.push_back(neighbor);
                    }
                }
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use rustc_hash::FxHashMap;

    use super::*;
    use crate::coordinates::{LoadedWorld, WorldId};

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    enum Material {
        Asphalt,
        Gravel,
        Grass,
    }

    struct FakeWorld {
        world: LoadedWorld,
        blocks: FxHashMap<(i32, i32, i32), Material>,
    }
    impl FakeWorld {
        fn new() -> FakeWorld {
            FakeWorld {
                world: LoadedWorld::new(WorldId::random(), "test").unwrap(),
                blocks: FxHashMap::default(),
            }
        }
        fn set(&mut self, x: i32, y: i32, z: i32, material: Material) {
            self.blocks.insert((x, y, z), material);
        }
        fn at(&self, x: i32, y: i32, z: i32) -> BlockCoordinate {
            BlockCoordinate::at(&self.world, x, y, z)
        }
    }
    impl MaterialSource for FakeWorld {
        type Material = Material;
        fn material_at(&self, coord: BlockCoordinate) -> Option<Material> {
            self.blocks.get(&(coord.x(), coord.y(), coord.z())).copied()
        }
    }

    fn is_road(m: &Material) -> bool {
        matches!(m, Material::Asphalt | Material::Gravel)
    }

    #[test]
    fn line_is_bounded_by_spread_distance() {
        let mut world = FakeWorld::new();
        for x in 0..50 {
            world.set(x, 10, 0, Material::Asphalt);
        }
        let selection = FloodFillSelector::new(20).select(world.at(0, 10, 0), &world, is_road);
        assert_eq!(selection.len(), 20);
        for x in 0..20 {
            assert!(selection.contains(&world.at(x, 10, 0)));
        }
        assert!(!selection.contains(&world.at(20, 10, 0)));
    }

    #[test]
    fn ineligible_block_splits_the_line() {
        let mut world = FakeWorld::new();
        for x in 0..10 {
            world.set(x, 0, 0, Material::Gravel);
        }
        world.set(4, 0, 0, Material::Grass);
        let selector = FloodFillSelector::new(64);

        let left = selector.select(world.at(0, 0, 0), &world, is_road);
        let right = selector.select(world.at(9, 0, 0), &world, is_road);
        assert_eq!(left.len(), 4);
        assert_eq!(right.len(), 5);
        assert!(left.is_disjoint(&right));
        assert!(!left.contains(&world.at(4, 0, 0)));
    }

    #[test]
    fn only_same_level_is_explored() {
        let mut world = FakeWorld::new();
        for x in 0..4 {
            for z in 0..4 {
                world.set(x, 5, z, Material::Asphalt);
                world.set(x, 6, z, Material::Asphalt);
            }
        }
        let selection = FloodFillSelector::new(64).select(world.at(1, 5, 1), &world, is_road);
        assert_eq!(selection.len(), 16);
        assert!(selection.iter().all(|c| c.y() == 5));
    }

    #[test]
    fn diagonals_do_not_connect() {
        let mut world = FakeWorld::new();
        world.set(0, 0, 0, Material::Asphalt);
        world.set(1, 0, 1, Material::Asphalt);
        let selection = FloodFillSelector::new(64).select(world.at(0, 0, 0), &world, is_road);
        assert_eq!(selection.len(), 1);
    }

    #[test]
    fn repeated_selection_is_identical() {
        let mut world = FakeWorld::new();
        for x in -8i32..8 {
            for z in -8..8 {
                if (x * 7 + z * 3).rem_euclid(5) != 0 {
                    world.set(x, 0, z, Material::Asphalt);
                }
            }
        }
        let selector = FloodFillSelector::new(6);
        let first = selector.select(world.at(1, 0, 0), &world, is_road);
        let second = selector.select(world.at(1, 0, 0), &world, is_road);
        assert!(!first.is_empty());
        assert_eq!(first, second);
        for coord in &first {
            assert!(coord.distance_squared(&world.at(1, 0, 0)).unwrap() < 36);
        }
    }

    #[test]
    fn ineligible_start_selects_nothing() {
        let mut world = FakeWorld::new();
        world.set(0, 0, 0, Material::Grass);
        world.set(1, 0, 0, Material::Asphalt);
        let selection = FloodFillSelector::new(64).select(world.at(0, 0, 0), &world, is_road);
        assert!(selection.is_empty());
        assert!(FloodFillSelector::new(0)
            .select(world.at(1, 0, 0), &world, is_road)
            .is_empty());
    }

    #[test]
    fn closures_are_material_sources() {
        let world = LoadedWorld::new(WorldId::random(), "closure").unwrap();
        let lookup = |c: BlockCoordinate| Some(c.x().abs() < 3 && c.z() == 0);
        let selection =
            FloodFillSelector::new(10).select(BlockCoordinate::at(&world, 0, 0, 0), &lookup, |m| *m);
        assert_eq!(selection.len(), 5);
    }
}
