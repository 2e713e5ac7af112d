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

use parking_lot::RwLock;
use roadguard_core::coordinates::{LoadedWorld, WorldId};
use rustc_hash::FxHashMap;

/// Lookup of live worlds, provided by the hosting engine.
///
/// Both lookups return None for worlds that do not exist or are not currently loaded.
/// Implementations must not panic for unknown worlds.
pub trait WorldResolver: Send + Sync {
    fn world_by_id(&self, id: WorldId) -> Option<LoadedWorld>;
    fn world_by_name(&self, name: &str) -> Option<LoadedWorld>;
}

/// A resolver backed by an explicit table of loaded worlds. Hosts that track world
/// load/unload themselves can keep one of these up to date; tests use it directly.
#[derive(Default)]
pub struct StaticWorldResolver {
    worlds: RwLock<FxHashMap<WorldId, LoadedWorld>>,
}
impl StaticWorldResolver {
    pub fn new() -> StaticWorldResolver {
        Self::default()
    }

    pub fn with_worlds(worlds: impl IntoIterator<Item = LoadedWorld>) -> StaticWorldResolver {
        let resolver = Self::new();
        for world in worlds {
            resolver.load(world);
        }
        resolver
    }

    pub fn load(&self, world: LoadedWorld) {
        self.worlds.write().insert(world.id(), world);
    }

    pub fn unload(&self, id: WorldId) -> Option<LoadedWorld> {
        self.worlds.write().remove(&id)
    }
}
impl WorldResolver for StaticWorldResolver {
    fn world_by_id(&self, id: WorldId) -> Option<LoadedWorld> {
        self.worlds.read().get(&id).cloned()
    }

    fn world_by_name(&self, name: &str) -> Option<LoadedWorld> {
        self.worlds
            .read()
            .values()
            .find(|w| w.name() == name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_and_unload() {
        let overworld = LoadedWorld::new(WorldId::random(), "overworld").unwrap();
        let resolver = StaticWorldResolver::with_worlds([overworld.clone()]);
        assert_eq!(resolver.world_by_name("overworld"), Some(overworld.clone()));
        assert_eq!(resolver.world_by_id(overworld.id()), Some(overworld.clone()));
        assert!(resolver.world_by_name("nether").is_none());

        resolver.unload(overworld.id());
        assert!(resolver.world_by_id(overworld.id()).is_none());
    }
}
