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

//! In-memory view of the protected block table.
//!
//! Entries are grouped by chunk, and chunks are spread over a fixed number of lock shards so
//! that the game loop and the writeback task rarely contend on the same lock.

use parking_lot::RwLock;
use roadguard_core::coordinates::{BlockCoordinate, ChunkKey, WorldId};
use rustc_hash::{FxHashMap, FxHashSet};
use tracy_client::span;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// Known to be in the durable store.
    Resident,
    /// Saved by a caller; the durable write has not completed yet.
    PendingInsert,
    /// Deleted by a caller; the durable delete has not completed yet.
    PendingDelete,
}
impl CacheState {
    pub fn is_protected(&self) -> bool {
        match self {
            CacheState::Resident | CacheState::PendingInsert => true,
            CacheState::PendingDelete => false,
        }
    }
    pub fn is_pending(&self) -> bool {
        !matches!(self, CacheState::Resident)
    }
}

pub(crate) const NUM_LOCK_SHARDS: usize = 16;
pub(crate) fn shard_id(chunk: ChunkKey) -> usize {
    (chunk.coarse_hash() % NUM_LOCK_SHARDS as u64) as usize
}

type ChunkEntries = FxHashMap<BlockCoordinate, CacheState>;

#[derive(Default)]
struct CacheShard {
    chunks: FxHashMap<ChunkKey, ChunkEntries>,
}

/// Map from coordinate to [CacheState], safe to read and write from any thread.
///
/// Absence of an entry only means "not protected" if the chunk has been loaded (see
/// [ChunkLoadTracker]); the cache itself does not know which chunks are complete.
pub struct CoherentCache {
    // sharded 16 ways based on the coarse hash of the chunk
    shards: [RwLock<CacheShard>; NUM_LOCK_SHARDS],
}
impl CoherentCache {
    pub fn new() -> CoherentCache {
        CoherentCache {
            shards: std::array::from_fn(|_| RwLock::new(CacheShard::default())),
        }
    }

    pub fn get(&self, coord: &BlockCoordinate) -> Option<CacheState> {
        let chunk = coord.chunk();
        self.shards[shard_id(chunk)]
            .read()
            .chunks
            .get(&chunk)
            .and_then(|entries| entries.get(coord))
            .copied()
    }

    /// Moves every coordinate to `state` unless `keep` accepts its current state. Returns
    /// how many entries changed.
    fn mark(
        &self,
        coords: &FxHashSet<BlockCoordinate>,
        state: CacheState,
        keep: impl Fn(Option<CacheState>) -> bool,
    ) -> usize {
        let mut changed = 0;
        for coord in coords {
            let chunk = coord.chunk();
            let mut shard = self.shards[shard_id(chunk)].write();
            let entries = shard.chunks.entry(chunk).or_default();
            if !keep(entries.get(coord).copied()) {
                entries.insert(*coord, state);
                changed += 1;
            }
        }
        changed
    }

    /// Already-resident coordinates stay resident.
    pub fn mark_pending_insert(&self, coords: &FxHashSet<BlockCoordinate>) -> usize {
        let _span = span!("cache mark_pending_insert");
        self.mark(coords, CacheState::PendingInsert, |s| {
            matches!(s, Some(CacheState::Resident | CacheState::PendingInsert))
        })
    }

    pub fn mark_pending_delete(&self, coords: &FxHashSet<BlockCoordinate>) -> usize {
        let _span = span!("cache mark_pending_delete");
        self.mark(coords, CacheState::PendingDelete, |s| {
            s == Some(CacheState::PendingDelete)
        })
    }

    /// `PendingInsert -> Resident` for each coordinate still pending insertion. Entries that
    /// were deleted or evicted in the meantime are left alone.
    pub fn confirm_inserted(&self, coords: &FxHashSet<BlockCoordinate>) -> usize {
        let mut confirmed = 0;
        for coord in coords {
            let chunk = coord.chunk();
            let mut shard = self.shards[shard_id(chunk)].write();
            if let Some(state) = shard
                .chunks
                .get_mut(&chunk)
                .and_then(|entries| entries.get_mut(coord))
            {
                if *state == CacheState::PendingInsert {
                    *state = CacheState::Resident;
                    confirmed += 1;
                }
            }
        }
        confirmed
    }

    /// Removes each coordinate that is still pending deletion.
    pub fn confirm_deleted(&self, coords: &FxHashSet<BlockCoordinate>) -> usize {
        let mut confirmed = 0;
        for coord in coords {
            let chunk = coord.chunk();
            let mut shard = self.shards[shard_id(chunk)].write();
            let Some(entries) = shard.chunks.get_mut(&chunk) else {
                continue;
            };
            if entries.get(coord) == Some(&CacheState::PendingDelete) {
                entries.remove(coord);
                confirmed += 1;
            }
            if entries.is_empty() {
                shard.chunks.remove(&chunk);
            }
        }
        confirmed
    }

    /// Inserts durable rows of a chunk as [CacheState::Resident]. Coordinates that already
    /// have an entry keep it, so pending markers win over what the store returned.
    pub fn merge_resident(
        &self,
        chunk: ChunkKey,
        coords: impl IntoIterator<Item = BlockCoordinate>,
    ) -> usize {
        let mut shard = self.shards[shard_id(chunk)].write();
        let entries = shard.chunks.entry(chunk).or_default();
        let mut added = 0;
        for coord in coords {
            debug_assert!(chunk.contains(&coord));
            entries.entry(coord).or_insert_with(|| {
                added += 1;
                CacheState::Resident
            });
        }
        added
    }

    /// Drops every entry of the chunk, including pending ones. Returns the dropped entries.
    pub fn evict_chunk(&self, chunk: ChunkKey) -> usize {
        let Some(entries) = self.shards[shard_id(chunk)].write().chunks.remove(&chunk) else {
            return 0;
        };
        let pending = entries.values().filter(|s| s.is_pending()).count();
        if pending > 0 {
            log::debug!("Evicting {chunk:?} with {pending} pending entries");
        }
        entries.len()
    }

    /// Protected coordinates of one chunk, as far as the cache knows.
    pub fn protected_in_chunk(&self, chunk: ChunkKey) -> FxHashSet<BlockCoordinate> {
        self.shards[shard_id(chunk)]
            .read()
            .chunks
            .get(&chunk)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, state)| state.is_protected())
                    .map(|(coord, _)| *coord)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pending entries whose x and z are within radius of the origin's.
    pub fn pending_within(
        &self,
        origin: &BlockCoordinate,
        radius: u32,
    ) -> Vec<(BlockCoordinate, CacheState)> {
        let world: WorldId = origin.world();
        let mut result = Vec::new();
        for shard in &self.shards {
            let shard = shard.read();
            for (chunk, entries) in shard.chunks.iter() {
                if chunk.world != world {
                    continue;
                }
                result.extend(
                    entries
                        .iter()
                        .filter(|(coord, state)| {
                            state.is_pending() && coord.within_square(origin, radius)
                        })
                        .map(|(coord, state)| (*coord, *state)),
                );
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().chunks.values().map(|e| e.len()).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                s.read()
                    .chunks
                    .values()
                    .flat_map(|e| e.values())
                    .filter(|state| state.is_pending())
                    .count()
            })
            .sum()
    }
}
impl Default for CoherentCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Set of chunks whose durable rows have all been merged into the [CoherentCache].
pub struct ChunkLoadTracker {
    shards: [RwLock<FxHashSet<ChunkKey>>; NUM_LOCK_SHARDS],
}
impl ChunkLoadTracker {
    pub fn new() -> ChunkLoadTracker {
        ChunkLoadTracker {
            shards: std::array::from_fn(|_| RwLock::new(FxHashSet::default())),
        }
    }

    pub fn is_loaded(&self, chunk: ChunkKey) -> bool {
        self.shards[shard_id(chunk)].read().contains(&chunk)
    }

    /// Returns false if the chunk was already marked.
    pub fn mark_loaded(&self, chunk: ChunkKey) -> bool {
        self.shards[shard_id(chunk)].write().insert(chunk)
    }

    /// Returns false if the chunk was not loaded.
    pub fn unmark(&self, chunk: ChunkKey) -> bool {
        self.shards[shard_id(chunk)].write().remove(&chunk)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
impl Default for ChunkLoadTracker {
    fn default() -> Self {
        Self::new()
    }
}
