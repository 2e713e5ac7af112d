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

pub mod migration;
pub(crate) mod rows;

use std::sync::Arc;

use anyhow::Result;
use itertools::iproduct;
use parking_lot::Mutex;
use roadguard_core::constants::CHUNK_EDGE;
use roadguard_core::coordinates::{BlockCoordinate, ChunkKey, LoadedWorld, WorldId};
use rustc_hash::{FxHashMap, FxHashSet};
use tracy_client::span;

use crate::database::{KeySpace, KvDatabase, WriteOp};
use crate::world::WorldResolver;

use self::rows::{chunk_prefix, row_key, world_prefix, StoredRow};

pub use self::rows::StoreError;

/// Result of one durable write batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Rows actually inserted or removed. Duplicate inserts and deletes of absent rows
    /// are not counted.
    pub rows_affected: usize,
    /// False if the batch failed and nothing was written.
    pub committed: bool,
}
impl BatchOutcome {
    pub fn committed(rows_affected: usize) -> BatchOutcome {
        BatchOutcome {
            rows_affected,
            committed: true,
        }
    }
    pub fn failed() -> BatchOutcome {
        BatchOutcome {
            rows_affected: 0,
            committed: false,
        }
    }
}

/// Durable table of protected block coordinates.
///
/// Writes are idempotent: saving a coordinate that is already stored and deleting one that
/// is not are both no-ops. Write failures are logged by the implementation and reported
/// through [BatchOutcome]; they never propagate as errors.
pub trait BlockStore: Send + Sync {
    fn save(&self, coords: &FxHashSet<BlockCoordinate>) -> BatchOutcome;
    fn delete(&self, coords: &FxHashSet<BlockCoordinate>) -> BatchOutcome;

    /// Full scan. Meant for startup and maintenance, not for per-tick use.
    fn get_all(&self) -> Result<FxHashSet<BlockCoordinate>>;
    fn get_in_chunk(&self, chunk: ChunkKey) -> Result<FxHashSet<BlockCoordinate>>;
    /// Coordinates whose x and z are both within radius of the origin's. This is a bounding
    /// box, not a distance check; y is not filtered.
    fn get_near(&self, origin: &BlockCoordinate, radius: u32) -> Result<FxHashSet<BlockCoordinate>>;
    fn count(&self) -> Result<usize>;

    fn flush(&self) -> Result<()>;
}

// Above this many chunks, a near query scans the whole world instead of chunk by chunk.
const NEAR_QUERY_MAX_CHUNK_SCANS: usize = 256;

/// [BlockStore] on top of a key-value [KvDatabase]. See [rows] for the key layout.
pub struct KvBlockStore {
    db: Arc<dyn KvDatabase>,
    worlds: Arc<dyn WorldResolver>,
    // Serializes write batches so that check-then-write stays atomic. Reads don't take it.
    writer: Mutex<()>,
    backend_name: &'static str,
}
impl KvBlockStore {
    pub fn new(
        db: Arc<dyn KvDatabase>,
        worlds: Arc<dyn WorldResolver>,
        backend_name: &'static str,
    ) -> KvBlockStore {
        KvBlockStore {
            db,
            worlds,
            writer: Mutex::new(()),
            backend_name,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    fn try_save(&self, coords: &FxHashSet<BlockCoordinate>) -> Result<usize> {
        let mut names: FxHashMap<WorldId, String> = FxHashMap::default();
        let mut ops = Vec::new();
        for coord in coords {
            let key = row_key(coord);
            if self.db.get(&key)?.is_some() {
                continue;
            }
            let name = names.entry(coord.world()).or_insert_with(|| {
                match self.worlds.world_by_id(coord.world()) {
                    Some(world) => world.name().to_string(),
                    None => {
                        tracing::warn!(
                            "Saving blocks for {:?}, which is not loaded; storing without a name",
                            coord.world()
                        );
                        String::new()
                    }
                }
            });
            ops.push(WriteOp::Put(key, name.as_bytes().to_vec()));
        }
        let inserted = ops.len();
        if inserted > 0 {
            self.db.write_batch(ops)?;
        }
        Ok(inserted)
    }

    fn try_delete(&self, coords: &FxHashSet<BlockCoordinate>) -> Result<usize> {
        let mut ops = Vec::new();
        for coord in coords {
            let key = row_key(coord);
            if self.db.get(&key)?.is_some() {
                ops.push(WriteOp::Delete(key));
            }
        }
        let removed = ops.len();
        if removed > 0 {
            self.db.write_batch(ops)?;
        }
        Ok(removed)
    }

    /// Reads every row under the prefix whose world is loaded and which passes the filter.
    /// Undecodable rows and rows of unloaded worlds are skipped with a warning.
    fn scan(
        &self,
        prefix: &[u8],
        filter: &dyn Fn(&BlockCoordinate) -> bool,
        out: &mut FxHashSet<BlockCoordinate>,
    ) -> Result<()> {
        let mut worlds: FxHashMap<WorldId, Option<LoadedWorld>> = FxHashMap::default();
        let mut skipped_unloaded = 0usize;
        self.db.read_prefix(prefix, &mut |key, value| {
            let row = match StoredRow::decode(key, value) {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!("Skipping undecodable row in {}: {e}", self.backend_name);
                    return Ok(());
                }
            };
            if !row.chunk_consistent() {
                tracing::warn!(
                    "Row at {},{},{} is filed under chunk {},{}; using the derived chunk",
                    row.x,
                    row.y,
                    row.z,
                    row.chunk_x,
                    row.chunk_z
                );
            }
            let world = worlds
                .entry(row.world)
                .or_insert_with(|| self.worlds.world_by_id(row.world));
            match world {
                Some(world) => {
                    if row.world_name != world.name() {
                        tracing::trace!("{world:?} was stored as {:?}", row.world_name);
                    }
                    let coord = row.into_coordinate(world);
                    if filter(&coord) {
                        out.insert(coord);
                    }
                }
                None => skipped_unloaded += 1,
            }
            Ok(())
        })?;
        if skipped_unloaded > 0 {
            let missing: Vec<_> = worlds
                .iter()
                .filter(|(_, w)| w.is_none())
                .map(|(id, _)| *id)
                .collect();
            tracing::warn!(
                "Skipped {skipped_unloaded} rows belonging to worlds that are not loaded: {missing:?}"
            );
        }
        Ok(())
    }
}

impl BlockStore for KvBlockStore {
    fn save(&self, coords: &FxHashSet<BlockCoordinate>) -> BatchOutcome {
        let _span = span!("block store save");
        let _writer = self.writer.lock();
        match self.try_save(coords) {
            Ok(inserted) => BatchOutcome::committed(inserted),
            Err(e) => {
                tracing::error!(
                    "Saving {} protected blocks to {} failed: {e:?}",
                    coords.len(),
                    self.backend_name
                );
                BatchOutcome::failed()
            }
        }
    }

    fn delete(&self, coords: &FxHashSet<BlockCoordinate>) -> BatchOutcome {
        let _span = span!("block store delete");
        let _writer = self.writer.lock();
        match self.try_delete(coords) {
            Ok(removed) => BatchOutcome::committed(removed),
            Err(e) => {
                tracing::error!(
                    "Deleting {} protected blocks from {} failed: {e:?}",
                    coords.len(),
                    self.backend_name
                );
                BatchOutcome::failed()
            }
        }
    }

    fn get_all(&self) -> Result<FxHashSet<BlockCoordinate>> {
        let _span = span!("block store get_all");
        let mut out = FxHashSet::default();
        self.scan(&KeySpace::ProtectedBlocks.prefix(), &|_| true, &mut out)?;
        Ok(out)
    }

    fn get_in_chunk(&self, chunk: ChunkKey) -> Result<FxHashSet<BlockCoordinate>> {
        let _span = span!("block store get_in_chunk");
        let mut out = FxHashSet::default();
        self.scan(&chunk_prefix(chunk), &|_| true, &mut out)?;
        Ok(out)
    }

    fn get_near(&self, origin: &BlockCoordinate, radius: u32) -> Result<FxHashSet<BlockCoordinate>> {
        let _span = span!("block store get_near");
        let clamp = |v: i64| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        let chunk_x_min = clamp(origin.x() as i64 - radius as i64).div_euclid(CHUNK_EDGE);
        let chunk_x_max = clamp(origin.x() as i64 + radius as i64).div_euclid(CHUNK_EDGE);
        let chunk_z_min = clamp(origin.z() as i64 - radius as i64).div_euclid(CHUNK_EDGE);
        let chunk_z_max = clamp(origin.z() as i64 + radius as i64).div_euclid(CHUNK_EDGE);
        let num_chunks = (chunk_x_max as i64 - chunk_x_min as i64 + 1)
            * (chunk_z_max as i64 - chunk_z_min as i64 + 1);

        let filter = |c: &BlockCoordinate| c.within_square(origin, radius);
        let mut out = FxHashSet::default();
        if num_chunks as usize > NEAR_QUERY_MAX_CHUNK_SCANS {
            tracing::trace!("near query over {num_chunks} chunks; scanning world instead");
            self.scan(&world_prefix(origin.world()), &filter, &mut out)?;
        } else {
            for (x, z) in iproduct!(chunk_x_min..=chunk_x_max, chunk_z_min..=chunk_z_max) {
                let chunk = ChunkKey::new(origin.world(), x, z);
                self.scan(&chunk_prefix(chunk), &filter, &mut out)?;
            }
        }
        Ok(out)
    }

    fn count(&self) -> Result<usize> {
        let mut count = 0;
        self.db
            .read_prefix(&KeySpace::ProtectedBlocks.prefix(), &mut |_, _| {
                count += 1;
                Ok(())
            })?;
        Ok(count)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()
    }
}
