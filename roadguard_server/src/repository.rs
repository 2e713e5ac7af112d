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

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{info, warn};
use parking_lot::{Mutex, MutexGuard};
use roadguard_core::coordinates::{BlockCoordinate, ChunkKey, InvalidReason, Location};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracy_client::{plot, span};

use crate::cache::{shard_id, CacheState, ChunkLoadTracker, CoherentCache, NUM_LOCK_SHARDS};
use crate::store::BlockStore;

/// Outcome of [BlockRepository::save_locations] and [BlockRepository::delete_locations].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocationBatchOutcome {
    /// Distinct valid coordinates that were forwarded.
    pub accepted: usize,
    /// How many of them changed state in the cache.
    pub changed: usize,
    /// Rejected locations, by reason.
    pub rejected: FxHashMap<InvalidReason, usize>,
}
impl LocationBatchOutcome {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RepositoryStatus {
    /// Rows in the durable store. Does not include writes that are still queued.
    pub stored_rows: usize,
    pub cached_entries: usize,
    pub pending_entries: usize,
    pub loaded_chunks: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct RepositoryOptions {
    /// How long the writeback task waits for more requests before writing a batch.
    pub coalesce_window: Duration,
}
impl Default for RepositoryOptions {
    fn default() -> Self {
        RepositoryOptions {
            coalesce_window: Duration::from_millis(25),
        }
    }
}

enum WritebackReq {
    Save(FxHashSet<BlockCoordinate>),
    Delete(FxHashSet<BlockCoordinate>),
    Flush(oneshot::Sender<()>),
}

/// The protection store as seen by the game: cheap lookups backed by a write-behind cache,
/// with chunks loaded lazily from the durable [BlockStore] on first touch.
pub struct BlockRepository {
    store: Arc<dyn BlockStore>,
    cache: CoherentCache,
    tracker: ChunkLoadTracker,
    // Held across a chunk's range query and merge, and while writeback confirms entries,
    // so that a confirmation never lands between a load's read and its merge.
    load_locks: [Mutex<()>; NUM_LOCK_SHARDS],
    writeback_sender: mpsc::UnboundedSender<WritebackReq>,
    shutdown: CancellationToken,
    writeback_handle: Mutex<Option<JoinHandle<Result<()>>>>,
}
impl BlockRepository {
    /// Creates the repository and starts its writeback task. Must be called from within a
    /// multi-threaded tokio runtime.
    pub fn new(store: Arc<dyn BlockStore>, options: RepositoryOptions) -> Result<Arc<BlockRepository>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancellation = CancellationToken::new();
        let result = Arc::new(BlockRepository {
            store,
            cache: CoherentCache::new(),
            tracker: ChunkLoadTracker::new(),
            load_locks: std::array::from_fn(|_| Mutex::new(())),
            writeback_sender: sender,
            shutdown: cancellation.clone(),
            writeback_handle: Mutex::new(None),
        });
        let mut writeback = RepositoryWriteback {
            repository: result.clone(),
            receiver,
            cancellation,
            coalesce_window: options.coalesce_window,
        };
        let handle = crate::spawn_async("repository_writeback", async move {
            writeback.run_loop().await
        })?;
        *result.writeback_handle.lock() = Some(handle);
        Ok(result)
    }

    /// Whether the block is protected. Loads the block's chunk from the store on first touch;
    /// otherwise answers from memory.
    pub fn is_protected(&self, coord: &BlockCoordinate) -> bool {
        let _span = span!("is_protected");
        let chunk = coord.chunk();
        if !self.tracker.is_loaded(chunk) {
            if let Err(e) = self.load_chunk(chunk) {
                // Pending entries are still authoritative; anything else is unknown.
                log::error!("Loading {chunk:?} failed, answering from partial cache: {e:?}");
            }
        }
        self.cache
            .get(coord)
            .map(|state| state.is_protected())
            .unwrap_or(false)
    }

    fn load_chunk(&self, chunk: ChunkKey) -> Result<()> {
        let _guard = self.load_locks[shard_id(chunk)].lock();
        if self.tracker.is_loaded(chunk) {
            // Someone else loaded it while we were waiting on the lock
            return Ok(());
        }
        let _span = span!("load chunk");
        let start = Instant::now();
        let rows = self
            .store
            .get_in_chunk(chunk)
            .with_context(|| format!("Range query for {chunk:?}"))?;
        let num_rows = rows.len();
        self.cache.merge_resident(chunk, rows);
        self.tracker.mark_loaded(chunk);
        plot!("chunk load rows", num_rows as f64);
        log::trace!(
            "Loaded {chunk:?} with {num_rows} protected blocks in {:?}",
            start.elapsed()
        );
        Ok(())
    }

    /// Protects the given blocks. The cache reflects the change before this returns; the
    /// durable write happens later on the writeback task.
    ///
    /// Returns how many of the blocks changed state in the cache.
    pub fn save(&self, coords: &FxHashSet<BlockCoordinate>) -> usize {
        if coords.is_empty() {
            return 0;
        }
        let changed = self.cache.mark_pending_insert(coords);
        self.enqueue(WritebackReq::Save(coords.clone()));
        changed
    }

    /// Unprotects the given blocks. See [Self::save].
    pub fn delete(&self, coords: &FxHashSet<BlockCoordinate>) -> usize {
        if coords.is_empty() {
            return 0;
        }
        let changed = self.cache.mark_pending_delete(coords);
        self.enqueue(WritebackReq::Delete(coords.clone()));
        changed
    }

    fn enqueue(&self, req: WritebackReq) {
        if self.writeback_sender.send(req).is_err() {
            log::error!("Writeback task is gone; change stays in memory only");
        }
    }

    /// Validates raw locations and saves the valid ones.
    pub fn save_locations<'a>(
        &self,
        locations: impl IntoIterator<Item = Option<&'a Location>>,
    ) -> LocationBatchOutcome {
        let (coords, mut outcome) = Self::validate_all(locations, "save");
        outcome.changed = self.save(&coords);
        outcome
    }

    /// Validates raw locations and deletes the valid ones.
    pub fn delete_locations<'a>(
        &self,
        locations: impl IntoIterator<Item = Option<&'a Location>>,
    ) -> LocationBatchOutcome {
        let (coords, mut outcome) = Self::validate_all(locations, "delete");
        outcome.changed = self.delete(&coords);
        outcome
    }

    fn validate_all<'a>(
        locations: impl IntoIterator<Item = Option<&'a Location>>,
        operation: &str,
    ) -> (FxHashSet<BlockCoordinate>, LocationBatchOutcome) {
        let mut coords = FxHashSet::default();
        let mut outcome = LocationBatchOutcome::default();
        for location in locations {
            match BlockCoordinate::validate(location) {
                Ok(coord) => {
                    coords.insert(coord);
                }
                Err(reason) => *outcome.rejected.entry(reason).or_default() += 1,
            }
        }
        outcome.accepted = coords.len();
        for (reason, count) in &outcome.rejected {
            warn!("Rejected {count} locations for {operation}: {}", reason.code());
        }
        (coords, outcome)
    }

    /// Forgets everything cached for the chunk, including pending markers. Writes already
    /// queued still reach the store.
    pub fn evict_chunk(&self, chunk: ChunkKey) {
        let _guard = self.load_locks[shard_id(chunk)].lock();
        self.tracker.unmark(chunk);
        let dropped = self.cache.evict_chunk(chunk);
        log::trace!("Evicted {chunk:?}, dropping {dropped} entries");
    }

    /// Protected blocks of one chunk, loading it if needed.
    pub fn protected_in_chunk(&self, chunk: ChunkKey) -> FxHashSet<BlockCoordinate> {
        if !self.tracker.is_loaded(chunk) {
            if let Err(e) = self.load_chunk(chunk) {
                log::error!("Loading {chunk:?} failed: {e:?}");
            }
        }
        self.cache.protected_in_chunk(chunk)
    }

    /// Protected blocks whose x and z are within radius of the origin. This is the store's
    /// bounding box prefilter, corrected for writes that have not reached the store yet.
    pub fn protected_near(&self, origin: &BlockCoordinate, radius: u32) -> FxHashSet<BlockCoordinate> {
        let _span = span!("protected_near");
        let mut result = match self.store.get_near(origin, radius) {
            Ok(result) => result,
            Err(e) => {
                log::error!("Near query around {origin:?} failed: {e:?}");
                FxHashSet::default()
            }
        };
        for (coord, state) in self.cache.pending_within(origin, radius) {
            match state {
                CacheState::PendingInsert => {
                    result.insert(coord);
                }
                CacheState::PendingDelete => {
                    result.remove(&coord);
                }
                CacheState::Resident => {}
            }
        }
        result
    }

    /// Number of rows in the durable store, or 0 if it cannot be read.
    pub fn count(&self) -> usize {
        match self.store.count() {
            Ok(count) => count,
            Err(e) => {
                log::error!("Counting protected blocks failed: {e:?}");
                0
            }
        }
    }

    pub fn status(&self) -> RepositoryStatus {
        RepositoryStatus {
            stored_rows: self.count(),
            cached_entries: self.cache.len(),
            pending_entries: self.cache.pending_len(),
            loaded_chunks: self.tracker.len(),
        }
    }

    /// Resolves once every save and delete issued before this call has been attempted
    /// against the store.
    pub async fn flush(&self) -> Result<()> {
        let (sender, receiver) = oneshot::channel();
        self.writeback_sender
            .send(WritebackReq::Flush(sender))
            .map_err(|_| anyhow::anyhow!("Writeback task is gone"))?;
        receiver.await.context("Writeback task exited before flushing")?;
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Waits for the writeback task to drain its queue and exit, then flushes the store.
    pub async fn await_shutdown(&self) -> Result<()> {
        let handle = self.writeback_handle.lock().take();
        if let Some(handle) = handle {
            handle.await??;
        }
        self.store.flush()
    }

    // Locks the load locks of every shard touched by coords, in shard order.
    fn lock_shards_of(&self, coords: &FxHashSet<BlockCoordinate>) -> Vec<MutexGuard<'_, ()>> {
        let mut touched = [false; NUM_LOCK_SHARDS];
        for coord in coords {
            touched[shard_id(coord.chunk())] = true;
        }
        touched
            .iter()
            .enumerate()
            .filter(|&(_, &t)| t)
            .map(|(i, _)| self.load_locks[i].lock())
            .collect()
    }
}

struct RepositoryWriteback {
    repository: Arc<BlockRepository>,
    receiver: mpsc::UnboundedReceiver<WritebackReq>,
    cancellation: CancellationToken,
    coalesce_window: Duration,
}
impl RepositoryWriteback {
    async fn run_loop(&mut self) -> Result<()> {
        while !self.cancellation.is_cancelled() {
            let requests = match self.gather().await {
                Some(requests) => requests,
                None => break,
            };
            tokio::task::block_in_place(|| self.execute(requests));
        }

        // Drain whatever is still queued so that nothing accepted before shutdown is lost.
        let mut remaining = Vec::new();
        while let Ok(req) = self.receiver.try_recv() {
            remaining.push(req);
        }
        if !remaining.is_empty() {
            info!("Repository writeback draining {} requests", remaining.len());
            tokio::task::block_in_place(|| self.execute(remaining));
        }
        info!("Repository writeback exiting");
        Ok(())
    }

    async fn gather(&mut self) -> Option<Vec<WritebackReq>> {
        let mut requests = Vec::new();
        tokio::select! {
            req = self.receiver.recv() => {
                match req {
                    Some(req) => requests.push(req),
                    None => return None,
                }
            }
            _ = self.cancellation.cancelled() => {
                info!("Repository writeback detected cancellation");
                return Some(requests);
            }
        };
        let should_coalesce = !matches!(requests.first(), Some(WritebackReq::Flush(_)));
        if should_coalesce && !self.coalesce_window.is_zero() {
            let deadline = Instant::now() + self.coalesce_window;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline.into()) => break,
                    _ = self.cancellation.cancelled() => break,
                    req = self.receiver.recv() => {
                        match req {
                            Some(WritebackReq::Flush(done)) => {
                                // Asked to flush. Stop coalescing and write now.
                                requests.push(WritebackReq::Flush(done));
                                break;
                            }
                            Some(req) => requests.push(req),
                            None => break,
                        }
                    }
                }
            }
        }
        // Catch up anything already queued, without waiting for more
        while let Ok(req) = self.receiver.try_recv() {
            requests.push(req);
        }
        Some(requests)
    }

    fn execute(&self, requests: Vec<WritebackReq>) {
        let _span = span!("repository writeback");
        let mut pending: Option<WritebackReq> = None;
        for req in requests {
            pending = match (pending, req) {
                (Some(WritebackReq::Save(mut a)), WritebackReq::Save(b)) => {
                    a.extend(b);
                    Some(WritebackReq::Save(a))
                }
                (Some(WritebackReq::Delete(mut a)), WritebackReq::Delete(b)) => {
                    a.extend(b);
                    Some(WritebackReq::Delete(a))
                }
                (previous, req) => {
                    if let Some(previous) = previous {
                        self.execute_one(previous);
                    }
                    Some(req)
                }
            };
        }
        if let Some(last) = pending {
            self.execute_one(last);
        }
    }

    fn execute_one(&self, req: WritebackReq) {
        let repository = &self.repository;
        match req {
            WritebackReq::Save(coords) => {
                let outcome = repository.store.save(&coords);
                plot!("writeback save batch", coords.len() as f64);
                if outcome.committed {
                    let _locks = repository.lock_shards_of(&coords);
                    repository.cache.confirm_inserted(&coords);
                } else {
                    warn!(
                        "Saving {} blocks failed; they stay pending in memory",
                        coords.len()
                    );
                }
            }
            WritebackReq::Delete(coords) => {
                let outcome = repository.store.delete(&coords);
                plot!("writeback delete batch", coords.len() as f64);
                if outcome.committed {
                    let _locks = repository.lock_shards_of(&coords);
                    repository.cache.confirm_deleted(&coords);
                } else {
                    warn!(
                        "Deleting {} blocks failed; they stay pending in memory",
                        coords.len()
                    );
                }
            }
            WritebackReq::Flush(done) => {
                if let Err(e) = repository.store.flush() {
                    log::error!("Flushing the block store failed: {e:?}");
                }
                // The caller may have stopped waiting
                let _ = done.send(());
            }
        }
    }
}
