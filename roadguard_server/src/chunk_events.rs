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

use anyhow::Result;
use roadguard_core::coordinates::ChunkKey;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::repository::BlockRepository;

/// Evicts chunks from the repository as the host unloads them.
pub struct ChunkUnloadListener {
    repository: Arc<BlockRepository>,
    unloads: broadcast::Receiver<ChunkKey>,
    cancellation: CancellationToken,
}
impl ChunkUnloadListener {
    pub fn new(
        repository: Arc<BlockRepository>,
        unloads: broadcast::Receiver<ChunkKey>,
        cancellation: CancellationToken,
    ) -> ChunkUnloadListener {
        ChunkUnloadListener {
            repository,
            unloads,
            cancellation,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<Result<()>>> {
        crate::spawn_async("chunk_unload_listener", self.run_loop())
    }

    #[tracing::instrument(name = "ChunkUnloadListener", level = "info", skip(self))]
    pub async fn run_loop(mut self) -> Result<()> {
        while !self.cancellation.is_cancelled() {
            tokio::select! {
                event = self.unloads.recv() => {
                    match event {
                        Ok(chunk) => {
                            tokio::task::block_in_place(|| self.repository.evict_chunk(chunk));
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // Missed chunks stay cached until their next unload; still correct,
                            // just larger.
                            tracing::warn!("Chunk unload listener lagged, {missed} unloads missed");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("Chunk unload channel closed");
                            break;
                        }
                    }
                }
                _ = self.cancellation.cancelled() => {
                    break;
                }
            }
        }
        Ok(())
    }
}
