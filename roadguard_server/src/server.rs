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

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use roadguard_core::{
    constants::{DEFAULT_NEAR_RADIUS, DEFAULT_SPREAD_DISTANCE},
    coordinates::{BlockCoordinate, ChunkKey},
    flood_fill::FloodFillSelector,
};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    chunk_events::ChunkUnloadListener,
    database::{
        rocksdb::{RocksDbBackend, RocksdbOptions},
        InMemKvDatabase, KvDatabase,
    },
    repository::{BlockRepository, RepositoryOptions},
    road_tool::RoadTool,
    store::{migration::SchemaMigrator, KvBlockStore},
    world::WorldResolver,
};

const SETTINGS_RON_FILE: &str = "settings.ron";

#[derive(Parser, Debug, Clone)]
pub struct RoadGuardArgs {
    /// The directory to use to store protected blocks and settings
    #[arg(short, long, value_name = "DATA_DIR")]
    pub data_dir: PathBuf,

    #[arg(long, default_value_t = 128)]
    pub rocksdb_point_lookup_cache_mib: u64,

    #[arg(long, default_value_t = 512)]
    pub rocksdb_num_fds: std::os::raw::c_int,

    /// How long the writeback task gathers saves and deletes before writing them
    #[arg(long, default_value_t = 25)]
    pub writeback_coalesce_ms: u64,

    /// Chance, out of 256, that any database call fails. Development only.
    #[cfg(feature = "db_failure_injection")]
    #[arg(long, default_value_t = 0)]
    pub db_failure_chance_over_256: u32,

    /// Chance, out of 256, that any database call hangs forever. Development only.
    #[cfg(feature = "db_failure_injection")]
    #[arg(long, default_value_t = 0)]
    pub db_hang_chance_over_256: u32,
}

/// Gameplay settings, read from `settings.ron` in the data directory.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RoadGuardSettings {
    /// Blocks selected by the road tool are strictly closer than this to the clicked block.
    pub spread_distance: u32,
    /// Default radius for listing nearby protected blocks.
    pub near_radius: u32,
}
impl Default for RoadGuardSettings {
    fn default() -> Self {
        Self {
            spread_distance: DEFAULT_SPREAD_DISTANCE,
            near_radius: DEFAULT_NEAR_RADIUS,
        }
    }
}
impl RoadGuardSettings {
    pub fn load_from_dir(data_dir: &Path) -> Result<Option<RoadGuardSettings>> {
        let settings_file = data_dir.join(SETTINGS_RON_FILE);
        if !settings_file.exists() {
            tracing::warn!("No settings found at {:?}", settings_file);
            return Ok(None);
        }
        let config = std::fs::read_to_string(&settings_file)?;
        let parsed = ron::from_str(&config)
            .with_context(|| format!("Parsing {:?}", settings_file))?;
        tracing::info!("Loaded settings from {:?}", settings_file);
        Ok(Some(parsed))
    }

    pub fn save_to_dir(&self, data_dir: &Path) -> Result<()> {
        let settings_file = data_dir.join(SETTINGS_RON_FILE);
        let config = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        std::fs::write(&settings_file, config)?;
        tracing::info!("Saved settings to {:?}", settings_file);
        Ok(())
    }
}

/// A running protection store: the repository, its runtime and the tool flow.
///
/// Dropping it drains pending writes into the store.
pub struct RoadGuard {
    runtime: tokio::runtime::Runtime,
    repository: Arc<BlockRepository>,
    road_tool: RoadTool,
    settings: RoadGuardSettings,
    listener_cancellation: CancellationToken,
    listener_handles: Mutex<Vec<JoinHandle<Result<()>>>>,
}
impl RoadGuard {
    pub fn repository(&self) -> &Arc<BlockRepository> {
        &self.repository
    }

    pub fn road_tool(&self) -> &RoadTool {
        &self.road_tool
    }

    pub fn settings(&self) -> &RoadGuardSettings {
        &self.settings
    }

    /// Protected blocks around the origin, within the configured near radius.
    pub fn protected_near(&self, origin: &BlockCoordinate) -> FxHashSet<BlockCoordinate> {
        self.repository
            .protected_near(origin, self.settings.near_radius)
    }

    /// Evicts chunks from the cache as the host announces their unload.
    pub fn subscribe_chunk_unloads(&self, unloads: broadcast::Receiver<ChunkKey>) -> Result<()> {
        let _rt_guard = self.runtime.enter();
        let listener = ChunkUnloadListener::new(
            self.repository.clone(),
            unloads,
            self.listener_cancellation.child_token(),
        );
        self.listener_handles.lock().push(listener.spawn()?);
        Ok(())
    }

    /// Blocks until every save and delete issued so far has been attempted.
    pub fn flush(&self) -> Result<()> {
        self.runtime.block_on(self.repository.flush())
    }

    pub fn run_task_in_runtime<T>(&self, task: impl FnOnce(&BlockRepository) -> Result<T>) -> Result<T> {
        let _enter_guard = self.runtime.enter();
        task(&self.repository)
    }

    async fn shut_down(&self) -> Result<()> {
        self.listener_cancellation.cancel();
        let handles: Vec<_> = self.listener_handles.lock().drain(..).collect();
        for handle in handles {
            handle.await??;
        }
        self.repository.request_shutdown();
        self.repository.await_shutdown().await
    }
}
impl Drop for RoadGuard {
    fn drop(&mut self) {
        tracing::info!("RoadGuard dropped, starting shutdown");
        match self.runtime.block_on(self.shut_down()) {
            Ok(_) => {
                tracing::info!("RoadGuard shutdown complete.");
            }
            Err(e) => {
                tracing::error!("RoadGuard shutdown was unclean: {e:?}");
            }
        };
    }
}

pub struct RoadGuardBuilder {
    runtime: tokio::runtime::Runtime,
    db: Arc<dyn KvDatabase>,
    backend_name: &'static str,
    worlds: Option<Arc<dyn WorldResolver>>,
    settings: RoadGuardSettings,
    repository_options: RepositoryOptions,
}
impl RoadGuardBuilder {
    pub fn from_cmdline() -> Result<RoadGuardBuilder> {
        Self::from_args(&RoadGuardArgs::parse())
    }

    pub fn from_args(args: &RoadGuardArgs) -> Result<RoadGuardBuilder> {
        if !Path::exists(&args.data_dir) {
            std::fs::create_dir(&args.data_dir)?;
            tracing::info!("Created new data directory at {:?}", args.data_dir);
        } else {
            if !Path::is_dir(&args.data_dir) {
                bail!("Specified data directory is not a directory.");
            }
            tracing::info!("Loaded existing data directory at {:?}", args.data_dir);
        }

        let settings = match RoadGuardSettings::load_from_dir(&args.data_dir)? {
            Some(settings) => settings,
            None => {
                let settings = RoadGuardSettings::default();
                settings.save_to_dir(&args.data_dir)?;
                settings
            }
        };

        let db_dir = args.data_dir.join("database");
        let mut options = RocksdbOptions::default();
        options.create_if_missing(true);
        options.optimize_for_point_lookup(args.rocksdb_point_lookup_cache_mib);
        let rocksdb_fds = set_rlimit_for_rocksdb(args.rocksdb_num_fds)?;
        tracing::info!(
            "Using up to {} open file descriptors for rocksdb",
            rocksdb_fds
        );
        options.set_max_open_files(rocksdb_fds);

        let db = Self::make_rocksdb_backend(db_dir, options, args)?;
        Ok(RoadGuardBuilder {
            runtime: Self::make_runtime()?,
            db,
            backend_name: "rocksdb",
            worlds: None,
            settings,
            repository_options: RepositoryOptions {
                coalesce_window: Duration::from_millis(args.writeback_coalesce_ms),
            },
        })
    }

    /// A builder over a fresh in-memory database, for tests and tools.
    pub fn testonly_in_memory() -> Result<RoadGuardBuilder> {
        Self::with_database(Arc::new(InMemKvDatabase::new()), "inmem")
    }

    /// A builder over a caller-provided database, with default settings.
    pub fn with_database(db: Arc<dyn KvDatabase>, backend_name: &'static str) -> Result<RoadGuardBuilder> {
        Ok(RoadGuardBuilder {
            runtime: Self::make_runtime()?,
            db,
            backend_name,
            worlds: None,
            settings: RoadGuardSettings::default(),
            repository_options: RepositoryOptions::default(),
        })
    }

    fn make_runtime() -> Result<tokio::runtime::Runtime> {
        Ok(tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?)
    }

    #[cfg(not(feature = "db_failure_injection"))]
    fn make_rocksdb_backend(
        db_dir: PathBuf,
        options: RocksdbOptions,
        _args: &RoadGuardArgs,
    ) -> Result<Arc<dyn KvDatabase>> {
        Ok(Arc::new(RocksDbBackend::new(db_dir, options)?))
    }

    #[cfg(feature = "db_failure_injection")]
    fn make_rocksdb_backend(
        db_dir: PathBuf,
        options: RocksdbOptions,
        args: &RoadGuardArgs,
    ) -> Result<Arc<dyn KvDatabase>> {
        use crate::database::failure_injection::FailureInjectedDbWrapper;
        tracing::warn!(
            "This store is running with DB failure injection on (fail {}/256, hang {}/256). This is DANGEROUS and meant only for development.",
            args.db_failure_chance_over_256,
            args.db_hang_chance_over_256
        );
        Ok(Arc::new(FailureInjectedDbWrapper::new(
            RocksDbBackend::new(db_dir, options)?,
            args.db_failure_chance_over_256,
            args.db_hang_chance_over_256,
        )))
    }

    /// Sets the resolver used to map stored world ids (and legacy world names) to live worlds.
    pub fn set_world_resolver(&mut self, worlds: Arc<dyn WorldResolver>) {
        self.worlds = Some(worlds);
    }

    pub fn settings_mut(&mut self) -> &mut RoadGuardSettings {
        &mut self.settings
    }

    pub fn settings(&self) -> &RoadGuardSettings {
        &self.settings
    }

    pub fn repository_options_mut(&mut self) -> &mut RepositoryOptions {
        &mut self.repository_options
    }

    pub fn build(self) -> Result<RoadGuard> {
        #[cfg(feature = "deadlock_detection")]
        {
            use parking_lot::deadlock;
            use std::thread;

            thread::spawn(move || loop {
                thread::sleep(Duration::from_secs(10));
                let deadlocks = deadlock::check_deadlock();
                if deadlocks.is_empty() {
                    continue;
                }

                eprintln!("{} deadlocks detected", deadlocks.len());
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("Deadlock #{}", i);
                    for t in threads {
                        eprintln!("Thread Id {:#?}", t.thread_id());
                        eprintln!("{:#?}", t.backtrace());
                    }
                }
            });
        }

        let worlds = self.worlds.with_context(|| "World resolver not specified")?;

        // Migration runs before any traffic. A failed migration is logged and startup
        // continues with whatever the store holds.
        match SchemaMigrator::new(self.db.clone(), worlds.clone()).run() {
            Ok(report) => {
                if report.from_version != report.to_version {
                    tracing::info!("Schema migration: {report:?}");
                }
            }
            Err(e) => {
                tracing::error!("Schema migration failed, continuing with the store as is: {e:?}");
            }
        }

        let store = Arc::new(KvBlockStore::new(self.db, worlds, self.backend_name));
        let repository = {
            let _rt_guard = self.runtime.enter();
            BlockRepository::new(store, self.repository_options)?
        };
        let road_tool = RoadTool::new(
            repository.clone(),
            FloodFillSelector::new(self.settings.spread_distance),
        );
        Ok(RoadGuard {
            runtime: self.runtime,
            repository,
            road_tool,
            settings: self.settings,
            listener_cancellation: CancellationToken::new(),
            listener_handles: Mutex::new(Vec::new()),
        })
    }
}

fn set_rlimit_for_rocksdb(rocksdb_desired_fds: std::os::raw::c_int) -> Result<std::os::raw::c_int> {
    let rocksdb_desired_fds = rocksdb_desired_fds.clamp(32, 524288);
    let intended_limit = rocksdb_desired_fds as u64 * 4 / 3;
    let actual_limit = rlimit::increase_nofile_limit(intended_limit)?;
    tracing::info!(
        "File descriptor limit updated to {} (wanted at least {})",
        actual_limit,
        intended_limit
    );
    if actual_limit >= intended_limit {
        Ok(rocksdb_desired_fds)
    } else {
        let rocksdb_allowed_fds = actual_limit * 3 / 4;
        if rocksdb_allowed_fds < 64 {
            tracing::warn!(
                "The rocksdb file descriptor count is very low. DB performance may be slow."
            );
        }
        rocksdb_allowed_fds
            .max(16)
            .try_into()
            .context("Integer overflow converting number of file descriptors")
    }
}
