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

use anyhow::{bail, Context, Result};
use integer_encoding::VarInt;
use roadguard_core::coordinates::BlockCoordinate;
use tracy_client::span;

use crate::database::{KeySpace, KvDatabase, WriteOp};
use crate::world::WorldResolver;

use super::rows::{row_key, LegacyRow};

/// Version 1 keys rows by stable world id. Version 0 keyed them by display name.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

/// Reads the stamped schema version. A store that was never stamped is version 0.
pub fn read_schema_version(db: &dyn KvDatabase) -> Result<u32> {
    match db.get(&KeySpace::Metadata.make_key(SCHEMA_VERSION_KEY))? {
        None => Ok(0),
        Some(bytes) => match u32::decode_var(&bytes) {
            Some((version, len)) if len == bytes.len() => Ok(version),
            _ => bail!("Stored schema version is malformed: {:?}", bytes),
        },
    }
}

pub fn write_schema_version(db: &dyn KvDatabase, version: u32) -> Result<()> {
    db.put(
        &KeySpace::Metadata.make_key(SCHEMA_VERSION_KEY),
        &version.encode_var_vec(),
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    /// Rows rewritten under the current key shape.
    pub migrated: usize,
    /// Legacy rows whose world could not be resolved, or that could not be decoded.
    pub dropped: usize,
}

/// One-shot schema upgrade, run at startup before any traffic reaches the store.
pub struct SchemaMigrator {
    db: Arc<dyn KvDatabase>,
    worlds: Arc<dyn WorldResolver>,
}
impl SchemaMigrator {
    pub fn new(db: Arc<dyn KvDatabase>, worlds: Arc<dyn WorldResolver>) -> SchemaMigrator {
        SchemaMigrator { db, worlds }
    }

    #[tracing::instrument(level = "info", name = "schema_migration", skip(self))]
    pub fn run(&self) -> Result<MigrationReport> {
        let _span = span!("schema migration");
        let from_version = read_schema_version(self.db.as_ref())?;
        if from_version > CURRENT_SCHEMA_VERSION {
            bail!(
                "Store has schema version {from_version}, newer than the supported version {CURRENT_SCHEMA_VERSION}"
            );
        }
        if from_version == CURRENT_SCHEMA_VERSION {
            tracing::debug!("Schema is at version {from_version}, nothing to migrate");
            return Ok(MigrationReport {
                from_version,
                to_version: from_version,
                migrated: 0,
                dropped: 0,
            });
        }
        tracing::info!("Migrating protected blocks from schema version {from_version} to {CURRENT_SCHEMA_VERSION}");

        let mut legacy_keys = Vec::new();
        self.db
            .read_prefix(&KeySpace::LegacyProtectedBlocks.prefix(), &mut |k, _| {
                legacy_keys.push(k.to_vec());
                Ok(())
            })
            .context("Reading legacy rows")?;

        // Recreating the table: anything already stored under the current shape is discarded
        // and rebuilt from the legacy rows.
        let mut ops = Vec::new();
        self.db
            .read_prefix(&KeySpace::ProtectedBlocks.prefix(), &mut |k, _| {
                ops.push(WriteOp::Delete(k.to_vec()));
                Ok(())
            })
            .context("Reading current rows")?;
        let discarded = ops.len();
        if discarded > 0 {
            tracing::warn!("Discarding {discarded} rows already present under the new key shape");
        }

        let mut migrated = 0;
        let mut dropped = 0;
        for key in legacy_keys {
            match LegacyRow::decode(&key) {
                Ok(row) => match self.worlds.world_by_name(&row.world_name) {
                    Some(world) => {
                        let coord = BlockCoordinate::at(&world, row.x, row.y, row.z);
                        ops.push(WriteOp::Put(
                            row_key(&coord),
                            world.name().as_bytes().to_vec(),
                        ));
                        migrated += 1;
                    }
                    None => {
                        tracing::warn!(
                            "Dropping protected block at {},{},{}: world {:?} cannot be resolved",
                            row.x,
                            row.y,
                            row.z,
                            row.world_name
                        );
                        dropped += 1;
                    }
                },
                Err(e) => {
                    tracing::warn!("Dropping undecodable legacy row: {e}");
                    dropped += 1;
                }
            }
            ops.push(WriteOp::Delete(key));
        }
        // The stamp commits with the rows. A store that reads as an older version must never
        // hold rows written under the current shape, or a rerun would discard them.
        ops.push(WriteOp::Put(
            KeySpace::Metadata.make_key(SCHEMA_VERSION_KEY),
            CURRENT_SCHEMA_VERSION.encode_var_vec(),
        ));

        self.db
            .write_batch(ops)
            .context("Writing migrated rows and schema version")?;
        self.db.flush()?;

        tracing::info!(
            "Schema migration done: {migrated} rows migrated, {dropped} dropped"
        );
        Ok(MigrationReport {
            from_version,
            to_version: CURRENT_SCHEMA_VERSION,
            migrated,
            dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemKvDatabase;
    use crate::store::rows::legacy_row_key;
    use crate::store::{BlockStore, KvBlockStore};
    use crate::world::StaticWorldResolver;
    use roadguard_core::coordinates::{LoadedWorld, WorldId};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn fresh_store_is_version_zero() {
        let db = InMemKvDatabase::new();
        assert_eq!(read_schema_version(&db).unwrap(), 0);
        write_schema_version(&db, 7).unwrap();
        assert_eq!(read_schema_version(&db).unwrap(), 7);
    }

    #[test]
    fn migrates_rows_of_resolvable_worlds() {
        let overworld = LoadedWorld::new(WorldId::random(), "overworld").unwrap();
        let resolver = Arc::new(StaticWorldResolver::with_worlds([overworld.clone()]));
        let db = Arc::new(InMemKvDatabase::new());
        for (name, x) in [("overworld", 1), ("overworld", -40), ("deleted_world", 5)] {
            db.put(&legacy_row_key(name, x, 64, 3), b"").unwrap();
        }

        let report = SchemaMigrator::new(db.clone(), resolver.clone())
            .run()
            .unwrap();
        assert_eq!(
            report,
            MigrationReport {
                from_version: 0,
                to_version: 1,
                migrated: 2,
                dropped: 1
            }
        );
        assert_eq!(read_schema_version(db.as_ref()).unwrap(), 1);

        let store = KvBlockStore::new(db.clone(), resolver.clone(), "inmem");
        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&BlockCoordinate::at(&overworld, 1, 64, 3)));
        assert!(all.contains(&BlockCoordinate::at(&overworld, -40, 64, 3)));

        let mut legacy_left = 0;
        db.read_prefix(&KeySpace::LegacyProtectedBlocks.prefix(), &mut |_, _| {
            legacy_left += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(legacy_left, 0);

        // Second run is a no-op
        let again = SchemaMigrator::new(db, resolver).run().unwrap();
        assert_eq!(again.from_version, 1);
        assert_eq!(again.migrated, 0);
    }

    /// Fails single puts always, and write batches while `fail_batches` is set.
    struct FlakyDb {
        base: InMemKvDatabase,
        fail_batches: AtomicBool,
    }
    impl KvDatabase for FlakyDb {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.base.get(key)
        }
        fn put(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
            bail!("Injected put failure")
        }
        fn delete(&self, key: &[u8]) -> Result<()> {
            self.base.delete(key)
        }
        fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()> {
            if self.fail_batches.load(Ordering::SeqCst) {
                bail!("Injected batch failure");
            }
            self.base.write_batch(ops)
        }
        fn flush(&self) -> Result<()> {
            self.base.flush()
        }
        fn read_prefix(
            &self,
            prefix: &[u8],
            callback: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
        ) -> Result<()> {
            self.base.read_prefix(prefix, callback)
        }
    }

    #[test]
    fn rerun_keeps_rows_saved_after_migration() {
        let overworld = LoadedWorld::new(WorldId::random(), "overworld").unwrap();
        let resolver = Arc::new(StaticWorldResolver::with_worlds([overworld.clone()]));
        let base = InMemKvDatabase::new();
        base.put(&legacy_row_key("overworld", 1, 64, 3), b"").unwrap();
        let db = Arc::new(FlakyDb {
            base,
            fail_batches: AtomicBool::new(true),
        });

        // Nothing lands if the batch fails, so the next run starts from scratch
        assert!(SchemaMigrator::new(db.clone(), resolver.clone()).run().is_err());
        assert_eq!(read_schema_version(db.as_ref()).unwrap(), 0);

        db.fail_batches.store(false, Ordering::SeqCst);
        let report = SchemaMigrator::new(db.clone(), resolver.clone())
            .run()
            .unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(read_schema_version(db.as_ref()).unwrap(), 1);

        let store = KvBlockStore::new(db.clone(), resolver.clone(), "flaky");
        let later = BlockCoordinate::at(&overworld, 9, 64, 9);
        assert!(store.save(&[later].into_iter().collect()).committed);
        assert_eq!(store.count().unwrap(), 2);

        let again = SchemaMigrator::new(db.clone(), resolver).run().unwrap();
        assert_eq!(again.from_version, 1);
        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&later));
        assert!(all.contains(&BlockCoordinate::at(&overworld, 1, 64, 3)));
    }

    #[test]
    fn refuses_newer_schema() {
        let db = Arc::new(InMemKvDatabase::new());
        write_schema_version(db.as_ref(), CURRENT_SCHEMA_VERSION + 1).unwrap();
        let result = SchemaMigrator::new(db, Arc::new(StaticWorldResolver::new())).run();
        assert!(result.is_err());
    }
}
