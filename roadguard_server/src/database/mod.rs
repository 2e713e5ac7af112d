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
pub mod rocksdb;

#[cfg(feature = "db_failure_injection")]
pub(crate) mod failure_injection {
    use crate::database::{KvDatabase, WriteOp};
    use anyhow::bail;
    use rand::Rng;
    use std::time::Duration;

    /// Fails or hangs a random share of database calls. Chances are out of 256.
    pub(crate) struct FailureInjectedDbWrapper<T> {
        inner: T,
        fail_chance: f64,
        hang_chance: f64,
    }

    impl<T: KvDatabase> FailureInjectedDbWrapper<T> {
        pub(crate) fn new(
            inner: T,
            fail_chance_over_256: u32,
            hang_chance_over_256: u32,
        ) -> FailureInjectedDbWrapper<T> {
            FailureInjectedDbWrapper {
                inner,
                fail_chance: (fail_chance_over_256 as f64 / 256.0).clamp(0.0, 1.0),
                hang_chance: (hang_chance_over_256 as f64 / 256.0).clamp(0.0, 1.0),
            }
        }

        fn maybe_fail(&self) -> anyhow::Result<()> {
            if self.fail_chance == 0.0 && self.hang_chance == 0.0 {
                return Ok(());
            }
            let mut rng = rand::thread_rng();
            if rng.gen_bool(self.fail_chance) {
                bail!("Injected error");
            }
            if rng.gen_bool(self.hang_chance) {
                tracing::error!("Hanging a database thread");
                db_hang();
            }
            Ok(())
        }
    }

    #[inline(never)]
    fn db_hang() {
        std::thread::sleep(Duration::MAX);
    }

    impl<T: KvDatabase> KvDatabase for FailureInjectedDbWrapper<T> {
        fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
            self.maybe_fail()?;
            self.inner.get(key)
        }

        fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
            self.maybe_fail()?;
            self.inner.put(key, value)
        }

        fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
            self.maybe_fail()?;
            self.inner.delete(key)
        }

        fn write_batch(&self, ops: Vec<WriteOp>) -> anyhow::Result<()> {
            self.maybe_fail()?;
            self.inner.write_batch(ops)
        }

        fn flush(&self) -> anyhow::Result<()> {
            self.maybe_fail()?;
            self.inner.flush()
        }

        fn read_prefix(
            &self,
            prefix: &[u8],
            callback: &mut dyn FnMut(&[u8], &[u8]) -> anyhow::Result<()>,
        ) -> anyhow::Result<()> {
            self.maybe_fail()?;
            self.inner.read_prefix(prefix, callback)
        }
    }

}

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;

pub(crate) enum KeySpace {
    /// Store metadata, e.g. the schema version.
    /// Should generally contain only hardcoded keys.
    Metadata,
    /// Protected blocks, keyed by world id, chunk and position (current schema)
    ProtectedBlocks,
    /// Protected blocks keyed by world display name (schema version 0). Only read by the
    /// migrator.
    LegacyProtectedBlocks,
}
impl KeySpace {
    pub(crate) fn make_key(&self, key: &[u8]) -> Vec<u8> {
        let mut result = Vec::with_capacity(key.len() + 1);
        result.push(self.identifier());
        result.extend_from_slice(key);
        result
    }

    pub(crate) fn prefix(&self) -> [u8; 1] {
        [self.identifier()]
    }

    fn identifier(&self) -> u8 {
        match self {
            KeySpace::Metadata => b'0',
            KeySpace::ProtectedBlocks => b'b',
            KeySpace::LegacyProtectedBlocks => b'l',
        }
    }
}

/// One mutation inside an atomic [KvDatabase::write_batch].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

pub trait KvDatabase: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    /// Applies all of the given operations, or none of them.
    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()>;
    fn flush(&self) -> Result<()>;

    /// Calls the callback for every key starting with prefix, in key order.
    fn read_prefix(
        &self,
        prefix: &[u8],
        callback: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()>;
}

/// Test-only database
pub struct InMemKvDatabase {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}
impl InMemKvDatabase {
    pub fn new() -> InMemKvDatabase {
        InMemKvDatabase {
            data: BTreeMap::new().into(),
        }
    }
}
impl Default for InMemKvDatabase {
    fn default() -> Self {
        Self::new()
    }
}
impl KvDatabase for InMemKvDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.lock().remove(key);
        Ok(())
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut data = self.data.lock();
        for op in ops {
            match op {
                WriteOp::Put(k, v) => {
                    data.insert(k, v);
                }
                WriteOp::Delete(k) => {
                    data.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn read_prefix(
        &self,
        prefix: &[u8],
        callback: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        // Snapshot first so that the callback may call back into the database
        let matching: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .lock()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in matching {
            callback(&key, &value)?;
        }
        Ok(())
    }
}
