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

use std::time::Duration;

use roadguard_core::coordinates::{BlockCoordinate, InvalidReason, Location, WorldRef};

use super::testutils::{set, wait_until, Harness};
use crate::store::BlockStore;

#[test]
fn save_is_visible_before_the_write_lands() {
    let h = Harness::new();
    let c = h.at(3, 64, 3);
    h.db.stall();

    assert_eq!(h.repository.save(&set([c])), 1);
    assert!(h.repository.is_protected(&c));
    // Give the writeback task time to block on the stalled database
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.store.count().unwrap(), 0);
    assert!(h.repository.is_protected(&c));
    assert_eq!(h.repository.status().pending_entries, 1);

    h.db.release();
    h.flush();
    assert_eq!(h.store.count().unwrap(), 1);
    assert!(h.repository.is_protected(&c));
    assert_eq!(h.repository.status().pending_entries, 0);
}

#[test]
fn delete_is_visible_immediately() {
    let h = Harness::new();
    let c = h.at(-20, 70, 100);
    h.repository.save(&set([c]));
    h.flush();
    assert!(h.repository.is_protected(&c));

    h.db.stall();
    assert_eq!(h.repository.delete(&set([c])), 1);
    assert!(!h.repository.is_protected(&c));

    h.db.release();
    h.flush();
    assert!(!h.repository.is_protected(&c));
    assert_eq!(h.store.count().unwrap(), 0);
    assert_eq!(h.repository.status().cached_entries, 0);
}

#[test]
fn delete_of_unknown_block() {
    let h = Harness::new();
    let c = h.at(1, 1, 1);
    assert_eq!(h.repository.delete(&set([c])), 1);
    assert!(!h.repository.is_protected(&c));
    h.flush();
    assert!(!h.repository.is_protected(&c));
    assert_eq!(h.store.count().unwrap(), 0);
}

#[test]
fn first_touch_loads_chunk_once() {
    let h = Harness::new();
    let a = h.at(16, 64, 16);
    let b = h.at(31, 10, 31);
    let outcome = h.store.save(&set([a, b]));
    assert_eq!(outcome.rows_affected, 2);

    let reads = h.db.prefix_reads();
    assert!(h.repository.is_protected(&a));
    assert_eq!(h.db.prefix_reads(), reads + 1);
    // Everything in the chunk came in with the first query
    assert!(h.repository.is_protected(&b));
    assert!(!h.repository.is_protected(&h.at(20, 64, 20)));
    assert_eq!(h.db.prefix_reads(), reads + 1);

    // A different chunk costs one more query, even when it holds nothing
    assert!(!h.repository.is_protected(&h.at(32, 64, 16)));
    assert_eq!(h.db.prefix_reads(), reads + 2);
    assert_eq!(h.repository.status().loaded_chunks, 2);
}

#[test]
fn concurrent_first_touch_loads_chunk_once() {
    let h = Harness::new();
    let c = h.at(100, 64, 100);
    h.store.save(&set([c]));
    let reads = h.db.prefix_reads();

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| assert!(h.repository.is_protected(&c)));
        }
    });
    assert_eq!(h.db.prefix_reads(), reads + 1);
}

#[test]
fn evicted_chunk_reloads_once() {
    let h = Harness::new();
    let c = h.at(-1, 64, -1);
    h.store.save(&set([c]));
    assert!(h.repository.is_protected(&c));

    h.repository.evict_chunk(c.chunk());
    assert_eq!(h.repository.status().loaded_chunks, 0);
    assert_eq!(h.repository.status().cached_entries, 0);

    let reads = h.db.prefix_reads();
    assert!(h.repository.is_protected(&c));
    assert!(h.repository.is_protected(&c));
    assert_eq!(h.db.prefix_reads(), reads + 1);
}

#[test]
fn pending_insert_survives_chunk_load() {
    let h = Harness::new();
    let stored = h.at(5, 5, 5);
    let fresh = h.at(6, 5, 5);
    h.store.save(&set([stored]));
    h.db.stall();

    // Saved before the chunk was ever touched
    h.repository.save(&set([fresh]));
    // Deleted before the chunk was ever touched
    h.repository.delete(&set([stored]));
    assert!(h.repository.is_protected(&fresh));
    assert!(!h.repository.is_protected(&stored));
    h.db.release();
    h.flush();
    assert_eq!(h.store.get_all().unwrap(), set([fresh]));
}

#[test]
fn save_is_idempotent() {
    let h = Harness::new();
    let c = h.at(7, 7, 7);
    assert_eq!(h.repository.save(&set([c])), 1);
    h.flush();
    assert_eq!(h.repository.save(&set([c])), 0);
    h.flush();
    assert_eq!(h.store.count().unwrap(), 1);
    let all = h.store.get_all().unwrap();
    assert_eq!(all.len(), 1);
    assert!(all.contains(&c));
}

#[test]
fn invalid_locations_never_reach_the_store() {
    let h = Harness::new();
    let no_world = Location::new(None, 1, 2, 3);
    assert_eq!(
        BlockCoordinate::validate(Some(&no_world)),
        Err(InvalidReason::WorldNull)
    );
    let unloaded = Location::new(
        Some(WorldRef {
            id: Some(h.world.id()),
            name: Some("overworld".to_string()),
            loaded: false,
        }),
        1,
        2,
        3,
    );
    let good = Location::in_world(&h.world, 4, 5, 6);

    let outcome = h
        .repository
        .save_locations([Some(&no_world), None, Some(&unloaded), Some(&good)]);
    assert_eq!(outcome.accepted, 1);
    assert_eq!(outcome.changed, 1);
    assert_eq!(outcome.rejected_total(), 3);
    assert_eq!(outcome.rejected.get(&InvalidReason::WorldNull), Some(&1));
    assert_eq!(outcome.rejected.get(&InvalidReason::LocationNull), Some(&1));
    assert_eq!(outcome.rejected.get(&InvalidReason::WorldNotLoaded), Some(&1));

    let outcome = h.repository.delete_locations([Some(&no_world)]);
    assert_eq!(outcome.accepted, 0);
    assert_eq!(outcome.changed, 0);

    h.flush();
    assert_eq!(h.store.get_all().unwrap(), set([h.at(4, 5, 6)]));
}

#[test]
fn failed_write_stays_pending() {
    let h = Harness::new();
    let c = h.at(0, 0, 0);
    h.db.set_fail_writes(true);
    h.repository.save(&set([c]));
    h.flush();

    // Nothing was written, but the cache keeps claiming protection until the chunk is
    // reloaded.
    assert_eq!(h.store.count().unwrap(), 0);
    assert!(h.repository.is_protected(&c));
    assert_eq!(h.repository.status().pending_entries, 1);

    h.db.set_fail_writes(false);
    h.repository.evict_chunk(c.chunk());
    assert!(!h.repository.is_protected(&c));
}

#[test]
fn later_delete_wins_over_earlier_save() {
    let h = Harness::new();
    let c = h.at(9, 9, 9);
    h.repository.save(&set([c]));
    h.repository.delete(&set([c]));
    h.repository.save(&set([c]));
    h.repository.delete(&set([c]));
    assert!(!h.repository.is_protected(&c));
    h.flush();
    assert!(!h.repository.is_protected(&c));
    assert_eq!(h.store.count().unwrap(), 0);
    assert_eq!(h.repository.status().pending_entries, 0);
}

#[test]
fn protected_near_includes_pending_changes() {
    let h = Harness::new();
    let origin = h.at(0, 64, 0);
    let durable = h.at(5, 64, 5);
    let doomed = h.at(-5, 64, 5);
    let far = h.at(40, 64, 0);
    h.repository.save(&set([durable, doomed, far]));
    h.flush();

    h.db.stall();
    let fresh = h.at(2, 10, -2);
    h.repository.save(&set([fresh]));
    h.repository.delete(&set([doomed]));
    assert_eq!(
        h.repository.protected_near(&origin, 10),
        set([durable, fresh])
    );
    h.db.release();
    h.flush();
    assert_eq!(
        h.repository.protected_near(&origin, 10),
        set([durable, fresh])
    );
}

#[test]
fn protected_in_chunk_lists_cache_view() {
    let h = Harness::new();
    let a = h.at(1, 64, 1);
    let b = h.at(2, 64, 2);
    h.store.save(&set([a]));
    h.repository.save(&set([b]));
    h.repository.delete(&set([a]));
    assert_eq!(h.repository.protected_in_chunk(a.chunk()), set([b]));
}

#[test]
fn rows_of_unloaded_worlds_are_not_protected() {
    let h = Harness::new();
    let c = h.at(1, 2, 3);
    h.store.save(&set([c]));
    h.worlds.unload(h.world.id());
    assert!(!h.repository.is_protected(&c));
    assert_eq!(h.repository.count(), 1);
}

#[test]
fn shutdown_drains_queue() {
    let h = Harness::new();
    let coords = set((0..100).map(|i| h.at(i, 64, -i)));
    h.repository.save(&coords);
    h.repository.request_shutdown();
    h.runtime.block_on(h.repository.await_shutdown()).unwrap();
    assert_eq!(h.store.count().unwrap(), 100);
    wait_until("pending entries to settle", || {
        h.repository.status().pending_entries == 0
    });
}

#[test]
fn delete_committed_during_chunk_load_stays_deleted() {
    let h = Harness::new();
    let c = h.at(5, 64, 5);
    h.repository.save(&set([c]));
    h.flush();
    h.repository.evict_chunk(c.chunk());
    assert_eq!(h.store.count().unwrap(), 1);

    // The load reads the row, then waits before merging it into the cache
    h.db.hold_next_read();
    let loader = {
        let repository = h.repository.clone();
        std::thread::spawn(move || repository.is_protected(&c))
    };
    wait_until("chunk load to read its rows", || h.db.held_reads() == 1);

    assert_eq!(h.repository.delete(&set([c])), 1);
    wait_until("delete to reach the store", || {
        h.store.count().unwrap() == 0
    });

    h.db.release_reads();
    assert!(!loader.join().unwrap());
    h.flush();
    assert!(!h.repository.is_protected(&c));
    assert_eq!(h.repository.status().cached_entries, 0);
    assert_eq!(h.repository.status().loaded_chunks, 1);
}
