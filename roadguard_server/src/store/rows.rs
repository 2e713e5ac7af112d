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

//! Row layout of the protected block table.
//!
//! A row is one key/value pair. The key packs the identifying columns in an order that makes
//! every chunk (and every world) a contiguous key prefix:
//!
//! `'b' | world_uid_high | world_uid_low | chunk_x | chunk_z | x | y | z`
//!
//! All integers are fixed width, big-endian, with the sign bit flipped so that byte order
//! matches numeric order. The value holds the world's display name at the time of writing.
//!
//! Schema version 0 rows are keyed by display name instead:
//! `'l' | varint(name length) | name | varint(x) | varint(y) | varint(z)`, with an empty value.

use integer_encoding::{VarIntReader, VarIntWriter};
use roadguard_core::coordinates::{BlockCoordinate, ChunkKey, LoadedWorld, WorldId};
use roadguard_core::constants::CHUNK_EDGE;
use std::io::Read;
use thiserror::Error;

use crate::database::KeySpace;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Row key has length {0}, expected {}", ROW_KEY_LEN)]
    BadKeyLength(usize),
    #[error("Row key is in key space 0x{0:x}, not the protected block table")]
    WrongKeySpace(u8),
    #[error("World name is not valid UTF-8")]
    BadWorldName(#[from] std::string::FromUtf8Error),
    #[error("Legacy row key is malformed: {0}")]
    MalformedLegacyKey(#[from] std::io::Error),
    #[error("Legacy row key has {0} trailing bytes")]
    TrailingLegacyBytes(usize),
}

const WORLD_PREFIX_LEN: usize = 1 + 16;
const CHUNK_PREFIX_LEN: usize = WORLD_PREFIX_LEN + 8;
pub(crate) const ROW_KEY_LEN: usize = CHUNK_PREFIX_LEN + 12;

#[inline]
fn push_ordered_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&((value as u32) ^ 0x8000_0000).to_be_bytes());
}

#[inline]
fn push_ordered_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&((value as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
}

#[inline]
fn read_ordered_i32(bytes: &[u8], offset: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    (u32::from_be_bytes(raw) ^ 0x8000_0000) as i32
}

#[inline]
fn read_ordered_i64(bytes: &[u8], offset: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    (u64::from_be_bytes(raw) ^ 0x8000_0000_0000_0000) as i64
}

pub(crate) fn world_prefix(world: WorldId) -> Vec<u8> {
    let (high, low) = world.as_halves();
    let mut key = Vec::with_capacity(ROW_KEY_LEN);
    key.extend_from_slice(&KeySpace::ProtectedBlocks.prefix());
    push_ordered_i64(&mut key, high);
    push_ordered_i64(&mut key, low);
    key
}

pub(crate) fn chunk_prefix(chunk: ChunkKey) -> Vec<u8> {
    let mut key = world_prefix(chunk.world);
    push_ordered_i32(&mut key, chunk.x);
    push_ordered_i32(&mut key, chunk.z);
    key
}

pub(crate) fn row_key(coord: &BlockCoordinate) -> Vec<u8> {
    let mut key = chunk_prefix(coord.chunk());
    push_ordered_i32(&mut key, coord.x());
    push_ordered_i32(&mut key, coord.y());
    push_ordered_i32(&mut key, coord.z());
    key
}

/// A decoded row, before its world has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredRow {
    pub(crate) world: WorldId,
    pub(crate) world_name: String,
    pub(crate) chunk_x: i32,
    pub(crate) chunk_z: i32,
    pub(crate) x: i32,
    pub(crate) y: i32,
    pub(crate) z: i32,
}
impl StoredRow {
    pub(crate) fn decode(key: &[u8], value: &[u8]) -> Result<StoredRow, StoreError> {
        if key.len() != ROW_KEY_LEN {
            return Err(StoreError::BadKeyLength(key.len()));
        }
        if key[..1] != KeySpace::ProtectedBlocks.prefix() {
            return Err(StoreError::WrongKeySpace(key[0]));
        }
        Ok(StoredRow {
            world: WorldId::from_halves(read_ordered_i64(key, 1), read_ordered_i64(key, 9)),
            world_name: String::from_utf8(value.to_vec())?,
            chunk_x: read_ordered_i32(key, WORLD_PREFIX_LEN),
            chunk_z: read_ordered_i32(key, WORLD_PREFIX_LEN + 4),
            x: read_ordered_i32(key, CHUNK_PREFIX_LEN),
            y: read_ordered_i32(key, CHUNK_PREFIX_LEN + 4),
            z: read_ordered_i32(key, CHUNK_PREFIX_LEN + 8),
        })
    }

    /// True if the chunk columns agree with the position columns.
    pub(crate) fn chunk_consistent(&self) -> bool {
        self.chunk_x == self.x.div_euclid(CHUNK_EDGE) && self.chunk_z == self.z.div_euclid(CHUNK_EDGE)
    }

    pub(crate) fn into_coordinate(self, world: &LoadedWorld) -> BlockCoordinate {
        debug_assert_eq!(world.id(), self.world);
        BlockCoordinate::at(world, self.x, self.y, self.z)
    }
}

pub(crate) fn legacy_row_key(world_name: &str, x: i32, y: i32, z: i32) -> Vec<u8> {
    let mut key = KeySpace::LegacyProtectedBlocks.prefix().to_vec();
    // Writes to a Vec cannot fail
    let _ = key.write_varint(world_name.len());
    key.extend_from_slice(world_name.as_bytes());
    let _ = key.write_varint(x);
    let _ = key.write_varint(y);
    let _ = key.write_varint(z);
    key
}

/// A schema version 0 row: (world display name, x, y, z)
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LegacyRow {
    pub(crate) world_name: String,
    pub(crate) x: i32,
    pub(crate) y: i32,
    pub(crate) z: i32,
}
impl LegacyRow {
    pub(crate) fn decode(key: &[u8]) -> Result<LegacyRow, StoreError> {
        if key.first() != Some(&KeySpace::LegacyProtectedBlocks.prefix()[0]) {
            return Err(StoreError::WrongKeySpace(key.first().copied().unwrap_or(0)));
        }
        let mut cursor = std::io::Cursor::new(&key[1..]);
        let name_len: usize = cursor.read_varint()?;
        if name_len > key.len() {
            return Err(StoreError::MalformedLegacyKey(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "world name longer than key",
            )));
        }
        let mut name = vec![0; name_len];
        cursor.read_exact(&mut name)?;
        let x = cursor.read_varint()?;
        let y = cursor.read_varint()?;
        let z = cursor.read_varint()?;
        let trailing = key.len() - 1 - cursor.position() as usize;
        if trailing != 0 {
            return Err(StoreError::TrailingLegacyBytes(trailing));
        }
        Ok(LegacyRow {
            world_name: String::from_utf8(name)?,
            x,
            y,
            z,
        })
    }
}
