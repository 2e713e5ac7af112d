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


/// Edge length of a host chunk, in blocks. Chunk coordinates are `floor(block / CHUNK_EDGE)`.
pub const CHUNK_EDGE: i32 = 16;

/// How far (euclidean, in blocks) a road selection may spread from the clicked block
/// when no setting overrides it.
pub const DEFAULT_SPREAD_DISTANCE: u32 = 64;

/// Default radius for "show nearby protected blocks"
pub const DEFAULT_NEAR_RADIUS: u32 = 32;
