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

use roadguard_core::coordinates::BlockCoordinate;
use roadguard_core::flood_fill::{FloodFillSelector, MaterialSource};

use crate::repository::BlockRepository;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoadToolOutcome {
    /// Size of the connected selection.
    pub selected: usize,
    /// Selected blocks whose protection actually changed.
    pub changed: usize,
}

/// The tool-use flow: a click on one block protects or unprotects the whole connected road.
pub struct RoadTool {
    repository: Arc<BlockRepository>,
    selector: FloodFillSelector,
}
impl RoadTool {
    pub fn new(repository: Arc<BlockRepository>, selector: FloodFillSelector) -> RoadTool {
        RoadTool {
            repository,
            selector,
        }
    }

    pub fn protect_connected<S, P>(
        &self,
        start: BlockCoordinate,
        materials: &S,
        is_road: P,
    ) -> RoadToolOutcome
    where
        S: MaterialSource + ?Sized,
        P: Fn(&S::Material) -> bool,
    {
        let selection = self.selector.select(start, materials, is_road);
        let changed = self.repository.save(&selection);
        tracing::debug!(
            "Protected road at {start:?}: {} selected, {changed} changed",
            selection.len()
        );
        RoadToolOutcome {
            selected: selection.len(),
            changed,
        }
    }

    pub fn unprotect_connected<S, P>(
        &self,
        start: BlockCoordinate,
        materials: &S,
        is_road: P,
    ) -> RoadToolOutcome
    where
        S: MaterialSource + ?Sized,
        P: Fn(&S::Material) -> bool,
    {
        let selection = self.selector.select(start, materials, is_road);
        let changed = self.repository.delete(&selection);
        tracing::debug!(
            "Unprotected road at {start:?}: {} selected, {changed} changed",
            selection.len()
        );
        RoadToolOutcome {
            selected: selection.len(),
            changed,
        }
    }
}
