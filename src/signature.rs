// Copyright 2024 Saptak Santra
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

//! Component identifiers and the packed vector signature.
//!
//! `Component` and `SharedInstance` are opaque 16-bit ids. `VectorComponentSignature`
//! packs up to 15 of either into 16 lanes (the 16th is a zero terminator),
//! biasing every stored id by +1 so the terminator can never collide with
//! a real id of value zero. All matching in the engine - archetype lookup,
//! query verification, shared-instance lookup - goes through this type.

use smallvec::SmallVec;

use crate::simd;

/// Number of lanes in a packed vector signature.
pub const SIGNATURE_LANES: usize = simd::LANES;

/// Maximum number of unique or shared components an archetype may carry.
/// One lane is reserved as the zero terminator.
pub const MAX_COMPONENTS: usize = SIGNATURE_LANES - 1;

/// Sentinel written by [`VectorComponentSignature::find`] for a query lane
/// with no match.
pub const MISSING: u8 = u8::MAX;

/// Opaque identifier of a unique (per-entity) component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
#[repr(transparent)]
pub struct Component(pub u16);

/// Opaque identifier of a concrete value interned for a shared component.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
#[repr(transparent)]
pub struct SharedInstance(pub u16);

/// An ordered tuple of component ids; order determines column layout
/// inside an archetype base. At most [`MAX_COMPONENTS`] entries.
pub type ComponentSignature = SmallVec<[Component; MAX_COMPONENTS]>;

/// An ordered tuple of shared-instance ids, parallel to a shared
/// [`ComponentSignature`].
pub type SharedInstanceSignature = SmallVec<[SharedInstance; MAX_COMPONENTS]>;

#[inline]
fn biased(id: u16) -> u16 {
    // id + 1 would only overflow for id == u16::MAX, which no registered
    // component uses in practice (component tables are small, fixed
    // registries, not a per-frame id space).
    id + 1
}

/// A fixed-width packed set of up to 15 component (or shared-instance)
/// ids, used for every hot-path comparison in the engine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VectorComponentSignature {
    lanes: [u16; SIGNATURE_LANES],
}

impl Default for VectorComponentSignature {
    fn default() -> Self {
        Self::empty()
    }
}

impl VectorComponentSignature {
    /// The empty signature: every lane is the zero terminator.
    pub fn empty() -> Self {
        Self {
            lanes: [0; SIGNATURE_LANES],
        }
    }

    /// Pack an ordered component signature into vector form.
    ///
    /// Crashes if `components.len() > MAX_COMPONENTS` - exceeding the
    /// fixed lane count is a contract violation, not a recoverable error.
    pub fn from_components(components: &[Component]) -> Self {
        crate::ecs_assert!(
            components.len() <= MAX_COMPONENTS,
            "component signature has {} entries, maximum is {}",
            components.len(),
            MAX_COMPONENTS
        );
        let mut lanes = [0u16; SIGNATURE_LANES];
        for (lane, component) in lanes.iter_mut().zip(components.iter()) {
            *lane = biased(component.0);
        }
        Self { lanes }
    }

    /// Pack an ordered shared-instance tuple into vector form.
    pub fn from_instances(instances: &[SharedInstance]) -> Self {
        crate::ecs_assert!(
            instances.len() <= MAX_COMPONENTS,
            "shared instance signature has {} entries, maximum is {}",
            instances.len(),
            MAX_COMPONENTS
        );
        let mut lanes = [0u16; SIGNATURE_LANES];
        for (lane, instance) in lanes.iter_mut().zip(instances.iter()) {
            *lane = biased(instance.0);
        }
        Self { lanes }
    }

    /// Number of non-terminator lanes.
    pub fn count(&self) -> usize {
        self.lanes.iter().take_while(|&&lane| lane != 0).count()
    }

    /// True if every non-zero lane of `query` also appears somewhere in
    /// `self`. A zero lane in `query` ends the scan successfully (queries
    /// are packed densely from index 0, so the first zero lane means
    /// "no more requirements").
    pub fn has_components(&self, query: &VectorComponentSignature) -> bool {
        for &lane in query.lanes.iter() {
            if lane == 0 {
                return true;
            }
            if !simd::contains(&self.lanes, lane) {
                return false;
            }
        }
        true
    }

    /// Dual of [`Self::has_components`]: every non-zero lane of `query`
    /// must be absent from `self`.
    pub fn excludes_components(&self, query: &VectorComponentSignature) -> bool {
        for &lane in query.lanes.iter() {
            if lane == 0 {
                return true;
            }
            if simd::contains(&self.lanes, lane) {
                return false;
            }
        }
        true
    }

    /// For every non-zero lane of `query`, write the lane position in
    /// `self` where it was found, or [`MISSING`] if absent. Positions
    /// beyond `query`'s last non-zero lane are left at [`MISSING`].
    pub fn find(&self, query: &VectorComponentSignature, out_positions: &mut [u8; SIGNATURE_LANES]) {
        out_positions.fill(MISSING);
        for (i, &lane) in query.lanes.iter().enumerate() {
            if lane == 0 {
                break;
            }
            out_positions[i] = self
                .lanes
                .iter()
                .position(|&v| v == lane)
                .map(|p| p as u8)
                .unwrap_or(MISSING);
        }
    }

    /// Locates each `query_components` lane inside `archetype_components`,
    /// then requires the corresponding `archetype_instances` lane to equal
    /// `query_instances`'s lane at the same query position. Used to check
    /// whether a base archetype's shared-instance tuple satisfies a
    /// query's required shared values.
    pub fn shared_has_instances(
        archetype_components: &VectorComponentSignature,
        archetype_instances: &VectorComponentSignature,
        query_components: &VectorComponentSignature,
        query_instances: &VectorComponentSignature,
    ) -> bool {
        for (i, &qc) in query_components.lanes.iter().enumerate() {
            if qc == 0 {
                return true;
            }
            match archetype_components.lanes.iter().position(|&v| v == qc) {
                None => return false,
                Some(pos) => {
                    if archetype_instances.lanes[pos] != query_instances.lanes[i] {
                        return false;
                    }
                }
            }
        }
        true
    }
}
