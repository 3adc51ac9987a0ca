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

//! Lane-wise compare primitives over 16-lane `u16` vectors.
//!
//! [`crate::signature::VectorComponentSignature`] is exactly 16 lanes of
//! 16 bits, i.e. 256 bits - one AVX2 register. `contains_any` is the
//! broadcast + compare + horizontal-OR the signature's `has_components`
//! and `excludes_components` are built on. The scalar loop is the
//! reference implementation; the AVX2 path must agree with it bit for
//! bit, and callers never need to pick between them.

pub const LANES: usize = 16;

/// True if `needle` appears anywhere in `haystack`. Scalar reference
/// implementation; always correct, used as the non-x86_64 fallback and to
/// check the SIMD path in tests.
#[inline]
pub fn scalar_contains(haystack: &[u16; LANES], needle: u16) -> bool {
    haystack.iter().any(|&lane| lane == needle)
}

#[cfg(target_arch = "x86_64")]
#[inline]
pub fn contains(haystack: &[u16; LANES], needle: u16) -> bool {
    if is_x86_feature_detected!("avx2") {
        unsafe { contains_avx2(haystack, needle) }
    } else {
        scalar_contains(haystack, needle)
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn contains(haystack: &[u16; LANES], needle: u16) -> bool {
    scalar_contains(haystack, needle)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn contains_avx2(haystack: &[u16; LANES], needle: u16) -> bool {
    use std::arch::x86_64::*;
    // SAFETY: `haystack` is a `&[u16; 16]`, i.e. exactly 32 bytes, so the
    // unaligned 256-bit load reads precisely the array's backing memory.
    let hay = unsafe { _mm256_loadu_si256(haystack.as_ptr() as *const __m256i) };
    let broadcast = unsafe { _mm256_set1_epi16(needle as i16) };
    let cmp = unsafe { _mm256_cmpeq_epi16(hay, broadcast) };
    unsafe { _mm256_movemask_epi8(cmp) != 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_and_accelerated_agree() {
        let mut hay = [0u16; LANES];
        for (i, lane) in hay.iter_mut().enumerate() {
            *lane = (i as u16 + 1) * 3;
        }
        for needle in 0..64u16 {
            assert_eq!(
                scalar_contains(&hay, needle),
                contains(&hay, needle),
                "mismatch for needle {needle}"
            );
        }
    }

    #[test]
    fn empty_needle_zero_not_found_in_populated_vector() {
        let hay = [1u16; LANES];
        assert!(!scalar_contains(&hay, 0));
    }
}
