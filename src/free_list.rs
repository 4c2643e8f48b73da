// BSD 2-Clause License
//
// Copyright (c) 2020 Brian Campbell
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
// notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
// notice, this list of conditions and the following disclaimer in the
// documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use log::debug;

use crate::error::{CkptError, Result};

/// Half-open `[begin, end)` run of unwritten bytes with even bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeRange {
    pub begin: u64,
    pub end: u64,
}

impl FreeRange {
    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// Distance from `target` to the nearest edge, zero if `target` lies inside.
    pub fn distance(&self, target: u64) -> u64 {
        if target < self.begin {
            self.begin - target
        } else if target >= self.end {
            target - self.end
        } else {
            0
        }
    }
}

/// Sorted, disjoint snapshot of the free ranges of a page store. It is not
/// kept in sync with the store; reservations shrink it in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FreeList {
    ranges: Vec<FreeRange>,
}

impl FreeList {
    pub fn from_ranges(mut ranges: Vec<FreeRange>) -> Self {
        ranges.retain(|r| !r.is_empty());
        ranges.sort_by_key(|r| r.begin);
        FreeList { ranges }
    }

    pub fn ranges(&self) -> &[FreeRange] {
        &self.ranges
    }

    /// Index of the closest range that can hold `size` bytes, searching
    /// outwards from `target` in both directions.
    fn nearest_fit(&self, target: u64, size: u64) -> Option<usize> {
        let split = self.ranges.partition_point(|r| r.begin <= target);
        let below = self.ranges[..split].iter().rposition(|r| r.len() >= size);
        let above = self.ranges[split..].iter().position(|r| r.len() >= size).map(|i| split + i);
        match (below, above) {
            (Some(lo), Some(hi)) => {
                if self.ranges[hi].distance(target) < self.ranges[lo].distance(target) {
                    Some(hi)
                } else {
                    Some(lo)
                }
            }
            (lo, hi) => lo.or(hi),
        }
    }

    /// Take `size` bytes (rounded up to even) from the range nearest to
    /// `target`. A range lying wholly above the target is allocated from its
    /// low end, any other range from its high end.
    pub fn reserve(&mut self, target: u64, size: u64) -> Result<u64> {
        let size = (size + 1) & !1;
        let i = self.nearest_fit(target, size).ok_or(CkptError::AllocationFailure { target, size })?;
        let range = &mut self.ranges[i];
        let addr = if range.begin > target {
            let addr = range.begin;
            range.begin += size;
            addr
        } else {
            range.end -= size;
            range.end
        };
        if range.is_empty() {
            self.ranges.remove(i);
        }
        debug!("Reserved {} bytes at {:#x} for {:#x}", size, addr, target);
        Ok(addr)
    }
}

pub fn reserve(free_list: &mut FreeList, target: u64, size: u64) -> Result<u64> {
    free_list.reserve(target, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn list(ranges: &[(u64, u64)]) -> FreeList {
        FreeList::from_ranges(ranges.iter().map(|&(begin, end)| FreeRange { begin, end }).collect())
    }

    #[test]
    fn target_below_single_range() {
        let mut free = list(&[(100, 200)]);
        assert_eq!(reserve(&mut free, 50, 60).unwrap(), 100);
        assert_eq!(free, list(&[(160, 200)]));
    }

    #[test]
    fn target_above_allocates_from_high_end() {
        let mut free = list(&[(100, 200)]);
        assert_eq!(reserve(&mut free, 500, 60).unwrap(), 140);
        assert_eq!(free, list(&[(100, 140)]));
    }

    #[test]
    fn target_inside_range() {
        let mut free = list(&[(100, 200)]);
        assert_eq!(reserve(&mut free, 150, 20).unwrap(), 180);
    }

    #[test]
    fn prefers_closer_side() {
        let mut free = list(&[(0, 100), (1000, 1100), (1180, 1300)]);
        assert_eq!(reserve(&mut free, 1150, 40).unwrap(), 1180);
        assert_eq!(reserve(&mut free, 1150, 40).unwrap(), 1060);
    }

    #[test]
    fn skips_ranges_that_are_too_small() {
        let mut free = list(&[(0, 100), (1000, 1010), (1200, 1210)]);
        assert_eq!(reserve(&mut free, 1100, 50).unwrap(), 50);
    }

    #[test]
    fn exhausted_range_is_removed() {
        let mut free = list(&[(100, 110), (300, 400)]);
        assert_eq!(reserve(&mut free, 0, 10).unwrap(), 100);
        assert_eq!(free, list(&[(300, 400)]));
    }

    #[test]
    fn odd_sizes_keep_alignment() {
        let mut free = list(&[(100, 200)]);
        assert_eq!(reserve(&mut free, 0, 3).unwrap(), 100);
        assert_eq!(free.ranges()[0].begin, 104);
    }

    #[test]
    fn no_fit_is_an_allocation_failure() {
        let mut free = list(&[(100, 110)]);
        match reserve(&mut free, 0, 64) {
            Err(CkptError::AllocationFailure { target: 0, size: 64 }) => (),
            other => panic!("Unexpected result {:?}", other),
        }
        assert!(reserve(&mut FreeList::default(), 0, 2).is_err());
    }

    #[test]
    fn random_reservations_are_nearest_and_inside_free_space() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut ranges = vec![];
            let mut cursor = 0u64;
            for _ in 0..rng.gen_range(1, 12) {
                let begin = cursor + rng.gen_range(1, 200) * 2;
                let end = begin + rng.gen_range(1, 100) * 2;
                ranges.push((begin, end));
                cursor = end;
            }
            let free = list(&ranges);
            let target = rng.gen_range(0, cursor + 200);
            let size = rng.gen_range(1, 120) * 2;

            let mut after = free.clone();
            match reserve(&mut after, target, size) {
                Ok(addr) => {
                    let chosen = free
                        .ranges()
                        .iter()
                        .find(|r| r.begin <= addr && addr + size <= r.end)
                        .expect("allocation outside the free list");
                    for other in free.ranges().iter().filter(|r| r.len() >= size) {
                        assert!(chosen.distance(target) <= other.distance(target));
                    }
                }
                Err(_) => assert!(free.ranges().iter().all(|r| r.len() < size)),
            }
        }
    }
}
