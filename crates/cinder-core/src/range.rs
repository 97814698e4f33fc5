//! Offset/size interval arithmetic for device memory sub-allocation.
//!
//! [`MemoryRange`] is a plain value type. [`RangeAllocator`] keeps the free
//! ranges of one region in an offset-ordered set, splitting a candidate on
//! allocation and coalescing neighbours on free. The allocator does no
//! locking of its own; callers serialise access to a single instance.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// A non-empty `[offset, offset + size)` interval.
///
/// Ordering is by offset first, which is what the free list relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryRange {
    offset: u64,
    size: u64,
}

impl MemoryRange {
    /// Create a range.
    ///
    /// Fails with [`Error::EmptyRange`] when `size == 0` and with
    /// [`Error::RangeOverflow`] when the end would not fit in a `u64`.
    pub const fn new(offset: u64, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::EmptyRange);
        }
        if offset.checked_add(size).is_none() {
            return Err(Error::RangeOverflow { offset, size });
        }
        Ok(Self { offset, size })
    }

    /// Start of the range.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the range in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// One past the last byte.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Whether `self` ends exactly where `next` begins.
    #[must_use]
    pub const fn is_adjacent_to(&self, next: &Self) -> bool {
        self.end() == next.offset
    }

    /// Whether the two ranges share at least one byte.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Split into a low part of `at` bytes and the remainder.
    ///
    /// Requires `0 < at <= size`. The high part is `None` when `at == size`.
    pub const fn split(self, at: u64) -> Result<(Self, Option<Self>)> {
        if at == 0 || at > self.size {
            return Err(Error::InvalidSplit {
                at,
                size: self.size,
            });
        }

        let low = Self {
            offset: self.offset,
            size: at,
        };
        if at == self.size {
            return Ok((low, None));
        }

        let high = Self {
            offset: self.offset + at,
            size: self.size - at,
        };
        Ok((low, Some(high)))
    }

    /// Join `self` with the range immediately after it.
    pub const fn merge(self, next: Self) -> Result<Self> {
        if !self.is_adjacent_to(&next) {
            return Err(Error::NotAdjacent {
                first: self,
                second: next,
            });
        }
        Ok(Self {
            offset: self.offset,
            size: self.size + next.size,
        })
    }
}

/// Candidate selection strategy for [`RangeAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitPolicy {
    /// Lowest-offset free range that fits.
    #[default]
    FirstFit,
    /// Smallest free range that fits, lowest offset on ties.
    BestFit,
}

/// Free-list sub-allocator over a single region.
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    region: MemoryRange,
    free: BTreeSet<MemoryRange>,
    free_bytes: u64,
    policy: FitPolicy,
}

impl RangeAllocator {
    /// Create an allocator managing all of `region`.
    #[must_use]
    pub fn new(region: MemoryRange, policy: FitPolicy) -> Self {
        let mut free = BTreeSet::new();
        free.insert(region);
        Self {
            region,
            free,
            free_bytes: region.size(),
            policy,
        }
    }

    /// The managed region.
    #[must_use]
    pub const fn region(&self) -> MemoryRange {
        self.region
    }

    /// Total free bytes, fragmented or not.
    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// Size of the largest single free range.
    #[must_use]
    pub fn largest_free(&self) -> u64 {
        self.free.iter().map(MemoryRange::size).max().unwrap_or(0)
    }

    /// Number of disjoint free ranges.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.free.len()
    }

    /// Iterate the free ranges in offset order.
    pub fn free_ranges(&self) -> impl Iterator<Item = &MemoryRange> {
        self.free.iter()
    }

    /// Allocate `size` bytes starting at a multiple of `alignment`.
    ///
    /// `alignment` must be a power of two; zero is treated as one.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<MemoryRange> {
        if size == 0 {
            return Err(Error::EmptyRange);
        }
        let alignment = alignment.max(1);
        debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");

        let fits = |r: &&MemoryRange| {
            align_up(r.offset(), alignment)
                .and_then(|aligned| (aligned - r.offset()).checked_add(size))
                .is_some_and(|needed| needed <= r.size())
        };

        let candidate = match self.policy {
            FitPolicy::FirstFit => self.free.iter().find(fits).copied(),
            FitPolicy::BestFit => self
                .free
                .iter()
                .filter(fits)
                .min_by_key(|r| (r.size(), r.offset()))
                .copied(),
        }
        .ok_or(Error::OutOfSpace { requested: size })?;

        self.free.remove(&candidate);

        let padding = align_up(candidate.offset(), alignment)
            .ok_or(Error::OutOfSpace { requested: size })?
            - candidate.offset();
        let rest = if padding == 0 {
            candidate
        } else {
            let (head, rest) = candidate.split(padding)?;
            self.free.insert(head);
            rest.ok_or(Error::OutOfSpace { requested: size })?
        };

        let (allocated, tail) = rest.split(size)?;
        if let Some(tail) = tail {
            self.free.insert(tail);
        }

        self.free_bytes -= allocated.size();
        Ok(allocated)
    }

    /// Return a range, coalescing it with adjacent free neighbours.
    pub fn free(&mut self, range: MemoryRange) -> Result<()> {
        if range.offset() < self.region.offset() || range.end() > self.region.end() {
            return Err(Error::UnknownRange(range));
        }

        let prev = self.free.range(..range).next_back().copied();
        let next = self.free.range(range..).next().copied();

        if prev.is_some_and(|p| p.overlaps(&range)) || next.is_some_and(|n| n.overlaps(&range)) {
            return Err(Error::UnknownRange(range));
        }

        let mut merged = range;
        if let Some(p) = prev.filter(|p| p.is_adjacent_to(&range)) {
            self.free.remove(&p);
            merged = p.merge(merged)?;
        }
        if let Some(n) = next.filter(|n| range.is_adjacent_to(n)) {
            self.free.remove(&n);
            merged = merged.merge(n)?;
        }

        self.free.insert(merged);
        self.free_bytes += range.size();
        Ok(())
    }
}

/// `None` when the aligned value does not fit in a `u64`.
const fn align_up(value: u64, alignment: u64) -> Option<u64> {
    match value.checked_add(alignment - 1) {
        Some(bumped) => Some(bumped & !(alignment - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn range(offset: u64, size: u64) -> MemoryRange {
        MemoryRange::new(offset, size).unwrap()
    }

    #[test]
    fn zero_size_is_rejected() {
        assert_eq!(MemoryRange::new(10, 0), Err(Error::EmptyRange));
    }

    #[test]
    fn end_past_u64_max_is_rejected() {
        assert_eq!(
            MemoryRange::new(u64::MAX - 3, 8),
            Err(Error::RangeOverflow {
                offset: u64::MAX - 3,
                size: 8
            })
        );

        let top = range(u64::MAX - 8, 8);
        assert_eq!(top.end(), u64::MAX);
        let (low, high) = top.split(5).unwrap();
        assert_eq!(high, Some(range(u64::MAX - 3, 3)));
        assert_eq!(low.merge(high.unwrap()), Ok(top));
    }

    #[test]
    fn alignment_near_u64_max_is_out_of_space() {
        let mut alloc = RangeAllocator::new(range(u64::MAX - 8, 8), FitPolicy::FirstFit);
        assert_eq!(
            alloc.allocate(4, 1 << 32),
            Err(Error::OutOfSpace { requested: 4 })
        );
        assert_eq!(alloc.allocate(8, 1).map(|r| r.offset()), Ok(u64::MAX - 8));
    }

    #[test]
    fn split_at_full_size_has_no_high_part() {
        let r = range(64, 128);
        assert_eq!(r.split(128), Ok((r, None)));
    }

    #[test]
    fn split_at_zero_fails() {
        assert_eq!(
            range(0, 8).split(0),
            Err(Error::InvalidSplit { at: 0, size: 8 })
        );
    }

    #[test]
    fn merge_requires_order() {
        let a = range(0, 16);
        let b = range(16, 16);
        assert_eq!(a.merge(b), Ok(range(0, 32)));
        assert!(matches!(b.merge(a), Err(Error::NotAdjacent { .. })));
    }

    #[test]
    fn ranges_order_by_offset() {
        let mut v = vec![range(300, 1), range(0, 500), range(100, 2)];
        v.sort();
        assert_eq!(v, vec![range(0, 500), range(100, 2), range(300, 1)]);
    }

    #[test]
    fn first_fit_takes_lowest_offset() {
        let mut alloc = RangeAllocator::new(range(0, 1024), FitPolicy::FirstFit);
        let a = alloc.allocate(100, 1).unwrap();
        let b = alloc.allocate(100, 1).unwrap();
        assert_eq!(a, range(0, 100));
        assert_eq!(b, range(100, 100));
        assert_eq!(alloc.free_bytes(), 824);
    }

    #[test]
    fn best_fit_prefers_smallest_hole() {
        let mut alloc = RangeAllocator::new(range(0, 1000), FitPolicy::BestFit);
        let a = alloc.allocate(300, 1).unwrap();
        let _b = alloc.allocate(100, 1).unwrap();
        let c = alloc.allocate(50, 1).unwrap();
        let _d = alloc.allocate(100, 1).unwrap();
        // Free holes: [0,300) and [400,450), plus the tail [550,1000).
        alloc.free(a).unwrap();
        alloc.free(c).unwrap();

        let e = alloc.allocate(40, 1).unwrap();
        assert_eq!(e.offset(), 400);
    }

    #[test]
    fn alignment_leaves_padding_free() {
        let mut alloc = RangeAllocator::new(range(0, 1024), FitPolicy::FirstFit);
        alloc.allocate(10, 1).unwrap();
        let aligned = alloc.allocate(64, 256).unwrap();
        assert_eq!(aligned.offset(), 256);
        assert_eq!(alloc.free_bytes(), 1024 - 10 - 64);
        assert_eq!(alloc.free_ranges().next(), Some(&range(10, 246)));
    }

    #[test]
    fn free_coalesces_both_neighbours() {
        let mut alloc = RangeAllocator::new(range(0, 300), FitPolicy::FirstFit);
        let a = alloc.allocate(100, 1).unwrap();
        let b = alloc.allocate(100, 1).unwrap();
        let c = alloc.allocate(100, 1).unwrap();
        alloc.free(a).unwrap();
        alloc.free(c).unwrap();
        assert_eq!(alloc.fragment_count(), 2);
        alloc.free(b).unwrap();
        assert_eq!(alloc.fragment_count(), 1);
        assert_eq!(alloc.largest_free(), 300);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut alloc = RangeAllocator::new(range(0, 256), FitPolicy::FirstFit);
        let a = alloc.allocate(64, 1).unwrap();
        alloc.free(a).unwrap();
        assert_eq!(alloc.free(a), Err(Error::UnknownRange(a)));
    }

    #[test]
    fn exhaustion_reports_out_of_space() {
        let mut alloc = RangeAllocator::new(range(0, 64), FitPolicy::FirstFit);
        alloc.allocate(64, 1).unwrap();
        assert_eq!(
            alloc.allocate(1, 1),
            Err(Error::OutOfSpace { requested: 1 })
        );
    }

    proptest! {
        #[test]
        fn split_then_merge_reconstructs(offset in 0u64..1 << 40, size in 2u64..1 << 20, at in 1u64..1 << 20) {
            let r = range(offset, size);
            let at = at.min(size - 1).max(1);
            let (low, high) = r.split(at).unwrap();
            let high = high.unwrap();
            prop_assert_eq!(low.end(), high.offset());
            prop_assert_eq!(low.merge(high).unwrap(), r);
        }

        #[test]
        fn split_one_round_trips(offset in 0u64..1 << 40, size in 1u64..1 << 20) {
            let r = range(offset, size);
            match r.split(1).unwrap() {
                (low, Some(high)) => prop_assert_eq!(low.merge(high).unwrap(), r),
                (low, None) => prop_assert_eq!(low, r),
            }
        }

        #[test]
        fn oversized_split_fails(offset in 0u64..1 << 40, size in 1u64..1 << 20, extra in 1u64..1 << 20) {
            let r = range(offset, size);
            prop_assert_eq!(
                r.split(size + extra),
                Err(Error::InvalidSplit { at: size + extra, size })
            );
            prop_assert_eq!(r.size(), size);
        }

        #[test]
        fn non_adjacent_merge_fails(
            a_off in 0u64..1 << 30,
            a_size in 1u64..1 << 16,
            gap in 1u64..1 << 16,
            b_size in 1u64..1 << 16,
            before in any::<bool>(),
        ) {
            let a = range(a_off, a_size);
            // Either a gap after `a`, or `b` placed before `a`.
            let b_off = if before { a_off.saturating_sub(gap) } else { a.end() + gap };
            let b = range(b_off, b_size);
            prop_assume!(a.end() != b.offset());
            let is_not_adjacent = matches!(a.merge(b), Err(Error::NotAdjacent { .. }));
            prop_assert!(is_not_adjacent);
        }

        #[test]
        fn allocations_never_overlap(sizes in proptest::collection::vec(1u64..200, 1..40), best in any::<bool>()) {
            let policy = if best { FitPolicy::BestFit } else { FitPolicy::FirstFit };
            let mut alloc = RangeAllocator::new(range(0, 4096), policy);
            let mut live: Vec<MemoryRange> = Vec::new();
            for (i, size) in sizes.iter().enumerate() {
                if let Ok(r) = alloc.allocate(*size, 1) {
                    prop_assert!(live.iter().all(|l| !l.overlaps(&r)));
                    live.push(r);
                }
                if i % 3 == 2 && !live.is_empty() {
                    let r = live.remove(0);
                    alloc.free(r).unwrap();
                }
            }
            for r in live.drain(..) {
                alloc.free(r).unwrap();
            }
            prop_assert_eq!(alloc.fragment_count(), 1);
            prop_assert_eq!(alloc.free_bytes(), 4096);
        }
    }
}
