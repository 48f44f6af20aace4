/*
Physical address ranges and the address space built from them.

The hierarchy owns a set of disjoint physical ranges (the DRAM backing
store).  AddressSpace answers containment queries for the caches and the
memory controller, and maps flat byte offsets onto the possibly
discontiguous ranges for the page-walk path.
*/

use serde::Deserialize;

pub type Addr = u64;

/// Half-open physical range `[base, base + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AddrRange {
    pub base: Addr,
    pub size: u64,
}

impl AddrRange {
    pub fn new(base: Addr, size: u64) -> Self {
        Self { base, size }
    }

    pub fn end(&self) -> Addr {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, addr: Addr) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn overlaps(&self, other: &AddrRange) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// Whether `other` lies entirely inside this range.
    pub fn covers(&self, other: &AddrRange) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }
}

/// Ordered collection of disjoint physical ranges.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    ranges: Vec<AddrRange>,
    total_bytes: u64,
}

impl AddressSpace {
    /// Build from ranges, normalizing to ascending base order.  Disjointness
    /// is the builder's responsibility; this only sorts.
    pub fn new(mut ranges: Vec<AddrRange>) -> Self {
        ranges.sort_by_key(|range| range.base);
        let total_bytes = ranges.iter().map(|range| range.size).sum();
        Self {
            ranges,
            total_bytes,
        }
    }

    pub fn ranges(&self) -> &[AddrRange] {
        &self.ranges
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn contains(&self, addr: Addr) -> bool {
        self.ranges.iter().any(|range| range.contains(addr))
    }

    /// Flat byte offset of `addr` across the concatenated ranges, or None if
    /// the address falls outside every range.
    pub fn offset_of(&self, addr: Addr) -> Option<u64> {
        let mut skipped = 0u64;
        for range in &self.ranges {
            if range.contains(addr) {
                return Some(skipped + (addr - range.base));
            }
            skipped += range.size;
        }
        None
    }

    /// Physical address at flat byte offset `offset`, or None if the offset
    /// is beyond the total backed size.
    pub fn addr_at(&self, offset: u64) -> Option<Addr> {
        let mut remaining = offset;
        for range in &self.ranges {
            if remaining < range.size {
                return Some(range.base + remaining);
            }
            remaining -= range.size;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_containment_is_half_open() {
        let range = AddrRange::new(0x1000, 0x1000);
        assert!(!range.contains(0xFFF));
        assert!(range.contains(0x1000));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x2000));
    }

    #[test]
    fn overlap_detection() {
        let a = AddrRange::new(0, 0x100);
        let b = AddrRange::new(0x100, 0x100);
        let c = AddrRange::new(0x80, 0x100);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn discontiguous_space_offsets_concatenate() {
        let space = AddressSpace::new(vec![
            AddrRange::new(0x8000, 0x1000),
            AddrRange::new(0x0, 0x1000),
        ]);
        // Sorted ascending by base, so the low range comes first.
        assert_eq!(space.offset_of(0x10), Some(0x10));
        assert_eq!(space.offset_of(0x8000), Some(0x1000));
        assert_eq!(space.offset_of(0x4000), None);
        assert_eq!(space.total_bytes(), 0x2000);
    }

    #[test]
    fn addr_at_inverts_offset_of() {
        let space = AddressSpace::new(vec![
            AddrRange::new(0x0, 0x1000),
            AddrRange::new(0x8000, 0x1000),
        ]);
        for addr in [0x0u64, 0xFFF, 0x8000, 0x8FFF] {
            let offset = space.offset_of(addr).unwrap();
            assert_eq!(space.addr_at(offset), Some(addr));
        }
        assert_eq!(space.addr_at(0x2000), None);
    }
}
