use log::trace;
use serde::Serialize;
use std::ops::AddAssign;

use super::config::TlbConfig;
use super::request::{AccessError, AccessKind};
use crate::addr::{Addr, AddressSpace};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TlbStats {
    pub lookups: u64,
    pub hits: u64,
    pub walks: u64,
    pub evictions: u64,
    pub faults: u64,
}

impl AddAssign<&TlbStats> for TlbStats {
    fn add_assign(&mut self, other: &TlbStats) {
        self.lookups = self.lookups.saturating_add(other.lookups);
        self.hits = self.hits.saturating_add(other.hits);
        self.walks = self.walks.saturating_add(other.walks);
        self.evictions = self.evictions.saturating_add(other.evictions);
        self.faults = self.faults.saturating_add(other.faults);
    }
}

/// Fully-associative translation cache with LRU eviction.  Entries map a
/// virtual page number to the physical base address of the page.
#[derive(Debug)]
struct TlbArray {
    capacity: usize,
    // Most recently used first.
    entries: Vec<(u64, Addr)>,
}

impl TlbArray {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    fn lookup(&mut self, vpage: u64) -> Option<Addr> {
        let pos = self.entries.iter().position(|&(page, _)| page == vpage)?;
        let entry = self.entries.remove(pos);
        let base = entry.1;
        self.entries.insert(0, entry);
        Some(base)
    }

    /// Insert a fresh mapping; returns true when an older entry was evicted.
    fn insert(&mut self, vpage: u64, base: Addr) -> bool {
        debug_assert!(self.entries.iter().all(|&(page, _)| page != vpage));
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop();
            true
        } else {
            false
        };
        self.entries.insert(0, (vpage, base));
        evicted
    }
}

/// Result of a successful translation.  `ready_at` is `now` on a TLB hit
/// and `now + walk_latency` when a page walk was needed.
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    pub paddr: Addr,
    pub ready_at: Cycle,
}

/// MMU front end: split instruction/data translation caches over a linear
/// virtual-to-physical page mapping onto the configured physical ranges.
#[derive(Debug)]
pub struct TranslationUnit {
    itlb: TlbArray,
    dtlb: TlbArray,
    walk_latency: Cycle,
    page_bytes: u64,
    space: AddressSpace,
    istats: TlbStats,
    dstats: TlbStats,
}

impl TranslationUnit {
    pub fn new(config: &TlbConfig, space: AddressSpace) -> Self {
        Self {
            itlb: TlbArray::new(config.itlb_entries),
            dtlb: TlbArray::new(config.dtlb_entries),
            walk_latency: config.walk_latency,
            page_bytes: config.page_bytes,
            space,
            istats: TlbStats::default(),
            dstats: TlbStats::default(),
        }
    }

    pub fn page_bytes(&self) -> u64 {
        self.page_bytes
    }

    pub fn istats(&self) -> TlbStats {
        self.istats
    }

    pub fn dstats(&self) -> TlbStats {
        self.dstats
    }

    /// Translate `vaddr` for the given access type.  Faults when the page
    /// walk cannot resolve a backed physical page.
    pub fn translate(
        &mut self,
        now: Cycle,
        vaddr: Addr,
        kind: AccessKind,
    ) -> Result<Translation, AccessError> {
        let vpage = vaddr / self.page_bytes;
        let offset = vaddr % self.page_bytes;

        let (pool, stats) = if kind.is_fetch() {
            (&mut self.itlb, &mut self.istats)
        } else {
            (&mut self.dtlb, &mut self.dstats)
        };
        stats.lookups += 1;

        if let Some(base) = pool.lookup(vpage) {
            stats.hits += 1;
            return Ok(Translation {
                paddr: base + offset,
                ready_at: now,
            });
        }

        // Page walk: the flat virtual page sequence maps linearly onto the
        // concatenated physical ranges.
        let flat = vpage
            .checked_mul(self.page_bytes)
            .ok_or(AccessError::TranslationFault { vaddr })?;
        let walked = self.space.addr_at(flat).and_then(|base| {
            // The whole page must be contiguously backed.
            match self.space.addr_at(flat + self.page_bytes - 1) {
                Some(end) if end == base + self.page_bytes - 1 => Some(base),
                _ => None,
            }
        });
        let base = match walked {
            Some(base) => base,
            None => {
                stats.faults += 1;
                return Err(AccessError::TranslationFault { vaddr });
            }
        };

        stats.walks += 1;
        if pool.insert(vpage, base) {
            stats.evictions += 1;
        }
        trace!("tlb: walked vpage {vpage:#x} -> {base:#x} at {now}");
        Ok(Translation {
            paddr: base + offset,
            ready_at: now + self.walk_latency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::AddrRange;

    fn unit(entries: usize) -> TranslationUnit {
        TranslationUnit::new(
            &TlbConfig {
                itlb_entries: entries,
                dtlb_entries: entries,
                walk_latency: 100,
                page_bytes: 4096,
            },
            AddressSpace::new(vec![AddrRange::new(0, 1 << 20)]),
        )
    }

    #[test]
    fn first_touch_walks_then_hits() {
        let mut mmu = unit(4);
        let first = mmu.translate(0, 0x1234, AccessKind::Read).unwrap();
        assert_eq!(first.paddr, 0x1234);
        assert_eq!(first.ready_at, 100);
        let second = mmu.translate(200, 0x1238, AccessKind::Read).unwrap();
        assert_eq!(second.ready_at, 200);
        assert_eq!(mmu.dstats().walks, 1);
        assert_eq!(mmu.dstats().hits, 1);
    }

    #[test]
    fn instruction_and_data_pools_are_separate() {
        let mut mmu = unit(4);
        mmu.translate(0, 0x1000, AccessKind::Read).unwrap();
        // Same page through the fetch path still walks.
        let fetch = mmu.translate(10, 0x1000, AccessKind::InstFetch).unwrap();
        assert_eq!(fetch.ready_at, 110);
        assert_eq!(mmu.istats().walks, 1);
        assert_eq!(mmu.dstats().walks, 1);
    }

    #[test]
    fn fifth_page_evicts_lru_and_rewalks() {
        let mut mmu = unit(4);
        for page in 0..5u64 {
            mmu.translate(0, page * 4096, AccessKind::Read).unwrap();
        }
        assert_eq!(mmu.dstats().walks, 5);
        assert_eq!(mmu.dstats().evictions, 1);
        // Page 0 was the LRU victim, so revisiting it walks again.
        let redo = mmu.translate(500, 0, AccessKind::Read).unwrap();
        assert_eq!(redo.ready_at, 600);
        assert_eq!(mmu.dstats().walks, 6);
    }

    #[test]
    fn unbacked_page_faults() {
        let mut mmu = unit(4);
        let err = mmu.translate(0, 2 << 20, AccessKind::Read).unwrap_err();
        assert!(matches!(err, AccessError::TranslationFault { .. }));
        assert_eq!(mmu.dstats().faults, 1);
    }

    #[test]
    fn discontiguous_ranges_map_linearly() {
        let mut mmu = TranslationUnit::new(
            &TlbConfig {
                itlb_entries: 4,
                dtlb_entries: 4,
                walk_latency: 10,
                page_bytes: 4096,
            },
            AddressSpace::new(vec![
                AddrRange::new(0, 8192),
                AddrRange::new(0x10000, 8192),
            ]),
        );
        // Virtual page 2 lands at the base of the second physical range.
        let translated = mmu.translate(0, 2 * 4096 + 4, AccessKind::Read).unwrap();
        assert_eq!(translated.paddr, 0x10004);
    }
}
