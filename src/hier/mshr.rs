use smallvec::SmallVec;

use super::request::MemRequest;

/// Lifecycle of one outstanding line fetch.  Entries advance strictly
/// forward; release happens when `take` removes the entry, after the caller
/// has drained every merged waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MshrState {
    Allocated,
    Forwarded,
    Filled,
}

#[derive(Debug)]
pub struct MshrEntry {
    line_addr: u64,
    state: MshrState,
    any_write: bool,
    merged: SmallVec<[MemRequest; 2]>,
}

impl MshrEntry {
    fn new(line_addr: u64, is_write: bool) -> Self {
        Self {
            line_addr,
            state: MshrState::Allocated,
            any_write: is_write,
            merged: SmallVec::new(),
        }
    }

    pub fn line_addr(&self) -> u64 {
        self.line_addr
    }

    pub fn state(&self) -> MshrState {
        self.state
    }

    /// Whether the primary or any merged request writes the line.
    pub fn any_write(&self) -> bool {
        self.any_write
    }

    pub fn merged(&self) -> &[MemRequest] {
        &self.merged
    }

    pub fn into_merged(self) -> SmallVec<[MemRequest; 2]> {
        self.merged
    }
}

/// Miss-status holding registry: at most `capacity` outstanding lines, at
/// most `tgts_per_entry` merged requests per line.  Exceeding either bound
/// is backpressure to the caller, never a drop.
#[derive(Debug)]
pub struct MshrTable {
    capacity: usize,
    tgts_per_entry: usize,
    entries: Vec<MshrEntry>,
    max_occupancy: usize,
}

impl MshrTable {
    pub fn new(capacity: usize, tgts_per_entry: usize) -> Self {
        Self {
            capacity,
            tgts_per_entry,
            entries: Vec::with_capacity(capacity),
            max_occupancy: 0,
        }
    }

    pub fn has_entry(&self, line_addr: u64) -> bool {
        self.entries.iter().any(|entry| entry.line_addr == line_addr)
    }

    pub fn occupancy(&self) -> usize {
        self.entries.len()
    }

    pub fn max_occupancy(&self) -> usize {
        self.max_occupancy
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Allocate a fresh entry for a primary miss.  Returns false when the
    /// registry is out of entries.  The caller must have checked that no
    /// entry for this line exists.
    pub fn try_allocate(&mut self, line_addr: u64, is_write: bool) -> bool {
        debug_assert!(
            !self.has_entry(line_addr),
            "one entry per outstanding line: {line_addr:#x}"
        );
        if self.is_full() {
            return false;
        }
        self.entries.push(MshrEntry::new(line_addr, is_write));
        self.max_occupancy = self.max_occupancy.max(self.entries.len());
        true
    }

    /// Merge a secondary miss into the existing entry for its line.  Returns
    /// the request back when the entry already holds `tgts_per_entry`
    /// waiters.
    pub fn try_merge(&mut self, line_addr: u64, request: MemRequest) -> Result<(), MemRequest> {
        let tgts_per_entry = self.tgts_per_entry;
        let entry = self
            .entry_mut(line_addr)
            .expect("merge requires an existing entry");
        if entry.merged.len() >= tgts_per_entry {
            return Err(request);
        }
        entry.any_write |= request.kind.is_write();
        entry.merged.push(request);
        Ok(())
    }

    /// The fill request left for the next level.
    pub fn mark_forwarded(&mut self, line_addr: u64) {
        if let Some(entry) = self.entry_mut(line_addr) {
            debug_assert_eq!(entry.state, MshrState::Allocated);
            entry.state = MshrState::Forwarded;
        }
    }

    /// The fill response arrived: remove and return the entry so the caller
    /// can install the line and notify every merged waiter.
    pub fn take(&mut self, line_addr: u64) -> Option<MshrEntry> {
        let idx = self
            .entries
            .iter()
            .position(|entry| entry.line_addr == line_addr)?;
        let mut entry = self.entries.swap_remove(idx);
        entry.state = MshrState::Filled;
        Some(entry)
    }

    fn entry_mut(&mut self, line_addr: u64) -> Option<&mut MshrEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.line_addr == line_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hier::request::{AccessKind, MemRequest};

    fn read_req(vaddr: u64) -> MemRequest {
        MemRequest::new(vaddr, 4, AccessKind::Read, 0)
    }

    fn write_req(vaddr: u64) -> MemRequest {
        MemRequest::new(vaddr, 4, AccessKind::Write, 0)
    }

    #[test]
    fn allocate_until_capacity() {
        let mut table = MshrTable::new(2, 4);
        assert!(table.try_allocate(1, false));
        assert!(table.try_allocate(2, false));
        assert!(!table.try_allocate(3, false));
        assert_eq!(table.occupancy(), 2);
        assert_eq!(table.max_occupancy(), 2);
    }

    #[test]
    fn take_frees_a_slot() {
        let mut table = MshrTable::new(1, 4);
        assert!(table.try_allocate(1, false));
        assert!(table.take(1).is_some());
        assert!(table.try_allocate(2, false));
    }

    #[test]
    fn take_unknown_line_returns_none() {
        let mut table = MshrTable::new(1, 4);
        assert!(table.take(9).is_none());
    }

    #[test]
    fn merge_respects_target_bound() {
        let mut table = MshrTable::new(1, 2);
        assert!(table.try_allocate(1, false));
        assert!(table.try_merge(1, read_req(0x40)).is_ok());
        assert!(table.try_merge(1, read_req(0x44)).is_ok());
        assert!(table.try_merge(1, read_req(0x48)).is_err());
        let entry = table.take(1).unwrap();
        assert_eq!(entry.merged().len(), 2);
    }

    #[test]
    fn merged_write_marks_entry_dirty() {
        let mut table = MshrTable::new(1, 4);
        assert!(table.try_allocate(1, false));
        assert!(table.try_merge(1, write_req(0x40)).is_ok());
        assert!(table.take(1).unwrap().any_write());
    }

    #[test]
    fn primary_write_marks_entry_dirty() {
        let mut table = MshrTable::new(1, 4);
        assert!(table.try_allocate(1, true));
        assert!(table.take(1).unwrap().any_write());
    }

    #[test]
    fn state_machine_advances_forward() {
        let mut table = MshrTable::new(1, 4);
        assert!(table.try_allocate(1, false));
        table.mark_forwarded(1);
        let entry = table.take(1).unwrap();
        assert_eq!(entry.state(), MshrState::Filled);
    }

    #[test]
    fn fill_and_drain_repeatedly() {
        let mut table = MshrTable::new(4, 4);
        for round in 0..100 {
            for line in 0..4 {
                assert!(table.try_allocate(line, false), "round {round}");
            }
            for line in 0..4 {
                assert!(table.take(line).is_some(), "round {round}");
            }
        }
    }
}
