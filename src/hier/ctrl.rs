use log::trace;
use serde::Serialize;
use std::ops::AddAssign;

use super::config::{CtrlConfig, DramTimingConfig};
use super::request::{AccessError, AccessKind};
use crate::addr::{Addr, AddrRange};
use crate::timeq::{ceil_div, Cycle};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CtrlStats {
    pub reads: u64,
    pub writes: u64,
    pub row_hits: u64,
    pub row_misses: u64,
    pub bytes: u64,
}

impl CtrlStats {
    pub fn accesses(&self) -> u64 {
        self.reads + self.writes
    }

    pub fn row_hit_rate(&self) -> f64 {
        let total = self.row_hits + self.row_misses;
        if total == 0 {
            return 0.0;
        }
        self.row_hits as f64 / total as f64
    }
}

impl AddAssign<&CtrlStats> for CtrlStats {
    fn add_assign(&mut self, other: &CtrlStats) {
        self.reads = self.reads.saturating_add(other.reads);
        self.writes = self.writes.saturating_add(other.writes);
        self.row_hits = self.row_hits.saturating_add(other.row_hits);
        self.row_misses = self.row_misses.saturating_add(other.row_misses);
        self.bytes = self.bytes.saturating_add(other.bytes);
    }
}

/// Per-channel mutable state: the currently open row and the cycle at which
/// the channel frees up.  Each channel is owned exclusively by this
/// controller instance, so row state updates are serialized by
/// construction.
#[derive(Debug, Default, Clone, Copy)]
struct Channel {
    open_row: Option<u64>,
    busy_until: Cycle,
}

/// Issues physical DRAM accesses for one owned address range, split across
/// `channels` by row-granule interleaving.
#[derive(Debug)]
pub struct MemoryController {
    name: String,
    range: AddrRange,
    timing: DramTimingConfig,
    channels: Vec<Channel>,
    stats: CtrlStats,
}

impl MemoryController {
    pub fn new(name: impl Into<String>, config: &CtrlConfig) -> Self {
        assert!(config.channels > 0, "channels must be > 0");
        Self {
            name: name.into(),
            range: config.range,
            timing: config.timing,
            channels: vec![Channel::default(); config.channels],
            stats: CtrlStats::default(),
        }
    }

    pub fn range(&self) -> AddrRange {
        self.range
    }

    pub fn owns(&self, paddr: Addr) -> bool {
        self.range.contains(paddr)
    }

    pub fn stats(&self) -> CtrlStats {
        self.stats
    }

    /// Service one DRAM access.  Returns the cycle at which the data burst
    /// completes.
    pub fn access(
        &mut self,
        now: Cycle,
        paddr: Addr,
        size: u32,
        kind: AccessKind,
    ) -> Result<Cycle, AccessError> {
        if !self.owns(paddr) {
            return Err(AccessError::AddressOutOfRange { addr: paddr });
        }
        let offset = paddr - self.range.base;
        let row_granule = self.timing.row_bytes;
        let channel_idx = ((offset / row_granule) % self.channels.len() as u64) as usize;
        let row = offset / (row_granule * self.channels.len() as u64);

        let channel = &mut self.channels[channel_idx];
        let start = channel.busy_until.max(now);
        let locality = match channel.open_row {
            Some(open) if open == row => {
                self.stats.row_hits += 1;
                0
            }
            Some(_) => {
                self.stats.row_misses += 1;
                self.timing.precharge_latency + self.timing.activate_latency
            }
            None => {
                self.stats.row_misses += 1;
                self.timing.activate_latency
            }
        };
        let transfer = ceil_div(size as u64, self.timing.channel_width_bytes as u64);
        let ready_at = start + self.timing.command_latency + locality + transfer;

        channel.open_row = Some(row);
        channel.busy_until = ready_at;

        if kind.is_write() {
            self.stats.writes += 1;
        } else {
            self.stats.reads += 1;
        }
        self.stats.bytes += size as u64;
        trace!(
            "{}: {:?} {paddr:#x} ch {channel_idx} row {row} at {now}, ready {ready_at}",
            self.name,
            kind
        );
        Ok(ready_at)
    }
}
