use log::trace;
use serde::Serialize;
use smallvec::SmallVec;
use std::ops::AddAssign;

use super::config::{CacheConfig, ConfigError};
use super::mshr::MshrTable;
use super::request::{MemRequest, Reject, RejectReason};
use crate::timeq::{normalize_retry, Cycle};

#[derive(Debug)]
struct Line {
    tag: u64,
    dirty: bool,
}

/// Set-associative tag store with true-LRU ordering per set.  Tracks tags
/// and dirty bits only; the timing model carries no data payload.
#[derive(Debug)]
struct TagArray {
    sets: u64,
    ways: usize,
    lines: Vec<Vec<Option<Line>>>,
    // Way indices per set, most recently used first.
    lru: Vec<Vec<usize>>,
}

impl TagArray {
    fn new(sets: u64, ways: usize) -> Self {
        let mut lines = Vec::with_capacity(sets as usize);
        let mut lru = Vec::with_capacity(sets as usize);
        for _ in 0..sets {
            lines.push((0..ways).map(|_| None).collect());
            lru.push((0..ways).collect());
        }
        Self {
            sets,
            ways,
            lines,
            lru,
        }
    }

    fn index(&self, line_addr: u64) -> (usize, u64) {
        ((line_addr % self.sets) as usize, line_addr / self.sets)
    }

    /// Look the line up and refresh its recency on a match.
    fn probe(&mut self, line_addr: u64) -> Option<&mut Line> {
        let (set_idx, tag) = self.index(line_addr);
        let way = self.lines[set_idx]
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |line| line.tag == tag))?;
        self.touch(set_idx, way);
        self.lines[set_idx][way].as_mut()
    }

    /// Install a line, evicting the LRU way if the set is full.  Returns the
    /// line address of a dirty victim, which owes a writeback downstream.
    fn install(&mut self, line_addr: u64, dirty: bool) -> Option<u64> {
        let (set_idx, tag) = self.index(line_addr);
        if let Some(way) = self.lines[set_idx]
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |line| line.tag == tag))
        {
            self.lines[set_idx][way].as_mut().expect("way just matched").dirty |= dirty;
            self.touch(set_idx, way);
            return None;
        }

        let way = match self.lines[set_idx].iter().position(|slot| slot.is_none()) {
            Some(idx) => idx,
            None => *self.lru[set_idx].last().expect("lru order non-empty"),
        };
        let victim = self.lines[set_idx][way]
            .take()
            .filter(|line| line.dirty)
            .map(|line| line.tag * self.sets + set_idx as u64);
        self.lines[set_idx][way] = Some(Line { tag, dirty });
        self.touch(set_idx, way);
        victim
    }

    fn touch(&mut self, set_idx: usize, way: usize) {
        let order = &mut self.lru[set_idx];
        if let Some(pos) = order.iter().position(|&idx| idx == way) {
            order.remove(pos);
        }
        order.insert(0, way);
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub accesses: u64,
    pub hits: u64,
    pub misses: u64,
    pub mshr_merges: u64,
    pub mshr_full_rejects: u64,
    pub tgt_full_rejects: u64,
    pub fills: u64,
    pub writebacks: u64,
    pub max_mshr_occupancy: u64,
    demand_miss_latency: u64,
    demand_misses_completed: u64,
}

impl CacheStats {
    pub fn miss_rate(&self) -> f64 {
        if self.accesses == 0 {
            return 0.0;
        }
        self.misses as f64 / self.accesses as f64
    }

    pub fn avg_miss_latency(&self) -> f64 {
        if self.demand_misses_completed == 0 {
            return 0.0;
        }
        self.demand_miss_latency as f64 / self.demand_misses_completed as f64
    }

    pub fn record_miss_completion(&mut self, latency: Cycle) {
        self.demand_miss_latency = self.demand_miss_latency.saturating_add(latency);
        self.demand_misses_completed = self.demand_misses_completed.saturating_add(1);
    }
}

impl AddAssign<&CacheStats> for CacheStats {
    fn add_assign(&mut self, other: &CacheStats) {
        self.accesses = self.accesses.saturating_add(other.accesses);
        self.hits = self.hits.saturating_add(other.hits);
        self.misses = self.misses.saturating_add(other.misses);
        self.mshr_merges = self.mshr_merges.saturating_add(other.mshr_merges);
        self.mshr_full_rejects = self.mshr_full_rejects.saturating_add(other.mshr_full_rejects);
        self.tgt_full_rejects = self.tgt_full_rejects.saturating_add(other.tgt_full_rejects);
        self.fills = self.fills.saturating_add(other.fills);
        self.writebacks = self.writebacks.saturating_add(other.writebacks);
        self.max_mshr_occupancy = self.max_mshr_occupancy.max(other.max_mshr_occupancy);
        self.demand_miss_latency = self.demand_miss_latency.saturating_add(other.demand_miss_latency);
        self.demand_misses_completed = self
            .demand_misses_completed
            .saturating_add(other.demand_misses_completed);
    }
}

/// Outcome of a lookup at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAccess {
    /// The line is resident; the response is ready at `ready_at`.
    Hit { ready_at: Cycle },
    /// Primary miss: an MSHR entry was allocated and the caller must forward
    /// a fill request downstream no earlier than `forward_at`.
    MissAllocated { forward_at: Cycle },
    /// Secondary miss merged into the in-flight entry for the same line; the
    /// request completes when that entry fills.
    MissMerged,
}

/// The effects of a fill response arriving at this level.
#[derive(Debug)]
pub struct CacheFill {
    /// Cycle at which the filled data is available to requesters upstream.
    pub ready_at: Cycle,
    /// Requests that were merged into the released MSHR entry; all complete
    /// with the same `ready_at`.
    pub waiters: SmallVec<[MemRequest; 2]>,
    /// Dirty victim evicted by the install, as a line address.
    pub victim: Option<u64>,
}

/// One cache level: tag store plus the MSHR registry bounding in-flight
/// misses.
#[derive(Debug)]
pub struct SetAssociativeCache {
    name: String,
    config: CacheConfig,
    tags: TagArray,
    mshr: MshrTable,
    stats: CacheStats,
}

impl SetAssociativeCache {
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Result<Self, ConfigError> {
        let name = name.into();
        let sets = config.num_sets(&name)?;
        let mshr = MshrTable::new(config.mshrs, config.tgts_per_mshr);
        Ok(Self {
            tags: TagArray::new(sets, config.assoc),
            mshr,
            stats: CacheStats::default(),
            name,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn line_size(&self) -> u64 {
        self.config.line_size
    }

    pub fn line_addr(&self, paddr: u64) -> u64 {
        paddr / self.config.line_size
    }

    pub fn paddr_of_line(&self, line_addr: u64) -> u64 {
        line_addr * self.config.line_size
    }

    pub fn response_latency(&self) -> Cycle {
        self.config.response_latency
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn note_miss_completion(&mut self, latency: Cycle) {
        self.stats.record_miss_completion(latency);
    }

    pub fn mshr_occupancy(&self) -> usize {
        self.mshr.occupancy()
    }

    /// Look up `request` at `now`.  Synchronous: a rejection means the
    /// request was not admitted and the caller retries at `retry_at`.
    pub fn access(&mut self, now: Cycle, request: &MemRequest) -> Result<CacheAccess, Reject> {
        let line_addr = self.line_addr(request.paddr);

        if let Some(line) = self.tags.probe(line_addr) {
            line.dirty |= request.kind.is_write();
            self.stats.accesses += 1;
            self.stats.hits += 1;
            let mut latency = self.config.tag_latency + self.config.data_latency;
            if request.kind.is_write() {
                latency += self.config.response_latency;
            }
            trace!(
                "{}: hit line {:#x} req {} at {}",
                self.name, line_addr, request.id, now
            );
            return Ok(CacheAccess::Hit {
                ready_at: now + latency,
            });
        }

        if self.mshr.has_entry(line_addr) {
            let mut merged = request.clone();
            merged.line_addr = line_addr;
            return match self.mshr.try_merge(line_addr, merged) {
                Ok(()) => {
                    self.stats.accesses += 1;
                    self.stats.misses += 1;
                    self.stats.mshr_merges += 1;
                    trace!(
                        "{}: merged req {} into mshr for line {:#x}",
                        self.name, request.id, line_addr
                    );
                    Ok(CacheAccess::MissMerged)
                }
                Err(_) => {
                    self.stats.tgt_full_rejects += 1;
                    Err(Reject::new(
                        normalize_retry(now, now),
                        RejectReason::MshrTargetsFull,
                    ))
                }
            };
        }

        if !self.mshr.try_allocate(line_addr, request.kind.is_write()) {
            self.stats.mshr_full_rejects += 1;
            return Err(Reject::new(normalize_retry(now, now), RejectReason::MshrFull));
        }
        self.stats.accesses += 1;
        self.stats.misses += 1;
        self.stats.max_mshr_occupancy = self
            .stats
            .max_mshr_occupancy
            .max(self.mshr.occupancy() as u64);
        trace!(
            "{}: miss line {:#x} req {} at {}, mshr occupancy {}",
            self.name,
            line_addr,
            request.id,
            now,
            self.mshr.occupancy()
        );
        Ok(CacheAccess::MissAllocated {
            forward_at: now + self.config.tag_latency,
        })
    }

    /// The fill request for `line_addr` left for the next level.
    pub fn mark_forwarded(&mut self, line_addr: u64) {
        self.mshr.mark_forwarded(line_addr);
    }

    /// A fill response arrived for `line_addr`: install the line, release
    /// the MSHR entry, and hand back every merged waiter.
    pub fn fill(&mut self, now: Cycle, line_addr: u64) -> CacheFill {
        let entry = self
            .mshr
            .take(line_addr)
            .expect("fill response for a line without an MSHR entry");
        let victim = self.tags.install(line_addr, entry.any_write());
        self.stats.fills += 1;
        if victim.is_some() {
            self.stats.writebacks += 1;
        }
        trace!(
            "{}: fill line {:#x} at {}, {} waiters, victim {:?}",
            self.name,
            line_addr,
            now,
            entry.merged().len(),
            victim
        );
        CacheFill {
            ready_at: now + self.config.response_latency,
            waiters: entry.into_merged(),
            victim,
        }
    }

    /// Sink a writeback arriving from an upstream level.  The line is
    /// installed dirty (write-allocate); a displaced dirty victim cascades
    /// further downstream.
    pub fn accept_writeback(&mut self, now: Cycle, line_addr: u64) -> (Cycle, Option<u64>) {
        let victim = self.tags.install(line_addr, true);
        if victim.is_some() {
            self.stats.writebacks += 1;
        }
        (now + self.config.data_latency, victim)
    }
}
