/*
The composed hierarchy and its pending-work pipeline.

Misses travel downstream through explicit stages (crossbar hop, lookup,
DRAM, fill) with every transition stamped with the cycle at which it may
fire.  `tick` advances whatever is due, always selecting the pending item
with the smallest (cycle, port, sequence) key, so two runs over the same
trace replay the exact same interleaving.  Completion delivery is a polled
queue keyed by the id handed out at issue; nothing calls back into the
issuing engine.
*/

use log::trace;
use serde::Serialize;
use std::collections::VecDeque;

use super::builder::HierarchyBuilder;
use super::cache::{CacheAccess, CacheStats, SetAssociativeCache};
use super::config::{ConfigError, HierarchyConfig};
use super::ctrl::{CtrlStats, MemoryController};
use super::request::{
    AccessError, AccessKind, IssueOutcome, MemCompletion, MemIssue, MemRequest,
};
use super::tlb::{TlbStats, TranslationUnit};
use super::xbar::{Crossbar, XbarStats};
use crate::addr::{Addr, AddressSpace};
use crate::timeq::Cycle;

/// Upstream port indices on the L2 crossbar.  Fixed ordering doubles as
/// the arbitration priority.
pub const INST_PORT: usize = 0;
pub const DATA_PORT: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// A demand miss travelling on behalf of a completion token.
    Demand,
    /// Dirty L1 victim headed for the L2.
    WritebackL1,
    /// Dirty L2 victim headed for memory.
    WritebackL2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    RouteToL2 { at: Cycle },
    L2Access { at: Cycle },
    RouteToMem { at: Cycle },
    Dram { at: Cycle },
    FillL2 { at: Cycle },
    FillL1 { at: Cycle },
}

impl Stage {
    fn at(&self) -> Cycle {
        match *self {
            Stage::RouteToL2 { at }
            | Stage::L2Access { at }
            | Stage::RouteToMem { at }
            | Stage::Dram { at }
            | Stage::FillL2 { at }
            | Stage::FillL1 { at } => at,
        }
    }
}

#[derive(Debug)]
struct Pending {
    seq: u64,
    origin: Origin,
    req: MemRequest,
    stage: Stage,
}

impl Pending {
    /// Arbitration priority for same-cycle ties: instruction side first,
    /// then data side, then background L2 writebacks.
    fn port(&self) -> usize {
        match self.origin {
            Origin::Demand | Origin::WritebackL1 => {
                if self.req.kind.is_fetch() {
                    INST_PORT
                } else {
                    DATA_PORT
                }
            }
            Origin::WritebackL2 => DATA_PORT + 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HierarchyStats {
    pub l1i: CacheStats,
    pub l1d: CacheStats,
    pub l2: CacheStats,
    pub itlb: TlbStats,
    pub dtlb: TlbStats,
    pub l2_xbar: XbarStats,
    pub mem_xbar: XbarStats,
    pub ctrl: CtrlStats,
}

/// Split L1I/L1D over a shared L2 over one or more memory controllers,
/// fronted by the MMU.  Single owner of every component; all cross-level
/// contention goes through the two crossbars.
pub struct MemoryHierarchy {
    space: AddressSpace,
    mmu: TranslationUnit,
    l1i: SetAssociativeCache,
    l1d: SetAssociativeCache,
    l2: SetAssociativeCache,
    l2_xbar: Crossbar,
    mem_xbar: Crossbar,
    ctrls: Vec<MemoryController>,
    pending: Vec<Pending>,
    /// Completions not yet visible, as (cycle, seq, completion).
    scheduled: Vec<(Cycle, u64, MemCompletion)>,
    completions: VecDeque<MemCompletion>,
    next_id: u64,
    next_seq: u64,
}

impl MemoryHierarchy {
    pub fn new(config: HierarchyConfig) -> Result<Self, ConfigError> {
        HierarchyBuilder::new(config).build()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        space: AddressSpace,
        mmu: TranslationUnit,
        l1i: SetAssociativeCache,
        l1d: SetAssociativeCache,
        l2: SetAssociativeCache,
        l2_xbar: Crossbar,
        mem_xbar: Crossbar,
        ctrls: Vec<MemoryController>,
    ) -> Self {
        Self {
            space,
            mmu,
            l1i,
            l1d,
            l2,
            l2_xbar,
            mem_xbar,
            ctrls,
            pending: Vec::new(),
            scheduled: Vec::new(),
            completions: VecDeque::new(),
            next_id: 0,
            next_seq: 0,
        }
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    /// Admit one access at `now`.  Translation and the L1 lookup happen
    /// synchronously; everything beyond a primary L1 miss is deferred work
    /// driven by `tick`.
    pub fn issue(
        &mut self,
        now: Cycle,
        vaddr: Addr,
        size: u32,
        kind: AccessKind,
        requester: usize,
    ) -> Result<IssueOutcome, AccessError> {
        debug_assert!(size > 0);
        let translation = self.mmu.translate(now, vaddr, kind)?;

        let mut req = MemRequest::new(vaddr, size, kind, requester);
        req.id = self.next_id;
        self.next_id += 1;
        req.paddr = translation.paddr;
        req.issued_at = now;

        let l1 = if kind.is_fetch() {
            &mut self.l1i
        } else {
            &mut self.l1d
        };
        req.line_addr = l1.line_addr(req.paddr);

        match l1.access(translation.ready_at, &req) {
            Ok(CacheAccess::Hit { ready_at }) => {
                let completion = completion_for(&req, ready_at);
                self.push_scheduled(ready_at, completion);
                Ok(IssueOutcome::Issued(MemIssue {
                    id: req.id,
                    hit: true,
                    ready_at: Some(ready_at),
                }))
            }
            Ok(CacheAccess::MissMerged) => Ok(IssueOutcome::Issued(MemIssue {
                id: req.id,
                hit: false,
                ready_at: None,
            })),
            Ok(CacheAccess::MissAllocated { forward_at }) => {
                // The fill request travelling downstream is a read; the
                // write itself lands in L1 when the line fills.
                let mut fill_req = req.clone();
                if fill_req.kind.is_write() {
                    fill_req.kind = AccessKind::Read;
                }
                self.spawn(Origin::Demand, fill_req, Stage::RouteToL2 { at: forward_at });
                Ok(IssueOutcome::Issued(MemIssue {
                    id: req.id,
                    hit: false,
                    ready_at: None,
                }))
            }
            Err(reject) => Ok(IssueOutcome::Rejected(reject)),
        }
    }

    /// Advance every due piece of deferred work.  Must be called with a
    /// non-decreasing `now`, once per simulated cycle.
    pub fn tick(&mut self, now: Cycle) {
        self.l2_xbar.tick(now);
        self.mem_xbar.tick(now);

        // Always service the due item with the smallest (cycle, port, seq)
        // key; this fixed tie-break makes replay bit-identical.
        loop {
            let next = self
                .pending
                .iter()
                .enumerate()
                .filter(|(_, p)| p.stage.at() <= now)
                .min_by_key(|(_, p)| (p.stage.at(), p.port(), p.seq))
                .map(|(idx, _)| idx);
            let Some(idx) = next else { break };
            let item = self.pending.swap_remove(idx);
            if let Some(kept) = self.step(item, now) {
                self.pending.push(kept);
            }
        }

        // Make due completions visible, in (cycle, seq) order.
        self.scheduled.sort_by_key(|(cycle, seq, _)| (*cycle, *seq));
        while let Some((cycle, _, _)) = self.scheduled.first() {
            if *cycle > now {
                break;
            }
            let (_, _, completion) = self.scheduled.remove(0);
            self.completions.push_back(completion);
        }
    }

    /// Drain the visible completion queue.
    pub fn take_completions(&mut self) -> Vec<MemCompletion> {
        self.completions.drain(..).collect()
    }

    /// Whether any deferred work or undelivered completion remains.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.scheduled.is_empty() && self.completions.is_empty()
    }

    pub fn inflight(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> HierarchyStats {
        let mut ctrl = CtrlStats::default();
        for mc in &self.ctrls {
            ctrl += &mc.stats();
        }
        HierarchyStats {
            l1i: self.l1i.stats(),
            l1d: self.l1d.stats(),
            l2: self.l2.stats(),
            itlb: self.mmu.istats(),
            dtlb: self.mmu.dstats(),
            l2_xbar: self.l2_xbar.stats(),
            mem_xbar: self.mem_xbar.stats(),
            ctrl,
        }
    }

    fn spawn(&mut self, origin: Origin, req: MemRequest, stage: Stage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(Pending {
            seq,
            origin,
            req,
            stage,
        });
    }

    fn push_scheduled(&mut self, at: Cycle, completion: MemCompletion) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.scheduled.push((at, seq, completion));
    }

    fn l1_mut(&mut self, port: usize) -> &mut SetAssociativeCache {
        if port == INST_PORT {
            &mut self.l1i
        } else {
            &mut self.l1d
        }
    }

    fn ctrl_port_for(&self, paddr: Addr) -> usize {
        self.ctrls
            .iter()
            .position(|mc| mc.owns(paddr))
            .expect("controller coverage validated at build")
    }

    /// Advance one pending item.  Returns the item back when it remains in
    /// flight.
    fn step(&mut self, mut p: Pending, now: Cycle) -> Option<Pending> {
        let line_bytes = self.l2.line_size() as u32;
        match p.stage {
            Stage::RouteToL2 { .. } => {
                let port = p.port().min(DATA_PORT);
                match self.l2_xbar.try_route(now, port, 0, line_bytes) {
                    Ok(ticket) => {
                        if p.origin == Origin::Demand {
                            self.l1_mut(port).mark_forwarded(p.req.line_addr);
                        }
                        p.stage = Stage::L2Access {
                            at: ticket.ready_at(),
                        };
                    }
                    Err(reject) => {
                        p.stage = Stage::RouteToL2 {
                            at: reject.retry_at,
                        };
                    }
                }
                Some(p)
            }
            Stage::L2Access { .. } => {
                if p.origin == Origin::WritebackL1 {
                    let line = self.l2.line_addr(p.req.paddr);
                    let (ready_at, victim) = self.l2.accept_writeback(now, line);
                    if let Some(victim_line) = victim {
                        self.spawn_writeback(Origin::WritebackL2, victim_line, ready_at);
                    }
                    return None;
                }
                match self.l2.access(now, &p.req) {
                    Ok(CacheAccess::Hit { ready_at }) => {
                        p.stage = Stage::FillL1 { at: ready_at };
                        Some(p)
                    }
                    Ok(CacheAccess::MissAllocated { forward_at }) => {
                        p.stage = Stage::RouteToMem { at: forward_at };
                        Some(p)
                    }
                    Ok(CacheAccess::MissMerged) => {
                        // Parked in the L2 entry; re-spawned by its fill.
                        None
                    }
                    Err(reject) => {
                        trace!(
                            "l2 pushed back req {} until {}",
                            p.req.id,
                            reject.retry_at
                        );
                        p.stage = Stage::L2Access {
                            at: reject.retry_at,
                        };
                        Some(p)
                    }
                }
            }
            Stage::RouteToMem { .. } => {
                let to_port = self.ctrl_port_for(p.req.paddr);
                match self.mem_xbar.try_route(now, 0, to_port, line_bytes) {
                    Ok(ticket) => {
                        if p.origin == Origin::Demand {
                            let line = self.l2.line_addr(p.req.paddr);
                            self.l2.mark_forwarded(line);
                        }
                        p.stage = Stage::Dram {
                            at: ticket.ready_at(),
                        };
                    }
                    Err(reject) => {
                        p.stage = Stage::RouteToMem {
                            at: reject.retry_at,
                        };
                    }
                }
                Some(p)
            }
            Stage::Dram { .. } => {
                let to_port = self.ctrl_port_for(p.req.paddr);
                let kind = match p.origin {
                    Origin::Demand => p.req.kind,
                    Origin::WritebackL1 | Origin::WritebackL2 => AccessKind::Write,
                };
                let ready_at = self.ctrls[to_port]
                    .access(now, p.req.paddr, line_bytes, kind)
                    .expect("controller ownership validated at build");
                match p.origin {
                    Origin::Demand => {
                        p.stage = Stage::FillL2 { at: ready_at };
                        Some(p)
                    }
                    // Writebacks terminate at memory.
                    Origin::WritebackL1 | Origin::WritebackL2 => None,
                }
            }
            Stage::FillL2 { .. } => {
                let line = self.l2.line_addr(p.req.paddr);
                let fill = self.l2.fill(now, line);
                if let Some(victim_line) = fill.victim {
                    self.spawn_writeback(Origin::WritebackL2, victim_line, fill.ready_at);
                }
                for waiter in fill.waiters {
                    self.spawn(
                        Origin::Demand,
                        waiter,
                        Stage::FillL1 { at: fill.ready_at },
                    );
                }
                p.stage = Stage::FillL1 { at: fill.ready_at };
                Some(p)
            }
            Stage::FillL1 { .. } => {
                let port = p.port();
                let line = p.req.line_addr;
                let fill = self.l1_mut(port).fill(now, line);
                if let Some(victim_line) = fill.victim {
                    let victim_paddr = self.l1_mut(port).paddr_of_line(victim_line);
                    let mut wb = MemRequest::new(victim_paddr, line_bytes, AccessKind::Write, port);
                    wb.paddr = victim_paddr;
                    wb.line_addr = victim_line;
                    wb.issued_at = now;
                    self.spawn(
                        Origin::WritebackL1,
                        wb,
                        Stage::RouteToL2 { at: fill.ready_at },
                    );
                }
                let completed_at = fill.ready_at;
                let latency = completed_at.saturating_sub(p.req.issued_at);
                self.l1_mut(port).note_miss_completion(latency);
                self.push_scheduled(completed_at, completion_for(&p.req, completed_at));
                for waiter in fill.waiters {
                    let waiter_latency = completed_at.saturating_sub(waiter.issued_at);
                    self.l1_mut(port).note_miss_completion(waiter_latency);
                    self.push_scheduled(completed_at, completion_for(&waiter, completed_at));
                }
                None
            }
        }
    }

    fn spawn_writeback(&mut self, origin: Origin, l2_line: u64, at: Cycle) {
        debug_assert_eq!(origin, Origin::WritebackL2);
        let paddr = self.l2.paddr_of_line(l2_line);
        let mut wb = MemRequest::new(paddr, self.l2.line_size() as u32, AccessKind::Write, 0);
        wb.paddr = paddr;
        wb.line_addr = l2_line;
        wb.issued_at = at;
        self.spawn(origin, wb, Stage::RouteToMem { at });
    }
}

fn completion_for(req: &MemRequest, completed_at: Cycle) -> MemCompletion {
    MemCompletion {
        id: req.id,
        paddr: req.paddr,
        completed_at,
        latency: completed_at.saturating_sub(req.issued_at),
    }
}
