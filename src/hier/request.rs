use thiserror::Error;

use crate::addr::Addr;
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    InstFetch,
}

impl AccessKind {
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }

    pub fn is_fetch(self) -> bool {
        matches!(self, Self::InstFetch)
    }
}

/// One memory access flowing through the hierarchy.  Immutable after issue
/// apart from the translation annotations (`paddr`, `line_addr`) filled in
/// by the front end.
#[derive(Debug, Clone)]
pub struct MemRequest {
    pub id: u64,
    pub vaddr: Addr,
    pub paddr: Addr,
    pub line_addr: u64,
    pub size: u32,
    pub kind: AccessKind,
    pub requester: usize,
    pub issued_at: Cycle,
}

impl MemRequest {
    pub fn new(vaddr: Addr, size: u32, kind: AccessKind, requester: usize) -> Self {
        Self {
            id: 0,
            vaddr,
            paddr: 0,
            line_addr: 0,
            size,
            kind,
            requester,
            issued_at: 0,
        }
    }
}

/// Successful admission of a request into the hierarchy.
#[derive(Debug, Clone, Copy)]
pub struct MemIssue {
    /// Completion token; completions are keyed by it.
    pub id: u64,
    /// Whether the access hit in L1 (the immediate outcome case).
    pub hit: bool,
    /// Known completion cycle for hits; None while a miss is in flight.
    pub ready_at: Option<Cycle>,
}

/// Completion notification delivered through the polled completion queue.
#[derive(Debug, Clone)]
pub struct MemCompletion {
    pub id: u64,
    pub paddr: Addr,
    pub completed_at: Cycle,
    pub latency: Cycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// All MSHR entries of the admitting cache are in use.
    MshrFull,
    /// The matching MSHR entry cannot merge more requests.
    MshrTargetsFull,
    /// A bounded port queue is full.
    QueueFull,
    /// A timed resource has residual occupancy.
    Busy,
}

/// Backpressure signal: the request was not admitted and should be retried
/// at `retry_at`.  Not an error; it never reaches the end user.
#[derive(Debug, Clone, Copy)]
pub struct Reject {
    pub retry_at: Cycle,
    pub reason: RejectReason,
}

impl Reject {
    pub fn new(retry_at: Cycle, reason: RejectReason) -> Self {
        Self { retry_at, reason }
    }
}

/// Outcome of `MemoryHierarchy::issue`: either admitted (with a completion
/// token) or pushed back for a later retry.
#[derive(Debug, Clone, Copy)]
pub enum IssueOutcome {
    Issued(MemIssue),
    Rejected(Reject),
}

impl IssueOutcome {
    pub fn issue(&self) -> Option<&MemIssue> {
        match self {
            IssueOutcome::Issued(issue) => Some(issue),
            IssueOutcome::Rejected(_) => None,
        }
    }
}

/// Fatal per-request failures.  These surface to the issuing engine, which
/// decides whether to abort or retry the access differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("address {addr:#x} falls outside all declared physical ranges")]
    AddressOutOfRange { addr: Addr },
    #[error("virtual address {vaddr:#x} has no resolvable mapping")]
    TranslationFault { vaddr: Addr },
}
