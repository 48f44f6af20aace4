//! The memory hierarchy model: split L1s over a shared L2 over DRAM
//! controllers, with a translation front end.  Components are plain owned
//! structs wired together by [`builder::HierarchyBuilder`]; all timing is
//! explicit cycle arithmetic driven by [`system::MemoryHierarchy::tick`].

pub mod builder;
pub mod cache;
pub mod config;
pub mod ctrl;
pub mod mshr;
pub mod request;
pub mod system;
pub mod tlb;
pub mod xbar;

pub use builder::HierarchyBuilder;
pub use cache::{CacheAccess, CacheStats, SetAssociativeCache};
pub use config::{ConfigError, HierarchyConfig};
pub use ctrl::{CtrlStats, MemoryController};
pub use request::{
    AccessError, AccessKind, IssueOutcome, MemCompletion, MemIssue, MemRequest, Reject,
    RejectReason,
};
pub use system::{HierarchyStats, MemoryHierarchy, DATA_PORT, INST_PORT};
pub use tlb::{TlbStats, TranslationUnit};
pub use xbar::{Crossbar, XbarStats};

#[cfg(test)]
mod tests;
