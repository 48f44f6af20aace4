use log::debug;

use super::cache::SetAssociativeCache;
use super::config::{ConfigError, HierarchyConfig};
use super::ctrl::MemoryController;
use super::system::MemoryHierarchy;
use super::tlb::TranslationUnit;
use super::xbar::Crossbar;
use crate::addr::AddressSpace;

/// Pure composition: turns a validated declarative config into fully wired,
/// independently owned component instances.  Children register with the
/// crossbars through plain port indices; there are no back-references.
pub struct HierarchyBuilder {
    config: HierarchyConfig,
}

impl HierarchyBuilder {
    pub fn new(config: HierarchyConfig) -> Self {
        Self { config }
    }

    pub fn build(self) -> Result<MemoryHierarchy, ConfigError> {
        let config = self.config;
        config.validate()?;

        let space = AddressSpace::new(config.ranges.clone());
        let mmu = TranslationUnit::new(&config.tlb, space.clone());

        let l1i = SetAssociativeCache::new("l1i", config.l1i.clone())?;
        let l1d = SetAssociativeCache::new("l1d", config.l1d.clone())?;
        let l2 = SetAssociativeCache::new("l2", config.l2.clone())?;

        // Both L1s feed the single shared L2; the memory-side crossbar fans
        // out to one downstream port per controller.
        let l2_xbar = Crossbar::new("l2_xbar", &config.l2_xbar, 1);
        let mem_xbar = Crossbar::new("mem_xbar", &config.mem_xbar, config.ctrls.len());
        let ctrls: Vec<MemoryController> = config
            .ctrls
            .iter()
            .enumerate()
            .map(|(idx, ctrl)| MemoryController::new(format!("mem_ctrl{idx}"), ctrl))
            .collect();

        debug!(
            "built hierarchy: l1i {} B, l1d {} B, l2 {} B, {} controller(s), {} B backed",
            config.l1i.size,
            config.l1d.size,
            config.l2.size,
            ctrls.len(),
            space.total_bytes()
        );
        Ok(MemoryHierarchy::from_parts(
            space, mmu, l1i, l1d, l2, l2_xbar, mem_xbar, ctrls,
        ))
    }
}
