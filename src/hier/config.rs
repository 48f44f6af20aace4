/*
Declarative description of the hierarchy topology.

The defaults reproduce the classic two-level teaching setup: split L1I/L1D
in front of a shared L2, one DDR3-style controller owning a 512 MiB range,
and split instruction/data TLBs.  Everything is a plain value; the builder
turns a validated config into wired component instances.
*/

use serde::Deserialize;
use thiserror::Error;

use crate::addr::AddrRange;
use crate::config::Config;
use crate::timeq::Cycle;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cache '{name}': {field} must be > 0")]
    ZeroCacheParam { name: String, field: &'static str },
    #[error(
        "cache '{name}': size {size} is not divisible by line_size {line_size} * assoc {assoc}"
    )]
    IndivisibleGeometry {
        name: String,
        size: u64,
        line_size: u64,
        assoc: usize,
    },
    #[error("cache '{name}': derived set count {sets} is not a positive power of two")]
    NonPowerOfTwoSets { name: String, sets: u64 },
    #[error("caches '{a}' and '{b}' feed the same level but disagree on line size ({a_line} vs {b_line})")]
    LineSizeMismatch {
        a: String,
        b: String,
        a_line: u64,
        b_line: u64,
    },
    #[error("{field} must be > 0")]
    ZeroParam { field: &'static str },
    #[error("page_bytes {page_bytes} is not a power of two")]
    NonPowerOfTwoPage { page_bytes: u64 },
    #[error("no physical memory ranges declared")]
    NoRanges,
    #[error("no memory controllers declared")]
    NoControllers,
    #[error("controller ranges {a:?} and {b:?} overlap")]
    RangeOverlap { a: AddrRange, b: AddrRange },
    #[error("declared physical range {range:?} is not covered by any controller")]
    RangeNotCovered { range: AddrRange },
}

/// Parameters of one cache level, mirroring the knobs of the usual
/// configuration scripts: geometry, the three access latencies, and the
/// miss-tracking bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub size: u64,
    pub assoc: usize,
    pub line_size: u64,
    pub tag_latency: Cycle,
    pub data_latency: Cycle,
    pub response_latency: Cycle,
    pub mshrs: usize,
    pub tgts_per_mshr: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::default_l1d()
    }
}

impl CacheConfig {
    pub fn default_l1i() -> Self {
        Self {
            size: 16 << 10,
            assoc: 2,
            line_size: 64,
            tag_latency: 2,
            data_latency: 2,
            response_latency: 2,
            mshrs: 4,
            tgts_per_mshr: 20,
        }
    }

    pub fn default_l1d() -> Self {
        Self {
            size: 64 << 10,
            ..Self::default_l1i()
        }
    }

    pub fn default_l2() -> Self {
        Self {
            size: 256 << 10,
            assoc: 8,
            line_size: 64,
            tag_latency: 20,
            data_latency: 20,
            response_latency: 20,
            mshrs: 20,
            tgts_per_mshr: 12,
        }
    }

    /// Derived set count; must be a positive power of two.
    pub fn num_sets(&self, name: &str) -> Result<u64, ConfigError> {
        for (field, value) in [
            ("size", self.size),
            ("assoc", self.assoc as u64),
            ("line_size", self.line_size),
            ("mshrs", self.mshrs as u64),
            ("tgts_per_mshr", self.tgts_per_mshr as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCacheParam {
                    name: name.to_string(),
                    field,
                });
            }
        }
        let footprint = self.line_size * self.assoc as u64;
        if self.size % footprint != 0 {
            return Err(ConfigError::IndivisibleGeometry {
                name: name.to_string(),
                size: self.size,
                line_size: self.line_size,
                assoc: self.assoc,
            });
        }
        let sets = self.size / footprint;
        if !sets.is_power_of_two() {
            return Err(ConfigError::NonPowerOfTwoSets {
                name: name.to_string(),
                sets,
            });
        }
        Ok(sets)
    }
}

/// Arbitration parameters of one crossbar.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct XbarConfig {
    pub arbitration_latency: Cycle,
    pub width_bytes: u32,
    pub queue_capacity: usize,
}

impl Default for XbarConfig {
    fn default() -> Self {
        Self {
            arbitration_latency: 1,
            width_bytes: 32,
            queue_capacity: 8,
        }
    }
}

/// Simplified DRAM service law: command setup, a row-buffer locality term,
/// and burst transfer at the channel width.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DramTimingConfig {
    pub command_latency: Cycle,
    pub precharge_latency: Cycle,
    pub activate_latency: Cycle,
    pub channel_width_bytes: u32,
    pub row_bytes: u64,
}

impl Default for DramTimingConfig {
    fn default() -> Self {
        // DDR3-1600 x64 flavored numbers at a 1 GHz model clock.
        Self {
            command_latency: 14,
            precharge_latency: 14,
            activate_latency: 14,
            channel_width_bytes: 8,
            row_bytes: 8 << 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CtrlConfig {
    pub channels: usize,
    pub range: AddrRange,
    pub timing: DramTimingConfig,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            range: AddrRange::new(0, 512 << 20),
            timing: DramTimingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TlbConfig {
    pub itlb_entries: usize,
    pub dtlb_entries: usize,
    pub walk_latency: Cycle,
    pub page_bytes: u64,
}

impl Default for TlbConfig {
    fn default() -> Self {
        Self {
            itlb_entries: 64,
            dtlb_entries: 128,
            walk_latency: 100,
            page_bytes: 4 << 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    pub ranges: Vec<AddrRange>,
    pub l1i: CacheConfig,
    pub l1d: CacheConfig,
    pub l2: CacheConfig,
    pub l2_xbar: XbarConfig,
    pub mem_xbar: XbarConfig,
    pub ctrls: Vec<CtrlConfig>,
    pub tlb: TlbConfig,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            ranges: vec![AddrRange::new(0, 512 << 20)],
            l1i: CacheConfig::default_l1i(),
            l1d: CacheConfig::default_l1d(),
            l2: CacheConfig::default_l2(),
            l2_xbar: XbarConfig::default(),
            mem_xbar: XbarConfig::default(),
            ctrls: vec![CtrlConfig::default()],
            tlb: TlbConfig::default(),
        }
    }
}

impl Config for HierarchyConfig {}

impl HierarchyConfig {
    /// Build-time validation; any violation halts construction before a
    /// single access is processed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.l1i.num_sets("l1i")?;
        self.l1d.num_sets("l1d")?;
        self.l2.num_sets("l2")?;

        // Siblings feeding the shared L2 must agree on line size, and fills
        // map one-to-one between levels.
        for (name, cache) in [("l1d", &self.l1d), ("l2", &self.l2)] {
            if cache.line_size != self.l1i.line_size {
                return Err(ConfigError::LineSizeMismatch {
                    a: "l1i".to_string(),
                    b: name.to_string(),
                    a_line: self.l1i.line_size,
                    b_line: cache.line_size,
                });
            }
        }

        if self.ranges.is_empty() {
            return Err(ConfigError::NoRanges);
        }
        if self.ctrls.is_empty() {
            return Err(ConfigError::NoControllers);
        }
        for ctrl in &self.ctrls {
            if ctrl.channels == 0 {
                return Err(ConfigError::ZeroParam { field: "channels" });
            }
            if ctrl.timing.channel_width_bytes == 0 {
                return Err(ConfigError::ZeroParam {
                    field: "channel_width_bytes",
                });
            }
            if ctrl.timing.row_bytes == 0 {
                return Err(ConfigError::ZeroParam { field: "row_bytes" });
            }
        }

        let mut owned: Vec<AddrRange> = self.ctrls.iter().map(|ctrl| ctrl.range).collect();
        owned.sort_by_key(|range| range.base);
        for pair in owned.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(ConfigError::RangeOverlap {
                    a: pair[0],
                    b: pair[1],
                });
            }
        }
        for range in &self.ranges {
            if !covered(range, &owned) {
                return Err(ConfigError::RangeNotCovered { range: *range });
            }
        }

        if self.tlb.itlb_entries == 0 {
            return Err(ConfigError::ZeroParam {
                field: "itlb_entries",
            });
        }
        if self.tlb.dtlb_entries == 0 {
            return Err(ConfigError::ZeroParam {
                field: "dtlb_entries",
            });
        }
        if self.tlb.page_bytes == 0 {
            return Err(ConfigError::ZeroParam { field: "page_bytes" });
        }
        if !self.tlb.page_bytes.is_power_of_two() {
            return Err(ConfigError::NonPowerOfTwoPage {
                page_bytes: self.tlb.page_bytes,
            });
        }
        Ok(())
    }
}

/// Whether `range` is tiled without gaps by the sorted disjoint `owned`
/// ranges.
fn covered(range: &AddrRange, owned: &[AddrRange]) -> bool {
    let mut cursor = range.base;
    let end = range.end();
    for candidate in owned {
        if cursor >= end {
            break;
        }
        if candidate.contains(cursor) {
            cursor = candidate.end();
        }
    }
    cursor >= end
}
