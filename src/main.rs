use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use toml::Table;

use memtick::config::{ByteSize, Config, SimConfig};
use memtick::hier::{HierarchyConfig, IssueOutcome, MemoryHierarchy};
use memtick::traffic::{TrafficConfig, TrafficGen, TrafficOp};

#[derive(Parser)]
#[command(version, about)]
struct MemtickArgs {
    #[arg(help = "Path to config.toml (defaults apply when omitted)")]
    config_path: Option<PathBuf>,
    #[arg(long, help = "Override L1I size, e.g. 16kB")]
    l1i_size: Option<ByteSize>,
    #[arg(long, help = "Override L1D size, e.g. 64kB")]
    l1d_size: Option<ByteSize>,
    #[arg(long, help = "Override L2 size, e.g. 256kB")]
    l2_size: Option<ByteSize>,
    #[arg(long, help = "Override the line size of every cache level")]
    cache_line_size: Option<u64>,
    #[arg(long, help = "Override L1D associativity")]
    l1d_assoc: Option<usize>,
    #[arg(long, help = "Override L2 associativity")]
    l2_assoc: Option<usize>,
    #[arg(long, help = "Override instruction TLB entry count")]
    itlb_entries: Option<usize>,
    #[arg(long, help = "Override data TLB entry count")]
    dtlb_entries: Option<usize>,
    #[arg(long, help = "Override number of traffic ops to run")]
    ops: Option<u64>,
    #[arg(long, help = "Override the cycle timeout")]
    timeout: Option<u64>,
}

pub fn main() -> Result<()> {
    env_logger::init();

    let argv = MemtickArgs::parse();
    let config_table: Table = match &argv.config_path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&text).context("cannot parse config toml")?
        }
        None => Table::new(),
    };
    let mut sim_config = SimConfig::from_section(config_table.get("sim"));
    let mut hier_config = HierarchyConfig::from_section(config_table.get("hierarchy"));
    let mut traffic_config = TrafficConfig::from_section(config_table.get("traffic"));

    // override toml configs with argv
    if let Some(size) = argv.l1i_size {
        hier_config.l1i.size = size.0;
    }
    if let Some(size) = argv.l1d_size {
        hier_config.l1d.size = size.0;
    }
    if let Some(size) = argv.l2_size {
        hier_config.l2.size = size.0;
    }
    if let Some(line) = argv.cache_line_size {
        hier_config.l1i.line_size = line;
        hier_config.l1d.line_size = line;
        hier_config.l2.line_size = line;
    }
    if let Some(assoc) = argv.l1d_assoc {
        hier_config.l1d.assoc = assoc;
    }
    if let Some(assoc) = argv.l2_assoc {
        hier_config.l2.assoc = assoc;
    }
    if let Some(entries) = argv.itlb_entries {
        hier_config.tlb.itlb_entries = entries;
    }
    if let Some(entries) = argv.dtlb_entries {
        hier_config.tlb.dtlb_entries = entries;
    }
    traffic_config.count = argv.ops.unwrap_or(traffic_config.count);
    sim_config.timeout = argv.timeout.unwrap_or(sim_config.timeout);

    let mut hier = MemoryHierarchy::new(hier_config).context("invalid hierarchy config")?;
    let mut gen = TrafficGen::new(&traffic_config);

    let mut now = 0u64;
    let mut carried: Option<TrafficOp> = None;
    let mut retry_at = 0u64;
    let mut drained = false;
    let mut issued = 0u64;
    let mut completed = 0u64;
    let mut faults = 0u64;

    loop {
        hier.tick(now);
        completed += hier.take_completions().len() as u64;

        if carried.is_none() && !drained {
            match gen.next_op() {
                Some(op) => {
                    carried = Some(op);
                    retry_at = now;
                }
                None => drained = true,
            }
        }
        if let Some(op) = carried {
            if now >= retry_at {
                match hier.issue(now, op.vaddr, op.size, op.kind, op.stream) {
                    Ok(IssueOutcome::Issued(_)) => {
                        issued += 1;
                        carried = None;
                    }
                    Ok(IssueOutcome::Rejected(reject)) => {
                        retry_at = reject.retry_at;
                    }
                    Err(err) => {
                        warn!(
                            "dropping access from stream '{}': {}",
                            gen.stream_name(op.stream).unwrap_or("?"),
                            err
                        );
                        faults += 1;
                        carried = None;
                    }
                }
            }
        }

        if drained && carried.is_none() && hier.is_idle() {
            break;
        }
        now += 1;
        if now > sim_config.timeout {
            bail!("simulation exceeded {} cycles", sim_config.timeout);
        }
    }

    let stats = hier.stats();
    info!(
        "finished at cycle {}: {} issued, {} completed, {} faulted",
        now, issued, completed, faults
    );
    info!(
        "l1d miss rate {:.3}, l2 miss rate {:.3}, dram row hit rate {:.3}",
        stats.l1d.miss_rate(),
        stats.l2.miss_rate(),
        stats.ctrl.row_hit_rate()
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).context("cannot serialize stats")?
    );
    Ok(())
}
