//! Synthetic access streams for exercising the hierarchy without a frontend.
//! Streams are compiled once from the config and drawn round-robin, so a
//! given config always replays the same op sequence.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::config::Config;
use crate::hier::AccessKind;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficConfig {
    /// Total ops drawn across all streams.
    pub count: u64,
    pub streams: Vec<StreamSpec>,
}

impl Config for TrafficConfig {}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            count: 10000,
            streams: vec![StreamSpec::default()],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamSpec {
    pub name: String,
    /// "strided" or "random".
    pub kind: String,
    /// "read", "write" or "fetch".
    pub op: String,
    pub base: u64,
    pub stride: u64,
    /// Working-set wrap window in bytes.
    pub within_bytes: u64,
    pub req_bytes: u32,
    pub seed: u64,
}

impl Default for StreamSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: "strided".to_string(),
            op: "read".to_string(),
            base: 0,
            stride: 64,
            within_bytes: 1 << 20,
            req_bytes: 4,
            seed: 0,
        }
    }
}

/// One access drawn from a stream, ready to hand to the hierarchy.
#[derive(Debug, Clone, Copy)]
pub struct TrafficOp {
    pub vaddr: u64,
    pub size: u32,
    pub kind: AccessKind,
    pub stream: usize,
}

enum AddrGen {
    Strided { stride: u64 },
    Random { rng: StdRng },
}

struct Stream {
    name: String,
    base: u64,
    within_bytes: u64,
    req_bytes: u32,
    kind: AccessKind,
    gen: AddrGen,
    drawn: u64,
}

impl Stream {
    fn next_vaddr(&mut self) -> u64 {
        let req = self.req_bytes.max(1) as u64;
        let within = self.within_bytes.max(req);
        let offset = match &mut self.gen {
            AddrGen::Strided { stride } => (self.drawn * *stride) % within,
            AddrGen::Random { rng } => rng.gen_range(0..within / req) * req,
        };
        self.drawn += 1;
        self.base + offset
    }
}

/// Draws ops round-robin from the compiled streams until `count` is reached.
pub struct TrafficGen {
    streams: Vec<Stream>,
    remaining: u64,
    cursor: usize,
}

impl TrafficGen {
    pub fn new(config: &TrafficConfig) -> Self {
        let streams = config
            .streams
            .iter()
            .enumerate()
            .map(|(idx, spec)| compile_stream(spec, idx))
            .collect();
        Self {
            streams,
            remaining: config.count,
            cursor: 0,
        }
    }

    pub fn stream_name(&self, idx: usize) -> Option<&str> {
        self.streams.get(idx).map(|s| s.name.as_str())
    }

    pub fn next_op(&mut self) -> Option<TrafficOp> {
        if self.remaining == 0 || self.streams.is_empty() {
            return None;
        }
        self.remaining -= 1;
        let idx = self.cursor;
        self.cursor = (self.cursor + 1) % self.streams.len();
        let stream = &mut self.streams[idx];
        Some(TrafficOp {
            vaddr: stream.next_vaddr(),
            size: stream.req_bytes,
            kind: stream.kind,
            stream: idx,
        })
    }
}

fn compile_stream(spec: &StreamSpec, index: usize) -> Stream {
    let kind = match spec.op.trim().to_ascii_lowercase().as_str() {
        "read" | "r" | "load" => AccessKind::Read,
        "write" | "w" | "store" => AccessKind::Write,
        "fetch" | "ifetch" | "inst" => AccessKind::InstFetch,
        other => panic!(
            "unsupported traffic op '{}' at index {}; expected read/write/fetch",
            other, index
        ),
    };
    let gen = match spec.kind.trim().to_ascii_lowercase().as_str() {
        "strided" => AddrGen::Strided {
            stride: spec.stride.max(1),
        },
        "random" => AddrGen::Random {
            rng: StdRng::seed_from_u64(spec.seed),
        },
        other => panic!(
            "unsupported traffic pattern kind '{}' at index {} (expected strided|random)",
            other, index
        ),
    };
    let name = if spec.name.is_empty() {
        match &gen {
            AddrGen::Strided { stride } => format!("strided({})@{}", stride, spec.req_bytes),
            AddrGen::Random { .. } => format!("random({})@{}", spec.seed, spec.req_bytes),
        }
    } else {
        spec.name.clone()
    };
    Stream {
        name,
        base: spec.base,
        within_bytes: spec.within_bytes,
        req_bytes: spec.req_bytes.max(1),
        kind,
        gen,
        drawn: 0,
    }
}
