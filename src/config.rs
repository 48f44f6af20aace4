use std::str::FromStr;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::*;

/// Top-level run parameters for the simulator binary.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub log_level: u64,
    /// Hard cap on simulated cycles before the run is declared hung.
    pub timeout: u64,
}

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Self {
        match section {
            Some(value) => value.clone().try_into().expect("cannot deserialize config"),
            None => {
                warn!("config section not found");
                Self::default()
            }
        }
    }
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            log_level: 0,
            timeout: 10000000,
        }
    }
}

/// A byte count with the usual capacity suffixes ("64kB", "8MB", "512MiB").
/// Suffixes are binary, matching the convention of architecture config
/// scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub u64);

impl FromStr for ByteSize {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, suffix) = trimmed.split_at(split);
        let count: u64 = digits
            .parse()
            .map_err(|_| format!("invalid size '{}'", value))?;
        let shift = match suffix.trim() {
            "" | "B" => 0,
            "kB" | "KB" | "KiB" => 10,
            "MB" | "MiB" => 20,
            "GB" | "GiB" => 30,
            other => return Err(format!("unsupported size suffix '{}'", other)),
        };
        count
            .checked_shl(shift)
            .filter(|_| count.leading_zeros() >= shift)
            .map(ByteSize)
            .ok_or_else(|| format!("size '{}' overflows", value))
    }
}
