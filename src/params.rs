//! Consensus parameters injected per network profile

use serde::{Deserialize, Serialize};

use crate::types::{Integer, Natural};

/// Policy for choosing between competing tips of equal cumulative work.
///
/// Deterministic for a given engine instance replaying the same blocks in
/// the same order; no global total order across independent instances is
/// implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Keep whichever tip was indexed first.
    FirstSeen,
    /// Prefer the tip with the numerically smaller block id.
    LowestId,
}

/// Consensus parameters for one network profile
///
/// These are domain configuration, not code: the engine never hardcodes
/// economic constants or window sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Supply bound in the smallest unit
    pub max_money: Integer,
    /// Subsidy of the genesis era, halved every `halving_interval` blocks
    pub initial_subsidy: Integer,
    pub halving_interval: Natural,
    /// Blocks a coinbase output must age before it may be spent
    pub coinbase_maturity: Natural,
    /// Serialized block size bound in bytes
    pub max_block_size: usize,
    pub max_block_txs: usize,
    /// Serialized transaction size bound in bytes
    pub max_tx_size: usize,
    /// Seconds a header timestamp may run ahead of adjusted time
    pub max_future_drift: u64,
    /// Trailing ancestor window for the median-time check
    pub median_time_window: usize,
    /// Least-difficulty target permitted on this network (compact form)
    pub pow_limit_bits: u32,
    /// Target seconds between blocks
    pub target_spacing: u64,
    /// Blocks per difficulty-adjustment window
    pub difficulty_window: Natural,
    pub tie_break: TieBreak,
}

impl ConsensusParams {
    /// Main network profile
    pub fn main() -> Self {
        Self {
            max_money: 21_000_000 * 100_000_000,
            initial_subsidy: 50 * 100_000_000,
            halving_interval: 210_000,
            coinbase_maturity: 100,
            max_block_size: 4_000_000,
            max_block_txs: 20_000,
            max_tx_size: 1_000_000,
            max_future_drift: 2 * 60 * 60,
            median_time_window: 11,
            pow_limit_bits: 0x1d00_ffff,
            target_spacing: 600,
            difficulty_window: 2016,
            tie_break: TieBreak::FirstSeen,
        }
    }

    /// Test network profile: main-network economics, relaxed difficulty
    pub fn test() -> Self {
        Self {
            pow_limit_bits: 0x1e00_ffff,
            ..Self::main()
        }
    }

    /// Regression-test profile: trivial difficulty, short maturity
    pub fn regtest() -> Self {
        Self {
            coinbase_maturity: 10,
            max_future_drift: 24 * 60 * 60,
            pow_limit_bits: 0x207f_ffff,
            difficulty_window: 144,
            ..Self::main()
        }
    }

    /// Load a profile from its JSON representation
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// JSON representation of this profile
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("parameter profiles serialize")
    }
}
