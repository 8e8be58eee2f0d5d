//! Subsidy schedule and supply accounting

use crate::params::ConsensusParams;
use crate::types::{Integer, Natural};

/// Subsidy minted by the block at `height`.
///
/// Halves every `halving_interval` blocks; the right-shift reaches zero
/// after 64 halvings.
pub fn block_subsidy(height: Natural, params: &ConsensusParams) -> Integer {
    let halvings = height / params.halving_interval;
    if halvings >= 64 {
        return 0;
    }
    params.initial_subsidy >> halvings
}

/// Total supply issued by all blocks up to and including `height`
pub fn total_issued(height: Natural, params: &ConsensusParams) -> Integer {
    let mut total: Integer = 0;
    let mut era = 0u64;
    loop {
        let era_start = era * params.halving_interval;
        if era_start > height || era >= 64 {
            break;
        }
        let era_end = ((era + 1) * params.halving_interval - 1).min(height);
        let blocks = (era_end - era_start + 1) as Integer;
        total += blocks * (params.initial_subsidy >> era);
        era += 1;
    }
    total
}

/// Issued supply must never exceed the configured bound.
pub fn supply_within_bound(height: Natural, params: &ConsensusParams) -> bool {
    total_issued(height, params) <= params.max_money
}
