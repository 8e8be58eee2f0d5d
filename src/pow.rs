//! Proof-of-work target arithmetic
//!
//! Targets travel in the compact 4-byte representation: one exponent byte
//! and a 3-byte mantissa, target = mantissa * 2^(8 * (exponent - 3)).

use sha2::{Digest, Sha256};

use crate::error::BlockError;
use crate::params::ConsensusParams;
use crate::types::{BlockHeader, Hash};

/// Check that a header's hash satisfies its claimed difficulty target and
/// that the target itself is within the network's floor.
pub fn check_proof_of_work(
    header: &BlockHeader,
    params: &ConsensusParams,
) -> Result<(), BlockError> {
    let target = expand_target(header.bits)?;
    let limit = expand_target(params.pow_limit_bits)?;
    if target > limit {
        return Err(BlockError::BadTarget);
    }

    let hash = header_pow_hash(header);
    if U256::from_le_bytes(&hash) > target {
        return Err(BlockError::HighHash);
    }
    Ok(())
}

/// Estimated work contributed by a block at the given compact target.
///
/// Approximates 2^256 / (target + 1) as 2^shift / mantissa with saturation;
/// exact magnitude is irrelevant, only monotonicity in difficulty matters
/// for cumulative-work comparison.
pub fn work_for_bits(bits: u32) -> u128 {
    let exponent = (bits >> 24) as i32;
    let mantissa = (bits & 0x007f_ffff) as u128;
    if mantissa == 0 || bits & 0x0080_0000 != 0 {
        return 0;
    }

    let shift = 256 - 8 * (exponent - 3);
    if shift <= 0 {
        return 1;
    }
    if shift < 127 {
        return ((1u128 << shift) / mantissa).max(1);
    }

    // Split the power of two so the division stays in range.
    let head = (1u128 << 126) / mantissa;
    let rest = (shift - 126) as u32;
    if rest >= 128 {
        return u128::MAX;
    }
    head.checked_shl(rest).unwrap_or(u128::MAX)
}

/// Proof-of-work hash of a serialized header: double SHA-256
fn header_pow_hash(header: &BlockHeader) -> Hash {
    let bytes = header.encode();
    let first = Sha256::digest(&bytes);
    let second = Sha256::digest(first);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&second);
    hash
}

/// Expand a compact target into a 256-bit value.
///
/// Rejects zero mantissas, negative targets (mantissa sign bit), and
/// exponents that shift the mantissa out of 256 bits.
pub(crate) fn expand_target(bits: u32) -> Result<U256, BlockError> {
    let exponent = (bits >> 24) as u32;
    let mantissa = bits & 0x00ff_ffff;

    if mantissa == 0 || bits & 0x0080_0000 != 0 {
        return Err(BlockError::BadTarget);
    }
    if exponent > 32 {
        return Err(BlockError::BadTarget);
    }

    let value = U256::from_u64(mantissa as u64);
    let target = if exponent <= 3 {
        value.shr(8 * (3 - exponent))
    } else {
        value.shl(8 * (exponent - 3))
    };
    if target.is_zero() {
        return Err(BlockError::BadTarget);
    }
    Ok(target)
}

/// 256-bit integer for target comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct U256([u64; 4]);

impl U256 {
    fn zero() -> Self {
        U256([0; 4])
    }

    fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    fn is_zero(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *word = u64::from_le_bytes(buf);
        }
        U256(words)
    }

    fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }
        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }
        result
    }

    fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }
        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in 0..4 {
            if i >= word_shift {
                result.0[i - word_shift] |= self.0[i] >> bit_shift;
                if bit_shift > 0 && i >= word_shift + 1 {
                    result.0[i - word_shift - 1] |= self.0[i] << (64 - bit_shift);
                }
            }
        }
        result
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                std::cmp::Ordering::Equal => continue,
                ordering => return ordering,
            }
        }
        std::cmp::Ordering::Equal
    }
}
