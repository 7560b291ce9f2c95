//! Compact target utilities and per-header work.

use elaspv_consensus::Hash256;
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    Compact(CompactError),
    /// Target of zero, or looser than the network's pow limit.
    TargetOutOfRange,
    /// The header hash does not meet its own claimed target.
    AboveTarget,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::Compact(err) => write!(f, "{err}"),
            PowError::TargetOutOfRange => write!(f, "target out of range"),
            PowError::AboveTarget => write!(f, "hash above target"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = (bits >> 24) as u32;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow =
            size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = ((value.bits() + 7) / 8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

/// Work contributed by one header: 2^256 / (target + 1), computed without
/// 256-bit overflow as (~target / (target + 1)) + 1.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    Ok((!target / (target + U256::one())) + U256::one())
}

/// Check a header hash against its own claimed target and the network's
/// pow limit. The hash is interpreted little-endian, as the chain does.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    pow_limit_bits: u32,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    let limit = compact_to_u256(pow_limit_bits)?;
    if target.is_zero() || target > limit {
        return Err(PowError::TargetOutOfRange);
    }
    if U256::from_little_endian(hash) > target {
        return Err(PowError::AboveTarget);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_roundtrip() {
        for bits in [0x1d00_ffffu32, 0x1d0f_ffff, 0x207f_ffff, 0x1b04_864c] {
            let target = compact_to_u256(bits).unwrap();
            assert_eq!(u256_to_compact(target), bits);
        }
    }

    #[test]
    fn negative_compact_rejected() {
        assert_eq!(compact_to_u256(0x0180_0000), Err(CompactError::Negative));
    }

    #[test]
    fn overflowing_compact_rejected() {
        assert_eq!(compact_to_u256(0x2300_ffff), Err(CompactError::Overflow));
    }

    #[test]
    fn harder_target_means_more_work() {
        let easy = block_proof(0x207f_ffff).unwrap();
        let hard = block_proof(0x1d00_ffff).unwrap();
        assert!(hard > easy);
    }

    #[test]
    fn hash_above_target_rejected() {
        // A target of 0x...00ffff... leaves the top bytes zero; an all-ones
        // hash can never satisfy it.
        let high = [0xFF; 32];
        assert_eq!(
            check_proof_of_work(&high, 0x1d00_ffff, 0x1d00_ffff),
            Err(PowError::AboveTarget)
        );
        // The zero hash satisfies any target.
        let low = [0x00; 32];
        assert_eq!(check_proof_of_work(&low, 0x1d00_ffff, 0x1d00_ffff), Ok(()));
    }

    #[test]
    fn target_looser_than_limit_rejected() {
        let hash = [0x00; 32];
        assert_eq!(
            check_proof_of_work(&hash, 0x207f_ffff, 0x1d00_ffff),
            Err(PowError::TargetOutOfRange)
        );
    }
}
