//! BIP37-style bloom filter advertised to peers.

use std::io::Cursor;

/// Largest filter accepted by the network, in bytes.
pub const MAX_FILTER_SIZE: usize = 36_000;
/// Largest hash-function count accepted by the network.
pub const MAX_HASH_FUNCS: u32 = 50;

/// Seed spacing between the k hash functions.
const HASH_SEED_MULTIPLIER: u32 = 0xFBA4_C795;

pub const BLOOM_UPDATE_NONE: u8 = 0;
pub const BLOOM_UPDATE_ALL: u8 = 1;
pub const BLOOM_UPDATE_P2PUBKEY_ONLY: u8 = 2;

/// A probabilistic set with no false negatives: every inserted element
/// matches, unrelated elements match at roughly the configured rate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BloomFilter {
    data: Vec<u8>,
    n_hash_funcs: u32,
    tweak: u32,
    flags: u8,
}

impl BloomFilter {
    /// Size the filter for `n_elements` at false-positive rate `fp_rate`.
    pub fn new(n_elements: usize, fp_rate: f64, tweak: u32, flags: u8) -> Self {
        let n = n_elements.max(1) as f64;
        let ln2_squared = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let bits = (-n * fp_rate.ln() / ln2_squared) as usize;
        let bits = bits.clamp(1, MAX_FILTER_SIZE * 8);
        let n_hash_funcs = ((bits as f64 / n) * std::f64::consts::LN_2) as u32;
        let n_hash_funcs = n_hash_funcs.clamp(1, MAX_HASH_FUNCS);
        Self {
            data: vec![0u8; bits.div_ceil(8)],
            n_hash_funcs,
            tweak,
            flags,
        }
    }

    /// Rebuild from previously advertised parameters.
    pub fn from_parts(data: Vec<u8>, n_hash_funcs: u32, tweak: u32, flags: u8) -> Self {
        Self {
            data,
            n_hash_funcs: n_hash_funcs.clamp(1, MAX_HASH_FUNCS),
            tweak,
            flags,
        }
    }

    fn bit_index(&self, hash_num: u32, data: &[u8]) -> usize {
        let seed = hash_num.wrapping_mul(HASH_SEED_MULTIPLIER).wrapping_add(self.tweak);
        let hash = murmur3::murmur3_32(&mut Cursor::new(data), seed).unwrap_or(0);
        (hash as usize) % (self.data.len() * 8)
    }

    pub fn insert(&mut self, data: &[u8]) {
        for i in 0..self.n_hash_funcs {
            let index = self.bit_index(i, data);
            self.data[index / 8] |= 1 << (index % 8);
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        (0..self.n_hash_funcs).all(|i| {
            let index = self.bit_index(i, data);
            self.data[index / 8] & (1 << (index % 8)) != 0
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn n_hash_funcs(&self) -> u32 {
        self.n_hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn is_within_limits(&self) -> bool {
        !self.data.is_empty()
            && self.data.len() <= MAX_FILTER_SIZE
            && self.n_hash_funcs <= MAX_HASH_FUNCS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(i: u32) -> Vec<u8> {
        let mut bytes = b"element-".to_vec();
        bytes.extend_from_slice(&i.to_le_bytes());
        bytes
    }

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::new(200, 0.001, 0xDEAD_BEEF, BLOOM_UPDATE_ALL);
        for i in 0..200 {
            filter.insert(&element(i));
        }
        for i in 0..200 {
            assert!(filter.contains(&element(i)), "element {i} must match");
        }
    }

    #[test]
    fn false_positive_rate_near_target() {
        let target = 0.01;
        let mut filter = BloomFilter::new(500, target, 1, BLOOM_UPDATE_NONE);
        for i in 0..500 {
            filter.insert(&element(i));
        }
        let queries = 10_000u32;
        let mut positives = 0u32;
        for i in 0..queries {
            if filter.contains(&element(1_000_000 + i)) {
                positives += 1;
            }
        }
        let rate = f64::from(positives) / f64::from(queries);
        assert!(rate <= target * 2.0, "observed rate {rate} exceeds 2x target");
    }

    #[test]
    fn parameters_respect_network_limits() {
        let filter = BloomFilter::new(10_000_000, 0.000_001, 0, BLOOM_UPDATE_NONE);
        assert!(filter.is_within_limits());
        assert!(filter.data().len() <= MAX_FILTER_SIZE);
        assert!(filter.n_hash_funcs() <= MAX_HASH_FUNCS);

        let tiny = BloomFilter::new(0, 0.5, 0, BLOOM_UPDATE_NONE);
        assert!(tiny.is_within_limits());
    }

    #[test]
    fn tweak_changes_bit_pattern() {
        let mut a = BloomFilter::new(50, 0.01, 1, BLOOM_UPDATE_NONE);
        let mut b = BloomFilter::new(50, 0.01, 2, BLOOM_UPDATE_NONE);
        for i in 0..50 {
            a.insert(&element(i));
            b.insert(&element(i));
        }
        assert_ne!(a.data(), b.data());
    }
}
