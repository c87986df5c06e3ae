//! Bloom filter over a node's hashed topic set.
//!
//! The filter is the probabilistic export of the local subscription store:
//! no false negatives, so "no" verdicts are authoritative and skip a node
//! entirely; "maybe" verdicts are re-checked against the exact local store
//! once the message reaches the node.

use serde::{Deserialize, Serialize};

/// Smallest bit array ever allocated; keeps tiny topic sets from producing
/// degenerate filters.
const MIN_BITS: usize = 64;

/// Probabilistic set over topic hashes, replicated per node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bit_len: usize,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Size the bit array for `expected_items` at the target false-positive
    /// probability, inflated by `buffer_factor` to tolerate growth between
    /// replication ticks without a resize.
    ///
    /// Uses the standard `m = -n * ln p / ln^2 2` sizing. A resize (export
    /// with a larger capacity) always carries the full topic set, so remote
    /// readers never see a partially migrated filter.
    pub fn sized_for(expected_items: usize, false_positive_rate: f64, buffer_factor: f64) -> Self {
        let n = (expected_items.max(1) as f64 * buffer_factor.max(1.0)).ceil();
        let p = false_positive_rate.clamp(0.000_1, 0.999_9);
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * p.ln()) / (ln2 * ln2)).ceil() as usize;
        Self::with_bits(m)
    }

    fn with_bits(bit_len: usize) -> Self {
        let bit_len = bit_len.max(MIN_BITS);
        Self {
            bit_len,
            bits: vec![0; bit_len.div_ceil(8)],
        }
    }

    /// Number of bits in the array.
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// True while no item has been inserted.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    /// Insert an item by its hash family values.
    pub fn insert_hashes(&mut self, hashes: &[u64]) {
        for &h in hashes {
            let idx = (h % self.bit_len as u64) as usize;
            self.bits[idx / 8] |= 1 << (idx % 8);
        }
    }

    /// Membership test. "false" is authoritative, "true" means maybe.
    pub fn might_contain_hashes(&self, hashes: &[u64]) -> bool {
        hashes.iter().all(|&h| {
            let idx = (h % self.bit_len as u64) as usize;
            self.bits[idx / 8] & (1 << (idx % 8)) != 0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::HashFamily;

    fn family() -> HashFamily {
        HashFamily::new("bloom-test", 5)
    }

    #[test]
    fn test_insert_and_query() {
        let family = family();
        let mut filter = BloomFilter::sized_for(64, 0.01, 1.5);
        filter.insert_hashes(&family.hashes("alpha"));

        assert!(filter.might_contain_hashes(&family.hashes("alpha")));
        assert!(!filter.might_contain_hashes(&family.hashes("beta")));
    }

    #[test]
    fn test_no_false_negatives() {
        let family = family();
        let mut filter = BloomFilter::sized_for(16, 0.05, 1.0);
        let topics: Vec<String> = (0..200).map(|i| format!("topic-{i}")).collect();
        // Deliberately overfilled far past its sizing; membership must hold.
        for topic in &topics {
            filter.insert_hashes(&family.hashes(topic));
        }
        for topic in &topics {
            assert!(filter.might_contain_hashes(&family.hashes(topic)));
        }
    }

    #[test]
    fn test_false_positive_rate_roughly_bounded() {
        let family = family();
        let mut filter = BloomFilter::sized_for(100, 0.01, 1.0);
        for i in 0..100 {
            filter.insert_hashes(&family.hashes(&format!("present-{i}")));
        }
        let false_hits = (0..1000)
            .filter(|i| filter.might_contain_hashes(&family.hashes(&format!("absent-{i}"))))
            .count();
        // Target is 1%; allow generous slack for hash variance.
        assert!(false_hits < 50, "false positive count: {false_hits}");
    }

    #[test]
    fn test_buffer_factor_grows_filter() {
        let plain = BloomFilter::sized_for(100, 0.01, 1.0);
        let buffered = BloomFilter::sized_for(100, 0.01, 2.0);
        assert!(buffered.bit_len() > plain.bit_len());
    }

    #[test]
    fn test_fresh_filter_is_empty() {
        let filter = BloomFilter::sized_for(10, 0.01, 1.0);
        assert!(filter.is_empty());

        let mut touched = filter.clone();
        touched.insert_hashes(&family().hashes("x"));
        assert!(!touched.is_empty());
    }

    #[test]
    fn test_serialization_round_trip() {
        let family = family();
        let mut filter = BloomFilter::sized_for(32, 0.01, 1.5);
        filter.insert_hashes(&family.hashes("alpha"));

        let yaml = serde_yaml::to_string(&filter).unwrap();
        let decoded: BloomFilter = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(decoded, filter);
        assert!(decoded.might_contain_hashes(&family.hashes("alpha")));
    }
}
