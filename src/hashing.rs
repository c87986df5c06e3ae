//! Seeded hash family shared identically by every node.
//!
//! The family is derived once from the configured seed string and family
//! size; two nodes with the same configuration produce bit-identical hash
//! lists for the same topic, which is what makes Bloom filters computed on
//! different nodes comparable.

use std::fmt;

const FAMILY_DERIVE_CONTEXT: &str = "clustercast 2025 hash family seeds";

/// A fixed family of keyed hash functions.
pub struct HashFamily {
    seeds: Vec<[u8; 32]>,
}

impl HashFamily {
    /// Derive `size` hash functions from the seed string.
    ///
    /// Derivation is an XOF read from a domain-separated blake3 key
    /// derivation, so any change to the seed string or family size yields
    /// an unrelated family.
    pub fn new(seed: &str, size: usize) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(FAMILY_DERIVE_CONTEXT);
        hasher.update(seed.as_bytes());
        let mut reader = hasher.finalize_xof();

        let mut seeds = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            let mut key = [0u8; 32];
            reader.fill(&mut key);
            seeds.push(key);
        }
        Self { seeds }
    }

    /// Number of hash functions in the family.
    pub fn size(&self) -> usize {
        self.seeds.len()
    }

    /// Hash a topic into one 64-bit value per family member.
    pub fn hashes(&self, topic: &str) -> Vec<u64> {
        self.seeds
            .iter()
            .map(|key| keyed_hash64(key, topic.as_bytes()))
            .collect()
    }

    /// Deterministic member choice for sticky group routing:
    /// `hash(entity) mod len` using the first family member.
    ///
    /// Callers must pass `len > 0`.
    pub fn sticky_index(&self, entity: &str, len: usize) -> usize {
        debug_assert!(len > 0);
        (keyed_hash64(&self.seeds[0], entity.as_bytes()) % len as u64) as usize
    }
}

impl fmt::Debug for HashFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashFamily")
            .field("size", &self.seeds.len())
            .field("first_seed", &hex::encode(&self.seeds[0][..4]))
            .finish()
    }
}

fn keyed_hash64(key: &[u8; 32], data: &[u8]) -> u64 {
    let digest = blake3::keyed_hash(key, data);
    let bytes = digest.as_bytes();
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_config_same_hashes() {
        let a = HashFamily::new("cluster-seed", 5);
        let b = HashFamily::new("cluster-seed", 5);
        assert_eq!(a.hashes("telemetry/device-1"), b.hashes("telemetry/device-1"));
    }

    #[test]
    fn test_different_seed_different_hashes() {
        let a = HashFamily::new("cluster-seed", 5);
        let b = HashFamily::new("other-seed", 5);
        assert_ne!(a.hashes("telemetry/device-1"), b.hashes("telemetry/device-1"));
    }

    #[test]
    fn test_family_size_respected() {
        let family = HashFamily::new("seed", 8);
        assert_eq!(family.size(), 8);
        assert_eq!(family.hashes("t").len(), 8);
    }

    #[test]
    fn test_zero_size_clamps_to_one() {
        let family = HashFamily::new("seed", 0);
        assert_eq!(family.size(), 1);
    }

    #[test]
    fn test_sticky_index_is_stable() {
        let family = HashFamily::new("seed", 3);
        let first = family.sticky_index("entity-42", 7);
        for _ in 0..10 {
            assert_eq!(family.sticky_index("entity-42", 7), first);
        }
        assert!(first < 7);
    }

    #[test]
    fn test_sticky_index_spreads_entities() {
        let family = HashFamily::new("seed", 3);
        let mut hits = [0usize; 4];
        for i in 0..1000 {
            hits[family.sticky_index(&format!("entity-{i}"), 4)] += 1;
        }
        for count in hits {
            // Roughly uniform: each bucket within 3x of the fair share.
            assert!(count > 250 / 3, "bucket starved: {hits:?}");
        }
    }
}
