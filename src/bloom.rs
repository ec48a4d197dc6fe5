use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Fixed-capacity bloom filter over auction uuids.
///
/// Sized from `(capacity, target_fpr)` at construction; positions come from
/// double hashing two 64-bit halves of a SHA-256 digest, so two filters built
/// with the same parameters index identically and can be merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    bit_count: u64,
    hash_count: u32,
    capacity: u64,
    target_fpr: f64,
    item_count: u64,
}

impl BloomFilter {
    pub fn with_capacity(capacity: u64, target_fpr: f64) -> Self {
        let n = capacity.max(1) as f64;
        let bit_count = (-(n * target_fpr.ln()) / 2f64.ln().powi(2)).ceil() as u64;
        let hash_count = ((bit_count as f64 / n) * 2f64.ln()).round().max(1.0) as u32;
        BloomFilter {
            bits: vec![0u64; bit_count.div_ceil(64) as usize],
            bit_count,
            hash_count,
            capacity,
            target_fpr,
            item_count: 0,
        }
    }

    fn hash_pair(uuid: &Uuid) -> (u64, u64) {
        let digest = Sha256::digest(uuid.as_bytes());
        let h1 = u64::from_le_bytes(digest[0..8].try_into().unwrap());
        let h2 = u64::from_le_bytes(digest[8..16].try_into().unwrap());
        (h1, h2)
    }

    fn positions(&self, uuid: &Uuid) -> impl Iterator<Item = u64> + '_ {
        let (h1, h2) = Self::hash_pair(uuid);
        let m = self.bit_count;
        (0..self.hash_count as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }

    pub fn add(&mut self, uuid: &Uuid) {
        let positions: Vec<u64> = self.positions(uuid).collect();
        for pos in positions {
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
        self.item_count += 1;
    }

    /// `false` means definitely absent; `true` means maybe present.
    pub fn may_contain(&self, uuid: &Uuid) -> bool {
        self.positions(uuid)
            .all(|pos| self.bits[(pos / 64) as usize] & (1 << (pos % 64)) != 0)
    }

    /// Unions another filter into this one. Requires identical geometry.
    pub fn merge(&mut self, other: &BloomFilter) -> Result<()> {
        if self.bit_count != other.bit_count || self.hash_count != other.hash_count {
            bail!(
                "cannot merge bloom filters with different geometry: {}x{} vs {}x{}",
                self.bit_count,
                self.hash_count,
                other.bit_count,
                other.hash_count
            );
        }
        for (slot, other_slot) in self.bits.iter_mut().zip(&other.bits) {
            *slot |= other_slot;
        }
        self.item_count += other.item_count;
        Ok(())
    }

    /// Observed false-positive rate estimate: `(set_bits / m) ^ k`.
    pub fn estimated_fpr(&self) -> f64 {
        let set: u64 = self.bits.iter().map(|b| b.count_ones() as u64).sum();
        (set as f64 / self.bit_count as f64).powi(self.hash_count as i32)
    }

    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .context("failed to serialize bloom filter")
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (filter, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .context("failed to deserialize bloom filter")?;
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::with_capacity(1_000, 0.01);
        let added: Vec<Uuid> = (0..1_000).map(|_| Uuid::new_v4()).collect();
        for u in &added {
            filter.add(u);
        }
        for u in &added {
            assert!(filter.may_contain(u));
        }
    }

    #[test]
    fn test_empirical_fpr_within_bound() {
        let mut filter = BloomFilter::with_capacity(10_000, 0.01);
        for _ in 0..10_000 {
            filter.add(&Uuid::new_v4());
        }
        let trials = 20_000;
        let false_hits = (0..trials)
            .filter(|_| filter.may_contain(&Uuid::new_v4()))
            .count();
        let observed = false_hits as f64 / trials as f64;
        assert!(observed <= 0.03, "observed FPR {observed} above 3x target");
    }

    #[test]
    fn test_merge_is_union() {
        let mut a = BloomFilter::with_capacity(1_000, 0.01);
        let mut b = BloomFilter::with_capacity(1_000, 0.01);
        let in_a: Vec<Uuid> = (0..100).map(|_| Uuid::new_v4()).collect();
        let in_b: Vec<Uuid> = (0..100).map(|_| Uuid::new_v4()).collect();
        for u in &in_a {
            a.add(u);
        }
        for u in &in_b {
            b.add(u);
        }
        a.merge(&b).unwrap();
        for u in in_a.iter().chain(&in_b) {
            assert!(a.may_contain(u));
        }
        assert_eq!(a.item_count(), 200);
    }

    #[test]
    fn test_merge_rejects_mismatched_geometry() {
        let mut a = BloomFilter::with_capacity(1_000, 0.01);
        let b = BloomFilter::with_capacity(2_000, 0.01);
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn test_serialize_preserves_every_field() {
        let mut filter = BloomFilter::with_capacity(500, 0.001);
        for _ in 0..50 {
            filter.add(&Uuid::new_v4());
        }
        let restored = BloomFilter::deserialize(&filter.serialize().unwrap()).unwrap();
        assert_eq!(restored, filter);
        assert_eq!(restored.item_count(), 50);
    }

    #[test]
    fn test_estimated_fpr_grows_with_load() {
        let mut filter = BloomFilter::with_capacity(1_000, 0.01);
        let empty = filter.estimated_fpr();
        for _ in 0..1_000 {
            filter.add(&Uuid::new_v4());
        }
        assert!(filter.estimated_fpr() > empty);
        assert!(filter.estimated_fpr() < 0.05);
    }
}
