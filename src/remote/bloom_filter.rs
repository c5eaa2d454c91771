use sha2::{Digest, Sha256};

use crate::error::{invalid_argument, ReplicaResult};
use crate::remote::watch_change::BloomFilterSpec;

/// Membership filter attached to an existence filter.
///
/// A lookup hashes the value with SHA-256; the first 16 bytes of the digest
/// are read as two little-endian `u64`s `h1` and `h2`, and the `i`th bit
/// checked is `(h1 + i * h2) mod bit_count`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: u8, hash_count: u32) -> ReplicaResult<Self> {
        if padding >= 8 {
            return Err(invalid_argument(format!(
                "Bloom filter padding must be below 8, got {padding}"
            )));
        }
        if bitmap.is_empty() {
            if padding != 0 {
                return Err(invalid_argument(format!(
                    "Empty bloom filter with non-zero padding {padding}"
                )));
            }
        } else if hash_count == 0 {
            return Err(invalid_argument("Bloom filter hash count must be positive"));
        }
        let bit_count = (bitmap.len() as u64) * 8 - u64::from(padding);
        Ok(Self {
            bitmap,
            bit_count,
            hash_count,
        })
    }

    pub fn from_spec(spec: &BloomFilterSpec) -> ReplicaResult<Self> {
        Self::new(spec.bitmap.to_vec(), spec.padding, spec.hash_count)
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// False means `value` was definitely not inserted.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        self.bit_indexes(value)
            .all(|index| self.bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0)
    }

    fn bit_indexes(&self, value: &str) -> impl Iterator<Item = u64> + '_ {
        let digest = Sha256::digest(value.as_bytes());
        let mut low = [0u8; 8];
        let mut high = [0u8; 8];
        low.copy_from_slice(&digest[..8]);
        high.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(low);
        let h2 = u64::from_le_bytes(high);
        (0..u64::from(self.hash_count))
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count)
    }

    #[cfg(test)]
    pub(crate) fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, value: &str) {
        let indexes: Vec<u64> = self.bit_indexes(value).collect();
        for index in indexes {
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_filters() {
        assert!(BloomFilter::new(vec![0], 8, 1).is_err());
        assert!(BloomFilter::new(vec![], 1, 0).is_err());
        assert!(BloomFilter::new(vec![0xff], 0, 0).is_err());
        assert!(BloomFilter::new(vec![], 0, 0).is_ok());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(vec![], 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain("rooms/a"));
    }

    #[test]
    fn inserted_values_are_found() {
        let mut filter = BloomFilter::new(vec![0; 32], 3, 7).unwrap();
        assert_eq!(filter.bit_count(), 253);
        for path in ["rooms/a", "rooms/b", "rooms/c"] {
            filter.insert(path);
        }
        for path in ["rooms/a", "rooms/b", "rooms/c"] {
            assert!(filter.might_contain(path), "{path}");
        }
        let false_positives = (0..100)
            .filter(|i| filter.might_contain(&format!("users/{i}")))
            .count();
        assert!(false_positives < 10, "{false_positives}");
    }

    #[test]
    fn full_bitmap_contains_everything() {
        let filter = BloomFilter::new(vec![0xff; 4], 0, 5).unwrap();
        assert!(filter.might_contain("anything"));
    }
}
