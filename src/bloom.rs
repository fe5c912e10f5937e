//! Bloom filters used to encode a Peer's item set as a vector of field elements.
//!
//! A plain filter holds `0`/`1` entries. Adding filters slot by slot yields a counting
//! filter, which is what the threshold union computes on; the reconstructed result is
//! again a filter and is queried with [`BloomFilter::contains`] and
//! [`BloomFilter::weight`]. A Peer's own filter counts too when it is built with
//! [`BloomFilter::add`], every repetition of an item adds one to its slots.

use serde::{Deserialize, Serialize};

/// Errors raised when creating a filter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BloomError {
    /// A filter needs at least one slot.
    #[error("bloom filter size must be positive")]
    ZeroSize,
    /// A filter needs at least one hash function.
    #[error("bloom filter needs at least one hash function")]
    ZeroHashCount,
    /// The given entries do not match the filter size.
    #[error("expected {expected} entries, got {actual}")]
    SizeMismatch {
        /// The filter size.
        expected: usize,
        /// The number of entries given.
        actual: usize,
    },
}

/// A Bloom filter over string items with BLAKE3-derived slot positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    hash_count: usize,
    entries: Vec<u64>,
}

impl BloomFilter {
    /// Creates an empty filter, `size` is rounded up to the next power of two.
    pub fn new(size: usize, hash_count: usize) -> Result<Self, BloomError> {
        if size == 0 {
            return Err(BloomError::ZeroSize);
        }
        if hash_count == 0 {
            return Err(BloomError::ZeroHashCount);
        }
        Ok(Self {
            hash_count,
            entries: vec![0; size.next_power_of_two()],
        })
    }

    /// Wraps reconstructed entries, for example a threshold-union result.
    pub fn from_entries(entries: Vec<u64>, hash_count: usize) -> Result<Self, BloomError> {
        let expected = Self::new(entries.len().max(1), hash_count)?.size();
        if entries.len() != expected {
            return Err(BloomError::SizeMismatch {
                expected,
                actual: entries.len(),
            });
        }
        Ok(Self {
            hash_count,
            entries,
        })
    }

    /// Builds a filter containing all items.
    pub fn with_items<S: AsRef<str>>(
        size: usize,
        hash_count: usize,
        items: impl IntoIterator<Item = S>,
    ) -> Result<Self, BloomError> {
        let mut filter = Self::new(size, hash_count)?;
        for item in items {
            filter.insert(item.as_ref());
        }
        Ok(filter)
    }

    /// The number of slots.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// The number of hash functions.
    pub fn hash_count(&self) -> usize {
        self.hash_count
    }

    /// The slot values.
    pub fn entries(&self) -> &[u64] {
        &self.entries
    }

    /// Consumes the filter, returning its slot values.
    pub fn into_entries(self) -> Vec<u64> {
        self.entries
    }

    /// The slots the item maps to. Positions may repeat.
    pub fn positions(&self, item: &str) -> impl Iterator<Item = usize> + use<> {
        let mask = self.entries.len() as u64 - 1;
        let mut reader = blake3::Hasher::new().update(item.as_bytes()).finalize_xof();
        (0..self.hash_count).map(move |_| {
            let mut word = [0u8; 8];
            reader.fill(&mut word);
            (u64::from_le_bytes(word) & mask) as usize
        })
    }

    /// Sets all slots of the item to 1.
    pub fn insert(&mut self, item: &str) {
        for p in self.positions(item).collect::<Vec<_>>() {
            self.entries[p] = 1;
        }
    }

    /// Adds one to every slot of the item, a slot hit twice by the item counts once.
    pub fn add(&mut self, item: &str) {
        let mut positions: Vec<usize> = self.positions(item).collect();
        positions.sort_unstable();
        positions.dedup();
        for p in positions {
            self.entries[p] = self.entries[p].saturating_add(1);
        }
    }

    /// Builds a counting filter, items listed `k` times have weight `k`.
    pub fn counting<S: AsRef<str>>(
        size: usize,
        hash_count: usize,
        items: impl IntoIterator<Item = S>,
    ) -> Result<Self, BloomError> {
        let mut filter = Self::new(size, hash_count)?;
        for item in items {
            filter.add(item.as_ref());
        }
        Ok(filter)
    }

    /// Whether all slots of the item are non-zero.
    pub fn contains(&self, item: &str) -> bool {
        self.positions(item).all(|p| self.entries[p] != 0)
    }

    /// The estimated number of sets containing the item: the minimum over its slots.
    pub fn weight(&self, item: &str) -> u64 {
        self.positions(item)
            .map(|p| self.entries[p])
            .min()
            .unwrap_or(0)
    }
}
