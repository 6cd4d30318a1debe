//! Directory sharding for blob placement.
//!
//! A numeric file id maps to three path segments:
//!
//! ```text
//! level2raw = ceil(id / N)
//! level1raw = ceil(level2raw / N)
//! level2adj = level2raw - level1raw * N
//! level1    = base36(N - level1raw)
//! level2    = base36(N - level2adj)
//! container = base36(id)
//! ```
//!
//! `N - level` is encoded instead of `level` so the shards that fill first sort
//! last in a directory listing. The layout must stay bit-for-bit stable: blobs
//! written by one process are located by another.

use std::fmt;
use std::path::PathBuf;

use crate::{Result, StorageError};

/// Default number of children per shard directory.
pub const DEFAULT_SHARD_FANOUT: u64 = 4096;

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Encode a non-negative integer in lowercase base 36.
pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();

    // Only ASCII digits were pushed.
    String::from_utf8(digits).unwrap_or_default()
}

/// The three directory segments a blob lives under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardPath {
    pub level1: String,
    pub level2: String,
    pub container: String,
}

impl ShardPath {
    /// Relative directory path `level1/level2/container`.
    pub fn to_path_buf(&self) -> PathBuf {
        [&self.level1, &self.level2, &self.container]
            .iter()
            .collect()
    }
}

impl fmt::Display for ShardPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.level1, self.level2, self.container)
    }
}

/// Three-level key sharding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySharding {
    fanout: u64,
}

impl Default for KeySharding {
    fn default() -> Self {
        Self {
            fanout: DEFAULT_SHARD_FANOUT,
        }
    }
}

impl KeySharding {
    /// Create a scheme with the given fanout.
    ///
    /// A fanout below 2 cannot shard anything and is rejected.
    pub fn new(fanout: u64) -> Result<Self> {
        if fanout < 2 {
            return Err(StorageError::Validation(format!(
                "shard fanout must be at least 2, got {fanout}"
            )));
        }
        Ok(Self { fanout })
    }

    /// Children per shard directory.
    pub fn fanout(&self) -> u64 {
        self.fanout
    }

    /// Largest id the tree can address (`fanout³`).
    pub fn capacity(&self) -> u64 {
        self.fanout.saturating_pow(3)
    }

    /// Map a file id to its shard path.
    ///
    /// Ids must be positive and at most [`capacity`](Self::capacity); past
    /// that point `N - level1raw` would go negative, which is reported rather
    /// than wrapped.
    pub fn path_for(&self, id: i64) -> Result<ShardPath> {
        if id <= 0 {
            return Err(StorageError::Validation(format!(
                "file id must be positive, got {id}"
            )));
        }

        let n = self.fanout;
        let id = id as u64;

        let level2_raw = id.div_ceil(n);
        let level1_raw = level2_raw.div_ceil(n);

        if level1_raw > n {
            return Err(StorageError::Validation(format!(
                "file id {id} exceeds shard capacity {} for fanout {n}",
                self.capacity()
            )));
        }

        // level2_raw - level1_raw * n lies in (-n, 0], so n - level2adj lies in [n, 2n).
        let level2_value = n + (level1_raw * n - level2_raw);

        Ok(ShardPath {
            level1: to_base36(n - level1_raw),
            level2: to_base36(level2_value),
            container: to_base36(id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_path(id: i64) -> ShardPath {
        KeySharding::default().path_for(id).unwrap()
    }

    #[test]
    fn test_to_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(4095), "35r");
        assert_eq!(to_base36(8191), "6bj");
    }

    #[test]
    fn test_path_for_first_id() {
        let path = default_path(1);
        assert_eq!(path.level1, "35r");
        assert_eq!(path.level2, "6bj");
        assert_eq!(path.container, "1");
        assert_eq!(path.to_string(), "35r/6bj/1");
    }

    #[test]
    fn test_path_for_end_of_first_shard() {
        let path = default_path(4096);
        assert_eq!(path.level1, "35r");
        assert_eq!(path.level2, "6bj");
        assert_eq!(path.container, "35s");
    }

    #[test]
    fn test_path_for_second_shard() {
        let path = default_path(4097);
        assert_eq!(path.level1, "35r");
        assert_eq!(path.level2, "6bi");
        assert_eq!(path.container, "35t");
    }

    #[test]
    fn test_path_for_second_top_level_shard() {
        // 4096² + 1 is the first id that needs a new level1 directory.
        let path = default_path(16_777_217);
        assert_eq!(path.level1, "35q");
        assert_eq!(path.level2, "6bj");
        assert_eq!(path.container, "9zldt");
    }

    #[test]
    fn test_path_for_is_deterministic() {
        let sharding = KeySharding::default();
        for id in [1, 2, 4095, 4096, 4097, 1_000_000] {
            assert_eq!(sharding.path_for(id).unwrap(), sharding.path_for(id).unwrap());
        }
    }

    #[test]
    fn test_path_for_is_injective() {
        let sharding = KeySharding::new(4).unwrap();
        let mut seen = std::collections::HashSet::new();
        for id in 1..=64 {
            assert!(seen.insert(sharding.path_for(id).unwrap()));
        }
    }

    #[test]
    fn test_path_for_small_fanout_capacity_boundary() {
        let sharding = KeySharding::new(2).unwrap();
        assert_eq!(sharding.capacity(), 8);

        let last = sharding.path_for(8).unwrap();
        assert_eq!(last.level1, "0");
        assert_eq!(last.level2, "2");
        assert_eq!(last.container, "8");

        assert!(matches!(
            sharding.path_for(9),
            Err(StorageError::Validation(_))
        ));
    }

    #[test]
    fn test_path_for_rejects_non_positive() {
        let sharding = KeySharding::default();
        assert!(matches!(sharding.path_for(0), Err(StorageError::Validation(_))));
        assert!(matches!(sharding.path_for(-5), Err(StorageError::Validation(_))));
    }

    #[test]
    fn test_new_rejects_tiny_fanout() {
        assert!(KeySharding::new(0).is_err());
        assert!(KeySharding::new(1).is_err());
        assert_eq!(KeySharding::new(16).unwrap().fanout(), 16);
    }

    #[test]
    fn test_to_path_buf() {
        let path = default_path(1).to_path_buf();
        assert_eq!(path, PathBuf::from("35r").join("6bj").join("1"));
    }
}
