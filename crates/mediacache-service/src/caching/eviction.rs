use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use super::CacheKey;
use super::store::CacheEntry;

/// The order in which entries are evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionOrder {
    /// Least recently accessed first. Used for capacity-triggered eviction.
    LeastRecentlyUsed,
    /// Largest payload first.
    LargestFirst,
    /// Earliest created first.
    OldestFirst,
}

impl EvictionOrder {
    /// Compares two entries, the one to be evicted first sorting first.
    ///
    /// Equal sort keys fall back to insertion order.
    fn compare<T>(self, a: &CacheEntry<T>, b: &CacheEntry<T>) -> Ordering {
        let primary = match self {
            Self::LeastRecentlyUsed => a.last_accessed_at.cmp(&b.last_accessed_at),
            Self::LargestFirst => b.size_bytes.cmp(&a.size_bytes),
            Self::OldestFirst => a.created_at.cmp(&b.created_at),
        };
        primary.then(a.seq.cmp(&b.seq))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LeastRecentlyUsed => "lru",
            Self::LargestFirst => "largest",
            Self::OldestFirst => "oldest",
        }
    }
}

/// The outcome of one eviction run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// The number of entries removed.
    pub evicted: usize,
    /// The sum of their sizes.
    pub freed_bytes: u64,
}

/// Picks the entries to remove so that `total_bytes` drops to `target_bytes` or below.
///
/// Stops at the first entry that reaches the target, so no more than necessary is evicted. The
/// `protected` entry is never picked, even if the target cannot be reached without it.
pub(super) fn select_victims<T>(
    entries: &HashMap<CacheKey, CacheEntry<T>>,
    total_bytes: u64,
    target_bytes: u64,
    order: EvictionOrder,
    protected: Option<&CacheKey>,
) -> Vec<CacheKey> {
    if total_bytes <= target_bytes {
        return vec![];
    }

    let mut candidates: Vec<_> = entries
        .iter()
        .filter(|(key, _)| Some(*key) != protected)
        .collect();
    candidates.sort_by(|(_, a), (_, b)| order.compare(a, b));

    let mut remaining = total_bytes;
    let mut victims = vec![];
    for (key, entry) in candidates {
        if remaining <= target_bytes {
            break;
        }
        remaining = remaining.saturating_sub(entry.size_bytes);
        victims.push(key.clone());
    }
    victims
}

#[cfg(test)]
mod tests {
    use tokio::time::{Duration, Instant};

    use super::*;

    fn entry(seq: u64, size_bytes: u64, created: u64, accessed: u64) -> CacheEntry<()> {
        let base = Instant::now();
        CacheEntry {
            handle: (),
            created_at: base + Duration::from_secs(created),
            last_accessed_at: base + Duration::from_secs(accessed),
            size_bytes,
            seq,
        }
    }

    fn entries() -> HashMap<CacheKey, CacheEntry<()>> {
        HashMap::from([
            (CacheKey::new("s", "a"), entry(0, 30, 0, 50)),
            (CacheKey::new("s", "b"), entry(1, 10, 10, 20)),
            (CacheKey::new("s", "c"), entry(2, 20, 20, 30)),
            (CacheKey::new("s", "d"), entry(3, 30, 30, 40)),
        ])
    }

    fn ids(victims: Vec<CacheKey>) -> Vec<String> {
        victims.iter().map(|k| k.media_id().to_owned()).collect()
    }

    #[test]
    fn test_lru_order() {
        let victims = select_victims(&entries(), 90, 60, EvictionOrder::LeastRecentlyUsed, None);
        assert_eq!(ids(victims), ["b", "c"]);
    }

    #[test]
    fn test_largest_first_tie_break() {
        // `a` and `d` are equally large, `a` was inserted first
        let victims = select_victims(&entries(), 90, 40, EvictionOrder::LargestFirst, None);
        assert_eq!(ids(victims), ["a", "d"]);
    }

    #[test]
    fn test_oldest_first() {
        let victims = select_victims(&entries(), 90, 60, EvictionOrder::OldestFirst, None);
        assert_eq!(ids(victims), ["a"]);
    }

    #[test]
    fn test_nothing_below_target() {
        let victims = select_victims(&entries(), 90, 90, EvictionOrder::LeastRecentlyUsed, None);
        assert!(victims.is_empty());

        let victims = select_victims(&entries(), 90, 0, EvictionOrder::LeastRecentlyUsed, None);
        assert_eq!(victims.len(), 4);
    }

    #[test]
    fn test_protected_entry_is_kept() {
        let protected = CacheKey::new("s", "b");
        let victims = select_victims(
            &entries(),
            90,
            0,
            EvictionOrder::LeastRecentlyUsed,
            Some(&protected),
        );
        assert_eq!(ids(victims), ["c", "d", "a"]);
    }
}
