use std::collections::HashMap;

use parking_lot::Mutex;

use crate::WindowCount;

/// Default number of keys kept before expired windows are pruned.
pub const DEFAULT_FALLBACK_CAPACITY: usize = 16_384;

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    reset_at_ms: u64,
}

/// Process-local fixed-window counters.
///
/// Used whenever the remote store is unconfigured or unreachable, so limits
/// degrade to per-instance budgets instead of failing requests.
#[derive(Debug)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
    capacity: usize,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), capacity: capacity.max(1) }
    }

    /// Increment `key` in its current window, opening a new window when the
    /// previous one has elapsed.
    pub fn increment(&self, key: &str, window_ms: u64, now_ms: u64) -> WindowCount {
        let mut entries = self.entries.lock();

        let entry = entries
            .entry(key.to_string())
            .or_insert(Entry { count: 0, reset_at_ms: now_ms.saturating_add(window_ms) });
        if now_ms >= entry.reset_at_ms {
            *entry = Entry { count: 0, reset_at_ms: now_ms.saturating_add(window_ms) };
        }
        entry.count = entry.count.saturating_add(1);
        let counted = WindowCount { count: entry.count, reset_at_ms: entry.reset_at_ms };

        if entries.len() > self.capacity {
            entries.retain(|_, entry| entry.reset_at_ms > now_ms);
        }
        counted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TRLM-001
    #[test]
    fn counts_within_a_window_and_restarts_after_reset() {
        let store = MemoryCounterStore::default();
        assert_eq!(store.increment("k", 1_000, 10).count, 1);
        let second = store.increment("k", 1_000, 500);
        assert_eq!(second, WindowCount { count: 2, reset_at_ms: 1_010 });

        let next_window = store.increment("k", 1_000, 1_010);
        assert_eq!(next_window, WindowCount { count: 1, reset_at_ms: 2_010 });
    }

    // Test IDs: TRLM-002
    #[test]
    fn keys_are_counted_independently() {
        let store = MemoryCounterStore::default();
        store.increment("a", 1_000, 0);
        store.increment("a", 1_000, 0);
        assert_eq!(store.increment("b", 1_000, 0).count, 1);
    }

    // Test IDs: TRLM-003
    #[test]
    fn expired_keys_are_pruned_past_capacity() {
        let store = MemoryCounterStore::new(4);
        for index in 0..4 {
            store.increment(&format!("old-{index}"), 100, 0);
        }
        assert_eq!(store.len(), 4);

        store.increment("fresh", 100, 1_000);
        assert_eq!(store.len(), 1);
    }
}
