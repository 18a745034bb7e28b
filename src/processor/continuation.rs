//! In-memory hints that let a partition be processed again right after a
//! step scheduled more work for it.

use std::collections::HashMap;
use std::sync::Mutex;

/// How long a partition is refused after it ran out of continuations.
pub const CONTINUATION_COOLDOWN_MS: i64 = 10_000;

/// At most this many partitions are continued at once.
pub const CONTINUATION_MAX_PARTITIONS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continuation {
    pub count: u32,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Continuation>,
    cooldown_until: HashMap<String, i64>,
}

/// Continuations keyed by partition id.
#[derive(Debug)]
pub struct ContinuationMap {
    limit: u32,
    max_partitions: usize,
    state: Mutex<State>,
}

impl ContinuationMap {
    pub fn new(limit: u32) -> Self {
        Self::with_capacity(limit, CONTINUATION_MAX_PARTITIONS)
    }

    pub fn with_capacity(limit: u32, max_partitions: usize) -> Self {
        Self {
            limit,
            max_partitions,
            state: Mutex::new(State::default()),
        }
    }

    /// Continue `partition_id` for the `count`th time. Returns whether the
    /// hint was accepted.
    pub fn add(&self, partition_id: &str, count: u32, now_ms: i64) -> bool {
        let mut st = self.state.lock().unwrap();
        if let Some(until) = st.cooldown_until.get(partition_id).copied() {
            if until > now_ms {
                return false;
            }
            st.cooldown_until.remove(partition_id);
        }
        if count > self.limit {
            st.entries.remove(partition_id);
            st.cooldown_until
                .insert(partition_id.to_string(), now_ms + CONTINUATION_COOLDOWN_MS);
            return false;
        }
        if !st.entries.contains_key(partition_id) && st.entries.len() >= self.max_partitions {
            return false;
        }
        let entry = st
            .entries
            .entry(partition_id.to_string())
            .or_insert(Continuation { count });
        entry.count = entry.count.max(count);
        true
    }

    /// Drop the hint. Returns whether one existed.
    pub fn remove(&self, partition_id: &str, cooldown: bool, now_ms: i64) -> bool {
        let mut st = self.state.lock().unwrap();
        if cooldown {
            st.cooldown_until
                .insert(partition_id.to_string(), now_ms + CONTINUATION_COOLDOWN_MS);
        }
        st.entries.remove(partition_id).is_some()
    }

    pub fn get(&self, partition_id: &str) -> Option<Continuation> {
        self.state.lock().unwrap().entries.get(partition_id).copied()
    }

    pub fn snapshot(&self) -> Vec<(String, Continuation)> {
        let st = self.state.lock().unwrap();
        let mut out: Vec<_> = st.entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_highest_count() {
        let m = ContinuationMap::new(5);
        assert!(m.add("p", 2, 0));
        assert!(m.add("p", 1, 0));
        assert_eq!(m.get("p"), Some(Continuation { count: 2 }));
        assert!(m.add("p", 3, 0));
        assert_eq!(m.get("p").unwrap().count, 3);
    }

    #[test]
    fn exceeding_the_limit_arms_cooldown() {
        let m = ContinuationMap::new(2);
        assert!(m.add("p", 2, 0));
        assert!(!m.add("p", 3, 0));
        assert!(m.get("p").is_none());
        // refused until the cooldown passes
        assert!(!m.add("p", 1, CONTINUATION_COOLDOWN_MS - 1));
        assert!(m.add("p", 1, CONTINUATION_COOLDOWN_MS));
    }

    #[test]
    fn full_map_refuses_new_partitions() {
        let m = ContinuationMap::with_capacity(5, 1);
        assert!(m.add("a", 1, 0));
        assert!(!m.add("b", 1, 0));
        assert!(m.add("a", 2, 0));
    }

    #[test]
    fn remove_with_cooldown() {
        let m = ContinuationMap::new(5);
        m.add("p", 1, 0);
        assert!(m.remove("p", true, 0));
        assert!(!m.remove("p", false, 0));
        assert!(!m.add("p", 1, 1));
        assert!(m.is_empty());
    }
}
