use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

pub const DEFAULT_DEDUP_CAPACITY: usize = 50;
const TOAST_SUPPRESSION_WINDOW: Duration = Duration::from_secs(5);

/// Bounded FIFO of recently processed event keys. Membership answers
/// "have we already handled this logical event"; once the store is full
/// the oldest key is evicted, so a key can be processed again after
/// enough newer events have passed through.
#[derive(Debug)]
pub struct DeduplicationStore {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl Default for DeduplicationStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DEDUP_CAPACITY)
    }
}

impl DeduplicationStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Records the key and reports whether the caller should act on it.
    /// Returns false for a key that is still in the window.
    pub fn should_process(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_string());
        self.order.push_back(key.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Suppresses visually identical notifications fired in quick succession.
/// Keyed on the full rendered content, not the event id: two distinct
/// events that would paint the same toast collapse into one.
#[derive(Debug, Default)]
pub struct ToastDeduper {
    recent: HashMap<(String, String, String), Instant>,
}

impl ToastDeduper {
    pub fn should_show(&mut self, title: &str, body: &str, kind: &str) -> bool {
        self.should_show_at(title, body, kind, Instant::now())
    }

    fn should_show_at(&mut self, title: &str, body: &str, kind: &str, now: Instant) -> bool {
        self.recent
            .retain(|_, shown_at| now.duration_since(*shown_at) < TOAST_SUPPRESSION_WINDOW);
        let key = (title.to_string(), body.to_string(), kind.to_string());
        if self.recent.contains_key(&key) {
            return false;
        }
        self.recent.insert(key, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_key_is_suppressed() {
        let mut store = DeduplicationStore::with_capacity(10);
        assert!(store.should_process("new-friend-request:abc"));
        assert!(!store.should_process("new-friend-request:abc"));
    }

    #[test]
    fn eviction_is_first_in_first_out() {
        let mut store = DeduplicationStore::with_capacity(3);
        for key in ["a", "b", "c"] {
            assert!(store.should_process(key));
        }
        assert!(store.should_process("d"));
        assert_eq!(store.len(), 3);

        // "a" was evicted and can be processed again; "b" is still held.
        assert!(store.should_process("a"));
        assert!(!store.should_process("c"));
    }

    #[test]
    fn default_capacity_holds_fifty_keys() {
        let mut store = DeduplicationStore::default();
        for i in 0..DEFAULT_DEDUP_CAPACITY {
            assert!(store.should_process(&format!("key-{i}")));
        }
        assert_eq!(store.len(), DEFAULT_DEDUP_CAPACITY);
        assert!(store.should_process("one-more"));
        assert_eq!(store.len(), DEFAULT_DEDUP_CAPACITY);
        assert!(store.should_process("key-0"));
    }

    #[test]
    fn identical_toasts_collapse_within_the_window() {
        let mut toasts = ToastDeduper::default();
        let start = Instant::now();
        assert!(toasts.should_show_at("Friend request", "from mira", "request", start));
        assert!(!toasts.should_show_at("Friend request", "from mira", "request", start));
        assert!(toasts.should_show_at("Friend request", "from kai", "request", start));

        let later = start + TOAST_SUPPRESSION_WINDOW;
        assert!(toasts.should_show_at("Friend request", "from mira", "request", later));
    }
}
