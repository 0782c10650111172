use std::collections::HashMap;
use std::sync::Mutex;

use windowgate_common::RateLimitKey;

/// Contents of the buffer at the moment it was drained.
pub type Snapshot = HashMap<RateLimitKey, u64>;

/// Admitted requests that have not yet been sent downstream, per key.
///
/// All operations take a single lock, so draining is a swap: an increment
/// either lands in the returned snapshot or in the fresh, empty buffer.
#[derive(Default)]
pub struct PendingWriteBuffer {
    counts: Mutex<Snapshot>,
}

impl PendingWriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one admitted request and return the new pending count for `key`.
    pub fn increment(&self, key: &RateLimitKey) -> u64 {
        let mut counts = self.counts.lock().expect("pending buffer lock poisoned");
        let count = counts.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Increment `key` only if `admit` accepts its current pending count.
    ///
    /// The predicate runs under the buffer lock, so concurrent decisions for
    /// the same process observe each other's increments.
    pub fn increment_if<F>(&self, key: &RateLimitKey, admit: F) -> bool
    where
        F: FnOnce(u64) -> bool,
    {
        let mut counts = self.counts.lock().expect("pending buffer lock poisoned");
        let pending = counts.get(key).copied().unwrap_or(0);
        if !admit(pending) {
            return false;
        }
        *counts.entry(key.clone()).or_insert(0) += 1;
        true
    }

    pub fn pending(&self, key: &RateLimitKey) -> u64 {
        self.counts
            .lock()
            .expect("pending buffer lock poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Number of distinct keys currently buffered.
    pub fn len(&self) -> usize {
        self.counts.lock().expect("pending buffer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the whole buffer, leaving it empty.
    pub fn drain_all(&self) -> Snapshot {
        std::mem::take(&mut *self.counts.lock().expect("pending buffer lock poisoned"))
    }

    /// Take the whole buffer if `should_drain` accepts its current key count.
    pub fn drain_if<F>(&self, should_drain: F) -> Option<Snapshot>
    where
        F: FnOnce(usize) -> bool,
    {
        let mut counts = self.counts.lock().expect("pending buffer lock poisoned");
        if should_drain(counts.len()) {
            Some(std::mem::take(&mut *counts))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn key(entity: &str) -> RateLimitKey {
        RateLimitKey::new(entity, "w")
    }

    #[test]
    fn counts_per_key() {
        let buffer = PendingWriteBuffer::new();
        assert_eq!(buffer.increment(&key("a")), 1);
        assert_eq!(buffer.increment(&key("a")), 2);
        assert_eq!(buffer.increment(&key("b")), 1);

        assert_eq!(buffer.pending(&key("a")), 2);
        assert_eq!(buffer.pending(&key("c")), 0);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn drain_returns_contents_and_resets() {
        let buffer = PendingWriteBuffer::new();
        buffer.increment(&key("a"));
        buffer.increment(&key("a"));

        let snapshot = buffer.drain_all();

        assert_eq!(snapshot.get(&key("a")), Some(&2));
        assert!(buffer.is_empty());
        assert_eq!(buffer.pending(&key("a")), 0);
    }

    #[test]
    fn drain_if_respects_predicate() {
        let buffer = PendingWriteBuffer::new();
        buffer.increment(&key("a"));

        assert!(buffer.drain_if(|len| len >= 2).is_none());
        assert_eq!(buffer.len(), 1);

        let snapshot = buffer.drain_if(|len| len >= 1).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn increment_if_sees_pending_count() {
        let buffer = PendingWriteBuffer::new();
        let k = key("a");

        // admit while fewer than two are pending
        assert!(buffer.increment_if(&k, |pending| pending < 2));
        assert!(buffer.increment_if(&k, |pending| pending < 2));
        assert!(!buffer.increment_if(&k, |pending| pending < 2));

        assert_eq!(buffer.pending(&k), 2);
    }

    #[test]
    fn concurrent_drains_never_lose_increments() {
        let buffer = Arc::new(PendingWriteBuffer::new());
        let k = key("hot");

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                let k = k.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        buffer.increment(&k);
                    }
                })
            })
            .collect();

        let drainer = {
            let buffer = Arc::clone(&buffer);
            let k = k.clone();
            thread::spawn(move || {
                let mut drained = 0;
                for _ in 0..200 {
                    drained += buffer.drain_all().get(&k).copied().unwrap_or(0);
                }
                drained
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        let drained = drainer.join().unwrap();
        let leftover = buffer.drain_all().get(&k).copied().unwrap_or(0);

        assert_eq!(drained + leftover, 4_000);
    }
}
