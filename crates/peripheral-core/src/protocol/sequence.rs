//! Thread-safe counter for subscription, receipt and message ids.
//!
//! # Why ids? (for beginners)
//!
//! STOMP ties several frames together by id.  A SUBSCRIBE frame carries an
//! `id` that the server echoes back as the `subscription` header on every
//! MESSAGE, and an UNSUBSCRIBE names the same id.  A frame that carries a
//! `receipt` header is answered by a RECEIPT frame with a matching
//! `receipt-id`.  The ids only need to be unique per connection, so a simple
//! counter with a prefix (`sub-0`, `sub-1`, ...) is enough.
//!
//! The counter uses `AtomicU64`, so the transport and the facades can draw
//! ids from any thread without a lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter starting at 0.
///
/// # Examples
///
/// ```rust
/// use peripheral_core::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next_id("sub"), "sub-0");
/// assert_eq!(counter.next_id("sub"), "sub-1");
/// ```
#[derive(Debug, Default)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Returns the next value and increments the counter.
    ///
    /// Wraps from `u64::MAX` to 0 without panicking.  `Relaxed` ordering is
    /// enough because the value is an identifier, not a synchronisation point.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the value the next call to [`next`](Self::next) would produce.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }

    /// Returns the next value formatted as `<prefix>-<n>`.
    pub fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter_starts_at_zero_and_increments() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.current(), 2);
    }

    #[test]
    fn test_counter_wraps_at_max() {
        let counter = SequenceCounter {
            inner: AtomicU64::new(u64::MAX),
        };
        assert_eq!(counter.next(), u64::MAX);
        assert_eq!(counter.next(), 0);
    }

    #[test]
    fn test_ids_are_unique_across_threads() {
        // Arrange
        let counter = Arc::new(SequenceCounter::new());

        // Act: 4 threads draw 250 ids each
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || (0..250).map(|_| counter.next_id("r")).collect::<Vec<_>>())
            })
            .collect();
        let ids: HashSet<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        // Assert
        assert_eq!(ids.len(), 1000);
    }
}
