//! Per-address read cursor

use std::sync::atomic::{AtomicU64, Ordering};

/// Index of the next unread message in a canister's outbound log.
///
/// Only moves forward, and only by the number of messages a successful pull
/// returned.
#[derive(Debug, Default)]
pub struct Cursor {
    next_index: AtomicU64,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.next_index.load(Ordering::Acquire)
    }

    /// Advance by `count` and return the new position. Saturates at `u64::MAX`.
    pub fn advance(&self, count: u64) -> u64 {
        let previous = self
            .next_index
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(count))
            })
            .unwrap_or_else(|current| current);
        previous.saturating_add(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_starts_at_zero() {
        assert_eq!(Cursor::new().get(), 0);
    }

    #[test]
    fn test_advance_by_zero_is_noop() {
        let cursor = Cursor::new();
        cursor.advance(3);
        assert_eq!(cursor.advance(0), 3);
        assert_eq!(cursor.get(), 3);
    }

    #[test]
    fn test_saturates() {
        let cursor = Cursor::new();
        cursor.advance(u64::MAX - 1);
        assert_eq!(cursor.advance(5), u64::MAX);
    }

    proptest! {
        #[test]
        fn prop_cursor_equals_sum_of_counts(counts in prop::collection::vec(0u64..200, 0..50)) {
            let cursor = Cursor::new();
            let mut last = 0;
            for count in &counts {
                let next = cursor.advance(*count);
                prop_assert!(next >= last);
                last = next;
            }
            prop_assert_eq!(cursor.get(), counts.iter().sum::<u64>());
        }
    }
}
