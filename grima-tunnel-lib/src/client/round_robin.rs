use std::sync::atomic::{AtomicUsize, Ordering};

/// Strictly sequential slot selection shared by every substream acquisition.
pub(crate) struct RoundRobin {
    index: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { index: AtomicUsize::new(0) }
    }

    /// Get the next index in round-robin fashion
    pub fn next(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.index
            .fetch_add(1, Ordering::Relaxed)
            .checked_rem(len)
            .unwrap_or(0)
    }
}
