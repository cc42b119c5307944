use std::sync::atomic::{AtomicU32, Ordering};

/// Process-wide record of the zero-based queue slot the bridge most recently
/// told a device to start playing from.
///
/// Written by the enqueue-and-play relay path (before the device commands go
/// out) and by the classifier when it observes an advance; read by every
/// streaming session. The value is an overwrite, not a running maximum.
///
/// A single value is shared across all sessions and devices, as in the
/// original protocol: correctness assumes at most one authoritative
/// streaming session per bridge (see DESIGN.md).
#[derive(Debug, Default)]
pub struct QueuePositionTracker {
    last_enqueued_index: AtomicU32,
}

impl QueuePositionTracker {
    pub fn new() -> Self {
        Self {
            last_enqueued_index: AtomicU32::new(0),
        }
    }

    pub fn set_last(&self, index: u32) {
        self.last_enqueued_index.store(index, Ordering::SeqCst);
    }

    pub fn get_last(&self) -> u32 {
        self.last_enqueued_index.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins() {
        let tracker = QueuePositionTracker::new();
        assert_eq!(tracker.get_last(), 0);

        tracker.set_last(7);
        assert_eq!(tracker.get_last(), 7);

        // Overwrite semantics: a smaller index replaces a larger one.
        tracker.set_last(2);
        assert_eq!(tracker.get_last(), 2);
    }
}
