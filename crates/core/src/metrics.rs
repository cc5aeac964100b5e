use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight counters for pool occupancy pressure.
///
/// # Example
/// ```rust
/// use hdcap_core::metrics::Metrics;
///
/// let metrics = Metrics::default();
/// metrics.borrowed();
/// assert_eq!(metrics.borrows(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    borrows: AtomicU64,
    exhausted: AtomicU64,
    recycles: AtomicU64,
}

impl Metrics {
    /// Count a borrow that found an idle slot.
    pub fn borrowed(&self) {
        self.borrows.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a borrow that found every slot in use.
    pub fn exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a slot returning to idle.
    pub fn recycle(&self) {
        self.recycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of successful borrows.
    pub fn borrows(&self) -> u64 {
        self.borrows.load(Ordering::Relaxed)
    }

    /// Snapshot of borrows rejected for lack of idle slots.
    pub fn exhausted_count(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// Snapshot of slots recycled to idle.
    pub fn recycles(&self) -> u64 {
        self.recycles.load(Ordering::Relaxed)
    }
}

impl Clone for Metrics {
    fn clone(&self) -> Self {
        let cloned = Metrics::default();
        cloned.borrows.store(self.borrows(), Ordering::Relaxed);
        cloned
            .exhausted
            .store(self.exhausted_count(), Ordering::Relaxed);
        cloned.recycles.store(self.recycles(), Ordering::Relaxed);
        cloned
    }
}
