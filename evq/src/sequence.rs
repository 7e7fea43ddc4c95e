use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic 64-bit ID source. One instance hands out transaction IDs, another
/// write-order IDs; both are passed explicitly to whoever needs them so tests
/// can run with isolated state.
///
/// After replay has seeded the oracle with every ID observed in the logs and
/// the checkpoint, any newly issued ID is strictly greater than all of them.
/// Replay relies on that to tell pre-checkpoint records from live ones.
#[derive(Debug, Default)]
pub struct SequenceOracle {
    counter: AtomicU64,
}

impl SequenceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next ID, strictly greater than any value previously returned
    /// or passed to [`seed`](Self::seed).
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Raises the counter to `floor` if it is currently below it. Only the
    /// replay path calls this.
    pub fn seed(&self, floor: u64) {
        self.counter.fetch_max(floor, Ordering::SeqCst);
    }

    /// Last issued (or seeded) value.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}
