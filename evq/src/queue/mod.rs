//! The persistent index queue: a fixed-capacity ring of event pointers inside
//! a memory-mapped checkpoint file.

mod active;
mod backing;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::pointer::EventPointer;
use crate::sequence::SequenceOracle;

use self::active::ActiveFileTable;
use self::backing::{
    BackingStore, ACTIVE_LOG_SLOT, HEAD_SLOT, SIZE_SLOT, WRITE_ORDER_SLOT,
};

pub use self::backing::{CHECKPOINT_VERSION, HEADER_SLOTS};

/// Upper bound on distinct log files referenced by the index at once, and the
/// size of the active-log block in the checkpoint header.
pub const MAX_ACTIVE_LOGS: usize = 1024;

/// Fixed-capacity circular index of [`EventPointer`]s backed by a
/// memory-mapped checkpoint file.
///
/// The ring occupies the file's slot array past the header; mutations are
/// staged in memory and only persisted by [`checkpoint`](Self::checkpoint).
/// Anything staged but not yet checkpointed is reconstructed from the
/// transaction logs on the next start, so a final checkpoint before close is
/// recommended but not required for correctness.
///
/// One exclusive lock serializes every operation, matching the channel's
/// single-logical-writer model.
pub struct IndexQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    write_orders: Arc<SequenceOracle>,
}

struct Inner {
    backing: BackingStore,
    active: ActiveFileTable,
    capacity: usize,
    head: usize,
    size: usize,
    /// Write-order ID of the last completed checkpoint.
    checkpoint_write_order: u64,
}

impl IndexQueue {
    /// Opens the checkpoint file at `path`, creating it when absent, and seeds
    /// `write_orders` with the write-order ID of the last completed
    /// checkpoint so every subsequently issued ID lands past it.
    pub fn open(path: &Path, capacity: usize, write_orders: Arc<SequenceOracle>) -> Result<Self> {
        assert!(capacity > 0, "queue capacity must be non-zero");
        let backing = BackingStore::open(path, HEADER_SLOTS + capacity)?;

        let size = backing.get(SIZE_SLOT) as usize;
        let head = backing.get(HEAD_SLOT) as usize;
        let checkpoint_write_order = backing.get(WRITE_ORDER_SLOT);
        if size > capacity || head >= capacity {
            return Err(Error::CorruptCheckpoint {
                path: path.to_owned(),
            });
        }

        let mut active = ActiveFileTable::default();
        for i in 0..MAX_ACTIVE_LOGS {
            let raw = backing.get(ACTIVE_LOG_SLOT + i);
            if raw != 0 {
                active.restore(raw);
            }
        }

        write_orders.seed(checkpoint_write_order);
        info!(
            path = %path.display(),
            capacity,
            size,
            write_order = checkpoint_write_order,
            "opened index queue"
        );
        Ok(Self {
            inner: Mutex::new(Inner {
                backing,
                active,
                capacity,
                head,
                size,
                checkpoint_write_order,
            }),
            capacity,
            write_orders,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Physical index of logical element 0.
    pub fn head(&self) -> usize {
        self.inner.lock().head
    }

    /// Write-order ID recorded by the last completed checkpoint. Replay skips
    /// every log record at or below this.
    pub fn log_write_order_id(&self) -> u64 {
        self.inner.lock().checkpoint_write_order
    }

    /// Pushes `ptr` onto the logical front. Returns `false` iff the queue is
    /// full.
    pub fn add_head(&self, ptr: EventPointer) -> Result<bool> {
        self.inner.lock().insert(0, ptr)
    }

    /// Appends `ptr` at the logical back. Returns `false` iff the queue is
    /// full.
    pub fn add_tail(&self, ptr: EventPointer) -> Result<bool> {
        let mut inner = self.inner.lock();
        let at = inner.size;
        inner.insert(at, ptr)
    }

    /// Pops the logical front, or `None` when the queue is empty.
    pub fn remove_head(&self) -> Option<EventPointer> {
        let mut inner = self.inner.lock();
        if inner.size == 0 {
            return None;
        }
        Some(inner.remove_at(0))
    }

    /// Removes the first live entry equal to `ptr`. Linear in the queue size,
    /// which is acceptable: only the recovery path and the rare pending-take
    /// reconciliation call it.
    pub fn remove(&self, ptr: EventPointer) -> bool {
        let mut inner = self.inner.lock();
        for i in 0..inner.size {
            if inner.get(i) == ptr.as_raw() {
                inner.remove_at(i);
                return true;
            }
        }
        false
    }

    /// Log files still referenced by at least one pointer, ascending. The log
    /// janitor must not delete any of these.
    pub fn file_ids(&self) -> Vec<u32> {
        self.inner.lock().active.file_ids().collect()
    }

    /// `(fileID, refcount)` pairs, ascending by file ID.
    pub fn ref_counts(&self) -> Vec<(u32, u32)> {
        self.inner.lock().active.entries().collect()
    }

    /// Raw ring contents in physical slot order, for the operator dump.
    pub fn ring_slots(&self) -> Vec<u64> {
        let inner = self.inner.lock();
        (0..inner.capacity)
            .map(|physical| inner.backing.get(HEADER_SLOTS + physical))
            .collect()
    }

    /// Persists the staged state using the two-phase marker protocol. Returns
    /// `false` when nothing is staged and `force` is off. Each completed
    /// checkpoint consumes a fresh write-order ID, so records logged before it
    /// compare `<=` and records logged after compare `>`.
    ///
    /// Not cancellable once under way: the in-progress marker is already on
    /// the mapping.
    pub fn checkpoint(&self, force: bool) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.backing.is_dirty() && !force {
            trace!("checkpoint skipped, nothing staged");
            return Ok(false);
        }

        let write_order = self.write_orders.next();
        let (size, head) = (inner.size, inner.head);
        inner.backing.put(WRITE_ORDER_SLOT, write_order);
        inner.backing.put(SIZE_SLOT, size as u64);
        inner.backing.put(HEAD_SLOT, head as u64);

        let entries: Vec<u64> = inner.active.encode().collect();
        for i in 0..MAX_ACTIVE_LOGS {
            let value = entries.get(i).copied().unwrap_or(0);
            inner.backing.put(ACTIVE_LOG_SLOT + i, value);
        }

        inner.backing.commit()?;
        inner.checkpoint_write_order = write_order;
        debug!(
            path = %inner.backing.path().display(),
            write_order,
            size,
            head,
            "checkpoint complete"
        );
        Ok(true)
    }
}

impl Inner {
    fn physical(&self, logical: usize) -> usize {
        (self.head + logical) % self.capacity
    }

    fn get(&self, logical: usize) -> u64 {
        self.backing.get(HEADER_SLOTS + self.physical(logical))
    }

    fn set(&mut self, logical: usize, value: u64) {
        let slot = HEADER_SLOTS + self.physical(logical);
        self.backing.put(slot, value);
    }

    /// Inserts at logical index `at`, shifting whichever half is shorter so
    /// head- and tail-biased workloads both stay cheap.
    fn insert(&mut self, at: usize, ptr: EventPointer) -> Result<bool> {
        assert!(at <= self.size, "insert index {at} past size {}", self.size);
        if self.size == self.capacity {
            return Ok(false);
        }
        self.active.increment(ptr.file_id())?;

        if at <= self.size / 2 {
            // Pull the head back one slot and move the left half into the gap.
            self.head = (self.head + self.capacity - 1) % self.capacity;
            for i in 0..at {
                let value = self.get(i + 1);
                self.set(i, value);
            }
        } else {
            for i in (at..self.size).rev() {
                let value = self.get(i);
                self.set(i + 1, value);
            }
        }
        self.set(at, ptr.as_raw());
        self.size += 1;
        Ok(true)
    }

    /// Removes the element at logical index `at`, shifting whichever half is
    /// shorter.
    fn remove_at(&mut self, at: usize) -> EventPointer {
        assert!(at < self.size, "remove index {at} past size {}", self.size);
        let Some(ptr) = EventPointer::from_raw(self.get(at)) else {
            panic!("live slot {at} is empty");
        };

        if at <= self.size / 2 {
            // Move the left half onto the removed slot and advance the head.
            for i in (1..=at).rev() {
                let value = self.get(i - 1);
                self.set(i, value);
            }
            self.set(0, 0);
            self.head = (self.head + 1) % self.capacity;
        } else {
            for i in at..self.size - 1 {
                let value = self.get(i + 1);
                self.set(i, value);
            }
            self.set(self.size - 1, 0);
        }
        self.size -= 1;
        self.active.decrement(ptr.file_id());
        ptr
    }
}
