use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap::MmapMut;
use tracing::debug;

use crate::error::{Error, Result};
use crate::queue::MAX_ACTIVE_LOGS;

/// Header slot indices. Values are 64-bit big-endian words.
pub(super) const VERSION_SLOT: usize = 0;
pub(super) const WRITE_ORDER_SLOT: usize = 1;
pub(super) const SIZE_SLOT: usize = 2;
pub(super) const HEAD_SLOT: usize = 3;
const MARKER_SLOT: usize = 4;
pub(super) const ACTIVE_LOG_SLOT: usize = 5;

/// Checkpoint format version this build reads and writes.
pub const CHECKPOINT_VERSION: u64 = 2;

/// Slots preceding the ring: the five fixed fields plus the active-log block.
pub const HEADER_SLOTS: usize = ACTIVE_LOG_SLOT + MAX_ACTIVE_LOGS;

const MARKER_COMPLETE: u64 = 0;
const MARKER_INCOMPLETE: u64 = 1;

const SLOT_BYTES: usize = std::mem::size_of::<u64>();

/// Slot-addressed view over the memory-mapped checkpoint file.
///
/// Writes land in an in-memory overlay keyed by slot index; reads see staged
/// values. The mapping itself only changes inside [`commit`](Self::commit),
/// between the two marker writes, so the file on disk always holds either the
/// last completed checkpoint or an in-progress marker that makes it
/// rejectable.
pub(super) struct BackingStore {
    path: PathBuf,
    map: MmapMut,
    slots: usize,
    overlay: HashMap<usize, u64>,
}

impl BackingStore {
    /// Opens `path`, creating and zero-filling it when absent. `slots` is the
    /// total slot count, header plus ring; an existing file of any other size
    /// is rejected.
    pub(super) fn open(path: &Path, slots: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let expected = (slots * SLOT_BYTES) as u64;
        let fresh = len == 0;
        if fresh {
            file.set_len(expected)?;
        } else if len != expected {
            return Err(Error::CapacityMismatch {
                path: path.to_owned(),
                expected: (slots - HEADER_SLOTS) as u64,
                actual: (len / SLOT_BYTES as u64).saturating_sub(HEADER_SLOTS as u64),
            });
        }

        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut store = Self {
            path: path.to_owned(),
            map,
            slots,
            overlay: HashMap::new(),
        };
        if fresh {
            debug!(path = %store.path.display(), "initializing empty checkpoint file");
            store.write_mapped(VERSION_SLOT, CHECKPOINT_VERSION);
            store.map.flush()?;
        } else {
            store.validate()?;
        }
        Ok(store)
    }

    fn validate(&self) -> Result<()> {
        let version = self.read_mapped(VERSION_SLOT);
        if version != CHECKPOINT_VERSION {
            return Err(Error::UnsupportedVersion {
                path: self.path.clone(),
                found: version,
            });
        }
        if self.read_mapped(MARKER_SLOT) != MARKER_COMPLETE {
            return Err(Error::CorruptCheckpoint {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }

    /// Current value of a slot: the overlay if staged since the last
    /// checkpoint, the mapping otherwise.
    pub(super) fn get(&self, slot: usize) -> u64 {
        assert!(slot < self.slots, "slot {slot} out of {}", self.slots);
        match self.overlay.get(&slot) {
            Some(value) => *value,
            None => self.read_mapped(slot),
        }
    }

    /// Stages a slot write. The mapping is untouched until the next
    /// [`commit`](Self::commit); writing a slot's current value is a no-op so
    /// that a clean store stays clean.
    pub(super) fn put(&mut self, slot: usize, value: u64) {
        assert!(slot < self.slots, "slot {slot} out of {}", self.slots);
        if self.get(slot) != value {
            self.overlay.insert(slot, value);
        }
    }

    pub(super) fn is_dirty(&self) -> bool {
        !self.overlay.is_empty()
    }

    /// Two-phase drain: mark the file in-progress, apply every staged write,
    /// mark it complete, then force the mapping to stable storage. A crash
    /// between the marker writes leaves a file that open-time validation
    /// rejects rather than silently trusts.
    pub(super) fn commit(&mut self) -> Result<()> {
        self.write_mapped(MARKER_SLOT, MARKER_INCOMPLETE);
        let staged: Vec<(usize, u64)> = self.overlay.drain().collect();
        for (slot, value) in staged {
            self.write_mapped(slot, value);
        }
        self.write_mapped(MARKER_SLOT, MARKER_COMPLETE);
        self.map.flush()?;
        Ok(())
    }

    fn read_mapped(&self, slot: usize) -> u64 {
        let at = slot * SLOT_BYTES;
        u64::from_be_bytes(self.map[at..at + SLOT_BYTES].try_into().unwrap())
    }

    fn write_mapped(&mut self, slot: usize, value: u64) {
        let at = slot * SLOT_BYTES;
        self.map[at..at + SLOT_BYTES].copy_from_slice(&value.to_be_bytes());
    }
}
