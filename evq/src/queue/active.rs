use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::queue::MAX_ACTIVE_LOGS;

/// Reference counts of the log files currently contributing pointers to the
/// index. A file with a live count must not be deleted by the log janitor.
///
/// Persisted inside the checkpoint header, one packed
/// `(fileID << 32) | refcount` word per entry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(super) struct ActiveFileTable {
    counts: BTreeMap<u32, u32>,
}

impl ActiveFileTable {
    pub(super) fn increment(&mut self, file_id: u32) -> Result<()> {
        if !self.counts.contains_key(&file_id) && self.counts.len() == MAX_ACTIVE_LOGS {
            return Err(Error::TooManyActiveLogs { file_id });
        }
        *self.counts.entry(file_id).or_insert(0) += 1;
        Ok(())
    }

    pub(super) fn decrement(&mut self, file_id: u32) {
        let Some(count) = self.counts.get_mut(&file_id) else {
            panic!("decrement of inactive log file {file_id}");
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&file_id);
        }
    }

    /// File IDs with a live count, ascending.
    pub(super) fn file_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.counts.keys().copied()
    }

    pub(super) fn entries(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.counts.iter().map(|(id, count)| (*id, *count))
    }

    /// Packed header words, one per entry.
    pub(super) fn encode(&self) -> impl Iterator<Item = u64> + '_ {
        self.counts
            .iter()
            .map(|(id, count)| ((*id as u64) << 32) | *count as u64)
    }

    /// Loads one packed header word read back from a checkpoint.
    pub(super) fn restore(&mut self, raw: u64) {
        let file_id = (raw >> 32) as u32;
        let count = raw as u32;
        if count > 0 {
            self.counts.insert(file_id, count);
        }
    }
}
