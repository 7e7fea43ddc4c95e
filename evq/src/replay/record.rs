use crate::error::Result;
use crate::pointer::EventPointer;

/// Which flavor of transaction a COMMIT record closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    Put,
    Take,
}

/// Payload of one transaction log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// An event write. The event body is the record itself, so the pointer to
    /// stage is the record's own location.
    Put,
    /// Removal of a previously put event, referencing the original record.
    Take(EventPointer),
    Commit(CommitKind),
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionEventRecord {
    pub transaction_id: u64,
    /// Globally monotonic stamp defining the total replay order across logs.
    pub write_order_id: u64,
    /// Where this record sits in its log file.
    pub location: EventPointer,
    pub kind: RecordKind,
}

/// Outcome of fast-forwarding a reader past the last completed checkpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SkipSummary {
    pub skipped: u64,
    /// Highest transaction ID among the skipped records. The ID oracles must
    /// clear IDs that predate the checkpoint too, and the skipped records are
    /// the only place those appear.
    pub max_transaction_id: u64,
}

/// Sequential source of transaction records, one per log file.
///
/// End of file is ordinary termination (`Ok(None)`), not an error. A damaged
/// trailing record surfaces as [`crate::Error::TruncatedLog`]; replay treats
/// that as the end of this file and keeps going with the others.
pub trait TransactionLog {
    fn log_file_id(&self) -> u32;

    /// Fast-forwards past every record with `write_order_id <= checkpoint`.
    fn skip_to_checkpoint(&mut self, checkpoint: u64) -> Result<SkipSummary>;

    fn next(&mut self) -> Result<Option<TransactionEventRecord>>;
}
