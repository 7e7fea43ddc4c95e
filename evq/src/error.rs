use std::path::PathBuf;

use crate::queue::{CHECKPOINT_VERSION, MAX_ACTIVE_LOGS};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The checkpoint file carries an in-progress marker: the process died
    /// mid-checkpoint. The file cannot be trusted; the index is rebuilt from
    /// the logs once the operator removes it.
    #[error("checkpoint file `{}` records an interrupted checkpoint; delete it and restart so the index is rebuilt from the logs", .path.display())]
    CorruptCheckpoint { path: PathBuf },
    #[error("checkpoint file `{}` holds {actual} index slots but the channel is configured for {expected}; capacity cannot be changed", .path.display())]
    CapacityMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("checkpoint file `{}` has format version {found}, this build reads version {}", .path.display(), CHECKPOINT_VERSION)]
    UnsupportedVersion { path: PathBuf, found: u64 },
    #[error("adding log file {file_id} would exceed the {} active log limit", MAX_ACTIVE_LOGS)]
    TooManyActiveLogs { file_id: u32 },
    #[error("unknown record type {tag:#04x} in log file {file_id} at offset {offset}")]
    UnknownRecordType { tag: u8, file_id: u32, offset: u64 },
    /// A record extends past the end of its log file or fails its checksum.
    /// Expected after a crash mid-write; replay drops the damaged tail and
    /// carries on with the other logs.
    #[error("log file {file_id} ends mid-record at offset {offset}")]
    TruncatedLog { file_id: u32, offset: u64 },
    #[error("`{}` is not a transaction log (bad magic)", .path.display())]
    BadLogMagic { path: PathBuf },
    #[error("transaction log `{}` has format version {found}, this build reads version {}", .path.display(), crate::log::LOG_VERSION)]
    UnsupportedLogVersion { path: PathBuf, found: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
