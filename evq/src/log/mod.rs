//! Append-only transaction log files.
//!
//! One file per rolling log, identified by a 32-bit file ID. Every record is
//! guarded by a CRC so a crash mid-write leaves at worst a damaged tail,
//! which readers report as truncation rather than corruption of the whole
//! file.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crc::Crc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pointer::EventPointer;
use crate::replay::{CommitKind, RecordKind, SkipSummary, TransactionEventRecord, TransactionLog};

/// `b"EVQWAL\0\0"`.
const LOG_MAGIC: u64 = u64::from_be_bytes(*b"EVQWAL\0\0");

/// Log format version this build reads and writes.
pub const LOG_VERSION: u32 = 1;

/// magic + version + file ID.
const FILE_HEADER_LEN: u64 = 16;

/// crc + body length prefix.
const RECORD_HEADER_LEN: usize = 12;

/// type, commit type, transaction ID, write-order ID, target file, target
/// offset. PUT records append the event payload after this.
const BODY_FIXED_LEN: usize = 26;

/// Cap on a single record body; a length prefix past this is torn-header
/// garbage, not a real record.
const MAX_BODY_LEN: usize = 16 << 20;

const TYPE_PUT: u8 = 1;
const TYPE_TAKE: u8 = 2;
const TYPE_COMMIT: u8 = 3;
const TYPE_ROLLBACK: u8 = 4;

const COMMIT_PUT: u8 = 1;
const COMMIT_TAKE: u8 = 2;

const RECORD_CRC: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_GO_ISO);

/// Appends transaction records to one log file.
///
/// The rolling policy (when to cut over to a new file) belongs to the channel;
/// the writer only guarantees that whatever prefix of the file survives a
/// crash parses cleanly up to the first damaged record.
pub struct LogWriter {
    file: File,
    file_id: u32,
    offset: u64,
}

impl LogWriter {
    pub fn create(path: &Path, file_id: u32) -> Result<Self> {
        let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
        let mut header = [0u8; FILE_HEADER_LEN as usize];
        header[..8].copy_from_slice(&LOG_MAGIC.to_be_bytes());
        header[8..12].copy_from_slice(&LOG_VERSION.to_be_bytes());
        header[12..16].copy_from_slice(&file_id.to_be_bytes());
        file.write_all(&header)?;
        debug!(path = %path.display(), file_id, "created transaction log");
        Ok(Self {
            file,
            file_id,
            offset: FILE_HEADER_LEN,
        })
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Appends an event record and returns the pointer under which it is
    /// indexed: this record's own location.
    pub fn put(
        &mut self,
        transaction_id: u64,
        write_order_id: u64,
        payload: &[u8],
    ) -> Result<EventPointer> {
        let at = self.offset;
        self.append(TYPE_PUT, 0, transaction_id, write_order_id, 0, 0, payload)?;
        Ok(EventPointer::new(self.file_id, at as u32))
    }

    /// Appends a take referencing the original put record.
    pub fn take(
        &mut self,
        transaction_id: u64,
        write_order_id: u64,
        target: EventPointer,
    ) -> Result<()> {
        self.append(
            TYPE_TAKE,
            0,
            transaction_id,
            write_order_id,
            target.file_id(),
            target.offset(),
            &[],
        )
    }

    pub fn commit(
        &mut self,
        transaction_id: u64,
        write_order_id: u64,
        kind: CommitKind,
    ) -> Result<()> {
        let tag = match kind {
            CommitKind::Put => COMMIT_PUT,
            CommitKind::Take => COMMIT_TAKE,
        };
        self.append(TYPE_COMMIT, tag, transaction_id, write_order_id, 0, 0, &[])
    }

    pub fn rollback(&mut self, transaction_id: u64, write_order_id: u64) -> Result<()> {
        self.append(TYPE_ROLLBACK, 0, transaction_id, write_order_id, 0, 0, &[])
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn append(
        &mut self,
        tag: u8,
        commit_tag: u8,
        transaction_id: u64,
        write_order_id: u64,
        target_file: u32,
        target_offset: u32,
        payload: &[u8],
    ) -> Result<()> {
        assert!(
            self.offset <= u32::MAX as u64,
            "log file {} outgrew 32-bit offsets",
            self.file_id
        );
        let mut body = Vec::with_capacity(BODY_FIXED_LEN + payload.len());
        body.push(tag);
        body.push(commit_tag);
        body.extend_from_slice(&transaction_id.to_be_bytes());
        body.extend_from_slice(&write_order_id.to_be_bytes());
        body.extend_from_slice(&target_file.to_be_bytes());
        body.extend_from_slice(&target_offset.to_be_bytes());
        body.extend_from_slice(payload);

        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
        record.extend_from_slice(&RECORD_CRC.checksum(&body).to_be_bytes());
        record.extend_from_slice(&(body.len() as u32).to_be_bytes());
        record.extend_from_slice(&body);
        self.file.write_all(&record)?;
        self.offset += record.len() as u64;
        Ok(())
    }
}

/// Sequential reader over one log file.
pub struct LogReader {
    file: BufReader<File>,
    file_id: u32,
    offset: u64,
    peeked: Option<TransactionEventRecord>,
}

impl LogReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        let mut header = [0u8; FILE_HEADER_LEN as usize];
        if !matches!(read_full(&mut file, &mut header)?, ReadFull::Complete) {
            return Err(Error::BadLogMagic {
                path: path.to_owned(),
            });
        }
        if u64::from_be_bytes(header[..8].try_into().unwrap()) != LOG_MAGIC {
            return Err(Error::BadLogMagic {
                path: path.to_owned(),
            });
        }
        let version = u32::from_be_bytes(header[8..12].try_into().unwrap());
        if version != LOG_VERSION {
            return Err(Error::UnsupportedLogVersion {
                path: path.to_owned(),
                found: version,
            });
        }
        let file_id = u32::from_be_bytes(header[12..16].try_into().unwrap());
        Ok(Self {
            file,
            file_id,
            offset: FILE_HEADER_LEN,
            peeked: None,
        })
    }

    fn truncated(&self, at: u64) -> Error {
        Error::TruncatedLog {
            file_id: self.file_id,
            offset: at,
        }
    }

    fn read_record(&mut self) -> Result<Option<TransactionEventRecord>> {
        let at = self.offset;
        let mut header = [0u8; RECORD_HEADER_LEN];
        match read_full(&mut self.file, &mut header)? {
            ReadFull::Empty => return Ok(None),
            ReadFull::Partial => return Err(self.truncated(at)),
            ReadFull::Complete => {}
        }
        let crc = u64::from_be_bytes(header[..8].try_into().unwrap());
        let len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
        if !(BODY_FIXED_LEN..=MAX_BODY_LEN).contains(&len) {
            return Err(self.truncated(at));
        }
        let mut body = vec![0u8; len];
        if !matches!(read_full(&mut self.file, &mut body)?, ReadFull::Complete) {
            return Err(self.truncated(at));
        }
        if RECORD_CRC.checksum(&body) != crc {
            return Err(self.truncated(at));
        }
        self.offset = at + (RECORD_HEADER_LEN + len) as u64;

        let transaction_id = u64::from_be_bytes(body[2..10].try_into().unwrap());
        let write_order_id = u64::from_be_bytes(body[10..18].try_into().unwrap());
        let kind = match body[0] {
            TYPE_PUT => RecordKind::Put,
            TYPE_TAKE => {
                let target_file = u32::from_be_bytes(body[18..22].try_into().unwrap());
                let target_offset = u32::from_be_bytes(body[22..26].try_into().unwrap());
                RecordKind::Take(EventPointer::new(target_file, target_offset))
            }
            TYPE_COMMIT => match body[1] {
                COMMIT_PUT => RecordKind::Commit(CommitKind::Put),
                COMMIT_TAKE => RecordKind::Commit(CommitKind::Take),
                other => {
                    return Err(Error::UnknownRecordType {
                        tag: other,
                        file_id: self.file_id,
                        offset: at,
                    })
                }
            },
            TYPE_ROLLBACK => RecordKind::Rollback,
            other => {
                return Err(Error::UnknownRecordType {
                    tag: other,
                    file_id: self.file_id,
                    offset: at,
                })
            }
        };
        Ok(Some(TransactionEventRecord {
            transaction_id,
            write_order_id,
            location: EventPointer::new(self.file_id, at as u32),
            kind,
        }))
    }
}

impl TransactionLog for LogReader {
    fn log_file_id(&self) -> u32 {
        self.file_id
    }

    fn skip_to_checkpoint(&mut self, checkpoint: u64) -> Result<SkipSummary> {
        let mut summary = SkipSummary::default();
        while self.peeked.is_none() {
            match self.read_record()? {
                Some(record) if record.write_order_id <= checkpoint => {
                    summary.skipped += 1;
                    summary.max_transaction_id =
                        summary.max_transaction_id.max(record.transaction_id);
                }
                Some(record) => self.peeked = Some(record),
                None => break,
            }
        }
        Ok(summary)
    }

    fn next(&mut self) -> Result<Option<TransactionEventRecord>> {
        if let Some(record) = self.peeked.take() {
            return Ok(Some(record));
        }
        self.read_record()
    }
}

enum ReadFull {
    Complete,
    Partial,
    Empty,
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<ReadFull> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadFull::Empty
                } else {
                    ReadFull::Partial
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(ReadFull::Complete)
}

/// Enumerates `*.log` files across the channel's log directories, in a stable
/// order. Replay does not depend on the order; a stable one just keeps runs
/// easy to compare.
pub fn scan_log_dirs<P: AsRef<Path>>(dirs: &[P]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for dir in dirs {
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "log") {
                paths.push(path);
            }
        }
    }
    paths.sort();
    Ok(paths)
}
